//! Execution engine: walks a resolved composition's steps front to back.
//!
//! - Input tokens are resolved against the enclosing scope and validated before any step runs
//! - Each step sees only the dependencies it declared, through an audited [`StepDependencies`]
//! - Step results are [`Outcome`]s; the walk continues, exits, or raises outputs accordingly
//! - Nested compositions run as distinct sub-evaluations sharing the parent's cache

use std::{
    fmt,
    sync::atomic::Ordering,
    time::Instant,
};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};

use crate::{
    cache::CacheKey,
    config::EngineConfig,
    error::{CompositeError, ErrorContext, Result},
    input::{InputKind, validate_input_value},
    resolve::{LeafStep, ResolvedComposition, ResolvedStep},
    token::{Dependencies, DependencyRef, InputToken, MYSELF_DEPENDENCY, THIS_PROPERTY_DEPENDENCY, is_internal_name},
    trace,
};

pub mod access;
pub mod continuation;

pub use access::StepDependencies;
pub use continuation::{Continuation, Outcome};

/// Whether a value is being carried through the steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    Compute,
    Transform,
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationMode::Compute => formatter.write_str("compute"),
            EvaluationMode::Transform => formatter.write_str("transform"),
        }
    }
}

/// How one composition's walk ended.
enum Evaluation {
    Exit(Value),
    /// Outputs already mapped to their external names.
    Raise { value: Option<Value>, outputs: Dependencies },
    RaiseAbove(Dependencies),
}

/// Where input tokens of a composition are resolved.
struct Scope<'a> {
    dependencies: &'a Dependencies,
    inputs: &'a IndexMap<String, Value>,
    value: Option<&'a Value>,
}

/// Resolved input values and static metadata of one running composition.
struct BoundValues {
    values: IndexMap<String, Value>,
    metadata: IndexMap<String, Value>,
}

impl ResolvedComposition {
    /// Evaluates without a carried value. Requires a step that computes.
    pub fn compute(&self, dependencies: &Dependencies) -> Result<Value> {
        self.evaluate(EvaluationMode::Compute, None, dependencies, &EngineConfig::current())
    }

    /// Evaluates with `value` carried through the steps. Requires a composition that updates.
    pub fn transform(&self, value: Value, dependencies: &Dependencies) -> Result<Value> {
        self.evaluate(EvaluationMode::Transform, Some(value), dependencies, &EngineConfig::current())
    }

    /// Evaluates under an explicit configuration.
    ///
    /// Every failure is reported as "error computing composition" with the cause attached.
    pub fn evaluate(&self, mode: EvaluationMode, value: Option<Value>, dependencies: &Dependencies, config: &EngineConfig) -> Result<Value> {
        self.evaluate_top_level(mode, value, dependencies, config)
            .map_err(|error| CompositeError::computing(&self.annotation, error))
    }

    fn evaluate_top_level(&self, mode: EvaluationMode, value: Option<Value>, dependencies: &Dependencies, config: &EngineConfig) -> Result<Value> {
        let value = match (mode, value) {
            (EvaluationMode::Compute, _) => {
                if !self.flags.exposes {
                    return Err(self.invalid_evaluation("does not compute a result, so it can only transform"));
                }
                None
            }
            (EvaluationMode::Transform, value) => {
                if !self.flags.updates {
                    return Err(self.invalid_evaluation("does not update a value, so it can only compute"));
                }
                let value = value.unwrap_or(Value::Null);
                if let Err(reason) = self.update.check(&value) {
                    return Err(CompositeError::Aggregate {
                        context: ErrorContext::UpdateValue {
                            annotation: self.annotation.clone(),
                        },
                        errors: vec![CompositeError::InvalidInputValue {
                            input: "updateValue".to_string(),
                            reason,
                        }],
                    });
                }
                Some(value)
            }
        };

        let no_inputs = IndexMap::new();
        let scope = Scope {
            dependencies,
            inputs: &no_inputs,
            value: value.as_ref(),
        };

        match self.run(dependencies, value.clone(), &scope, config)? {
            Evaluation::Exit(value) => Ok(value),
            Evaluation::Raise { value, outputs } if outputs.is_empty() && self.outputs.is_empty() => Ok(value.unwrap_or(Value::Null)),
            Evaluation::Raise { outputs, .. } => Ok(Value::Object(outputs.into_iter().collect::<JsonMap<String, Value>>())),
            Evaluation::RaiseAbove(_) => Err(self.invalid_evaluation("raised output above the top-level composition")),
        }
    }

    fn run(&self, ambient: &Dependencies, value: Option<Value>, scope: &Scope<'_>, config: &EngineConfig) -> Result<Evaluation> {
        let bound = self.bind_inputs(scope)?;
        let mut dependencies = ambient.clone();
        let mut carried = value;
        let base_index = self.steps.len().saturating_sub(1);

        for (index, step) in self.steps.iter().enumerate() {
            let outcome = match step {
                ResolvedStep::Leaf(leaf) => match self.run_leaf(leaf, &dependencies, &bound, carried.as_ref(), config)? {
                    Some(outcome) => outcome,
                    None => continue,
                },
                ResolvedStep::Nested(nested) => {
                    let nested_ambient: Dependencies = dependencies
                        .iter()
                        .filter(|(name, _)| !is_internal_name(name))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect();
                    let nested_value = if nested.flags.updates { carried.clone() } else { None };
                    let nested_scope = Scope {
                        dependencies: &dependencies,
                        inputs: &bound.values,
                        value: carried.as_ref(),
                    };
                    let evaluation = nested
                        .run(&nested_ambient, nested_value, &nested_scope, config)
                        .map_err(|error| CompositeError::computing(&nested.annotation, error))?;
                    match evaluation {
                        Evaluation::Exit(value) => Outcome::Exit(value),
                        Evaluation::Raise { value, outputs } => Outcome::Continue {
                            value,
                            dependencies: outputs,
                        },
                        Evaluation::RaiseAbove(raised) => Outcome::RaiseOutput(raised),
                    }
                }
            };

            match outcome {
                Outcome::Exit(value) => return Ok(Evaluation::Exit(value)),
                Outcome::Continue { value, dependencies: produced } => {
                    if value.is_some() {
                        carried = value;
                    }
                    if index == base_index {
                        return self.finish(produced, carried, &dependencies);
                    }
                    dependencies.extend(produced);
                }
                Outcome::RaiseOutput(raised) => {
                    self.ensure_composes("raise output")?;
                    return self.finish(raised, carried, &dependencies);
                }
                Outcome::RaiseOutputAbove(raised) => {
                    self.ensure_composes("raise output above")?;
                    return Ok(Evaluation::RaiseAbove(raised));
                }
            }
        }

        self.finish(Dependencies::new(), carried, &dependencies)
    }

    /// Resolves every input token against `scope` and validates the resulting values.
    fn bind_inputs(&self, scope: &Scope<'_>) -> Result<BoundValues> {
        let mut values = IndexMap::new();
        let mut metadata = IndexMap::new();
        let mut errors = Vec::new();

        for (name, bound) in &self.inputs {
            metadata.insert(name.clone(), bound.token.metadata());
            if matches!(bound.descriptor.kind, InputKind::Subroutine { .. }) {
                continue;
            }
            let value = resolve_token(&bound.token, scope);
            if let Err(error) = validate_input_value(name, &value, &bound.descriptor) {
                errors.push(error);
            }
            values.insert(name.clone(), value);
        }

        CompositeError::check(
            ErrorContext::InputValues {
                annotation: self.annotation.clone(),
            },
            errors,
        )?;
        Ok(BoundValues { values, metadata })
    }

    /// Runs one leaf step. `None` means the step had nothing to run in this mode.
    fn run_leaf(
        &self,
        leaf: &LeafStep,
        dependencies: &Dependencies,
        bound: &BoundValues,
        carried: Option<&Value>,
        config: &EngineConfig,
    ) -> Result<Option<Outcome>> {
        let mode = match (carried, &leaf.transform, &leaf.compute) {
            (Some(_), Some(_), _) => EvaluationMode::Transform,
            (_, _, Some(_)) => EvaluationMode::Compute,
            _ => {
                trace::step_skipped(config.trace_steps, &self.annotation, &leaf.label);
                return Ok(None);
            }
        };

        let visible = self.visible_dependencies(leaf, dependencies, bound, carried);
        let step_dependencies = StepDependencies::new(visible);
        trace::step_started(config.trace_steps, &self.annotation, &leaf.label, mode, &step_dependencies.to_trace_value());

        let cache_entry = leaf.cache.filter(|_| config.cache_steps).map(|step| {
            let mut arguments = step_dependencies.cache_arguments(&leaf.dependencies);
            if mode == EvaluationMode::Transform {
                arguments.push(Some(carried.cloned().unwrap_or(Value::Null)));
            }
            (step, CacheKey::new(mode, arguments))
        });
        if let Some((step, key)) = &cache_entry
            && let Some(outcome) = self.cache.lookup(*step, &leaf.label, key)
        {
            trace::step_finished(config.trace_steps, &self.annotation, &leaf.label, &outcome, true);
            return Ok(Some(outcome));
        }

        let continuation = leaf.flags.compose.then(|| Continuation::new(&self.annotation, self.flags.composes));
        let started = Instant::now();
        let result = match (mode, &leaf.transform, &leaf.compute) {
            (EvaluationMode::Transform, Some(transform), _) => transform(carried.cloned().unwrap_or(Value::Null), &step_dependencies, continuation.as_ref()),
            (_, _, Some(compute)) => compute(&step_dependencies, continuation.as_ref()),
            _ => return Ok(None),
        };
        let elapsed = started.elapsed();
        let result = result.map_err(|error| error.context(format!("step `{}` failed", leaf.label)));

        if config.audit_dependencies && leaf.first_call.swap(false, Ordering::SeqCst) {
            let audit = step_dependencies.audit(&leaf.dependencies);
            if !audit.is_empty() {
                let audit = CompositeError::Aggregate {
                    context: ErrorContext::AccessedDependencies,
                    errors: audit,
                };
                return Err(match result {
                    Ok(_) => audit,
                    Err(error) => CompositeError::Aggregate {
                        context: ErrorContext::Step { label: leaf.label.clone() },
                        errors: vec![CompositeError::Step(error), audit],
                    },
                });
            }
        }

        let outcome = result?;
        self.check_outcome(leaf, &outcome)?;

        if let Some((step, key)) = cache_entry {
            self.cache.store(step, &leaf.label, key, outcome.clone(), elapsed);
        }
        trace::step_finished(config.trace_steps, &self.annotation, &leaf.label, &outcome, false);
        Ok(Some(outcome))
    }

    /// The step's declared dependencies that are actually available.
    fn visible_dependencies(
        &self,
        leaf: &LeafStep,
        dependencies: &Dependencies,
        bound: &BoundValues,
        carried: Option<&Value>,
    ) -> IndexMap<DependencyRef, Value> {
        leaf.dependencies
            .iter()
            .filter_map(|reference| {
                let value = match reference {
                    DependencyRef::Named(name) => dependencies.get(name).cloned(),
                    DependencyRef::Input(name) => bound.values.get(name).cloned(),
                    DependencyRef::InputMetadata(name) => bound.metadata.get(name).cloned(),
                    DependencyRef::Myself => dependencies.get(MYSELF_DEPENDENCY).cloned(),
                    DependencyRef::ThisProperty => dependencies.get(THIS_PROPERTY_DEPENDENCY).cloned(),
                    DependencyRef::UpdateValue => self.flags.updates.then(|| carried.cloned().unwrap_or(Value::Null)),
                };
                value.map(|value| (reference.clone(), value))
            })
            .collect()
    }

    fn check_outcome(&self, leaf: &LeafStep, outcome: &Outcome) -> Result<()> {
        let invalid = |reason: String| CompositeError::InvalidOutcome {
            label: leaf.label.clone(),
            reason,
        };

        if !leaf.flags.compose && !matches!(outcome, Outcome::Exit(_)) {
            return Err(invalid(format!("a step that does not compose can only exit, got `{}`", outcome.label())));
        }
        if let Outcome::Continue { dependencies, .. } = outcome
            && let Some(name) = dependencies.keys().find(|name| !is_internal_name(name))
        {
            return Err(invalid(format!("provided dependency `{name}` must start with `#`")));
        }
        Ok(())
    }

    /// Maps produced dependencies through the output mapping.
    ///
    /// Raised keys must be declared outputs; declared outputs that were not raised
    /// fall back to dependencies produced by earlier steps.
    fn finish(&self, raised: Dependencies, carried: Option<Value>, dependencies: &Dependencies) -> Result<Evaluation> {
        let mut errors = Vec::new();
        for name in raised.keys() {
            if !self.outputs.contains_key(name) {
                errors.push(CompositeError::UnknownOutput { name: name.clone() });
            }
        }

        let mut outputs = Dependencies::new();
        for (internal, external) in &self.outputs {
            match raised.get(internal).or_else(|| dependencies.get(internal)) {
                Some(value) => {
                    outputs.insert(external.clone(), value.clone());
                }
                None => errors.push(CompositeError::MissingOutput { name: internal.clone() }),
            }
        }

        CompositeError::check(
            ErrorContext::RaisedOutputs {
                annotation: self.annotation.clone(),
            },
            errors,
        )?;
        Ok(Evaluation::Raise { value: carried, outputs })
    }

    fn ensure_composes(&self, operation: &str) -> Result<()> {
        if self.flags.composes {
            Ok(())
        } else {
            Err(self.invalid_evaluation(&format!("cannot {operation} because it does not compose")))
        }
    }

    fn invalid_evaluation(&self, reason: &str) -> CompositeError {
        CompositeError::InvalidEvaluation {
            annotation: self.annotation.clone(),
            reason: reason.to_string(),
        }
    }
}

fn resolve_token(token: &InputToken, scope: &Scope<'_>) -> Value {
    let found = match token {
        InputToken::Value(value) | InputToken::StaticValue(value) => Some(value),
        InputToken::Dependency(name) | InputToken::StaticDependency(name) => scope.dependencies.get(name),
        InputToken::Input(name) => scope.inputs.get(name),
        InputToken::Myself => scope.dependencies.get(MYSELF_DEPENDENCY),
        InputToken::ThisProperty => scope.dependencies.get(THIS_PROPERTY_DEPENDENCY),
        InputToken::UpdateValue(_) => scope.value,
        InputToken::Subroutine(_) => None,
    };
    found.cloned().unwrap_or(Value::Null)
}
