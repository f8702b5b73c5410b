//! Lowering template instances into executable compositions.
//!
//! Resolution walks the instance's step list once, inlining nested instances
//! and expanding subroutine calls, and decides per step whether it composes
//! (hands control to the next step), updates (transforms the carried value),
//! and exposes (computes a result). The ordering rules are checked here so that
//! evaluation never has to:
//!
//! - every step except the last ("base") must compose;
//! - a composition that neither composes nor updates needs a step that computes;
//! - a transform-only step needs a composition that composes or declares an update.

use std::{
    fmt,
    sync::{Arc, atomic::AtomicBool},
};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::debug;

use crate::{
    cache::{CompositionCache, StepCacheId},
    error::{CompositeError, ErrorContext, Result},
    input::{InputDescriptor, UpdateDescription},
    instance::InstanceDescription,
    step::{ComputeFn, Step, StepDescriptor, SubroutineCall, TransformFn},
    token::{DependencyRef, InputToken, is_internal_name},
};

/// Derived booleans describing how a composition can be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompositionFlags {
    /// Accepts a carried value through `transform`.
    pub updates: bool,
    /// Produces a result through `compute`.
    pub exposes: bool,
    /// Meant to be nested inside another composition.
    pub composes: bool,
}

/// Per-step flags decided by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepFlags {
    pub compose: bool,
    pub update: bool,
    pub expose: bool,
}

/// An input with its descriptor and the token bound to it.
#[derive(Debug, Clone)]
pub(crate) struct BoundInput {
    pub(crate) descriptor: InputDescriptor,
    pub(crate) token: InputToken,
}

/// The flattened, executable form of a template instance. Immutable once built.
#[derive(Debug)]
pub struct ResolvedComposition {
    pub(crate) annotation: String,
    pub(crate) flags: CompositionFlags,
    pub(crate) inputs: IndexMap<String, BoundInput>,
    pub(crate) outputs: IndexMap<String, String>,
    pub(crate) steps: Vec<ResolvedStep>,
    pub(crate) update: UpdateDescription,
    pub(crate) external_dependencies: Vec<String>,
    pub(crate) cache: Arc<CompositionCache>,
}

#[derive(Debug)]
pub(crate) enum ResolvedStep {
    Leaf(LeafStep),
    Nested(Box<ResolvedComposition>),
}

impl ResolvedStep {
    fn flags(&self) -> StepFlags {
        match self {
            ResolvedStep::Leaf(leaf) => leaf.flags,
            ResolvedStep::Nested(nested) => StepFlags {
                compose: nested.flags.composes,
                update: nested.flags.updates,
                expose: nested.flags.exposes,
            },
        }
    }
}

pub(crate) struct LeafStep {
    pub(crate) label: String,
    pub(crate) flags: StepFlags,
    pub(crate) dependencies: Vec<DependencyRef>,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) transform: Option<TransformFn>,
    pub(crate) cache: Option<StepCacheId>,
    pub(crate) update: Option<UpdateDescription>,
    pub(crate) first_call: AtomicBool,
}

impl fmt::Debug for LeafStep {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LeafStep")
            .field("label", &self.label)
            .field("flags", &self.flags)
            .field("dependencies", &self.dependencies)
            .field("cache", &self.cache)
            .finish()
    }
}

impl ResolvedComposition {
    pub fn annotation(&self) -> &str {
        &self.annotation
    }

    pub fn flags(&self) -> CompositionFlags {
        self.flags
    }

    pub fn updates(&self) -> bool {
        self.flags.updates
    }

    pub fn exposes(&self) -> bool {
        self.flags.exposes
    }

    pub fn composes(&self) -> bool {
        self.flags.composes
    }

    /// Internal output name to external name.
    pub fn output_mapping(&self) -> &IndexMap<String, String> {
        &self.outputs
    }

    /// Ambient dependency names read anywhere in this composition, in first-seen order.
    pub fn external_dependencies(&self) -> &[String] {
        &self.external_dependencies
    }

    pub fn update_description(&self) -> &UpdateDescription {
        &self.update
    }

    /// The memoization cache shared by this composition and the ones nested in it.
    pub fn cache(&self) -> &Arc<CompositionCache> {
        &self.cache
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Structural summary, equal for equal resolutions.
    pub fn shape(&self) -> CompositionShape {
        CompositionShape {
            annotation: self.annotation.clone(),
            flags: self.flags,
            inputs: self
                .inputs
                .iter()
                .map(|(name, bound)| (name.clone(), bound.token.to_string()))
                .collect(),
            outputs: self.outputs.clone(),
            external_dependencies: self.external_dependencies.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| match step {
                    ResolvedStep::Leaf(leaf) => StepShape::Leaf(LeafShape {
                        label: leaf.label.clone(),
                        flags: leaf.flags,
                        dependencies: leaf.dependencies.iter().map(ToString::to_string).collect(),
                        cached: leaf.cache.is_some(),
                    }),
                    ResolvedStep::Nested(nested) => StepShape::Nested(nested.shape()),
                })
                .collect(),
        }
    }
}

/// Serializable structure of a resolved composition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionShape {
    pub annotation: String,
    pub flags: CompositionFlags,
    pub inputs: IndexMap<String, String>,
    pub outputs: IndexMap<String, String>,
    pub external_dependencies: Vec<String>,
    pub steps: Vec<StepShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepShape {
    Leaf(LeafShape),
    Nested(CompositionShape),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafShape {
    pub label: String,
    pub flags: StepFlags,
    pub dependencies: Vec<String>,
    pub cached: bool,
}

/// Resolves a top-level instance description with a fresh cache.
pub(crate) fn resolve_instance(description: &InstanceDescription) -> Result<ResolvedComposition> {
    let context = ResolveContext {
        cache: Arc::new(CompositionCache::new()),
        enclosing_inputs: None,
    };
    resolve_composition(description, &context)
}

struct ResolveContext<'parent> {
    cache: Arc<CompositionCache>,
    /// Inputs of the enclosing composition, `None` at the top level.
    enclosing_inputs: Option<&'parent IndexMap<String, BoundInput>>,
}

fn resolve_composition(description: &InstanceDescription, context: &ResolveContext<'_>) -> Result<ResolvedComposition> {
    let template = &description.template;
    let annotation = template.annotation().to_string();
    let composes = template.composes();
    let mut errors = Vec::new();

    let mut inputs = IndexMap::new();
    for (name, descriptor) in template.inputs() {
        let Some(token) = description.inputs.get(name) else {
            errors.push(CompositeError::MissingInput { input: name.clone() });
            continue;
        };
        if let InputToken::Input(forwarded) = token {
            match context.enclosing_inputs {
                None => errors.push(CompositeError::InvalidInputDeclaration {
                    input: name.clone(),
                    reason: format!("forwards input `{forwarded}` but there is no enclosing composition"),
                }),
                Some(enclosing) if !enclosing.contains_key(forwarded) => errors.push(CompositeError::InvalidInputDeclaration {
                    input: name.clone(),
                    reason: format!("forwards input `{forwarded}` which the enclosing composition does not declare"),
                }),
                Some(_) => {}
            }
        }
        inputs.insert(
            name.clone(),
            BoundInput {
                descriptor: descriptor.clone(),
                token: token.clone(),
            },
        );
    }

    let step_list = template.make_steps();
    if step_list.is_empty() {
        errors.push(CompositeError::InvalidStep {
            reason: "the steps function returned no steps".to_string(),
        });
    }

    let nested_context = ResolveContext {
        cache: Arc::clone(&context.cache),
        enclosing_inputs: Some(&inputs),
    };
    let base_index = step_list.len().saturating_sub(1);
    let mut steps = Vec::with_capacity(step_list.len());
    for (index, step) in step_list.iter().enumerate() {
        let label = step_label(&annotation, index, step);
        let mut step_errors = Vec::new();
        let resolved = match step {
            Step::Leaf(descriptor) => resolve_leaf(descriptor, &label, index == base_index, composes, &inputs, &context.cache, &mut step_errors),
            Step::Composite(instance) => resolve_nested(&instance.to_description(), index == base_index, &nested_context, &mut step_errors),
            Step::Subroutine(call) => resolve_subroutine(call, index == base_index, &inputs, &nested_context, &mut step_errors),
        };
        if !step_errors.is_empty() {
            errors.push(CompositeError::Aggregate {
                context: ErrorContext::ResolveStep { index, label },
                errors: step_errors,
            });
        }
        if let Some(resolved) = resolved {
            steps.push(resolved);
        }
    }

    let declares_update = template.update().is_some()
        || inputs.values().any(|bound| matches!(bound.token, InputToken::UpdateValue(_)))
        || steps.iter().any(|step| match step {
            ResolvedStep::Leaf(leaf) => leaf.update.is_some() || leaf.dependencies.contains(&DependencyRef::UpdateValue),
            ResolvedStep::Nested(nested) => nested.flags.updates,
        });
    let flags = CompositionFlags {
        updates: declares_update || steps.iter().any(|step| step.flags().update),
        exposes: steps.iter().any(|step| step.flags().expose),
        composes,
    };

    if !flags.composes && !flags.updates && !flags.exposes {
        errors.push(CompositeError::NoComputeStep {
            annotation: annotation.clone(),
        });
    }
    if !flags.composes && !declares_update {
        for (index, step) in steps.iter().enumerate() {
            if let ResolvedStep::Leaf(leaf) = step
                && leaf.transform.is_some()
                && leaf.compute.is_none()
            {
                errors.push(CompositeError::Aggregate {
                    context: ErrorContext::ResolveStep {
                        index,
                        label: leaf.label.clone(),
                    },
                    errors: vec![CompositeError::InvalidStep {
                        reason: "a step that only transforms needs a composition that composes or updates".to_string(),
                    }],
                });
            }
        }
    }

    CompositeError::check(ErrorContext::Resolve { annotation: annotation.clone() }, errors)?;

    let update = merge_updates(&inputs, &steps, template.update());
    let external_dependencies = collect_external_dependencies(&inputs, &steps);

    debug!(
        composition = %annotation,
        updates = flags.updates,
        exposes = flags.exposes,
        composes = flags.composes,
        steps = steps.len(),
        "resolved composition"
    );

    Ok(ResolvedComposition {
        annotation,
        flags,
        inputs,
        outputs: description.outputs.clone(),
        steps,
        update,
        external_dependencies,
        cache: Arc::clone(&context.cache),
    })
}

fn step_label(annotation: &str, index: usize, step: &Step) -> String {
    match step {
        Step::Leaf(StepDescriptor {
            annotation: Some(label), ..
        }) => label.clone(),
        Step::Composite(instance) => instance.annotation().to_string(),
        Step::Subroutine(call) => format!("{annotation} subroutine `{}`", call.input),
        Step::Leaf(_) => format!("{annotation} step #{index}"),
    }
}

fn resolve_leaf(
    descriptor: &StepDescriptor,
    label: &str,
    is_base: bool,
    composition_composes: bool,
    inputs: &IndexMap<String, BoundInput>,
    cache: &Arc<CompositionCache>,
    errors: &mut Vec<CompositeError>,
) -> Option<ResolvedStep> {
    let invalid = |reason: &str| CompositeError::InvalidStep { reason: reason.to_string() };

    if descriptor.compute.is_none() && descriptor.transform.is_none() {
        errors.push(invalid("a step must provide compute or transform"));
    }

    let compose = match (is_base, descriptor.compose) {
        (false, Some(false)) => {
            errors.push(invalid("only the last step may stop composing"));
            false
        }
        (false, _) => true,
        (true, Some(true)) if !composition_composes => {
            errors.push(invalid("the last step cannot compose because its composition does not"));
            false
        }
        (true, explicit) => explicit.unwrap_or(composition_composes),
    };

    for reference in &descriptor.dependencies {
        if let Some(input) = reference.input_name()
            && !inputs.contains_key(input)
        {
            errors.push(CompositeError::InvalidStep {
                reason: format!("depends on `{reference}` but the composition declares no input `{input}`"),
            });
        }
    }

    let flags = StepFlags {
        compose,
        update: descriptor.transform.is_some() || descriptor.dependencies.contains(&DependencyRef::UpdateValue),
        expose: descriptor.compute.is_some(),
    };

    Some(ResolvedStep::Leaf(LeafStep {
        label: label.to_string(),
        flags,
        dependencies: descriptor.dependencies.clone(),
        compute: descriptor.compute.clone(),
        transform: descriptor.transform.clone(),
        cache: descriptor.cache.map(|_| cache.register_step()),
        update: descriptor.update.clone(),
        first_call: AtomicBool::new(true),
    }))
}

/// A nested composition that does not compose can only be the base step; its exit becomes the result.
fn resolve_nested(
    description: &InstanceDescription,
    is_base: bool,
    context: &ResolveContext<'_>,
    errors: &mut Vec<CompositeError>,
) -> Option<ResolvedStep> {
    if !is_base && !description.template.composes() {
        errors.push(CompositeError::InvalidStep {
            reason: format!("nested composition `{}` does not compose, so it can only be the last step", description.annotation()),
        });
        return None;
    }
    for (internal, external) in &description.outputs {
        if !is_internal_name(external) {
            errors.push(CompositeError::InvalidOutputName {
                name: internal.clone(),
                reason: format!("nested outputs must be renamed to `#` names, got `{external}`"),
            });
        }
    }
    match resolve_composition(description, context) {
        Ok(nested) => Some(ResolvedStep::Nested(Box::new(nested))),
        Err(error) => {
            errors.push(error);
            None
        }
    }
}

fn resolve_subroutine(
    call: &SubroutineCall,
    is_base: bool,
    inputs: &IndexMap<String, BoundInput>,
    context: &ResolveContext<'_>,
    errors: &mut Vec<CompositeError>,
) -> Option<ResolvedStep> {
    let subroutine = match inputs.get(&call.input).map(|bound| &bound.token) {
        Some(InputToken::Subroutine(subroutine)) => subroutine,
        Some(other) => {
            errors.push(CompositeError::InvalidStep {
                reason: format!("input `{}` holds {other}, not a subroutine", call.input),
            });
            return None;
        }
        None => {
            errors.push(CompositeError::InvalidStep {
                reason: format!("calls subroutine input `{}` which is not declared", call.input),
            });
            return None;
        }
    };

    match subroutine.call(&call.inputs, &call.outputs) {
        Ok(instance) => resolve_nested(&instance.to_description(), is_base, context, errors),
        Err(error) => {
            errors.push(error);
            None
        }
    }
}

/// Input tokens first, then steps in order, then the description; later fields win.
fn merge_updates(inputs: &IndexMap<String, BoundInput>, steps: &[ResolvedStep], description: Option<&UpdateDescription>) -> UpdateDescription {
    let mut merged = UpdateDescription::new();
    for update in inputs.values().filter_map(|bound| bound.token.update_description()) {
        merged.merge(update);
    }
    for step in steps {
        match step {
            ResolvedStep::Leaf(leaf) => {
                if let Some(update) = &leaf.update {
                    merged.merge(update);
                }
            }
            ResolvedStep::Nested(nested) => merged.merge(&nested.update),
        }
    }
    if let Some(update) = description {
        merged.merge(update);
    }
    merged
}

fn collect_external_dependencies(inputs: &IndexMap<String, BoundInput>, steps: &[ResolvedStep]) -> Vec<String> {
    let mut names = IndexSet::new();
    for bound in inputs.values() {
        if let Some(name) = bound.token.ambient_name() {
            names.insert(name.to_string());
        }
    }
    for step in steps {
        match step {
            ResolvedStep::Leaf(leaf) => {
                names.extend(leaf.dependencies.iter().filter_map(DependencyRef::ambient_name).map(str::to_string));
            }
            ResolvedStep::Nested(nested) => names.extend(nested.external_dependencies.iter().cloned()),
        }
    }
    names.into_iter().collect()
}
