//! Step outcomes and the continuation handle passed to composing steps.

use serde_json::Value;

use crate::token::Dependencies;

/// What a step asks the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Stop the whole evaluation with this value.
    Exit(Value),
    /// Move on to the next step, optionally replacing the carried value and
    /// adding `#internal` dependencies.
    Continue { value: Option<Value>, dependencies: Dependencies },
    /// Produce this composition's outputs and hand control to the enclosing evaluation.
    RaiseOutput(Dependencies),
    /// Produce outputs for the evaluation one level further up.
    RaiseOutputAbove(Dependencies),
}

impl Outcome {
    /// A plain result: stop with `value`.
    pub fn exit(value: impl Into<Value>) -> Self {
        Outcome::Exit(value.into())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Exit(_) => "exit",
            Outcome::Continue { .. } => "continue",
            Outcome::RaiseOutput(_) => "raiseOutput",
            Outcome::RaiseOutputAbove(_) => "raiseOutputAbove",
        }
    }
}

/// Control handle given to a step that composes.
///
/// Every method only builds an [`Outcome`]; the step returns it and the engine
/// acts on it once the call is over.
#[derive(Debug)]
pub struct Continuation {
    composition: String,
    composes: bool,
}

impl Continuation {
    pub(crate) fn new(composition: &str, composes: bool) -> Self {
        Self {
            composition: composition.to_string(),
            composes,
        }
    }

    /// Continue without producing anything.
    pub fn proceed(&self) -> Outcome {
        self.proceed_with(Dependencies::new())
    }

    /// Continue, adding `#internal` dependencies for later steps.
    pub fn proceed_with(&self, dependencies: Dependencies) -> Outcome {
        Outcome::Continue {
            value: None,
            dependencies,
        }
    }

    /// Continue with a new carried value, adding `#internal` dependencies.
    pub fn proceed_with_value(&self, value: impl Into<Value>, dependencies: Dependencies) -> Outcome {
        Outcome::Continue {
            value: Some(value.into()),
            dependencies,
        }
    }

    /// Stop the whole evaluation, enclosing compositions included.
    pub fn exit(&self, value: impl Into<Value>) -> Outcome {
        Outcome::exit(value)
    }

    /// Produce the composition's outputs. Only compositions that compose can raise.
    pub fn raise_output(&self, dependencies: Dependencies) -> anyhow::Result<Outcome> {
        self.ensure_composes("raiseOutput")?;
        Ok(Outcome::RaiseOutput(dependencies))
    }

    /// Produce outputs for the composition enclosing this one.
    pub fn raise_output_above(&self, dependencies: Dependencies) -> anyhow::Result<Outcome> {
        self.ensure_composes("raiseOutputAbove")?;
        Ok(Outcome::RaiseOutputAbove(dependencies))
    }

    fn ensure_composes(&self, operation: &str) -> anyhow::Result<()> {
        if !self.composes {
            anyhow::bail!("`{operation}` is unavailable because `{}` does not compose", self.composition);
        }
        Ok(())
    }
}
