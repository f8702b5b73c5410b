//! Error types shared by every phase of the composite engine.
//!
//! Failures are never reported one at a time. Each phase collects everything it
//! finds into a [`CompositeError::Aggregate`] whose heading names the phase and
//! the composition involved. Errors raised while a composition is running are
//! wrapped in [`CompositeError::Computing`], so a failure inside a nested
//! composition reads as a causal chain through [`std::error::Error::source`].

use std::fmt;

use thiserror::Error;

use crate::token::TokenKind;

/// Convenience alias used throughout the engine.
pub type Result<T, E = CompositeError> = std::result::Result<T, E>;

/// Heading attached to an aggregated error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    /// Structural problems in a composite description.
    Description { annotation: String },
    /// Problems with the options passed when instantiating a template.
    InputOptions { annotation: String },
    /// Problems with an output rename map.
    OutputRenames { annotation: String },
    /// Ordering or compute-requirement violations found while resolving.
    Resolve { annotation: String },
    /// Violations attributed to one step of a composition being resolved.
    ResolveStep { index: usize, label: String },
    /// Dynamic validation failures for input values.
    InputValues { annotation: String },
    /// The value handed to `transform` failed the update description.
    UpdateValue { annotation: String },
    /// Problems with the outputs a composition raised.
    RaisedOutputs { annotation: String },
    /// Mismatches found by the first-call dependency audit.
    AccessedDependencies,
    /// A step failed and its dependency audit failed as well.
    Step { label: String },
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Description { annotation } => write!(formatter, "errors in description for `{annotation}`"),
            ErrorContext::InputOptions { annotation } => write!(formatter, "errors in input options passed to `{annotation}`"),
            ErrorContext::OutputRenames { annotation } => write!(formatter, "errors in output names passed to `{annotation}`"),
            ErrorContext::Resolve { annotation } => write!(formatter, "errors resolving `{annotation}`"),
            ErrorContext::ResolveStep { index, label } => write!(formatter, "errors in step #{index} (`{label}`)"),
            ErrorContext::InputValues { annotation } => write!(formatter, "errors in input values provided to `{annotation}`"),
            ErrorContext::UpdateValue { annotation } => write!(formatter, "errors in update value provided to `{annotation}`"),
            ErrorContext::RaisedOutputs { annotation } => write!(formatter, "errors in outputs raised by `{annotation}`"),
            ErrorContext::AccessedDependencies => formatter.write_str("errors in accessed dependencies"),
            ErrorContext::Step { label } => write!(formatter, "errors in step `{label}`"),
        }
    }
}

/// Every failure the engine can report.
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("{}", render_aggregate(.context, .errors))]
    Aggregate { context: ErrorContext, errors: Vec<CompositeError> },

    #[error("error computing composition `{annotation}`")]
    Computing {
        annotation: String,
        #[source]
        source: Box<CompositeError>,
    },

    #[error("steps must be provided as a function")]
    MissingSteps,

    #[error("invalid declaration for input `{input}`: {reason}")]
    InvalidInputDeclaration { input: String, reason: String },

    #[error("invalid output name `{name}`: {reason}")]
    InvalidOutputName { name: String, reason: String },

    #[error("unexpected input `{input}`")]
    UnexpectedInput { input: String },

    #[error("required input `{input}` was not provided")]
    MissingInput { input: String },

    #[error("input `{input}` expects {expected}, got a {found} token")]
    MismatchedToken {
        input: String,
        expected: &'static str,
        found: TokenKind,
    },

    #[error("input `{input}`: {reason}")]
    InvalidInputValue { input: String, reason: String },

    #[error("subroutine passed to `{input}` does not match: {}", .mismatches.join("; "))]
    SubroutineMismatch { input: String, mismatches: Vec<String> },

    #[error("unknown output `{name}`")]
    UnknownOutput { name: String },

    #[error("output `{name}` was never provided")]
    MissingOutput { name: String },

    #[error("{reason}")]
    InvalidStep { reason: String },

    #[error("composition `{annotation}` neither composes nor updates, so it needs at least one step that computes")]
    NoComputeStep { annotation: String },

    #[error("dependency `{dependency}` was declared but never used")]
    UnusedDependency { dependency: String },

    #[error("dependency `{dependency}` was used but is unavailable")]
    UnavailableDependency { dependency: String },

    #[error("step `{label}` returned an invalid outcome: {reason}")]
    InvalidOutcome { label: String, reason: String },

    #[error("composition `{annotation}` {reason}")]
    InvalidEvaluation { annotation: String, reason: String },

    #[error(transparent)]
    Step(#[from] anyhow::Error),
}

impl CompositeError {
    /// Wraps `errors` under `context`, or succeeds when nothing was collected.
    pub fn check(context: ErrorContext, errors: Vec<CompositeError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompositeError::Aggregate { context, errors })
        }
    }

    /// Wraps an error raised while `annotation` was running.
    pub fn computing(annotation: &str, source: CompositeError) -> Self {
        CompositeError::Computing {
            annotation: annotation.to_string(),
            source: Box::new(source),
        }
    }

    /// Aggregate heading, when this is an aggregate.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            CompositeError::Aggregate { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Every leaf error reachable through aggregates and computing wrappers, depth first.
    pub fn leaves(&self) -> Vec<&CompositeError> {
        let mut leaves = Vec::new();
        collect_leaves(self, &mut leaves);
        leaves
    }
}

fn collect_leaves<'error>(error: &'error CompositeError, leaves: &mut Vec<&'error CompositeError>) {
    match error {
        CompositeError::Aggregate { errors, .. } => errors.iter().for_each(|nested| collect_leaves(nested, leaves)),
        CompositeError::Computing { source, .. } => collect_leaves(source, leaves),
        other => leaves.push(other),
    }
}

fn render_aggregate(context: &ErrorContext, errors: &[CompositeError]) -> String {
    let mut rendered = format!("{context}:");
    for error in errors {
        let text = match error {
            CompositeError::Computing { .. } => render_chain(error),
            other => other.to_string(),
        };
        rendered.push_str("\n  - ");
        rendered.push_str(&text.replace('\n', "\n    "));
    }
    rendered
}

fn render_chain(error: &CompositeError) -> String {
    let mut rendered = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        rendered.push_str("\n  caused by: ");
        rendered.push_str(&cause.to_string().replace('\n', "\n  "));
        source = cause.source();
    }
    rendered
}
