//! Steps: the stages of a composition's pipeline.
//!
//! A step is either a leaf (a declared dependency list plus `compute` and/or
//! `transform` functions), a nested [`TemplateInstance`], or a call to a
//! subroutine passed in through one of the composition's inputs.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    cache::CacheMode,
    executor::{Continuation, Outcome, StepDependencies},
    input::UpdateDescription,
    instance::TemplateInstance,
    token::{DependencyRef, InputToken},
};

/// Computes a result from the step's dependencies.
///
/// The continuation is present exactly when the step composes.
pub type ComputeFn = Arc<dyn Fn(&StepDependencies, Option<&Continuation>) -> anyhow::Result<Outcome> + Send + Sync>;

/// Transforms the carried value using the step's dependencies.
pub type TransformFn = Arc<dyn Fn(Value, &StepDependencies, Option<&Continuation>) -> anyhow::Result<Outcome> + Send + Sync>;

/// One stage of a composition.
#[derive(Clone, Debug)]
pub enum Step {
    Leaf(StepDescriptor),
    Composite(TemplateInstance),
    Subroutine(SubroutineCall),
}

impl From<StepDescriptor> for Step {
    fn from(descriptor: StepDescriptor) -> Self {
        Step::Leaf(descriptor)
    }
}

impl From<TemplateInstance> for Step {
    fn from(instance: TemplateInstance) -> Self {
        Step::Composite(instance)
    }
}

impl From<SubroutineCall> for Step {
    fn from(call: SubroutineCall) -> Self {
        Step::Subroutine(call)
    }
}

/// Declaration of a leaf step.
#[derive(Clone, Default)]
pub struct StepDescriptor {
    pub(crate) annotation: Option<String>,
    pub(crate) compose: Option<bool>,
    pub(crate) dependencies: Vec<DependencyRef>,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) transform: Option<TransformFn>,
    pub(crate) cache: Option<CacheMode>,
    pub(crate) update: Option<UpdateDescription>,
}

impl StepDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Overrides whether the step composes. Every step but the last must compose;
    /// the last composes exactly when its composition does.
    pub fn compose(mut self, compose: bool) -> Self {
        self.compose = Some(compose);
        self
    }

    pub fn dependencies<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<DependencyRef>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn compute(mut self, compute: impl Fn(&StepDependencies, Option<&Continuation>) -> anyhow::Result<Outcome> + Send + Sync + 'static) -> Self {
        self.compute = Some(Arc::new(compute));
        self
    }

    pub fn transform(
        mut self,
        transform: impl Fn(Value, &StepDependencies, Option<&Continuation>) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.cache = Some(mode);
        self
    }

    pub fn update(mut self, update: UpdateDescription) -> Self {
        self.update = Some(update);
        self
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StepDescriptor")
            .field("annotation", &self.annotation)
            .field("compose", &self.compose)
            .field("dependencies", &self.dependencies)
            .field("compute", &self.compute.is_some())
            .field("transform", &self.transform.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Invokes the subroutine bound to one of the composition's inputs.
///
/// `inputs` are tokens in the calling composition's scope; `outputs` renames the
/// subroutine's outputs into the caller's `#internal` names.
#[derive(Debug, Clone)]
pub struct SubroutineCall {
    pub(crate) input: String,
    pub(crate) inputs: IndexMap<String, InputToken>,
    pub(crate) outputs: IndexMap<String, String>,
}

impl SubroutineCall {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, token: InputToken) -> Self {
        self.inputs.insert(name.into(), token);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>, renamed: impl Into<String>) -> Self {
        self.outputs.insert(output.into(), renamed.into());
        self
    }
}
