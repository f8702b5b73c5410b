//! Composite descriptions and their static validation.
//!
//! A [`CompositeDescription`] is the declaration of a derived computation:
//! named inputs, output names, and a function producing the ordered steps.
//! [`CompositeDescription::build`] checks the declaration structurally and, on
//! success, yields a [`CompositeTemplate`] whose only job is to instantiate.

use std::{fmt, sync::Arc};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{CompositeError, ErrorContext, Result},
    input::{InputDescriptor, InputKind, UpdateDescription, validate_token_shape},
    instance::TemplateInstance,
    step::Step,
    token::{INTERNAL_PREFIX, InputToken, TokenKind},
};

/// Produces the ordered step list of a composition.
pub type StepsFn = Arc<dyn Fn() -> Vec<Step> + Send + Sync>;

/// Computes output names from the static metadata of the bound inputs.
pub type OutputsFn = Arc<dyn Fn(&IndexMap<String, Value>) -> Vec<String> + Send + Sync>;

const ANONYMOUS_ANNOTATION: &str = "<anonymous composition>";

/// Output names of a composition.
#[derive(Clone)]
pub enum OutputNames {
    Fixed(Vec<String>),
    Computed(OutputsFn),
}

/// Static declaration of a composite.
#[derive(Clone)]
pub struct CompositeDescription {
    annotation: Option<String>,
    inputs: IndexMap<String, InputDescriptor>,
    outputs: OutputNames,
    steps: Option<StepsFn>,
    update: Option<UpdateDescription>,
    compose: bool,
}

impl CompositeDescription {
    pub fn new(annotation: impl Into<String>) -> Self {
        Self {
            annotation: Some(annotation.into()),
            ..Self::anonymous()
        }
    }

    pub fn anonymous() -> Self {
        Self {
            annotation: None,
            inputs: IndexMap::new(),
            outputs: OutputNames::Fixed(Vec::new()),
            steps: None,
            update: None,
            compose: true,
        }
    }

    pub fn input(mut self, name: impl Into<String>, descriptor: InputDescriptor) -> Self {
        self.inputs.insert(name.into(), descriptor);
        self
    }

    pub fn outputs<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.outputs = OutputNames::Fixed(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn computed_outputs(mut self, outputs: impl Fn(&IndexMap<String, Value>) -> Vec<String> + Send + Sync + 'static) -> Self {
        self.outputs = OutputNames::Computed(Arc::new(outputs));
        self
    }

    pub fn steps(mut self, steps: impl Fn() -> Vec<Step> + Send + Sync + 'static) -> Self {
        self.steps = Some(Arc::new(steps));
        self
    }

    pub fn update(mut self, update: UpdateDescription) -> Self {
        self.update = Some(update);
        self
    }

    /// Whether the composition is meant to be nested inside another. Defaults to true.
    pub fn compose(mut self, compose: bool) -> Self {
        self.compose = compose;
        self
    }

    pub fn annotation(&self) -> &str {
        self.annotation.as_deref().unwrap_or(ANONYMOUS_ANNOTATION)
    }

    /// Checks the declaration and yields the template that instantiates it.
    ///
    /// Every problem is collected before failing, under "errors in description for".
    pub fn build(self) -> Result<CompositeTemplate> {
        let mut errors = Vec::new();

        if self.steps.is_none() {
            errors.push(CompositeError::MissingSteps);
        }

        for (name, descriptor) in &self.inputs {
            errors.extend(validate_input_declaration(name, descriptor));
        }

        if let OutputNames::Fixed(names) = &self.outputs {
            errors.extend(validate_output_names(names));
        }

        CompositeError::check(
            ErrorContext::Description {
                annotation: self.annotation().to_string(),
            },
            errors,
        )?;

        debug!(composition = self.annotation(), inputs = self.inputs.len(), "built composite description");
        Ok(CompositeTemplate {
            description: Arc::new(self),
        })
    }
}

fn validate_input_declaration(name: &str, descriptor: &InputDescriptor) -> Vec<CompositeError> {
    let mut errors = Vec::new();
    let mut invalid = |reason: String| {
        errors.push(CompositeError::InvalidInputDeclaration {
            input: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        invalid("input names must not be empty".to_string());
    }

    if let InputKind::Subroutine { inputs, outputs } = &descriptor.kind {
        if inputs.iter().any(String::is_empty) {
            invalid("subroutine input names must not be empty".to_string());
        }
        for output in outputs {
            if let Some(reason) = output_name_problem(output) {
                invalid(format!("subroutine output `{output}` {reason}"));
            }
        }
    }

    if let Some(default) = &descriptor.default {
        if default.kind() == TokenKind::Input {
            invalid("defaults cannot forward an enclosing composition's input".to_string());
        } else if !descriptor.kind.accepts(default.kind()) {
            invalid(format!("default {} token does not fit {}", default.kind(), descriptor.kind.expectation()));
        } else {
            for error in validate_token_shape(name, default, descriptor) {
                invalid(format!("default is invalid: {error}"));
            }
        }
    }

    errors
}

fn validate_output_names(names: &[String]) -> Vec<CompositeError> {
    let mut errors = Vec::new();
    let mut seen = IndexSet::new();
    for name in names {
        if let Some(reason) = output_name_problem(name) {
            errors.push(CompositeError::InvalidOutputName {
                name: name.clone(),
                reason: reason.to_string(),
            });
        } else if !seen.insert(name.as_str()) {
            errors.push(CompositeError::InvalidOutputName {
                name: name.clone(),
                reason: "declared more than once".to_string(),
            });
        }
    }
    errors
}

fn output_name_problem(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        Some("must not be empty")
    } else if !name.starts_with(INTERNAL_PREFIX) {
        Some("must start with `#`")
    } else if name.len() == INTERNAL_PREFIX.len_utf8() {
        Some("must name something after `#`")
    } else {
        None
    }
}

/// A validated description; instantiating it binds input options.
#[derive(Clone)]
pub struct CompositeTemplate {
    description: Arc<CompositeDescription>,
}

impl CompositeTemplate {
    pub fn annotation(&self) -> &str {
        self.description.annotation()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.description.inputs.keys().cloned().collect()
    }

    pub fn input(&self, name: &str) -> Option<&InputDescriptor> {
        self.description.inputs.get(name)
    }

    pub(crate) fn inputs(&self) -> &IndexMap<String, InputDescriptor> {
        &self.description.inputs
    }

    pub fn composes(&self) -> bool {
        self.description.compose
    }

    pub(crate) fn update(&self) -> Option<&UpdateDescription> {
        self.description.update.as_ref()
    }

    pub(crate) fn make_steps(&self) -> Vec<Step> {
        match &self.description.steps {
            Some(steps) => steps(),
            None => Vec::new(),
        }
    }

    /// Output names for the given options; defaults fill the metadata of inputs not supplied.
    pub fn output_names_for(&self, options: &IndexMap<String, InputToken>) -> Vec<String> {
        match &self.description.outputs {
            OutputNames::Fixed(names) => names.clone(),
            OutputNames::Computed(outputs) => outputs(&self.input_metadata(options)),
        }
    }

    fn input_metadata(&self, options: &IndexMap<String, InputToken>) -> IndexMap<String, Value> {
        self.description
            .inputs
            .iter()
            .map(|(name, descriptor)| {
                let metadata = options
                    .get(name)
                    .or(descriptor.default.as_ref())
                    .map_or(Value::Null, InputToken::metadata);
                (name.clone(), metadata)
            })
            .collect()
    }

    /// Binds input options, failing with every mismatch under "errors in input options passed to".
    pub fn instantiate<I, K>(&self, options: I) -> Result<TemplateInstance>
    where
        I: IntoIterator<Item = (K, InputToken)>,
        K: Into<String>,
    {
        let options: IndexMap<String, InputToken> = options.into_iter().map(|(name, token)| (name.into(), token)).collect();
        let mut errors = Vec::new();

        for (name, token) in &options {
            match self.description.inputs.get(name) {
                Some(descriptor) => errors.extend(validate_token_shape(name, token, descriptor)),
                None => errors.push(CompositeError::UnexpectedInput { input: name.clone() }),
            }
        }

        for (name, descriptor) in &self.description.inputs {
            if !options.contains_key(name) && !descriptor.has_default() {
                errors.push(CompositeError::MissingInput { input: name.clone() });
            }
        }

        let output_names = self.output_names_for(&options);
        if matches!(self.description.outputs, OutputNames::Computed(_)) {
            errors.extend(validate_output_names(&output_names));
        }

        CompositeError::check(
            ErrorContext::InputOptions {
                annotation: self.annotation().to_string(),
            },
            errors,
        )?;

        Ok(TemplateInstance::new(self.clone(), options, output_names))
    }
}

impl fmt::Debug for CompositeTemplate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CompositeTemplate")
            .field("annotation", &self.annotation())
            .field("inputs", &self.description.inputs.keys().collect::<Vec<_>>())
            .field("compose", &self.description.compose)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::Outcome,
        input::ValueType,
        step::StepDescriptor,
        token::DependencyRef,
    };
    use serde_json::json;

    fn constant_step() -> Step {
        StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(1))).into()
    }

    #[test]
    fn build_collects_every_structural_problem() {
        let error = CompositeDescription::new("withBrokenShape")
            .input("mode", InputDescriptor::static_value().default_dependency("mode"))
            .input("limit", InputDescriptor::dynamic().value_type(ValueType::Number).default_value("ten"))
            .outputs(["total", "#", "#count", "#count"])
            .build()
            .expect_err("description is invalid");

        assert_eq!(
            error.context(),
            Some(&ErrorContext::Description {
                annotation: "withBrokenShape".into()
            })
        );
        let messages: Vec<String> = error.leaves().iter().map(ToString::to_string).collect();
        assert!(messages.iter().any(|message| message == "steps must be provided as a function"), "{messages:?}");
        assert!(messages.iter().any(|message| message.contains("input `mode`")), "{messages:?}");
        assert!(messages.iter().any(|message| message.contains("input `limit`") && message.contains("expected number")), "{messages:?}");
        assert!(messages.iter().any(|message| message.contains("`total`") && message.contains("start with `#`")), "{messages:?}");
        assert!(messages.iter().any(|message| message.contains("`#`") && message.contains("after")), "{messages:?}");
        assert!(messages.iter().any(|message| message.contains("declared more than once")), "{messages:?}");
    }

    #[test]
    fn instantiate_accepts_exactly_the_declared_inputs() {
        let template = CompositeDescription::new("withRange")
            .input("from", InputDescriptor::dynamic())
            .input("limit", InputDescriptor::dynamic().default_value(10))
            .steps(|| vec![constant_step()])
            .build()
            .expect("template builds");

        assert!(template.instantiate([("from", InputToken::dependency("tracks"))]).is_ok());
        assert!(
            template
                .instantiate([("from", InputToken::dependency("tracks")), ("limit", InputToken::value(3))])
                .is_ok()
        );

        let error = template
            .instantiate([("from", InputToken::dependency("tracks")), ("step", InputToken::value(2))])
            .expect_err("unexpected input rejected");
        assert!(error.to_string().contains("errors in input options passed to `withRange`"), "{error}");
        assert!(error.to_string().contains("unexpected input `step`"), "{error}");
    }

    #[test]
    fn instantiate_reports_missing_and_misshaped_inputs_together() {
        let template = CompositeDescription::new("withProperty")
            .input("property", InputDescriptor::static_dependency())
            .input("object", InputDescriptor::dynamic())
            .steps(|| vec![constant_step()])
            .build()
            .expect("template builds");

        let error = template
            .instantiate([("property", InputToken::value("name"))])
            .expect_err("options are invalid");
        let leaves = error.leaves();
        assert_eq!(leaves.len(), 2);
        assert!(matches!(leaves[0], CompositeError::MismatchedToken { input, .. } if input == "property"));
        assert!(matches!(leaves[1], CompositeError::MissingInput { input } if input == "object"));
    }

    #[test]
    fn computed_outputs_follow_static_metadata() {
        let template = CompositeDescription::new("withPropertyFrom")
            .input("property", InputDescriptor::static_value().value_type(ValueType::String))
            .computed_outputs(|metadata| {
                let property = metadata.get("property").and_then(Value::as_str).unwrap_or_default();
                vec![format!("#{property}")]
            })
            .steps(|| {
                vec![
                    StepDescriptor::new()
                        .dependencies([DependencyRef::input_metadata("property")])
                        .compute(|dependencies, continuation| {
                            let property = dependencies.input_metadata("property").cloned().unwrap_or_default();
                            match continuation {
                                Some(continuation) => continuation.raise_output(crate::token::dependencies([(
                                    format!("#{}", property.as_str().unwrap_or_default()),
                                    json!(true),
                                )])),
                                None => Ok(Outcome::exit(property)),
                            }
                        })
                        .into(),
                ]
            })
            .build()
            .expect("template builds");

        let instance = template
            .instantiate([("property", InputToken::static_value("name"))])
            .expect("instantiates");
        assert_eq!(instance.output_names(), ["#name".to_string()]);

        let error = template
            .instantiate([("property", InputToken::static_value(""))])
            .expect_err("empty property produces a bare `#`");
        assert!(error.to_string().contains("invalid output name `#`"), "{error}");
    }
}
