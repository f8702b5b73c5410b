//! Input tokens and step dependency references.
//!
//! An [`InputToken`] says where the value of one composition input comes from:
//! a literal, an ambient dependency, the enclosing composition's own input, a
//! subroutine, or one of the special markers. A [`DependencyRef`] is what a step
//! lists in its dependency declaration and what it reads back at call time.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    description::CompositeTemplate,
    error::Result,
    input::UpdateDescription,
    instance::TemplateInstance,
};

/// Plain key/value map exchanged with collaborators and between steps.
pub type Dependencies = IndexMap<String, Value>;

/// Ambient dependency holding the evaluation subject.
pub const MYSELF_DEPENDENCY: &str = "this";
/// Ambient dependency holding the name of the property being computed.
pub const THIS_PROPERTY_DEPENDENCY: &str = "thisProperty";
/// Prefix reserved for dependencies produced inside a composition.
pub const INTERNAL_PREFIX: char = '#';

/// Builds a dependency map from `(name, value)` pairs.
pub fn dependencies<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Dependencies {
    entries.into_iter().map(|(name, value)| (name.into(), value)).collect()
}

/// True for names produced inside a composition (`#total`, `#tracks`, ...).
pub fn is_internal_name(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Where an input value comes from.
#[derive(Debug, Clone)]
pub enum InputToken {
    /// A literal value.
    Value(Value),
    /// The name of an ambient (or `#internal`) dependency.
    Dependency(String),
    /// The enclosing composition's own input of this name.
    Input(String),
    /// A composition invoked as a step, remapped at the call site.
    Subroutine(Subroutine),
    /// The evaluation subject.
    Myself,
    /// The name of the property being computed.
    ThisProperty,
    /// The value currently being transformed, optionally with the update rules it brings.
    UpdateValue(Option<UpdateDescription>),
    /// A dependency name fixed at definition time.
    StaticDependency(String),
    /// A literal fixed at definition time.
    StaticValue(Value),
}

/// Shape of an [`InputToken`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenKind {
    Value,
    Dependency,
    Input,
    Subroutine,
    Myself,
    ThisProperty,
    UpdateValue,
    StaticDependency,
    StaticValue,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TokenKind::Value => "value",
            TokenKind::Dependency => "dependency",
            TokenKind::Input => "input",
            TokenKind::Subroutine => "subroutine",
            TokenKind::Myself => "myself",
            TokenKind::ThisProperty => "thisProperty",
            TokenKind::UpdateValue => "updateValue",
            TokenKind::StaticDependency => "staticDependency",
            TokenKind::StaticValue => "staticValue",
        };
        formatter.write_str(label)
    }
}

impl InputToken {
    pub fn value(value: impl Into<Value>) -> Self {
        InputToken::Value(value.into())
    }

    pub fn dependency(name: impl Into<String>) -> Self {
        InputToken::Dependency(name.into())
    }

    pub fn input(name: impl Into<String>) -> Self {
        InputToken::Input(name.into())
    }

    pub fn subroutine(subroutine: impl Into<Subroutine>) -> Self {
        InputToken::Subroutine(subroutine.into())
    }

    pub fn myself() -> Self {
        InputToken::Myself
    }

    pub fn this_property() -> Self {
        InputToken::ThisProperty
    }

    pub fn update_value() -> Self {
        InputToken::UpdateValue(None)
    }

    pub fn update_value_with(update: UpdateDescription) -> Self {
        InputToken::UpdateValue(Some(update))
    }

    pub fn static_dependency(name: impl Into<String>) -> Self {
        InputToken::StaticDependency(name.into())
    }

    pub fn static_value(value: impl Into<Value>) -> Self {
        InputToken::StaticValue(value.into())
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            InputToken::Value(_) => TokenKind::Value,
            InputToken::Dependency(_) => TokenKind::Dependency,
            InputToken::Input(_) => TokenKind::Input,
            InputToken::Subroutine(_) => TokenKind::Subroutine,
            InputToken::Myself => TokenKind::Myself,
            InputToken::ThisProperty => TokenKind::ThisProperty,
            InputToken::UpdateValue(_) => TokenKind::UpdateValue,
            InputToken::StaticDependency(_) => TokenKind::StaticDependency,
            InputToken::StaticValue(_) => TokenKind::StaticValue,
        }
    }

    /// Literal payload of value tokens.
    pub fn literal(&self) -> Option<&Value> {
        match self {
            InputToken::Value(value) | InputToken::StaticValue(value) => Some(value),
            _ => None,
        }
    }

    /// Dependency name carried by dependency tokens.
    pub fn dependency_name(&self) -> Option<&str> {
        match self {
            InputToken::Dependency(name) | InputToken::StaticDependency(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn update_description(&self) -> Option<&UpdateDescription> {
        match self {
            InputToken::UpdateValue(update) => update.as_ref(),
            _ => None,
        }
    }

    /// What a step sees through [`DependencyRef::InputMetadata`]: the literal of
    /// value tokens, the name of dependency tokens, the annotation of subroutines.
    pub fn metadata(&self) -> Value {
        match self {
            InputToken::Value(value) | InputToken::StaticValue(value) => value.clone(),
            InputToken::Dependency(name) | InputToken::StaticDependency(name) => Value::String(name.clone()),
            InputToken::Subroutine(subroutine) => Value::String(subroutine.annotation().to_string()),
            InputToken::Input(_) | InputToken::Myself | InputToken::ThisProperty | InputToken::UpdateValue(_) => Value::Null,
        }
    }

    /// Ambient dependency this token reads when bound at the top level, if any.
    pub(crate) fn ambient_name(&self) -> Option<&str> {
        match self {
            InputToken::Dependency(name) | InputToken::StaticDependency(name) if !is_internal_name(name) => Some(name.as_str()),
            InputToken::Myself => Some(MYSELF_DEPENDENCY),
            InputToken::ThisProperty => Some(THIS_PROPERTY_DEPENDENCY),
            _ => None,
        }
    }
}

impl fmt::Display for InputToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputToken::Value(value) => write!(formatter, "value({value})"),
            InputToken::Dependency(name) => write!(formatter, "dependency({name})"),
            InputToken::Input(name) => write!(formatter, "input({name})"),
            InputToken::Subroutine(subroutine) => write!(formatter, "subroutine({})", subroutine.annotation()),
            InputToken::Myself => formatter.write_str("myself"),
            InputToken::ThisProperty => formatter.write_str("thisProperty"),
            InputToken::UpdateValue(_) => formatter.write_str("updateValue"),
            InputToken::StaticDependency(name) => write!(formatter, "staticDependency({name})"),
            InputToken::StaticValue(value) => write!(formatter, "staticValue({value})"),
        }
    }
}

/// A template passed as an input so the receiving composition can call it as a step.
///
/// Options already bound on the wrapped instance act as presets; the call site
/// supplies the rest and may rename outputs.
#[derive(Clone)]
pub struct Subroutine {
    template: CompositeTemplate,
    preset: IndexMap<String, InputToken>,
}

impl Subroutine {
    pub fn new(template: CompositeTemplate) -> Self {
        Self {
            template,
            preset: IndexMap::new(),
        }
    }

    pub fn from_instance(instance: &TemplateInstance) -> Self {
        Self {
            template: instance.template().clone(),
            preset: instance.options().clone(),
        }
    }

    pub fn annotation(&self) -> &str {
        self.template.annotation()
    }

    pub fn template(&self) -> &CompositeTemplate {
        &self.template
    }

    /// Every input the wrapped template declares.
    pub fn input_names(&self) -> Vec<String> {
        self.template.input_names()
    }

    /// Output names the wrapped template declares, computed against the presets.
    pub fn output_names(&self) -> Vec<String> {
        self.template.output_names_for(&self.preset)
    }

    /// Instantiates the wrapped template with the call site's inputs and output renames.
    pub(crate) fn call(&self, inputs: &IndexMap<String, InputToken>, outputs: &IndexMap<String, String>) -> Result<TemplateInstance> {
        let mut options = self.preset.clone();
        options.extend(inputs.iter().map(|(name, token)| (name.clone(), token.clone())));
        let instance = self.template.instantiate(options)?;
        if outputs.is_empty() {
            Ok(instance)
        } else {
            instance.outputs(outputs.clone())
        }
    }
}

impl fmt::Debug for Subroutine {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subroutine")
            .field("annotation", &self.annotation())
            .field("preset", &self.preset.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl From<CompositeTemplate> for Subroutine {
    fn from(template: CompositeTemplate) -> Self {
        Subroutine::new(template)
    }
}

impl From<&TemplateInstance> for Subroutine {
    fn from(instance: &TemplateInstance) -> Self {
        Subroutine::from_instance(instance)
    }
}

impl From<TemplateInstance> for Subroutine {
    fn from(instance: TemplateInstance) -> Self {
        Subroutine::from_instance(&instance)
    }
}

/// One entry in a step's dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyRef {
    /// An ambient dependency or a `#internal` one produced by an earlier step.
    Named(String),
    /// The resolved value of one of the composition's inputs.
    Input(String),
    /// Static metadata of one of the composition's inputs.
    InputMetadata(String),
    /// The evaluation subject.
    Myself,
    /// The name of the property being computed.
    ThisProperty,
    /// The value being transformed.
    UpdateValue,
}

impl DependencyRef {
    pub fn named(name: impl Into<String>) -> Self {
        DependencyRef::Named(name.into())
    }

    pub fn input(name: impl Into<String>) -> Self {
        DependencyRef::Input(name.into())
    }

    pub fn input_metadata(name: impl Into<String>) -> Self {
        DependencyRef::InputMetadata(name.into())
    }

    /// Ambient dependency this reference reads, if any.
    pub(crate) fn ambient_name(&self) -> Option<&str> {
        match self {
            DependencyRef::Named(name) if !is_internal_name(name) => Some(name.as_str()),
            DependencyRef::Myself => Some(MYSELF_DEPENDENCY),
            DependencyRef::ThisProperty => Some(THIS_PROPERTY_DEPENDENCY),
            _ => None,
        }
    }

    /// Composition input this reference points at, if any.
    pub(crate) fn input_name(&self) -> Option<&str> {
        match self {
            DependencyRef::Input(name) | DependencyRef::InputMetadata(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyRef::Named(name) => formatter.write_str(name),
            DependencyRef::Input(name) => write!(formatter, "input({name})"),
            DependencyRef::InputMetadata(name) => write!(formatter, "inputMetadata({name})"),
            DependencyRef::Myself => formatter.write_str("myself"),
            DependencyRef::ThisProperty => formatter.write_str("thisProperty"),
            DependencyRef::UpdateValue => formatter.write_str("updateValue"),
        }
    }
}

impl From<&str> for DependencyRef {
    fn from(name: &str) -> Self {
        DependencyRef::Named(name.to_string())
    }
}

impl From<String> for DependencyRef {
    fn from(name: String) -> Self {
        DependencyRef::Named(name)
    }
}
