//! Input descriptors: the declared shape of each named composition input.
//!
//! A descriptor fixes the token category an input accepts for its whole
//! lifetime, an optional type tag and predicate for its values, whether `null`
//! is acceptable, and an optional default token used when an instantiation does
//! not supply the input.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::token::{InputToken, TokenKind};

pub mod validation;

pub use validation::{validate_input_value, validate_token_shape};

/// Primitive JSON type an input value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ValueType::String, Value::String(_))
                | (ValueType::Number, Value::Number(_))
                | (ValueType::Boolean, Value::Bool(_))
                | (ValueType::Array, Value::Array(_))
                | (ValueType::Object, Value::Object(_))
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        formatter.write_str(label)
    }
}

/// Custom check applied to a value. The error string explains the rejection.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>);

impl Predicate {
    pub fn new(check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    pub fn check(&self, value: &Value) -> Result<(), String> {
        (self.0)(value)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Predicate(..)")
    }
}

/// Token category an input accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Any token that yields a value at call time.
    Dynamic,
    /// A dependency name known at definition time.
    StaticDependency,
    /// A literal known at definition time.
    StaticValue,
    /// A template with exactly these input and output names.
    Subroutine { inputs: Vec<String>, outputs: Vec<String> },
}

impl InputKind {
    pub fn accepts(&self, kind: TokenKind) -> bool {
        match self {
            InputKind::Dynamic => kind != TokenKind::Subroutine,
            InputKind::StaticDependency => matches!(kind, TokenKind::Dependency | TokenKind::StaticDependency),
            InputKind::StaticValue => matches!(kind, TokenKind::Value | TokenKind::StaticValue),
            InputKind::Subroutine { .. } => kind == TokenKind::Subroutine,
        }
    }

    /// Phrase used in mismatch errors.
    pub fn expectation(&self) -> &'static str {
        match self {
            InputKind::Dynamic => "a value, dependency, or marker token",
            InputKind::StaticDependency => "a static dependency token",
            InputKind::StaticValue => "a static value token",
            InputKind::Subroutine { .. } => "a subroutine token",
        }
    }
}

/// Declared constraints for one named input.
#[derive(Debug, Clone)]
pub struct InputDescriptor {
    pub(crate) kind: InputKind,
    pub(crate) value_type: Option<ValueType>,
    pub(crate) validate: Option<Predicate>,
    pub(crate) default: Option<InputToken>,
    pub(crate) accepts_null: bool,
}

impl InputDescriptor {
    fn of_kind(kind: InputKind) -> Self {
        Self {
            kind,
            value_type: None,
            validate: None,
            default: None,
            accepts_null: false,
        }
    }

    pub fn dynamic() -> Self {
        Self::of_kind(InputKind::Dynamic)
    }

    pub fn static_dependency() -> Self {
        Self::of_kind(InputKind::StaticDependency)
    }

    pub fn static_value() -> Self {
        Self::of_kind(InputKind::StaticValue)
    }

    pub fn subroutine<I, O>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self::of_kind(InputKind::Subroutine {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        })
    }

    /// A dynamic input defaulting to the value being transformed.
    pub fn update_value(update: Option<UpdateDescription>) -> Self {
        let mut descriptor = Self::dynamic();
        descriptor.default = Some(InputToken::UpdateValue(update));
        descriptor.accepts_null = true;
        descriptor
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn validate(mut self, check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validate = Some(Predicate::new(check));
        self
    }

    pub fn accepts_null(mut self, accepts_null: bool) -> Self {
        self.accepts_null = accepts_null;
        self
    }

    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let token = match self.kind {
            InputKind::StaticValue => InputToken::StaticValue(value.into()),
            _ => InputToken::Value(value.into()),
        };
        self.default_token(token)
    }

    pub fn default_dependency(self, name: impl Into<String>) -> Self {
        let token = match self.kind {
            InputKind::StaticDependency => InputToken::StaticDependency(name.into()),
            _ => InputToken::Dependency(name.into()),
        };
        self.default_token(token)
    }

    pub fn default_token(mut self, token: InputToken) -> Self {
        self.default = Some(token);
        self
    }

    pub fn kind(&self) -> &InputKind {
        &self.kind
    }

    pub fn default_source(&self) -> Option<&InputToken> {
        self.default.as_ref()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Rules applied to a value before a composition transforms it.
#[derive(Debug, Clone, Default)]
pub struct UpdateDescription {
    pub value_type: Option<ValueType>,
    pub validate: Option<Predicate>,
}

impl UpdateDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn validate(mut self, check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validate = Some(Predicate::new(check));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.value_type.is_none() && self.validate.is_none()
    }

    /// Overlays `other` field by field; later contributions win.
    pub fn merge(&mut self, other: &UpdateDescription) {
        if other.value_type.is_some() {
            self.value_type = other.value_type;
        }
        if other.validate.is_some() {
            self.validate = other.validate.clone();
        }
    }

    pub fn check(&self, value: &Value) -> Result<(), String> {
        if let Some(value_type) = self.value_type
            && !value.is_null()
            && !value_type.matches(value)
        {
            return Err(format!("expected {value_type}, got {}", validation::json_type_name(value)));
        }
        match &self.validate {
            Some(predicate) => predicate.check(value),
            None => Ok(()),
        }
    }
}
