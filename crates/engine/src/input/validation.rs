//! Checks applied to input tokens and input values.
//!
//! Token shape checks run when a template is instantiated; value checks run
//! immediately for literals and again at call time for values that could only
//! be known once the ambient dependencies arrive.

use std::collections::BTreeSet;

use serde_json::Value;

use super::{InputDescriptor, InputKind};
use crate::{
    error::CompositeError,
    token::{InputToken, Subroutine},
};

/// Validate a concrete value against the declared constraints of `input`.
///
/// `null` short-circuits: it passes when the descriptor accepts null and fails
/// otherwise, without consulting the type tag or predicate.
pub fn validate_input_value(input: &str, value: &Value, descriptor: &InputDescriptor) -> Result<(), CompositeError> {
    if value.is_null() {
        if descriptor.accepts_null {
            return Ok(());
        }
        return Err(invalid_value(input, "expected a value, got null".to_string()));
    }

    if let Some(value_type) = descriptor.value_type
        && !value_type.matches(value)
    {
        return Err(invalid_value(input, format!("expected {value_type}, got {}", json_type_name(value))));
    }

    if let Some(predicate) = &descriptor.validate {
        predicate.check(value).map_err(|reason| invalid_value(input, reason))?;
    }

    Ok(())
}

/// Validate the shape of a token supplied for `input`, returning every problem found.
///
/// Literal tokens are also validated against the descriptor right away.
pub fn validate_token_shape(input: &str, token: &InputToken, descriptor: &InputDescriptor) -> Vec<CompositeError> {
    let mut errors = Vec::new();

    if !descriptor.kind.accepts(token.kind()) {
        errors.push(CompositeError::MismatchedToken {
            input: input.to_string(),
            expected: descriptor.kind.expectation(),
            found: token.kind(),
        });
        return errors;
    }

    if let (InputKind::Subroutine { inputs, outputs }, InputToken::Subroutine(subroutine)) = (&descriptor.kind, token)
        && let Err(error) = validate_subroutine_shape(input, subroutine, inputs, outputs)
    {
        errors.push(error);
    }

    if let Some(literal) = token.literal()
        && let Err(error) = validate_input_value(input, literal, descriptor)
    {
        errors.push(error);
    }

    errors
}

/// The subroutine's declared inputs and outputs must match the expected names exactly.
pub(crate) fn validate_subroutine_shape(
    input: &str,
    subroutine: &Subroutine,
    expected_inputs: &[String],
    expected_outputs: &[String],
) -> Result<(), CompositeError> {
    let mut mismatches = Vec::new();
    compare_names("input", &subroutine.input_names(), expected_inputs, &mut mismatches);
    compare_names("output", &subroutine.output_names(), expected_outputs, &mut mismatches);

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(CompositeError::SubroutineMismatch {
            input: input.to_string(),
            mismatches,
        })
    }
}

fn compare_names(label: &str, declared: &[String], expected: &[String], mismatches: &mut Vec<String>) {
    let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();

    let missing: Vec<&str> = expected.difference(&declared).copied().collect();
    if !missing.is_empty() {
        mismatches.push(format!("missing {label}s {}", quote_all(&missing)));
    }

    let unexpected: Vec<&str> = declared.difference(&expected).copied().collect();
    if !unexpected.is_empty() {
        mismatches.push(format!("unexpected {label}s {}", quote_all(&unexpected)));
    }
}

fn quote_all(names: &[&str]) -> String {
    names.iter().map(|name| format!("`{name}`")).collect::<Vec<_>>().join(", ")
}

fn invalid_value(input: &str, reason: String) -> CompositeError {
    CompositeError::InvalidInputValue {
        input: input.to_string(),
        reason,
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
