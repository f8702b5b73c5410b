//! Loading the ambient dependency map a composition is evaluated against.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use composite_engine::Dependencies;
use serde_json::Value;

/// Reads a dependency map from a JSON or YAML file, chosen by extension.
pub fn load_file(path: &Path) -> Result<Dependencies> {
    let text = fs::read_to_string(path).with_context(|| format!("read dependencies from {}", path.display()))?;
    let value: Value = match path.extension().and_then(|extension| extension.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&text).with_context(|| format!("parse YAML in {}", path.display()))?,
        _ => serde_json::from_str(&text).with_context(|| format!("parse JSON in {}", path.display()))?,
    };
    into_dependencies(value).with_context(|| format!("dependencies in {}", path.display()))
}

/// Parses an inline JSON object such as `{"amount": 21}`.
pub fn parse_inline(text: &str) -> Result<Dependencies> {
    let value: Value = serde_json::from_str(text).context("parse inline dependencies")?;
    into_dependencies(value)
}

/// Parses a `--value` argument as JSON, falling back to a plain string.
pub fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Later maps win on conflicting names.
pub fn merge(layers: impl IntoIterator<Item = Dependencies>) -> Dependencies {
    let mut merged = Dependencies::new();
    for layer in layers {
        merged.extend(layer);
    }
    merged
}

fn into_dependencies(value: Value) -> Result<Dependencies> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(Dependencies::new()),
        other => bail!("expected an object of named dependencies, found {}", kind_of(&other)),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
