//! Engine configuration read from the environment.
//!
//! Supported variables:
//! - `COMPOSITE_TRACE`: emit step-by-step trace events at `info` level.
//! - `COMPOSITE_AUDIT`: run the first-call dependency audit (on by default).
//! - `COMPOSITE_CACHE`: honour aggressive step caches (on by default).

use std::{
    env,
    sync::{PoisonError, RwLock},
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const TRACE_ENV: &str = "COMPOSITE_TRACE";
pub const AUDIT_ENV: &str = "COMPOSITE_AUDIT";
pub const CACHE_ENV: &str = "COMPOSITE_CACHE";

static CURRENT: Lazy<RwLock<EngineConfig>> = Lazy::new(|| RwLock::new(EngineConfig::from_env()));

/// Switches read at the start of every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub trace_steps: bool,
    pub audit_dependencies: bool,
    pub cache_steps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trace_steps: false,
            audit_dependencies: true,
            cache_steps: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whichever `COMPOSITE_*` variables are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trace_steps: flag_from_environment(TRACE_ENV).unwrap_or(defaults.trace_steps),
            audit_dependencies: flag_from_environment(AUDIT_ENV).unwrap_or(defaults.audit_dependencies),
            cache_steps: flag_from_environment(CACHE_ENV).unwrap_or(defaults.cache_steps),
        }
    }

    /// The process-wide configuration.
    pub fn current() -> Self {
        *CURRENT.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the process-wide configuration.
    pub fn install(self) {
        *CURRENT.write().unwrap_or_else(PoisonError::into_inner) = self;
    }
}

/// Turns verbose step tracing on or off for the whole process.
pub fn set_trace_enabled(enabled: bool) {
    CURRENT.write().unwrap_or_else(PoisonError::into_inner).trace_steps = enabled;
}

pub fn trace_enabled() -> bool {
    EngineConfig::current().trace_steps
}

fn flag_from_environment(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    let parsed = parse_flag(raw.trim());
    if parsed.is_none() {
        warn!(variable = key, value = %raw, "ignoring unrecognised boolean value");
    }
    parsed
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
