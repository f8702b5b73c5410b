//! Step-by-step trace events.
//!
//! With tracing enabled the events go out at `info` under the `composite::trace`
//! target so an operator console shows them without raising the log level;
//! otherwise they are plain `trace` events.

use serde_json::Value;
use tracing::{info, trace};

use crate::executor::{EvaluationMode, Outcome};

pub const TRACE_TARGET: &str = "composite::trace";

pub(crate) fn step_started(enabled: bool, composition: &str, step: &str, mode: EvaluationMode, dependencies: &Value) {
    if enabled {
        info!(target: TRACE_TARGET, composition, step, mode = %mode, dependencies = %dependencies, "step started");
    } else {
        trace!(composition, step, mode = %mode, dependencies = %dependencies, "step started");
    }
}

pub(crate) fn step_finished(enabled: bool, composition: &str, step: &str, outcome: &Outcome, cached: bool) {
    let detail = describe_outcome(outcome);
    if enabled {
        info!(target: TRACE_TARGET, composition, step, outcome = outcome.label(), detail = %detail, cached, "step finished");
    } else {
        trace!(composition, step, outcome = outcome.label(), detail = %detail, cached, "step finished");
    }
}

pub(crate) fn step_skipped(enabled: bool, composition: &str, step: &str) {
    if enabled {
        info!(target: TRACE_TARGET, composition, step, "step skipped: nothing to compute");
    } else {
        trace!(composition, step, "step skipped: nothing to compute");
    }
}

fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Exit(value) => value.to_string(),
        Outcome::Continue { value, dependencies } => {
            let produced: Vec<&str> = dependencies.keys().map(String::as_str).collect();
            match value {
                Some(value) => format!("value={value} provides=[{}]", produced.join(", ")),
                None => format!("provides=[{}]", produced.join(", ")),
            }
        }
        Outcome::RaiseOutput(dependencies) | Outcome::RaiseOutputAbove(dependencies) => {
            serde_json::to_string(dependencies).unwrap_or_default()
        }
    }
}
