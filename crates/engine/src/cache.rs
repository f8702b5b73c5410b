//! Step memoization and cache timing reports.
//!
//! Each top-level resolved composition owns one [`CompositionCache`], shared
//! with the compositions nested inside it. Buckets are keyed by a per-cache step
//! id, so two steps with the same annotation never share entries; timings are
//! aggregated per annotation for operators deciding which steps to cache.

use std::{
    collections::HashMap,
    fmt::Write as _,
    hash::{Hash, Hasher},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::executor::{EvaluationMode, Outcome};

/// How a step's results are memoized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Reuse the stored outcome whenever the arguments are equal.
    Aggressive,
}

/// Identifies a cached step inside one [`CompositionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StepCacheId(usize);

/// Evaluation mode plus the step's declared arguments; `None` marks an unavailable one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheKey {
    mode: EvaluationMode,
    arguments: Vec<Option<Value>>,
}

impl CacheKey {
    pub(crate) fn new(mode: EvaluationMode, arguments: Vec<Option<Value>>) -> Self {
        Self { mode, arguments }
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mode.hash(state);
        state.write_usize(self.arguments.len());
        for argument in &self.arguments {
            match argument {
                Some(value) => {
                    state.write_u8(1);
                    hash_value(value, state);
                }
                None => state.write_u8(0),
            }
        }
    }
}

/// Structural hash agreeing with `Value` equality; object entries are hashed in key order.
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(flag) => {
            state.write_u8(1);
            flag.hash(state);
        }
        Value::Number(number) => {
            state.write_u8(2);
            number.hash(state);
        }
        Value::String(text) => {
            state.write_u8(3);
            text.hash(state);
        }
        Value::Array(items) => {
            state.write_u8(4);
            state.write_usize(items.len());
            items.iter().for_each(|item| hash_value(item, state));
        }
        Value::Object(map) => {
            state.write_u8(5);
            state.write_usize(map.len());
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|left, right| left.0.cmp(right.0));
            for (key, item) in entries {
                key.hash(state);
                hash_value(item, state);
            }
        }
    }
}

#[derive(Debug, Default)]
struct StepTimings {
    reads: Vec<Duration>,
    evaluations: Vec<Duration>,
    hits: u64,
    misses: u64,
}

/// Memoized outcomes and timings for the steps of one composition tree.
#[derive(Debug, Default)]
pub struct CompositionCache {
    next_step: AtomicUsize,
    buckets: Mutex<HashMap<StepCacheId, HashMap<CacheKey, Outcome>>>,
    timings: Mutex<IndexMap<String, StepTimings>>,
}

impl CompositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_step(&self) -> StepCacheId {
        StepCacheId(self.next_step.fetch_add(1, Ordering::Relaxed))
    }

    /// Looks up a stored outcome, recording the read time and a hit or miss.
    pub(crate) fn lookup(&self, step: StepCacheId, label: &str, key: &CacheKey) -> Option<Outcome> {
        let started = Instant::now();
        let found = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&step)
            .and_then(|bucket| bucket.get(key))
            .cloned();

        let mut timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = timings.entry(label.to_string()).or_default();
        entry.reads.push(started.elapsed());
        if found.is_some() {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
        found
    }

    pub(crate) fn store(&self, step: StepCacheId, label: &str, key: CacheKey, outcome: Outcome, evaluation: Duration) {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(step)
            .or_default()
            .insert(key, outcome);
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(label.to_string())
            .or_default()
            .evaluations
            .push(evaluation);
    }

    /// Drops every stored outcome and timing.
    pub fn clear(&self) {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.timings.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Per-annotation summaries in first-recorded order.
    pub fn report(&self) -> Vec<CacheReport> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(annotation, timings)| CacheReport {
                annotation: annotation.clone(),
                hits: timings.hits,
                misses: timings.misses,
                read: TimingSummary::from_samples(&timings.reads),
                evaluate: TimingSummary::from_samples(&timings.evaluations),
            })
            .collect()
    }

    /// Formats [`CompositionCache::report`] as a console table.
    pub fn render_report(&self) -> String {
        let reports = self.report();
        if reports.is_empty() {
            return "no cached steps were evaluated\n".to_string();
        }

        let width = reports.iter().map(|report| report.annotation.len()).max().unwrap_or(0).max("step".len());
        let mut rendered = String::new();
        let _ = writeln!(
            rendered,
            "{:<width$}  {:>6}  {:>6}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
            "step", "hits", "misses", "read mean", "read p50", "read p95", "eval mean", "eval p50", "eval p95"
        );
        for report in &reports {
            let _ = writeln!(
                rendered,
                "{:<width$}  {:>6}  {:>6}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
                report.annotation,
                report.hits,
                report.misses,
                format_micros(report.read.mean_micros),
                format_micros(report.read.p50_micros),
                format_micros(report.read.p95_micros),
                format_micros(report.evaluate.mean_micros),
                format_micros(report.evaluate.p50_micros),
                format_micros(report.evaluate.p95_micros),
            );
        }
        rendered
    }

    /// Emits one `info` event per annotation.
    pub fn log_report(&self) {
        for report in self.report() {
            info!(
                step = %report.annotation,
                hits = report.hits,
                misses = report.misses,
                read_mean_us = report.read.mean_micros,
                read_p95_us = report.read.p95_micros,
                evaluate_mean_us = report.evaluate.mean_micros,
                evaluate_p95_us = report.evaluate.p95_micros,
                "cache timings"
            );
        }
    }
}

/// Cache statistics for one step annotation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub annotation: String,
    pub hits: u64,
    pub misses: u64,
    pub read: TimingSummary,
    pub evaluate: TimingSummary,
}

/// Summary of a set of duration samples, in microseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub mean_micros: f64,
    pub p50_micros: f64,
    pub p95_micros: f64,
    pub total_micros: f64,
}

impl TimingSummary {
    fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut micros: Vec<f64> = samples.iter().map(|sample| sample.as_nanos() as f64 / 1_000.0).collect();
        micros.sort_by(f64::total_cmp);
        let total: f64 = micros.iter().sum();

        Self {
            samples: micros.len(),
            mean_micros: total / micros.len() as f64,
            p50_micros: percentile(&micros, 0.50),
            p95_micros: percentile(&micros, 0.95),
            total_micros: total,
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn format_micros(micros: f64) -> String {
    if micros >= 1_000.0 {
        format!("{:.2}ms", micros / 1_000.0)
    } else {
        format!("{micros:.1}µs")
    }
}
