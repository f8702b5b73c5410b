//! # Composite Engine
//!
//! The composite engine declares, resolves, and evaluates *derived properties*:
//! named computations with typed inputs, ordered compute/transform steps, nested
//! sub-computations, explicit early-exit and output-raising control flow, and
//! optional per-step memoization.
//!
//! ## Usage
//!
//! ```rust
//! use composite_engine::{
//!     CompositeDescription, DependencyRef, InputDescriptor, InputToken, Outcome, StepDescriptor, ValueType, dependencies,
//! };
//! use serde_json::json;
//!
//! let double = CompositeDescription::new("double")
//!     .input("n", InputDescriptor::dynamic().value_type(ValueType::Number))
//!     .steps(|| {
//!         vec![
//!             StepDescriptor::new()
//!                 .dependencies([DependencyRef::input("n")])
//!                 .compute(|step, _| {
//!                     let n = step.input("n").and_then(|value| value.as_i64()).unwrap_or_default();
//!                     Ok(Outcome::exit(n * 2))
//!                 })
//!                 .into(),
//!         ]
//!     })
//!     .build()?;
//!
//! let resolved = double.instantiate([("n", InputToken::dependency("amount"))])?.to_resolved_composition()?;
//! assert_eq!(resolved.compute(&dependencies([("amount", json!(21))]))?, json!(42));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`token`**: input tokens, dependency references, and subroutine wrappers
//! - **`input`**: input descriptors and their validation
//! - **`description`**: composite descriptions and the templates they build
//! - **`instance`**: templates bound to options and output renames
//! - **`resolve`**: lowering instances into executable compositions
//! - **`executor`**: the step walk, continuations, and the dependency audit
//! - **`cache`**: per-step memoization and timing reports
//! - **`config`** / **`trace`**: process-wide switches and step tracing

pub mod cache;
pub mod config;
pub mod description;
pub mod error;
pub mod executor;
pub mod input;
pub mod instance;
pub mod resolve;
pub mod step;
pub mod token;
pub mod trace;

pub use cache::{CacheMode, CacheReport, CompositionCache, TimingSummary};
pub use config::{EngineConfig, set_trace_enabled, trace_enabled};
pub use description::{CompositeDescription, CompositeTemplate};
pub use error::{CompositeError, ErrorContext, Result};
pub use executor::{Continuation, EvaluationMode, Outcome, StepDependencies};
pub use input::{InputDescriptor, InputKind, UpdateDescription, ValueType};
pub use instance::{InstanceDescription, TemplateInstance};
pub use resolve::{CompositionFlags, CompositionShape, ResolvedComposition, StepFlags, StepShape};
pub use step::{Step, StepDescriptor, SubroutineCall};
pub use token::{Dependencies, DependencyRef, InputToken, Subroutine, TokenKind, dependencies};
