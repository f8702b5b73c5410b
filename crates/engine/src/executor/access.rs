//! Read-logging accessor over a step's visible dependencies.

use std::cell::RefCell;

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map as JsonMap, Value};

use crate::{error::CompositeError, token::DependencyRef};

/// The dependencies a step may read, filtered to its declaration.
///
/// Every lookup is logged so the first call of a step can be audited against
/// what it declared.
#[derive(Debug, Default)]
pub struct StepDependencies {
    values: IndexMap<DependencyRef, Value>,
    reads: RefCell<IndexSet<DependencyRef>>,
}

impl StepDependencies {
    pub(crate) fn new(values: IndexMap<DependencyRef, Value>) -> Self {
        Self {
            values,
            reads: RefCell::default(),
        }
    }

    /// An ambient or `#internal` dependency.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.lookup(&DependencyRef::named(name))
    }

    /// The resolved value of a composition input.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.lookup(&DependencyRef::input(name))
    }

    /// Static metadata of a composition input.
    pub fn input_metadata(&self, name: &str) -> Option<&Value> {
        self.lookup(&DependencyRef::input_metadata(name))
    }

    pub fn myself(&self) -> Option<&Value> {
        self.lookup(&DependencyRef::Myself)
    }

    pub fn this_property(&self) -> Option<&Value> {
        self.lookup(&DependencyRef::ThisProperty)
    }

    /// The value being transformed; `null` in compute mode.
    pub fn update_value(&self) -> Option<&Value> {
        self.lookup(&DependencyRef::UpdateValue)
    }

    pub fn lookup(&self, reference: &DependencyRef) -> Option<&Value> {
        self.reads.borrow_mut().insert(reference.clone());
        self.values.get(reference)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compares what was read against what was declared.
    ///
    /// Declared but never read is reported as unused; read but undeclared or
    /// missing from the visible set is reported as unavailable.
    pub(crate) fn audit(&self, declared: &[DependencyRef]) -> Vec<CompositeError> {
        let reads = self.reads.borrow();
        let mut errors = Vec::new();

        for reference in declared {
            if !reads.contains(reference) {
                errors.push(CompositeError::UnusedDependency {
                    dependency: reference.to_string(),
                });
            }
        }

        for reference in reads.iter() {
            if !self.values.contains_key(reference) {
                errors.push(CompositeError::UnavailableDependency {
                    dependency: reference.to_string(),
                });
            }
        }

        errors
    }

    /// Arguments in declaration order, used as the memoization key.
    pub(crate) fn cache_arguments(&self, declared: &[DependencyRef]) -> Vec<Option<Value>> {
        declared.iter().map(|reference| self.values.get(reference).cloned()).collect()
    }

    /// Visible values as a JSON object, for step tracing.
    pub(crate) fn to_trace_value(&self) -> Value {
        let entries: JsonMap<String, Value> = self
            .values
            .iter()
            .map(|(reference, value)| (reference.to_string(), value.clone()))
            .collect();
        Value::Object(entries)
    }
}
