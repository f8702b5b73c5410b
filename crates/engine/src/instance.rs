//! Template instances: a template bound to input options and output renames.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use once_cell::sync::OnceCell;

use crate::{
    description::CompositeTemplate,
    error::{CompositeError, ErrorContext, Result},
    resolve::{ResolvedComposition, resolve_instance},
    token::{InputToken, Subroutine},
};

/// A [`CompositeTemplate`] with its input options bound.
///
/// Cloning is cheap; clones share the memoized resolved composition.
#[derive(Clone)]
pub struct TemplateInstance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    template: CompositeTemplate,
    options: IndexMap<String, InputToken>,
    output_names: Vec<String>,
    renames: IndexMap<String, String>,
    resolved: OnceCell<Arc<ResolvedComposition>>,
}

impl TemplateInstance {
    pub(crate) fn new(template: CompositeTemplate, options: IndexMap<String, InputToken>, output_names: Vec<String>) -> Self {
        Self::from_parts(template, options, output_names, IndexMap::new())
    }

    fn from_parts(
        template: CompositeTemplate,
        options: IndexMap<String, InputToken>,
        output_names: Vec<String>,
        renames: IndexMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                template,
                options,
                output_names,
                renames,
                resolved: OnceCell::new(),
            }),
        }
    }

    pub fn template(&self) -> &CompositeTemplate {
        &self.inner.template
    }

    pub fn annotation(&self) -> &str {
        self.inner.template.annotation()
    }

    /// Options exactly as supplied at instantiation.
    pub fn options(&self) -> &IndexMap<String, InputToken> {
        &self.inner.options
    }

    /// Declared output names, before renaming.
    pub fn output_names(&self) -> &[String] {
        &self.inner.output_names
    }

    /// Returns a new instance with some outputs renamed to caller-chosen names.
    ///
    /// Renames accumulate over earlier calls; every key must be a declared output.
    pub fn outputs<I, K, V>(&self, renames: I) -> Result<TemplateInstance>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.inner.renames.clone();
        let mut errors = Vec::new();

        for (output, renamed) in renames {
            let (output, renamed) = (output.into(), renamed.into());
            if !self.inner.output_names.contains(&output) {
                errors.push(CompositeError::UnknownOutput { name: output });
            } else if renamed.is_empty() {
                errors.push(CompositeError::InvalidOutputName {
                    name: output,
                    reason: "cannot be renamed to an empty name".to_string(),
                });
            } else {
                merged.insert(output, renamed);
            }
        }

        CompositeError::check(
            ErrorContext::OutputRenames {
                annotation: self.annotation().to_string(),
            },
            errors,
        )?;

        Ok(Self::from_parts(
            self.inner.template.clone(),
            self.inner.options.clone(),
            self.inner.output_names.clone(),
            merged,
        ))
    }

    /// Internal output name to external name, for every declared output.
    pub fn output_mapping(&self) -> IndexMap<String, String> {
        self.inner
            .output_names
            .iter()
            .map(|name| {
                let external = self.inner.renames.get(name).cloned().unwrap_or_else(|| name.clone());
                (name.clone(), external)
            })
            .collect()
    }

    /// Canonical form of this instance: every input bound, defaults filled in.
    pub fn to_description(&self) -> InstanceDescription {
        let inputs = self
            .inner
            .template
            .inputs()
            .iter()
            .filter_map(|(name, descriptor)| {
                self.inner
                    .options
                    .get(name)
                    .or(descriptor.default_source())
                    .map(|token| (name.clone(), token.clone()))
            })
            .collect();

        InstanceDescription {
            template: self.inner.template.clone(),
            inputs,
            outputs: self.output_mapping(),
        }
    }

    /// Lowers this instance, and every instance nested in its steps, into an executable composition.
    ///
    /// The result is computed once and shared by later calls and clones.
    pub fn to_resolved_composition(&self) -> Result<Arc<ResolvedComposition>> {
        self.inner
            .resolved
            .get_or_try_init(|| resolve_instance(&self.to_description()).map(Arc::new))
            .cloned()
    }

    /// Wraps this instance so it can be passed as another composition's subroutine input.
    pub fn as_subroutine(&self) -> InputToken {
        InputToken::Subroutine(Subroutine::from_instance(self))
    }
}

impl fmt::Debug for TemplateInstance {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TemplateInstance")
            .field("annotation", &self.annotation())
            .field("options", &self.inner.options)
            .field("outputs", &self.output_mapping())
            .finish()
    }
}

/// Fully bound description of an instance, the input of the resolver.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub(crate) template: CompositeTemplate,
    pub(crate) inputs: IndexMap<String, InputToken>,
    pub(crate) outputs: IndexMap<String, String>,
}

impl InstanceDescription {
    pub fn annotation(&self) -> &str {
        self.template.annotation()
    }

    pub fn inputs(&self) -> &IndexMap<String, InputToken> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, String> {
        &self.outputs
    }

    /// Re-instantiates the template from this description.
    pub fn instantiate(&self) -> Result<TemplateInstance> {
        let renames: IndexMap<String, String> = self
            .outputs
            .iter()
            .filter(|(internal, external)| internal != external)
            .map(|(internal, external)| (internal.clone(), external.clone()))
            .collect();
        let instance = self.template.instantiate(self.inputs.clone())?;
        if renames.is_empty() { Ok(instance) } else { instance.outputs(renames) }
    }

    /// Resolves this description directly, without memoization.
    pub fn resolve(&self) -> Result<ResolvedComposition> {
        resolve_instance(self)
    }
}
