//! Capability registry: the static catalog of computation-node providers.
//!
//! Populated once at startup, then shared read-only (`Arc<CapabilityRegistry>`) by every graph
//! build.

mod builtin;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::BackendRegistry;
use crate::error::RegistryError;
use crate::model::{ModelHierarchy, Value};
use crate::node::{ModuleFunction, NodeContext, NodeFailure, NodeSpec};

pub use builtin::{MODEL_PARAMETERS, MODEL_PARAMETERS_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(usize);

impl ProviderId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Available,
    Disabled { reason: String },
}

/// A registered node: metadata plus the function handle.
pub struct NodeProvider {
    id: ProviderId,
    spec: NodeSpec,
    function: Arc<dyn ModuleFunction>,
    status: ProviderStatus,
}

impl NodeProvider {
    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn function(&self) -> &Arc<dyn ModuleFunction> {
        &self.function
    }

    pub fn status(&self) -> &ProviderStatus {
        &self.status
    }

    pub fn is_available(&self) -> bool {
        self.status == ProviderStatus::Available
    }
}

/// Catalog of providers indexed by capability.
#[derive(Default)]
pub struct CapabilityRegistry {
    providers: Vec<NodeProvider>,
    by_capability: HashMap<String, Vec<ProviderId>>,
    names: HashSet<String>,
    models: ModelHierarchy,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already provides [`MODEL_PARAMETERS`].
    pub fn with_builtin_parameters() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Adds a provider. Malformed metadata fails immediately; several providers of the same
    /// capability are fine and are disambiguated at build time.
    pub fn register(
        &mut self,
        spec: NodeSpec,
        function: Arc<dyn ModuleFunction>,
    ) -> Result<ProviderId, RegistryError> {
        validate(&spec)?;
        let full_name = spec.full_name();
        if !self.names.insert(full_name.clone()) {
            return Err(RegistryError::DuplicateNode(full_name));
        }

        let id = ProviderId(self.providers.len());
        debug!(
            "Registered `{}` providing `{}` ({})",
            full_name, spec.capability, spec.type_name
        );
        self.by_capability
            .entry(spec.capability.clone())
            .or_default()
            .push(id);
        self.providers.push(NodeProvider {
            id,
            spec,
            function,
            status: ProviderStatus::Available,
        });
        Ok(id)
    }

    /// Registers a closure as the node's function.
    pub fn register_fn<F>(
        &mut self,
        spec: NodeSpec,
        function: F,
    ) -> Result<ProviderId, RegistryError>
    where
        F: Fn(&NodeContext<'_>) -> Result<Value, NodeFailure> + Send + Sync + 'static,
    {
        self.register(spec, Arc::new(function))
    }

    pub fn models(&self) -> &ModelHierarchy {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut ModelHierarchy {
        &mut self.models
    }

    pub fn get(&self, id: ProviderId) -> Option<&NodeProvider> {
        self.providers.get(id.0)
    }

    pub fn providers(&self) -> impl Iterator<Item = &NodeProvider> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Every provider of `capability`, disabled ones included, in registration order.
    pub fn lookup_all(&self, capability: &str) -> Vec<&NodeProvider> {
        self.by_capability
            .get(capability)
            .map(|ids| ids.iter().map(|id| &self.providers[id.0]).collect())
            .unwrap_or_default()
    }

    /// Available providers of `capability` matching `type_name` (if given) that may run under
    /// `model`, in registration order.
    pub fn lookup(
        &self,
        capability: &str,
        type_name: Option<&str>,
        model: &str,
    ) -> Vec<&NodeProvider> {
        self.lookup_all(capability)
            .into_iter()
            .filter(|p| p.is_available())
            .filter(|p| type_name.map_or(true, |t| p.spec.type_name == t))
            .filter(|p| self.models.is_compatible(model, &p.spec.allowed_models))
            .collect()
    }

    /// Why `provider` is not a candidate for `(type_name, model)`, or `None` if it is.
    pub fn exclusion_reason(
        &self,
        provider: &NodeProvider,
        type_name: Option<&str>,
        model: &str,
    ) -> Option<String> {
        let name = provider.spec.full_name();
        if let ProviderStatus::Disabled { reason } = &provider.status {
            return Some(format!("{} is disabled: {}", name, reason));
        }
        if let Some(t) = type_name {
            if provider.spec.type_name != t {
                return Some(format!("{} provides type `{}`", name, provider.spec.type_name));
            }
        }
        if !self.models.is_compatible(model, &provider.spec.allowed_models) {
            return Some(format!(
                "{} is not allowed for model `{}` (allowed: {})",
                name,
                model,
                provider.spec.allowed_models.join(", ")
            ));
        }
        None
    }

    /// Disables every provider whose backend requirements no loaded backend can satisfy.
    ///
    /// Call once after backend discovery and before building graphs, so absent backends show up
    /// as ordinary missing-provider errors.
    pub fn apply_backend_status(&mut self, backends: &BackendRegistry) -> usize {
        let mut disabled = 0;
        for provider in &mut self.providers {
            if !provider.is_available() {
                continue;
            }
            let unsatisfied = provider
                .spec
                .backend_requirements
                .iter()
                .find(|req| !backends.can_satisfy(req));
            if let Some(req) = unsatisfied {
                let reason = format!(
                    "backend requirement `{}` unavailable: {}",
                    req.group,
                    backends.explain(req)
                );
                warn!("Disabling `{}`: {}", provider.spec.full_name(), reason);
                provider.status = ProviderStatus::Disabled { reason };
                disabled += 1;
            }
        }
        disabled
    }
}

fn validate(spec: &NodeSpec) -> Result<(), RegistryError> {
    let node = if spec.module.is_empty() || spec.function.is_empty() {
        spec.capability.clone()
    } else {
        spec.full_name()
    };
    let empty = |field: &'static str| RegistryError::EmptyField {
        node: node.clone(),
        field,
    };

    if spec.capability.is_empty() {
        return Err(empty("capability name"));
    }
    if spec.module.is_empty() {
        return Err(empty("module name"));
    }
    if spec.function.is_empty() {
        return Err(empty("function name"));
    }
    if spec.type_name.is_empty() {
        return Err(empty("result type"));
    }
    if spec.dependencies.iter().any(|d| d.capability.is_empty()) {
        return Err(empty("dependency capability"));
    }
    if spec.backend_requirements.iter().any(|b| b.group.is_empty()) {
        return Err(empty("backend requirement group"));
    }
    if spec.options.iter().any(|o| o.key.is_empty()) {
        return Err(empty("option key"));
    }
    if matches!(&spec.needs_manager, Some(m) if m.is_empty()) {
        return Err(empty("loop manager capability"));
    }
    if let Some(loop_spec) = &spec.manages_loop {
        let invalid = |reason: &str| RegistryError::InvalidLoopSpec {
            node: node.clone(),
            reason: reason.to_string(),
        };
        if loop_spec.convergence.is_empty() {
            return Err(invalid("empty convergence capability"));
        }
        if loop_spec.max_iterations == 0 {
            return Err(invalid("max_iterations must be at least 1"));
        }
        if loop_spec.outputs.iter().any(String::is_empty) {
            return Err(invalid("empty output capability"));
        }
    }
    Ok(())
}
