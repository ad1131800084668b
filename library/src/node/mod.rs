//! Computation node metadata.
//!
//! A [`NodeSpec`] is what a physics module registers: the capability it produces, what it needs,
//! which models it can run under and how it takes part in loops. The work itself is a
//! [`ModuleFunction`].

mod context;
mod traits;

pub use context::NodeContext;
pub use traits::{ModuleFunction, NodeFailure};

use crate::backend::BackendRequirement;

/// A need for another capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRequirement {
    pub capability: String,
    pub type_name: Option<String>,
    /// Only active when the run's model is compatible with one of these. Empty means always.
    pub models: Vec<String>,
}

impl DependencyRequirement {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            type_name: None,
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    pub key: String,
    pub required: bool,
}

/// What a loop manager does when its loop hits the iteration bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortPolicy {
    /// Requested outputs depending on the loop report `Invalidated`.
    #[default]
    Invalidate,
    /// The manager still runs and sees the aborted state.
    Accept,
    /// Requested outputs depending on the loop report `Error`.
    Error,
}

/// Declares that a node manages a loop region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSpec {
    /// Capability of the member whose `Boolean` output decides convergence.
    pub convergence: String,
    /// Further member capabilities the manager reads after the loop.
    pub outputs: Vec<String>,
    /// Overridable through the manager's `max_iterations` option.
    pub max_iterations: u32,
    pub on_abort: AbortPolicy,
}

impl LoopSpec {
    pub fn new(convergence: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            convergence: convergence.into(),
            outputs: Vec::new(),
            max_iterations,
            on_abort: AbortPolicy::default(),
        }
    }

    pub fn reads(mut self, capability: impl Into<String>) -> Self {
        self.outputs.push(capability.into());
        self
    }

    pub fn on_abort(mut self, policy: AbortPolicy) -> Self {
        self.on_abort = policy;
        self
    }
}

/// Registration metadata of a computation node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub module: String,
    pub function: String,
    pub capability: String,
    pub type_name: String,
    pub dependencies: Vec<DependencyRequirement>,
    pub backend_requirements: Vec<BackendRequirement>,
    pub allowed_models: Vec<String>,
    pub options: Vec<OptionSpec>,
    pub once_per_process: bool,
    pub needs_manager: Option<String>,
    pub manages_loop: Option<LoopSpec>,
}

impl NodeSpec {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        capability: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            capability: capability.into(),
            type_name: type_name.into(),
            dependencies: Vec::new(),
            backend_requirements: Vec::new(),
            allowed_models: Vec::new(),
            options: Vec::new(),
            once_per_process: false,
            needs_manager: None,
            manages_loop: None,
        }
    }

    pub fn depends_on(mut self, capability: impl Into<String>) -> Self {
        self.dependencies.push(DependencyRequirement::new(capability));
        self
    }

    pub fn depends_on_typed(
        mut self,
        capability: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        let mut dep = DependencyRequirement::new(capability);
        dep.type_name = Some(type_name.into());
        self.dependencies.push(dep);
        self
    }

    /// A dependency that only exists when running under one of `models` (or a descendant).
    pub fn depends_on_if_model<M: Into<String>>(
        mut self,
        capability: impl Into<String>,
        models: impl IntoIterator<Item = M>,
    ) -> Self {
        let mut dep = DependencyRequirement::new(capability);
        dep.models = models.into_iter().map(Into::into).collect();
        self.dependencies.push(dep);
        self
    }

    pub fn requires_backend(mut self, requirement: BackendRequirement) -> Self {
        self.backend_requirements.push(requirement);
        self
    }

    pub fn allow_model(mut self, model: impl Into<String>) -> Self {
        self.allowed_models.push(model.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>) -> Self {
        self.options.push(OptionSpec {
            key: key.into(),
            required: false,
        });
        self
    }

    pub fn required_option(mut self, key: impl Into<String>) -> Self {
        self.options.push(OptionSpec {
            key: key.into(),
            required: true,
        });
        self
    }

    /// Runs once per process instead of once per point (backend initialisation and the like).
    pub fn once_per_process(mut self) -> Self {
        self.once_per_process = true;
        self
    }

    /// Makes this node a member of the loop managed by the provider of `manager_capability`.
    pub fn needs_manager(mut self, manager_capability: impl Into<String>) -> Self {
        self.needs_manager = Some(manager_capability.into());
        self
    }

    pub fn manages_loop(mut self, spec: LoopSpec) -> Self {
        self.manages_loop = Some(spec);
        self
    }

    /// `module::function`.
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.module, self.function)
    }

    /// Matches either the bare function name or `module::function`.
    pub fn matches_name(&self, name: &str) -> bool {
        match name.split_once("::") {
            Some((module, function)) => module == self.module && function == self.function,
            None => name == self.function,
        }
    }

    pub fn declares_dependency(&self, capability: &str) -> bool {
        self.dependencies.iter().any(|d| d.capability == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_requirements() {
        let spec = NodeSpec::new("DarkBit", "RD_oh2_DS_general", "RD_oh2", "double")
            .depends_on("RD_spectrum_ordered")
            .depends_on_typed("RD_eff_annrate", "fptr")
            .depends_on_if_model("TH_ProcessCatalog", ["ScalarSingletDM_Z2"])
            .required_option("fast")
            .allow_model("ScalarSingletDM_Z2");
        assert_eq!(spec.dependencies.len(), 3);
        assert_eq!(spec.dependencies[1].type_name.as_deref(), Some("fptr"));
        assert_eq!(spec.dependencies[2].models, vec!["ScalarSingletDM_Z2".to_string()]);
        assert!(spec.options[0].required);
        assert!(spec.declares_dependency("RD_eff_annrate"));
    }

    #[test]
    fn name_matching() {
        let spec = NodeSpec::new("DarkBit", "mwimp_generic", "mwimp", "double");
        assert_eq!(spec.full_name(), "DarkBit::mwimp_generic");
        assert!(spec.matches_name("mwimp_generic"));
        assert!(spec.matches_name("DarkBit::mwimp_generic"));
        assert!(!spec.matches_name("SpecBit::mwimp_generic"));
    }
}
