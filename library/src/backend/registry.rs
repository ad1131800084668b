//! Backend registry and requirement resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use super::{Backend, BackendFunction, BackendPlugin, BackendRequirement, LoadStatus, Version};
use crate::error::BackendError;
use crate::model::Value;
use crate::node::NodeFailure;

/// All backends discovered at process start, loaded or not.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Backend) -> Arc<Backend> {
        match backend.status() {
            LoadStatus::Loaded => info!(
                "Registered backend {} ({} functions)",
                backend.label(),
                backend.functions.len()
            ),
            LoadStatus::Absent(reason) | LoadStatus::Broken(reason) => {
                warn!("Backend {} is unavailable: {}", backend.label(), reason)
            }
        }
        let backend = Arc::new(backend);
        self.backends.push(backend.clone());
        backend
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn BackendPlugin>) -> Arc<Backend> {
        self.register(Backend::from_plugin(plugin.as_ref()))
    }

    /// Records a backend that could not be found. It is kept for diagnostics only.
    pub fn mark_absent(
        &mut self,
        name: impl Into<String>,
        version: impl Into<Version>,
        reason: impl Into<String>,
    ) {
        self.register(Backend::absent(name, version, reason));
    }

    pub fn get(&self, name: &str, version: Version) -> Option<&Arc<Backend>> {
        self.backends
            .iter()
            .find(|b| b.name() == name && b.version() == version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Loaded backends that satisfy `requirement`, in registration order.
    pub fn candidates(&self, requirement: &BackendRequirement) -> Vec<&Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.status().is_loaded() && requirement.accepts(b))
            .collect()
    }

    /// True if some loaded backend could satisfy `requirement`.
    pub fn can_satisfy(&self, requirement: &BackendRequirement) -> bool {
        !self.candidates(requirement).is_empty()
    }

    /// Binds `requirement` to exactly one loaded backend.
    ///
    /// `pins` maps a function group to `name` or `name@version`.
    pub fn resolve(
        &self,
        requirement: &BackendRequirement,
        pins: &BTreeMap<String, String>,
    ) -> Result<BackendBinding, BackendError> {
        let mut candidates = self.candidates(requirement);
        if let Some(pin) = pins.get(&requirement.group) {
            candidates.retain(|b| pin_matches(pin, b));
            if candidates.is_empty() {
                return Err(BackendError::Unsatisfiable {
                    group: requirement.group.clone(),
                    reason: format!("pinned backend `{}` does not provide it", pin),
                });
            }
        }

        match candidates.as_slice() {
            [] => Err(BackendError::Unsatisfiable {
                group: requirement.group.clone(),
                reason: self.explain(requirement),
            }),
            [backend] => {
                let entry = backend.function(&requirement.group).ok_or_else(|| {
                    BackendError::Unsatisfiable {
                        group: requirement.group.clone(),
                        reason: format!("{} lost its function table entry", backend.label()),
                    }
                })?;
                debug!(
                    "Bound backend requirement `{}` to {}",
                    requirement.group,
                    backend.label()
                );
                Ok(BackendBinding {
                    group: requirement.group.clone(),
                    function: entry.function.clone(),
                    backend: (*backend).clone(),
                })
            }
            many => Err(BackendError::Ambiguous {
                group: requirement.group.clone(),
                candidates: many.iter().map(|b| b.label()).collect(),
            }),
        }
    }

    /// Human-readable reason why no loaded backend satisfies `requirement`.
    pub fn explain(&self, requirement: &BackendRequirement) -> String {
        let mut reasons = Vec::new();
        for backend in &self.backends {
            if let Some(name) = &requirement.backend {
                if name != backend.name() {
                    continue;
                }
            }
            match backend.status() {
                LoadStatus::Absent(reason) => {
                    reasons.push(format!("{} is absent ({})", backend.label(), reason))
                }
                LoadStatus::Broken(reason) => {
                    reasons.push(format!("{} is broken ({})", backend.label(), reason))
                }
                LoadStatus::Loaded => {
                    if !requirement.versions.matches(&backend.version()) {
                        reasons.push(format!(
                            "{} does not match version {}",
                            backend.label(),
                            requirement.versions
                        ));
                    } else if let Some(entry) = backend.function(&requirement.group) {
                        if let Some(t) = &requirement.type_name {
                            reasons.push(format!(
                                "{} provides type `{}`, not `{}`",
                                backend.label(),
                                entry.type_name,
                                t
                            ));
                        }
                    }
                }
            }
        }
        if reasons.is_empty() {
            match &requirement.backend {
                Some(name) => format!("backend `{}` is not known", name),
                None => "no backend advertises it".to_string(),
            }
        } else {
            reasons.join("; ")
        }
    }
}

fn pin_matches(pin: &str, backend: &Backend) -> bool {
    match pin.split_once('@') {
        Some((name, version)) => {
            name == backend.name()
                && version
                    .parse::<Version>()
                    .map_or(false, |v| v == backend.version())
        }
        None => pin == backend.name(),
    }
}

/// A node's backend requirement bound to one concrete function. Fixed for the graph's lifetime.
#[derive(Clone)]
pub struct BackendBinding {
    group: String,
    function: Arc<dyn BackendFunction>,
    backend: Arc<Backend>,
}

impl BackendBinding {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Calls the bound function. Calls into non-thread-safe backends are serialised.
    pub fn call(&self, args: &[Value]) -> Result<Value, NodeFailure> {
        if self.backend.is_thread_safe() {
            return self.function.call(args);
        }
        let _guard = self.backend.call_lock.lock().map_err(|_| {
            NodeFailure::fatal(format!(
                "backend {} is poisoned by an earlier panic",
                self.backend.label()
            ))
        })?;
        self.function.call(args)
    }
}

impl fmt::Debug for BackendBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendBinding")
            .field("group", &self.group)
            .field("backend", &self.backend.label())
            .finish()
    }
}
