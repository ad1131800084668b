//! Expands a [`Request`] into a validated [`DependencyGraph`].
//!
//! Resolution is depth-first from each requested capability. Every capability gets exactly one
//! node per graph; later requirements reuse it. A node still on the resolution stack being
//! required again is a cycle. Loop managers' convergence and output capabilities are resolved
//! after the main expansion, since they point back into the manager's own region.

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use super::{analysis, DependencyGraph, GraphNode, LoopRegion, NodeIndex, RegionId, Request};
use crate::backend::{BackendBinding, BackendRegistry};
use crate::error::{BackendError, BuildError};
use crate::model::Options;
use crate::registry::{CapabilityRegistry, NodeProvider};

/// Chain entry standing for the caller's request list.
const REQUEST: &str = "<request>";
const MAX_ITERATIONS_OPTION: &str = "max_iterations";

type Bindings = HashMap<String, BackendBinding>;
/// A provider's backend bindings, or the first requirement that could not be bound.
type Bound = Result<Bindings, (String, BackendError)>;

/// Builds graphs against a fixed registry and backend set.
pub struct GraphBuilder<'a> {
    registry: &'a CapabilityRegistry,
    backends: &'a BackendRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a CapabilityRegistry, backends: &'a BackendRegistry) -> Self {
        Self { registry, backends }
    }

    pub fn build(&self, request: &Request) -> Result<DependencyGraph, BuildError> {
        let models = self.registry.models();
        if !models.is_empty() && !models.contains(&request.model) {
            return Err(BuildError::IncompatibleModel(request.model.clone()));
        }

        let mut expansion = Expansion {
            registry: self.registry,
            backends: self.backends,
            request,
            nodes: Vec::new(),
            by_capability: HashMap::new(),
            stack: Vec::new(),
            deferred: VecDeque::new(),
        };

        let root = vec![REQUEST.to_string()];
        let mut requested = Vec::with_capacity(request.requested.len());
        for wanted in &request.requested {
            let index =
                expansion.resolve(&wanted.capability, wanted.type_name.as_deref(), &root)?;
            requested.push((wanted.capability.clone(), index));
        }
        let loops = expansion.resolve_loops()?;
        expansion.finish(requested, loops)
    }
}

struct Pending<'r> {
    provider: &'r NodeProvider,
    options: Options,
    backends: Bindings,
    dependencies: Vec<(String, NodeIndex)>,
    manager: Option<NodeIndex>,
    /// Requesters of this node, nearest first.
    chain: Vec<String>,
}

struct LoopTargets {
    convergence: NodeIndex,
    outputs: Vec<(String, NodeIndex)>,
    max_iterations: u32,
}

struct Expansion<'r> {
    registry: &'r CapabilityRegistry,
    backends: &'r BackendRegistry,
    request: &'r Request,
    nodes: Vec<Pending<'r>>,
    by_capability: HashMap<String, NodeIndex>,
    /// Nodes whose dependencies are being resolved, outermost first.
    stack: Vec<NodeIndex>,
    /// Loop managers whose convergence and outputs are still unresolved.
    deferred: VecDeque<NodeIndex>,
}

impl<'r> Expansion<'r> {
    fn name(&self, index: NodeIndex) -> String {
        self.nodes[index.as_usize()].provider.spec().full_name()
    }

    fn resolve(
        &mut self,
        capability: &str,
        type_name: Option<&str>,
        chain: &[String],
    ) -> Result<NodeIndex, BuildError> {
        if let Some(&index) = self.by_capability.get(capability) {
            if let Some(pos) = self.stack.iter().position(|&i| i == index) {
                let mut path: Vec<String> =
                    self.stack[pos..].iter().map(|&i| self.name(i)).collect();
                path.push(self.name(index));
                return Err(BuildError::Cycle { path });
            }
            self.check_type(index, capability, type_name, chain)?;
            return Ok(index);
        }

        let (provider, backends) = self.select(capability, type_name, chain)?;
        let spec = provider.spec();
        let name = spec.full_name();
        let options = self.request.options.for_node(&name);
        if let Some(missing) = spec
            .options
            .iter()
            .find(|o| o.required && !options.has(&[o.key.as_str()]))
        {
            return Err(BuildError::MissingOption {
                node: name,
                key: missing.key.clone(),
                chain: chain.to_vec(),
            });
        }

        let index = NodeIndex::new(self.nodes.len());
        debug!("Resolved `{}` to `{}`", capability, name);
        self.nodes.push(Pending {
            provider,
            options,
            backends,
            dependencies: Vec::new(),
            manager: None,
            chain: chain.to_vec(),
        });
        self.by_capability.insert(capability.to_string(), index);
        self.stack.push(index);

        let mut here = Vec::with_capacity(chain.len() + 1);
        here.push(name.clone());
        here.extend_from_slice(chain);

        for dep in &spec.dependencies {
            if !dep.models.is_empty()
                && !self
                    .registry
                    .models()
                    .is_compatible(&self.request.model, &dep.models)
            {
                debug!(
                    "Skipping `{}` of `{}`: not active for model `{}`",
                    dep.capability, name, self.request.model
                );
                continue;
            }
            let target = self.resolve(&dep.capability, dep.type_name.as_deref(), &here)?;
            self.nodes[index.as_usize()]
                .dependencies
                .push((dep.capability.clone(), target));
        }

        if let Some(manager_capability) = &spec.needs_manager {
            // Membership is not a data edge: a manager already in progress is not a cycle.
            let existing = self.by_capability.get(manager_capability.as_str()).copied();
            let manager = match existing {
                Some(manager) => manager,
                None => self.resolve(manager_capability, None, &here)?,
            };
            if self.nodes[manager.as_usize()]
                .provider
                .spec()
                .manages_loop
                .is_none()
            {
                return Err(BuildError::NotALoopManager {
                    node: self.name(manager),
                    member: name,
                    chain: chain.to_vec(),
                });
            }
            self.nodes[index.as_usize()].manager = Some(manager);
        }

        self.stack.pop();
        if spec.manages_loop.is_some() {
            self.deferred.push_back(index);
        }
        Ok(index)
    }

    fn check_type(
        &self,
        index: NodeIndex,
        capability: &str,
        type_name: Option<&str>,
        chain: &[String],
    ) -> Result<(), BuildError> {
        let spec = self.nodes[index.as_usize()].provider.spec();
        match type_name {
            Some(expected) if expected != spec.type_name => Err(BuildError::TypeMismatch {
                capability: capability.to_string(),
                node: spec.full_name(),
                expected: expected.to_string(),
                found: spec.type_name.clone(),
                chain: chain.to_vec(),
            }),
            _ => Ok(()),
        }
    }

    /// Picks exactly one provider for `capability` and binds its backend requirements.
    ///
    /// Only a requirement no loaded backend can satisfy excludes a provider. One that several
    /// backends satisfy keeps the provider in the running and fails the build if it is chosen.
    fn select(
        &self,
        capability: &str,
        type_name: Option<&str>,
        chain: &[String],
    ) -> Result<(&'r NodeProvider, Bindings), BuildError> {
        let model = self.request.model.as_str();
        let mut candidates: Vec<(&'r NodeProvider, Bound)> = Vec::new();
        let mut excluded: Vec<(&'r NodeProvider, String)> = Vec::new();
        let mut unsatisfied: Vec<(&'r NodeProvider, String, BackendError)> = Vec::new();

        for provider in self.registry.lookup_all(capability) {
            if let Some(reason) = self.registry.exclusion_reason(provider, type_name, model) {
                excluded.push((provider, reason));
                continue;
            }
            match self.bind_backends(provider) {
                Err((group, err @ BackendError::Unsatisfiable { .. })) => {
                    excluded.push((
                        provider,
                        format!(
                            "{} needs backend `{}`: {}",
                            provider.spec().full_name(),
                            group,
                            err
                        ),
                    ));
                    unsatisfied.push((provider, group, err));
                }
                bound => candidates.push((provider, bound)),
            }
        }

        if let Some(pin) = self.request.pins.get(capability) {
            let mut pinned: Vec<_> = candidates
                .into_iter()
                .filter(|(p, _)| p.spec().matches_name(pin))
                .collect();
            return match pinned.len() {
                0 => {
                    let reason = excluded
                        .iter()
                        .find(|(p, _)| p.spec().matches_name(pin))
                        .map(|(_, reason)| reason.clone())
                        .unwrap_or_else(|| {
                            format!("no provider of `{}` is named `{}`", capability, pin)
                        });
                    Err(BuildError::PinnedProviderUnavailable {
                        capability: capability.to_string(),
                        pin: pin.clone(),
                        reason,
                        chain: chain.to_vec(),
                    })
                }
                1 => {
                    debug!("Pin `{}` selects provider for `{}`", pin, capability);
                    let (provider, bound) = pinned.remove(0);
                    settle(provider, bound, chain)
                }
                _ => Err(BuildError::AmbiguousProvider {
                    capability: capability.to_string(),
                    candidates: pinned.iter().map(|(p, _)| p.spec().full_name()).collect(),
                    chain: chain.to_vec(),
                }),
            };
        }

        match candidates.len() {
            1 => {
                let (provider, bound) = candidates.remove(0);
                settle(provider, bound, chain)
            }
            0 => {
                if let [(provider, group, err)] = unsatisfied.as_slice() {
                    return Err(BuildError::UnsatisfiedBackend {
                        node: provider.spec().full_name(),
                        group: group.clone(),
                        reason: err.to_string(),
                        chain: chain.to_vec(),
                    });
                }
                Err(BuildError::MissingProvider {
                    capability: capability.to_string(),
                    type_name: type_name.map(str::to_string),
                    chain: chain.to_vec(),
                    excluded: excluded.into_iter().map(|(_, reason)| reason).collect(),
                })
            }
            _ => Err(BuildError::AmbiguousProvider {
                capability: capability.to_string(),
                candidates: candidates
                    .iter()
                    .map(|(p, _)| p.spec().full_name())
                    .collect(),
                chain: chain.to_vec(),
            }),
        }
    }

    fn bind_backends(&self, provider: &NodeProvider) -> Bound {
        provider
            .spec()
            .backend_requirements
            .iter()
            .map(|req| {
                self.backends
                    .resolve(req, &self.request.backend_pins)
                    .map(|binding| (req.group.clone(), binding))
                    .map_err(|err| (req.group.clone(), err))
            })
            .collect()
    }

    fn resolve_loops(&mut self) -> Result<HashMap<NodeIndex, LoopTargets>, BuildError> {
        let mut targets = HashMap::new();
        while let Some(manager) = self.deferred.pop_front() {
            let pending = &self.nodes[manager.as_usize()];
            let provider = pending.provider;
            let Some(loop_spec) = &provider.spec().manages_loop else {
                continue;
            };
            let name = provider.spec().full_name();
            let invalid = |message: String| BuildError::InvalidOption {
                node: name.clone(),
                key: MAX_ITERATIONS_OPTION.to_string(),
                message,
                chain: pending.chain.clone(),
            };
            let max_iterations = pending
                .options
                .get_or(loop_spec.max_iterations, &[MAX_ITERATIONS_OPTION])
                .map_err(|err| invalid(err.to_string()))?;
            if max_iterations == 0 {
                return Err(invalid("must be at least 1".to_string()));
            }

            let mut chain = Vec::with_capacity(pending.chain.len() + 1);
            chain.push(name);
            chain.extend_from_slice(&pending.chain);
            let convergence = self.resolve(&loop_spec.convergence, None, &chain)?;
            self.check_member(manager, &loop_spec.convergence, convergence)?;
            let mut outputs = Vec::with_capacity(loop_spec.outputs.len());
            for capability in &loop_spec.outputs {
                let index = self.resolve(capability, None, &chain)?;
                self.check_member(manager, capability, index)?;
                outputs.push((capability.clone(), index));
            }
            targets.insert(
                manager,
                LoopTargets {
                    convergence,
                    outputs,
                    max_iterations,
                },
            );
        }
        Ok(targets)
    }

    fn check_member(
        &self,
        manager: NodeIndex,
        capability: &str,
        node: NodeIndex,
    ) -> Result<(), BuildError> {
        if self.nodes[node.as_usize()].manager == Some(manager) {
            Ok(())
        } else {
            Err(BuildError::ConvergenceNotInRegion {
                manager: self.name(manager),
                capability: capability.to_string(),
                node: self.name(node),
            })
        }
    }

    /// The managers enclosing `node`, innermost first.
    fn enclosing(&self, node: NodeIndex) -> Result<Vec<NodeIndex>, BuildError> {
        let mut managers = Vec::new();
        let mut current = self.nodes[node.as_usize()].manager;
        while let Some(manager) = current {
            if manager == node || managers.contains(&manager) {
                let mut path: Vec<String> = std::iter::once(node)
                    .chain(managers.iter().copied())
                    .map(|i| self.name(i))
                    .collect();
                path.push(self.name(manager));
                return Err(BuildError::Cycle { path });
            }
            managers.push(manager);
            current = self.nodes[manager.as_usize()].manager;
        }
        Ok(managers)
    }

    fn check_boundaries(&self, requested: &[(String, NodeIndex)]) -> Result<(), BuildError> {
        let mut enclosing = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            enclosing.push(self.enclosing(NodeIndex::new(i))?);
        }

        for (i, pending) in self.nodes.iter().enumerate() {
            let consumer = NodeIndex::new(i);
            for &(_, dep) in &pending.dependencies {
                let Some(manager) = self.nodes[dep.as_usize()].manager else {
                    continue;
                };
                let inside = consumer == manager || enclosing[i].contains(&manager);
                if !inside {
                    return Err(BuildError::LoopBoundary {
                        consumer: self.name(consumer),
                        member: self.name(dep),
                        manager: self.name(manager),
                    });
                }
            }
        }

        for &(_, index) in requested {
            if let Some(manager) = self.nodes[index.as_usize()].manager {
                return Err(BuildError::LoopBoundary {
                    consumer: REQUEST.to_string(),
                    member: self.name(index),
                    manager: self.name(manager),
                });
            }
        }
        Ok(())
    }

    fn finish(
        self,
        requested: Vec<(String, NodeIndex)>,
        mut targets: HashMap<NodeIndex, LoopTargets>,
    ) -> Result<DependencyGraph, BuildError> {
        self.check_boundaries(&requested)?;

        let mut prereqs: Vec<Vec<NodeIndex>> = self
            .nodes
            .iter()
            .map(|n| n.dependencies.iter().map(|&(_, d)| d).collect())
            .collect();
        for (i, pending) in self.nodes.iter().enumerate() {
            if let Some(manager) = pending.manager {
                prereqs[manager.as_usize()].push(NodeIndex::new(i));
            }
        }

        let order = match analysis::topological_sort(&prereqs) {
            Ok(order) => order,
            Err(_) => {
                let path = analysis::find_cycle(&prereqs)
                    .map(|cycle| cycle.into_iter().map(|i| self.name(i)).collect())
                    .unwrap_or_default();
                return Err(BuildError::Cycle { path });
            }
        };
        let mut position = vec![0usize; self.nodes.len()];
        for (pos, index) in order.iter().enumerate() {
            position[index.as_usize()] = pos;
        }

        let mut region_of: HashMap<NodeIndex, RegionId> = HashMap::new();
        let mut managers: Vec<NodeIndex> = targets.keys().copied().collect();
        managers.sort();
        for &manager in &managers {
            region_of.insert(manager, RegionId(region_of.len()));
        }

        let mut regions = Vec::with_capacity(managers.len());
        for &manager in &managers {
            let Some(loop_targets) = targets.remove(&manager) else {
                continue;
            };
            let pending = &self.nodes[manager.as_usize()];
            let mut members: Vec<NodeIndex> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.manager == Some(manager))
                .map(|(i, _)| NodeIndex::new(i))
                .collect();
            members.sort_by_key(|m| position[m.as_usize()]);
            let on_abort = pending
                .provider
                .spec()
                .manages_loop
                .as_ref()
                .map(|l| l.on_abort)
                .unwrap_or_default();
            regions.push(LoopRegion {
                id: region_of[&manager],
                manager,
                parent: pending.manager.and_then(|m| region_of.get(&m).copied()),
                members,
                convergence: loop_targets.convergence,
                outputs: loop_targets.outputs,
                max_iterations: loop_targets.max_iterations,
                on_abort,
            });
        }

        let nodes: Vec<GraphNode> = self
            .nodes
            .into_iter()
            .enumerate()
            .map(|(i, pending)| {
                let index = NodeIndex::new(i);
                GraphNode {
                    index,
                    provider: pending.provider.id(),
                    spec: pending.provider.spec().clone(),
                    function: pending.provider.function().clone(),
                    options: pending.options,
                    dependencies: pending.dependencies,
                    backends: pending.backends,
                    region: pending.manager.and_then(|m| region_of.get(&m).copied()),
                    manages: region_of.get(&index).copied(),
                }
            })
            .collect();

        info!(
            "Built dependency graph for model `{}`: {} nodes, {} loop regions",
            self.request.model,
            nodes.len(),
            regions.len()
        );

        Ok(DependencyGraph {
            model: self.request.model.clone(),
            nodes,
            by_capability: self.by_capability,
            prereqs,
            order,
            requested,
            regions,
        })
    }
}

/// Turns a chosen provider's binding result into a build result.
fn settle<'r>(
    provider: &'r NodeProvider,
    bound: Bound,
    chain: &[String],
) -> Result<(&'r NodeProvider, Bindings), BuildError> {
    let node = provider.spec().full_name();
    match bound {
        Ok(bindings) => Ok((provider, bindings)),
        Err((group, BackendError::Ambiguous { candidates, .. })) => {
            Err(BuildError::AmbiguousBackend {
                node,
                group,
                candidates,
                chain: chain.to_vec(),
            })
        }
        Err((group, err)) => Err(BuildError::UnsatisfiedBackend {
            node,
            group,
            reason: err.to_string(),
            chain: chain.to_vec(),
        }),
    }
}
