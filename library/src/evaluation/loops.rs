//! Loop regions: repeated evaluation of a manager's members until convergence.
//!
//! A region is a set of graph nodes tagged with their manager at build time. The executor hands
//! the manager to [`Executor::run_loop`], which re-runs the members in topological order with a
//! fresh member cache per iteration. A nested region is just another member whose evaluation
//! happens to be a loop.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use super::{lookup, CapabilityOutcome, Executor, Scope};
use crate::error::LibraryError;
use crate::graph::{LoopRegion, NodeIndex};
use crate::model::{ParameterPoint, Value};
use crate::node::AbortPolicy;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Iterating,
    Converged,
    Aborted,
}

/// What loop members can see about their loop.
#[derive(Debug, Clone)]
pub struct LoopContext {
    region: String,
    iteration: u32,
    previous: HashMap<String, Arc<Value>>,
}

impl LoopContext {
    /// Name of the managing node.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// 1-based.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// A member's value from the previous iteration. `None` on the first one.
    pub fn previous(&self, capability: &str) -> Option<&Value> {
        self.previous.get(capability).map(|v| v.as_ref())
    }
}

/// How a loop ended, visible to its manager.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub region: String,
    pub state: LoopState,
    pub iterations: u32,
    pub max_iterations: u32,
}

impl LoopReport {
    pub fn converged(&self) -> bool {
        self.state == LoopState::Converged
    }
}

/// State machine of one loop run: `Idle -> Iterating -> Converged | Aborted`.
#[derive(Debug)]
pub(crate) struct LoopManager {
    state: LoopState,
    max_iterations: u32,
    context: LoopContext,
}

impl LoopManager {
    pub(crate) fn new(region: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            state: LoopState::Idle,
            max_iterations,
            context: LoopContext {
                region: region.into(),
                iteration: 0,
                previous: HashMap::new(),
            },
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        self.state
    }

    pub(crate) fn context(&self) -> &LoopContext {
        &self.context
    }

    /// Starts the next iteration.
    pub(crate) fn begin_iteration(&mut self) -> &LoopContext {
        self.state = LoopState::Iterating;
        self.context.iteration += 1;
        &self.context
    }

    /// Records the iteration's member values and decides whether to go on.
    pub(crate) fn finish_iteration(
        &mut self,
        converged: bool,
        values: HashMap<String, Arc<Value>>,
    ) -> bool {
        self.context.previous = values;
        if converged {
            self.state = LoopState::Converged;
        } else if self.context.iteration >= self.max_iterations {
            self.state = LoopState::Aborted;
        }
        self.state == LoopState::Iterating
    }

    /// Final member values by capability.
    pub(crate) fn values(&self) -> &HashMap<String, Arc<Value>> {
        &self.context.previous
    }

    pub(crate) fn report(&self) -> LoopReport {
        LoopReport {
            region: self.context.region.clone(),
            state: self.state,
            iterations: self.context.iteration,
            max_iterations: self.max_iterations,
        }
    }
}

impl Executor {
    /// Runs the region managed by `manager`, then the manager itself.
    ///
    /// `outer` is the loop context of the region the manager is itself a member of.
    pub(super) fn run_loop(
        &self,
        point: &ParameterPoint,
        scopes: &[&Scope],
        manager: NodeIndex,
        outer: Option<&LoopContext>,
    ) -> Result<CapabilityOutcome, LibraryError> {
        let graph = self.graph();
        let node = graph.node(manager);
        let Some(region_id) = node.manages() else {
            return self.evaluate_node(point, scopes, manager, outer, None);
        };
        let region = graph.region(region_id);
        let name = node.name();

        // Dependencies from outside the region must hold before the loop is worth running.
        for &(_, dep) in node.dependencies() {
            if graph.node(dep).region() == Some(region_id) {
                continue;
            }
            match lookup(scopes, dep) {
                Some(CapabilityOutcome::Value(_)) | None => {}
                Some(other) => return Ok(other.clone()),
            }
        }

        let mut state = LoopManager::new(name.clone(), region.max_iterations());
        let mut members = Scope::new();
        loop {
            let context = state.begin_iteration().clone();
            members.clear();
            for &member in region.members() {
                let outcome = {
                    let mut layered = scopes.to_vec();
                    layered.push(&members);
                    if graph.node(member).manages().is_some() {
                        self.run_loop(point, &layered, member, Some(&context))?
                    } else {
                        self.evaluate_node(point, &layered, member, Some(&context), None)?
                    }
                };
                if !outcome.is_value() {
                    debug!(
                        "Loop `{}` stopped in iteration {}: `{}` did not produce a value",
                        name,
                        context.iteration(),
                        graph.node(member).name()
                    );
                    return Ok(outcome);
                }
                members.insert(member, outcome);
            }

            let converged = self.read_convergence(region, &members, &name)?;
            let values = member_values(self, region, &members);
            if !state.finish_iteration(converged, values) {
                break;
            }
        }

        let report = state.report();
        debug!(
            "Loop `{}` finished: {:?} after {} iterations",
            name, report.state, report.iterations
        );
        if state.state() == LoopState::Aborted {
            let message = format!(
                "loop did not converge within {} iterations",
                report.max_iterations
            );
            match region.on_abort() {
                AbortPolicy::Invalidate => {
                    warn!("`{}`: {}; invalidating point", name, message);
                    return Ok(CapabilityOutcome::Invalidated {
                        reason: message,
                        origin: name,
                    });
                }
                AbortPolicy::Error => {
                    warn!("`{}`: {}", name, message);
                    return Ok(CapabilityOutcome::Error {
                        diagnostic: format!("`{}`: {}", name, message),
                    });
                }
                AbortPolicy::Accept => {
                    debug!("`{}`: {}; accepting last iteration", name, message);
                }
            }
        }

        let mut layered = scopes.to_vec();
        layered.push(&members);
        self.evaluate_node(point, &layered, manager, outer, Some((state.values(), &report)))
    }

    fn read_convergence(
        &self,
        region: &LoopRegion,
        members: &Scope,
        manager: &str,
    ) -> Result<bool, LibraryError> {
        let node = self.graph().node(region.convergence());
        let value = members
            .get(&region.convergence())
            .and_then(CapabilityOutcome::value)
            .ok_or_else(|| {
                LibraryError::fatal(
                    manager,
                    format!("convergence member `{}` was not evaluated", node.name()),
                )
            })?;
        value.as_bool().ok_or_else(|| {
            LibraryError::fatal(
                node.name(),
                format!(
                    "convergence capability `{}` must be a Boolean, got {}",
                    node.capability(),
                    value.kind()
                ),
            )
        })
    }
}

fn member_values(
    executor: &Executor,
    region: &LoopRegion,
    members: &Scope,
) -> HashMap<String, Arc<Value>> {
    region
        .members()
        .iter()
        .filter_map(|m| match members.get(m) {
            Some(CapabilityOutcome::Value(v)) => Some((
                executor.graph().node(*m).capability().to_string(),
                v.clone(),
            )),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_before_bound() {
        let mut manager = LoopManager::new("DarkBit::RD_oh2", 5);
        assert_eq!(manager.state(), LoopState::Idle);
        assert_eq!(manager.begin_iteration().iteration(), 1);
        assert!(manager.finish_iteration(false, HashMap::new()));
        assert_eq!(manager.state(), LoopState::Iterating);

        manager.begin_iteration();
        let values = HashMap::from([("estimate".to_string(), Arc::new(Value::from(0.11)))]);
        assert!(!manager.finish_iteration(true, values));
        let report = manager.report();
        assert!(report.converged());
        assert_eq!(report.iterations, 2);
        assert_eq!(
            manager.context().previous("estimate").and_then(Value::as_number),
            Some(0.11)
        );
    }

    #[test]
    fn test_aborts_exactly_at_bound() {
        let mut manager = LoopManager::new("DarkBit::RD_oh2", 3);
        let mut iterations = 0;
        loop {
            manager.begin_iteration();
            iterations += 1;
            if !manager.finish_iteration(false, HashMap::new()) {
                break;
            }
        }
        assert_eq!(iterations, 3);
        assert_eq!(manager.state(), LoopState::Aborted);
        assert_eq!(manager.report().iterations, 3);
    }

    #[test]
    fn test_previous_is_empty_on_first_iteration() {
        let mut manager = LoopManager::new("M::loop", 2);
        let context = manager.begin_iteration();
        assert!(context.previous("anything").is_none());
        assert_eq!(context.region(), "M::loop");
    }
}
