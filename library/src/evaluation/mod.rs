//! Per-point evaluation of a built dependency graph.
//!
//! The [`Executor`] walks the graph's topological order restricted to the closure of the
//! requested outputs, memoising every node's outcome for the current point. A node whose
//! dependency did not produce a value inherits that outcome without being called, so an
//! invalidated point cancels only its downstream closure.

mod loops;
mod outcome;
mod stats;

pub use loops::{LoopContext, LoopReport, LoopState};
pub use outcome::{CapabilityOutcome, PointResults};
pub use stats::NodeStats;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::LibraryError;
use crate::graph::{DependencyGraph, GraphNode, NodeIndex};
use crate::model::{ParameterPoint, Value};
use crate::node::{NodeContext, NodeFailure};
use stats::StatsTable;

/// Outcomes of one evaluation scope: the point, or one loop iteration.
pub(crate) type Scope = HashMap<NodeIndex, CapabilityOutcome>;

/// Innermost scope wins.
pub(crate) fn lookup<'s>(scopes: &[&'s Scope], node: NodeIndex) -> Option<&'s CapabilityOutcome> {
    scopes.iter().rev().find_map(|scope| scope.get(&node))
}

/// How nodes of one point are scheduled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// One node at a time, in topological order.
    #[default]
    Serial,
    /// Nodes of the same dependency level run concurrently on the rayon pool.
    Parallel,
}

/// Results a loop manager reads after its loop.
type LoopResults<'a> = (&'a HashMap<String, Arc<Value>>, &'a LoopReport);

/// Evaluates one graph for any number of points.
pub struct Executor {
    graph: Arc<DependencyGraph>,
    dispatch: Dispatch,
    /// First successful results of once-per-process nodes.
    once: Mutex<HashMap<NodeIndex, Arc<Value>>>,
    stats: StatsTable,
}

impl Executor {
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        let stats = StatsTable::new(graph.len());
        Self {
            graph,
            dispatch: Dispatch::default(),
            once: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    /// Evaluates every requested capability for `point`.
    pub fn evaluate(&self, point: &ParameterPoint) -> Result<PointResults, LibraryError> {
        let targets = self.graph.requested().to_vec();
        self.run(point, &targets)
    }

    /// Evaluates only the named requested capabilities; nodes outside their closure are skipped.
    pub fn evaluate_subset(
        &self,
        point: &ParameterPoint,
        capabilities: &[&str],
    ) -> Result<PointResults, LibraryError> {
        let targets = capabilities
            .iter()
            .map(|&capability| {
                self.graph
                    .requested()
                    .iter()
                    .find(|(c, _)| c == capability)
                    .cloned()
                    .ok_or_else(|| LibraryError::UnknownOutput(capability.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.run(point, &targets)
    }

    /// Evaluates independent points concurrently. A fatal error in any point fails the batch.
    pub fn evaluate_many(
        &self,
        points: &[ParameterPoint],
    ) -> Result<Vec<PointResults>, LibraryError> {
        points.par_iter().map(|p| self.evaluate(p)).collect()
    }

    /// Counters of the node selected for `capability`.
    pub fn node_stats(&self, capability: &str) -> Option<NodeStats> {
        self.graph
            .find(capability)
            .map(|node| self.stats.get(node.index().as_usize()))
    }

    /// Counters of every node, by `module::function`.
    pub fn stats(&self) -> Vec<(String, NodeStats)> {
        self.graph
            .nodes()
            .iter()
            .map(|node| (node.name(), self.stats.get(node.index().as_usize())))
            .collect()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn run(
        &self,
        point: &ParameterPoint,
        targets: &[(String, NodeIndex)],
    ) -> Result<PointResults, LibraryError> {
        if point.model() != self.graph.model() {
            return Err(LibraryError::ModelMismatch {
                graph: self.graph.model().to_string(),
                point: point.model().to_string(),
            });
        }
        debug!("Evaluating point {} ({})", point.id(), point.model());

        let roots: Vec<NodeIndex> = targets.iter().map(|&(_, i)| i).collect();
        let closure = self.graph.closure(&roots);
        let mut cache = Scope::with_capacity(closure.len());

        match self.dispatch {
            Dispatch::Serial => {
                for &index in self.graph.order() {
                    if !closure.contains(&index) || self.graph.node(index).region().is_some() {
                        continue;
                    }
                    let outcome = self.visit(point, &[&cache], index)?;
                    cache.insert(index, outcome);
                }
            }
            Dispatch::Parallel => {
                for level in self.graph.levels(&closure) {
                    let outcomes = level
                        .par_iter()
                        .filter(|&&i| self.graph.node(i).region().is_none())
                        .map(|&i| self.visit(point, &[&cache], i).map(|o| (i, o)))
                        .collect::<Result<Vec<_>, _>>()?;
                    cache.extend(outcomes);
                }
            }
        }

        let outcomes = targets
            .iter()
            .map(|(capability, index)| {
                cache
                    .get(index)
                    .cloned()
                    .map(|o| (capability.clone(), o))
                    .ok_or_else(|| {
                        LibraryError::fatal(
                            self.graph.node(*index).name(),
                            "requested node was not evaluated",
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PointResults {
            point: point.id(),
            model: point.model().to_string(),
            outcomes,
        })
    }

    /// Evaluates a node outside any loop region.
    fn visit(
        &self,
        point: &ParameterPoint,
        scopes: &[&Scope],
        index: NodeIndex,
    ) -> Result<CapabilityOutcome, LibraryError> {
        if self.graph.node(index).manages().is_some() {
            self.run_loop(point, scopes, index, None)
        } else {
            self.evaluate_node(point, scopes, index, None, None)
        }
    }

    /// Gathers a node's inputs and calls it, unless a dependency already failed.
    fn evaluate_node(
        &self,
        point: &ParameterPoint,
        scopes: &[&Scope],
        index: NodeIndex,
        loop_context: Option<&LoopContext>,
        loop_results: Option<LoopResults<'_>>,
    ) -> Result<CapabilityOutcome, LibraryError> {
        let node = self.graph.node(index);

        let mut inputs = HashMap::with_capacity(node.dependencies().len());
        for (capability, dep) in node.dependencies() {
            match lookup(scopes, *dep) {
                Some(CapabilityOutcome::Value(value)) => {
                    inputs.insert(capability.as_str(), value.clone());
                }
                Some(other) => {
                    debug!(
                        "`{}` skipped: dependency `{}` produced no value",
                        node.name(),
                        capability
                    );
                    return Ok(other.clone());
                }
                None => {
                    return Err(LibraryError::fatal(
                        node.name(),
                        format!(
                            "dependency `{}` was not evaluated before its consumer",
                            capability
                        ),
                    ));
                }
            }
        }

        let mut ctx = NodeContext::new(node.spec(), point, node.options(), inputs, node.backends())
            .in_loop(loop_context);
        if let Some((members, report)) = loop_results {
            ctx = ctx.with_loop_results(members, report);
        }

        if node.spec().once_per_process {
            let mut once = self.once.lock().map_err(|_| {
                LibraryError::fatal(node.name(), "once-per-process cache is poisoned")
            })?;
            if let Some(value) = once.get(&index) {
                return Ok(CapabilityOutcome::Value(value.clone()));
            }
            let outcome = self.invoke(node, &ctx)?;
            if let CapabilityOutcome::Value(value) = &outcome {
                once.insert(index, value.clone());
            }
            return Ok(outcome);
        }

        self.invoke(node, &ctx)
    }

    fn invoke(
        &self,
        node: &GraphNode,
        ctx: &NodeContext<'_>,
    ) -> Result<CapabilityOutcome, LibraryError> {
        let started = Instant::now();
        let result = node.function().evaluate(ctx);
        let elapsed = started.elapsed();
        self.stats.record(
            node.index().as_usize(),
            elapsed,
            matches!(result, Err(NodeFailure::Invalid(_))),
        );

        match result {
            Ok(value) => Ok(CapabilityOutcome::Value(Arc::new(value))),
            Err(NodeFailure::Invalid(reason)) => {
                debug!("`{}` invalidated the point: {}", node.name(), reason);
                Ok(CapabilityOutcome::Invalidated {
                    reason,
                    origin: node.name(),
                })
            }
            Err(NodeFailure::Fatal(message)) => {
                error!("Fatal error in `{}`: {}", node.name(), message);
                Err(LibraryError::fatal(node.name(), message))
            }
        }
    }
}
