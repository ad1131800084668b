//! The resolved dependency graph.
//!
//! A [`DependencyGraph`] is produced once per [`Request`] by [`GraphBuilder`] and is immutable
//! afterwards: edges, backend bindings and loop regions never change between parameter points.
//! Rebinding anything means building a new graph.

pub mod analysis;
mod builder;

pub use builder::GraphBuilder;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::BackendBinding;
use crate::model::{Options, RunOptions};
use crate::node::{AbortPolicy, ModuleFunction, NodeSpec};
use crate::registry::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(usize);

impl RegionId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// One requested capability, optionally constrained to a result type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub capability: String,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
}

impl CapabilityRequest {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            type_name: None,
        }
    }

    pub fn typed(capability: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            type_name: Some(type_name.into()),
        }
    }
}

/// What the scan driver asks for.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Request {
    pub model: String,
    #[serde(default)]
    pub requested: Vec<CapabilityRequest>,
    /// capability -> node name (`function` or `module::function`)
    #[serde(default)]
    pub pins: BTreeMap<String, String>,
    /// backend function group -> `name` or `name@version`
    #[serde(default)]
    pub backend_pins: BTreeMap<String, String>,
    #[serde(default)]
    pub options: RunOptions,
}

impl Request {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn request(mut self, capability: impl Into<String>) -> Self {
        self.requested.push(CapabilityRequest::new(capability));
        self
    }

    pub fn request_typed(
        mut self,
        capability: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        self.requested
            .push(CapabilityRequest::typed(capability, type_name));
        self
    }

    pub fn pin(mut self, capability: impl Into<String>, node: impl Into<String>) -> Self {
        self.pins.insert(capability.into(), node.into());
        self
    }

    pub fn pin_backend(mut self, group: impl Into<String>, backend: impl Into<String>) -> Self {
        self.backend_pins.insert(group.into(), backend.into());
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// A node selected for this graph, with everything resolved at build time.
pub struct GraphNode {
    index: NodeIndex,
    provider: ProviderId,
    spec: NodeSpec,
    function: Arc<dyn ModuleFunction>,
    options: Options,
    /// Active dependency edges as (capability, provider node).
    dependencies: Vec<(String, NodeIndex)>,
    backends: HashMap<String, BackendBinding>,
    /// Region this node is a member of.
    region: Option<RegionId>,
    /// Region this node manages.
    manages: Option<RegionId>,
}

impl GraphNode {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn name(&self) -> String {
        self.spec.full_name()
    }

    pub fn capability(&self) -> &str {
        &self.spec.capability
    }

    pub fn function(&self) -> &Arc<dyn ModuleFunction> {
        &self.function
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn dependencies(&self) -> &[(String, NodeIndex)] {
        &self.dependencies
    }

    pub fn backends(&self) -> &HashMap<String, BackendBinding> {
        &self.backends
    }

    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    pub fn manages(&self) -> Option<RegionId> {
        self.manages
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("index", &self.index)
            .field("name", &self.spec.full_name())
            .field("capability", &self.spec.capability)
            .field("dependencies", &self.dependencies)
            .field("backends", &self.backends)
            .field("region", &self.region)
            .field("manages", &self.manages)
            .finish()
    }
}

/// A set of nodes evaluated repeatedly under one loop manager.
#[derive(Debug, Clone)]
pub struct LoopRegion {
    id: RegionId,
    manager: NodeIndex,
    parent: Option<RegionId>,
    /// Direct members in topological order. Members of nested regions are reached through their
    /// own manager, which is a direct member here.
    members: Vec<NodeIndex>,
    convergence: NodeIndex,
    outputs: Vec<(String, NodeIndex)>,
    max_iterations: u32,
    on_abort: AbortPolicy,
}

impl LoopRegion {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn manager(&self) -> NodeIndex {
        self.manager
    }

    pub fn parent(&self) -> Option<RegionId> {
        self.parent
    }

    pub fn members(&self) -> &[NodeIndex] {
        &self.members
    }

    pub fn convergence(&self) -> NodeIndex {
        self.convergence
    }

    pub fn outputs(&self) -> &[(String, NodeIndex)] {
        &self.outputs
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn on_abort(&self) -> AbortPolicy {
        self.on_abort
    }
}

/// A validated, acyclic graph of computation nodes for one request.
#[derive(Debug)]
pub struct DependencyGraph {
    model: String,
    nodes: Vec<GraphNode>,
    by_capability: HashMap<String, NodeIndex>,
    /// Evaluation prerequisites: dependency edges, plus a manager's direct members.
    prereqs: Vec<Vec<NodeIndex>>,
    order: Vec<NodeIndex>,
    requested: Vec<(String, NodeIndex)>,
    regions: Vec<LoopRegion>,
}

impl DependencyGraph {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &GraphNode {
        &self.nodes[index.0]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// The node selected for `capability`.
    pub fn find(&self, capability: &str) -> Option<&GraphNode> {
        self.by_capability.get(capability).map(|&i| &self.nodes[i.0])
    }

    pub fn prerequisites(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.prereqs[index.0]
    }

    /// Topological order, prerequisites first.
    pub fn order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Requested capabilities in request order with their nodes.
    pub fn requested(&self) -> &[(String, NodeIndex)] {
        &self.requested
    }

    pub fn regions(&self) -> &[LoopRegion] {
        &self.regions
    }

    pub fn region(&self, id: RegionId) -> &LoopRegion {
        &self.regions[id.0]
    }

    /// Transitive prerequisite closure of `roots`.
    pub fn closure(&self, roots: &[NodeIndex]) -> HashSet<NodeIndex> {
        analysis::closure(&self.prereqs, roots)
    }

    /// Dependency levels of `subset`, in topological order.
    pub fn levels(&self, subset: &HashSet<NodeIndex>) -> Vec<Vec<NodeIndex>> {
        analysis::levels(&self.prereqs, &self.order, subset)
    }

    /// True if `node` lies in `region` or in a region nested inside it.
    pub fn is_within(&self, node: NodeIndex, region: RegionId) -> bool {
        let mut current = self.nodes[node.0].region;
        while let Some(r) = current {
            if r == region {
                return true;
            }
            current = self.regions[r.0].parent;
        }
        false
    }
}
