//! Capability-based dependency resolution and execution.
//!
//! Modules register computation nodes in a [`CapabilityRegistry`]; a [`GraphBuilder`] turns a
//! [`Request`] into an immutable [`DependencyGraph`]; an [`Executor`] evaluates that graph once
//! per [`ParameterPoint`], reporting each requested capability as a value, an invalidated point
//! or a loop error.

pub mod backend;
pub mod error;
pub mod evaluation;
pub mod graph;
pub mod model;
pub mod node;
pub mod registry;

pub use backend::{
    Backend, BackendBinding, BackendFunctionEntry, BackendPlugin, BackendRegistry,
    BackendRequirement, LoadStatus, Version, VersionReq,
};
pub use error::{BackendError, BuildError, LibraryError, RegistryError};
pub use evaluation::{
    CapabilityOutcome, Dispatch, Executor, LoopContext, LoopReport, LoopState, NodeStats,
    PointResults,
};
pub use graph::{CapabilityRequest, DependencyGraph, GraphBuilder, Request};
pub use model::{ModelHierarchy, Options, ParameterPoint, RunOptions, Value};
pub use node::{AbortPolicy, LoopSpec, ModuleFunction, NodeContext, NodeFailure, NodeSpec};
pub use registry::{CapabilityRegistry, MODEL_PARAMETERS};
