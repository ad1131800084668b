//! Core node traits.

use thiserror::Error;

use super::context::NodeContext;
use crate::model::{OptionError, Value};

/// Why a node did not produce a value.
///
/// `Invalid` marks the current parameter point as physically disallowed; it is expected and
/// point-scoped. `Fatal` is a defect or misconfiguration and aborts the run. The executor
/// dispatches on the variant only, never on the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeFailure {
    #[error("invalid point: {0}")]
    Invalid(String),
    #[error("{0}")]
    Fatal(String),
}

impl NodeFailure {
    pub fn invalid(reason: impl Into<String>) -> Self {
        NodeFailure::Invalid(reason.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        NodeFailure::Fatal(message.into())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, NodeFailure::Invalid(_))
    }
}

impl From<OptionError> for NodeFailure {
    fn from(err: OptionError) -> Self {
        NodeFailure::Fatal(err.to_string())
    }
}

/// A computation node's work.
///
/// Implementations must be deterministic for a given point and inputs, and must not touch other
/// nodes' state.
pub trait ModuleFunction: Send + Sync {
    fn evaluate(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeFailure>;
}

impl<F> ModuleFunction for F
where
    F: Fn(&NodeContext<'_>) -> Result<Value, NodeFailure> + Send + Sync,
{
    fn evaluate(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeFailure> {
        self(ctx)
    }
}
