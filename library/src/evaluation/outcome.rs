use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::model::Value;

/// What one node, and therefore one requested capability, produced for a point.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Value(Arc<Value>),
    /// The point is physically disallowed. `origin` is the node that said so.
    Invalidated { reason: String, origin: String },
    /// A loop aborted under [`AbortPolicy::Error`](crate::node::AbortPolicy::Error).
    Error { diagnostic: String },
}

impl CapabilityOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            CapabilityOutcome::Value(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, CapabilityOutcome::Value(_))
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, CapabilityOutcome::Invalidated { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CapabilityOutcome::Error { .. })
    }
}

/// Per requested capability outcomes of one parameter point, in request order.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PointResults {
    pub point: Uuid,
    pub model: String,
    pub outcomes: Vec<(String, CapabilityOutcome)>,
}

impl PointResults {
    pub fn get(&self, capability: &str) -> Option<&CapabilityOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| c == capability)
            .map(|(_, o)| o)
    }

    pub fn value(&self, capability: &str) -> Option<&Value> {
        self.get(capability).and_then(CapabilityOutcome::value)
    }

    /// True if every requested capability produced a value.
    pub fn is_valid(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_value())
    }
}
