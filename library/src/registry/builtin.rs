use super::CapabilityRegistry;
use crate::model::Value;
use crate::node::{NodeContext, NodeFailure, NodeSpec};

/// Capability exposing the current point's named values as a map.
pub const MODEL_PARAMETERS: &str = "ModelParameters";
pub const MODEL_PARAMETERS_TYPE: &str = "parameters";

fn primary_parameters(ctx: &NodeContext<'_>) -> Result<Value, NodeFailure> {
    Ok(ctx.point().to_value())
}

pub(super) fn register(registry: &mut CapabilityRegistry) {
    let spec = NodeSpec::new(
        "Core",
        "primary_parameters",
        MODEL_PARAMETERS,
        MODEL_PARAMETERS_TYPE,
    );
    // A fresh registry has no providers, so this cannot collide.
    if let Err(e) = registry.register_fn(spec, primary_parameters) {
        log::error!("Failed to register built-in parameters provider: {}", e);
    }
}
