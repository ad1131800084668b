use depres::backend::{BackendFunctionEntry, BackendPlugin};
use depres::model::Value;
use depres::node::NodeFailure;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A toy Monte Carlo integration library.
pub struct MonteCarloLib;

impl BackendPlugin for MonteCarloLib {
    fn name(&self) -> &str {
        "MonteCarloLib"
    }

    fn version(&self) -> (u32, u32, u32) {
        (1, 0, 0)
    }

    fn thread_safe(&self) -> bool {
        true
    }

    fn functions(&self) -> Vec<BackendFunctionEntry> {
        vec![BackendFunctionEntry::new("mc_integrate", "double", mc_integrate)]
    }
}

/// `mc_integrate(target, samples, seed)`: averages `samples` draws of `target` smeared by ±2%.
///
/// The same seed always gives the same estimate.
fn mc_integrate(args: &[Value]) -> Result<Value, NodeFailure> {
    let target = args
        .first()
        .and_then(Value::as_number)
        .ok_or_else(|| NodeFailure::fatal("mc_integrate: argument 0 must be a number"))?;
    let samples = args.get(1).and_then(Value::as_integer).unwrap_or(1000);
    let seed = args.get(2).and_then(Value::as_integer).unwrap_or(0);
    if samples <= 0 {
        return Err(NodeFailure::fatal(format!(
            "mc_integrate: sample count must be positive, got {}",
            samples
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed as u64);
    let sum: f64 = (0..samples)
        .map(|_| target * rng.gen_range(0.98..=1.02))
        .sum();
    Ok(Value::from(sum / samples as f64))
}

#[allow(improper_ctypes_definitions)]
#[no_mangle]
pub extern "C" fn create_backend_plugin() -> *mut dyn BackendPlugin {
    let plugin: Box<dyn BackendPlugin> = Box::new(MonteCarloLib);
    Box::into_raw(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depres::backend::{BackendRegistry, BackendRequirement, VersionReq};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn test_estimate_is_seeded_and_close() {
        let args = [Value::from(0.12), Value::from(500i64), Value::from(7i64)];
        let a = mc_integrate(&args).unwrap().as_number().unwrap();
        let b = mc_integrate(&args).unwrap().as_number().unwrap();
        assert_eq!(a, b);
        assert!((a - 0.12).abs() < 0.12 * 0.02);
    }

    #[test]
    fn test_bad_arguments_are_fatal() {
        assert!(!mc_integrate(&[]).unwrap_err().is_invalid());
        let zero = [Value::from(1.0), Value::from(0i64)];
        assert!(mc_integrate(&zero).is_err());
    }

    #[test]
    fn test_registers_as_thread_safe_backend() {
        let mut registry = BackendRegistry::new();
        let backend = registry.register_plugin(Arc::new(MonteCarloLib));
        assert!(backend.is_thread_safe());

        let requirement = BackendRequirement::new("mc_integrate")
            .from_backend("MonteCarloLib", VersionReq::Compatible((1, 0, 0).into()));
        let binding = registry.resolve(&requirement, &BTreeMap::new()).unwrap();
        let value = binding.call(&[Value::from(1.0), Value::from(10i64)]).unwrap();
        assert!(value.as_number().is_some());
    }
}
