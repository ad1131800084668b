//! Toy singlet scalar dark matter modules.
//!
//! Four modules (`Spectrum`, `Decays`, `Relic`, `Likelihood`) and one in-process backend
//! (`ToyCalc`), enough to drive every path of the engine from the command line: model
//! lineage, once-per-process initialisation, backend calls, an iterative loop and point
//! invalidation.

use std::f64::consts::PI;

use depres::backend::{Backend, BackendFunctionEntry, BackendRequirement, VersionReq};
use depres::error::RegistryError;
use depres::model::Value;
use depres::node::{LoopSpec, NodeContext, NodeFailure, NodeSpec};
use depres::registry::{CapabilityRegistry, MODEL_PARAMETERS};

pub const SINGLET: &str = "SingletDM";
pub const SINGLET_Z2: &str = "SingletDM_Z2";

const HIGGS_MASS: f64 = 125.1;
const HIGGS_VEV: f64 = 246.22;
/// Standard Model Higgs width in GeV.
const HIGGS_SM_WIDTH: f64 = 4.07e-3;
const PLANCK_OH2: f64 = 0.120;
const PLANCK_OH2_SIGMA: f64 = 0.0012;
const BR_INVISIBLE_SIGMA: f64 = 0.11;

fn toycalc_requirement(group: &str) -> BackendRequirement {
    BackendRequirement::new(group).from_backend("ToyCalc", VersionReq::Compatible((1, 0, 0).into()))
}

/// The in-process `ToyCalc` backend. Not reentrant.
pub fn toycalc() -> Backend {
    Backend::new("ToyCalc", (1, 0, 0))
        .with_function(BackendFunctionEntry::new(
            "toycalc_initialise",
            "bool",
            |_: &[Value]| {
                log::info!("ToyCalc initialised");
                Ok(Value::from(true))
            },
        ))
        .with_function(BackendFunctionEntry::new(
            "higgs_invisible_width",
            "double",
            higgs_to_singlets,
        ))
}

/// `Γ(h → SS)` for `[m_h, m_S, λ_hS]`.
fn higgs_to_singlets(args: &[Value]) -> Result<Value, NodeFailure> {
    let arg = |i: usize| {
        args.get(i).and_then(Value::as_number).ok_or_else(|| {
            NodeFailure::fatal(format!("higgs_invisible_width: argument {} must be a number", i))
        })
    };
    let (m_h, m_s, lambda) = (arg(0)?, arg(1)?, arg(2)?);
    if 2.0 * m_s >= m_h {
        return Ok(Value::from(0.0));
    }
    let beta = (1.0 - 4.0 * m_s * m_s / (m_h * m_h)).sqrt();
    Ok(Value::from(
        lambda * lambda * HIGGS_VEV * HIGGS_VEV / (32.0 * PI * m_h) * beta,
    ))
}

/// Declares the singlet models and registers every toy module.
pub fn registry() -> Result<CapabilityRegistry, RegistryError> {
    let mut registry = CapabilityRegistry::with_builtin_parameters();
    registry.models_mut().declare(SINGLET)?;
    registry.models_mut().declare_child(SINGLET_Z2, SINGLET)?;

    register_spectrum(&mut registry)?;
    register_decays(&mut registry)?;
    register_relic(&mut registry)?;
    register_likelihoods(&mut registry)?;
    Ok(registry)
}

fn register_spectrum(registry: &mut CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register_fn(
        NodeSpec::new("Spectrum", "get_singlet_spectrum", "SingletDM_spectrum", "spectrum")
            .depends_on(MODEL_PARAMETERS)
            .allow_model(SINGLET),
        |ctx: &NodeContext<'_>| {
            let params = ctx.dependency(MODEL_PARAMETERS)?;
            let get = |name: &str| {
                params
                    .get(name)
                    .and_then(Value::as_number)
                    .ok_or_else(|| NodeFailure::fatal(format!("missing parameter `{}`", name)))
            };
            let m_s = get("m_S")?;
            let lambda = get("lambda_hS")?;
            if m_s <= 0.0 {
                return Err(NodeFailure::invalid(format!("tachyonic singlet, m_S = {}", m_s)));
            }
            if lambda.abs() > 4.0 * PI {
                return Err(NodeFailure::invalid(format!(
                    "non-perturbative coupling, lambda_hS = {}",
                    lambda
                )));
            }
            Ok(Value::map([
                ("m_S", m_s),
                ("lambda_hS", lambda),
                ("m_h", HIGGS_MASS),
            ]))
        },
    )?;
    Ok(())
}

fn register_decays(registry: &mut CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register_fn(
        NodeSpec::new("Decays", "ToyCalc_init", "ToyCalc_init", "bool")
            .requires_backend(toycalc_requirement("toycalc_initialise"))
            .once_per_process(),
        |ctx: &NodeContext<'_>| ctx.backend("toycalc_initialise")?.call(&[]),
    )?;

    registry.register_fn(
        NodeSpec::new(
            "Decays",
            "higgs_invisible_width",
            "Higgs_invisible_width",
            "double",
        )
        .depends_on("SingletDM_spectrum")
        .depends_on("ToyCalc_init")
        .requires_backend(toycalc_requirement("higgs_invisible_width").of_type("double")),
        |ctx: &NodeContext<'_>| {
            let spectrum = ctx.dependency("SingletDM_spectrum")?;
            let args: Vec<Value> = ["m_h", "m_S", "lambda_hS"]
                .iter()
                .map(|key| spectrum.get(key).cloned().unwrap_or(Value::from(0.0)))
                .collect();
            ctx.backend("higgs_invisible_width")?.call(&args)
        },
    )?;
    Ok(())
}

/// Freeze-out relic density the iteration converges to.
fn relic_target(spectrum: &Value) -> Result<f64, NodeFailure> {
    let m_s = spectrum.get("m_S").and_then(Value::as_number);
    let lambda = spectrum.get("lambda_hS").and_then(Value::as_number);
    let (Some(m_s), Some(lambda)) = (m_s, lambda) else {
        return Err(NodeFailure::fatal("malformed singlet spectrum"));
    };
    // <σv> grows with the coupling and is resonantly enhanced near m_S = m_h / 2.
    let resonance = 1.0 / (((2.0 * m_s - HIGGS_MASS) / 10.0).powi(2) + 1.0);
    let sigma_v = lambda * lambda * (1.0 + 50.0 * resonance) * (100.0 / m_s);
    Ok(2.4e-4 / (sigma_v + 1e-6))
}

fn register_relic(registry: &mut CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register_fn(
        NodeSpec::new("Relic", "RD_oh2_iterative", "RD_oh2", "double")
            .manages_loop(LoopSpec::new("RD_converged", 20).reads("RD_estimate")),
        |ctx: &NodeContext<'_>| {
            if let Some(report) = ctx.loop_report() {
                log::debug!(
                    "Relic density loop {:?} after {} iterations",
                    report.state,
                    report.iterations
                );
            }
            ctx.member("RD_estimate").cloned()
        },
    )?;

    registry.register_fn(
        NodeSpec::new("Relic", "RD_estimate_simple", "RD_estimate", "double")
            .depends_on("SingletDM_spectrum")
            .needs_manager("RD_oh2"),
        |ctx: &NodeContext<'_>| {
            let target = relic_target(ctx.dependency("SingletDM_spectrum")?)?;
            let previous = ctx
                .previous_iteration("RD_estimate")
                .and_then(Value::as_number)
                .unwrap_or(0.0);
            Ok(Value::from(previous + (target - previous) / 2.0))
        },
    )?;

    registry.register_fn(
        NodeSpec::new("Relic", "RD_estimate_mc", "RD_estimate", "double")
            .depends_on("SingletDM_spectrum")
            .needs_manager("RD_oh2")
            .requires_backend(
                BackendRequirement::new("mc_integrate")
                    .of_type("double")
                    .from_backend("MonteCarloLib", VersionReq::Compatible((1, 0, 0).into())),
            )
            .option("samples")
            .option("seed"),
        |ctx: &NodeContext<'_>| {
            let target = relic_target(ctx.dependency("SingletDM_spectrum")?)?;
            let samples: i64 = ctx.options().get_or(1000, &["samples"])?;
            let seed: i64 = ctx.options().get_or(0, &["seed"])?;
            let sampled = ctx
                .backend("mc_integrate")?
                .call(&[Value::from(target), Value::from(samples), Value::from(seed)])?
                .as_number()
                .ok_or_else(|| NodeFailure::fatal("mc_integrate returned a non-number"))?;
            let previous = ctx
                .previous_iteration("RD_estimate")
                .and_then(Value::as_number)
                .unwrap_or(0.0);
            Ok(Value::from(previous + (sampled - previous) / 2.0))
        },
    )?;

    registry.register_fn(
        NodeSpec::new("Relic", "RD_converged", "RD_converged", "bool")
            .depends_on("RD_estimate")
            .needs_manager("RD_oh2")
            .option("tolerance"),
        |ctx: &NodeContext<'_>| {
            let tolerance: f64 = ctx.options().get_or(1e-4, &["tolerance"])?;
            let current = ctx.number("RD_estimate")?;
            let converged = ctx
                .previous_iteration("RD_estimate")
                .and_then(Value::as_number)
                .is_some_and(|previous| (current - previous).abs() <= tolerance * current.abs());
            Ok(Value::from(converged))
        },
    )?;
    Ok(())
}

fn register_likelihoods(registry: &mut CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register_fn(
        NodeSpec::new("Likelihood", "lnL_oh2_Planck", "lnL_oh2", "double")
            .depends_on("RD_oh2")
            .option("upper_limit_only"),
        |ctx: &NodeContext<'_>| {
            let oh2 = ctx.number("RD_oh2")?;
            let upper_only: bool = ctx.options().get_or(true, &["upper_limit_only"])?;
            if upper_only && oh2 <= PLANCK_OH2 {
                return Ok(Value::from(0.0));
            }
            let pull = (oh2 - PLANCK_OH2) / PLANCK_OH2_SIGMA;
            Ok(Value::from(-0.5 * pull * pull))
        },
    )?;

    registry.register_fn(
        NodeSpec::new(
            "Likelihood",
            "lnL_Higgs_invisible",
            "lnL_Higgs_invisible",
            "double",
        )
        .depends_on_typed("Higgs_invisible_width", "double"),
        |ctx: &NodeContext<'_>| {
            let width = ctx.number("Higgs_invisible_width")?;
            let branching = width / (width + HIGGS_SM_WIDTH);
            let pull = branching / BR_INVISIBLE_SIGMA;
            Ok(Value::from(-0.5 * pull * pull))
        },
    )?;
    Ok(())
}
