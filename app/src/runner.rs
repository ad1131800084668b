use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use depres::backend::{BackendRegistry, Version};
use depres::evaluation::{Dispatch, Executor, PointResults};
use depres::graph::GraphBuilder;
use depres::registry::{CapabilityRegistry, ProviderStatus};
use log::{debug, info, warn};

use crate::config::RunConfig;
use crate::toy;

/// Registers the built-in backend, loads plugins and records expected backends that are missing.
pub fn discover_backends(config: &RunConfig, plugin_dir: Option<&Path>) -> Result<BackendRegistry> {
    let mut backends = BackendRegistry::new();
    backends.register(toy::toycalc());

    if let Some(dir) = plugin_dir.or(config.plugin_dir.as_deref()) {
        backends
            .load_plugins_from_directory(dir)
            .with_context(|| format!("scanning {}", dir.display()))?;
    }

    for expected in &config.backend {
        if backends.iter().any(|b| b.name() == expected.name) {
            continue;
        }
        let version: Version = expected
            .version
            .parse()
            .with_context(|| format!("version of backend `{}`", expected.name))?;
        backends.mark_absent(&expected.name, version, "no plugin provides it");
    }
    Ok(backends)
}

/// Builds the graph for `config` and writes one JSON line of results per point to `out`.
pub fn run<W: Write>(
    config: &RunConfig,
    plugin_dir: Option<&Path>,
    dispatch: Option<Dispatch>,
    out: &mut W,
) -> Result<Vec<PointResults>> {
    let backends = discover_backends(config, plugin_dir)?;
    let mut registry = toy::registry()?;
    let disabled = registry.apply_backend_status(&backends);
    if disabled > 0 {
        warn!("{} providers disabled by missing backends", disabled);
    }

    let graph = GraphBuilder::new(&registry, &backends).build(&config.to_request())?;
    let dispatch = dispatch.unwrap_or(config.dispatch);
    let executor = Executor::new(Arc::new(graph)).with_dispatch(dispatch);
    info!(
        "Evaluating {} points over {} nodes ({:?} dispatch)",
        config.point.len(),
        executor.graph().len(),
        dispatch
    );

    let points = config.points()?;
    let results = executor.evaluate_many(&points)?;
    for result in &results {
        writeln!(out, "{}", serde_json::to_string(result)?)?;
    }

    let valid = results.iter().filter(|r| r.is_valid()).count();
    info!("{} of {} points valid", valid, results.len());
    for (name, stats) in executor.stats() {
        debug!(
            "{}: {} calls, {} invalidations, {:?}",
            name, stats.calls, stats.invalidations, stats.total_time
        );
    }
    Ok(results)
}

/// Writes the provider catalog and backend table.
pub fn list<W: Write>(
    registry: &CapabilityRegistry,
    backends: &BackendRegistry,
    out: &mut W,
) -> Result<()> {
    writeln!(out, "Providers:")?;
    for provider in registry.providers() {
        let spec = provider.spec();
        let status = match provider.status() {
            ProviderStatus::Available => String::new(),
            ProviderStatus::Disabled { reason } => format!("  [disabled: {}]", reason),
        };
        writeln!(
            out,
            "  {:<40} {} ({}){}",
            spec.full_name(),
            spec.capability,
            spec.type_name,
            status
        )?;
    }

    writeln!(out, "Backends:")?;
    for backend in backends.iter() {
        let mut groups: Vec<&str> = backend.groups().collect();
        groups.sort_unstable();
        writeln!(
            out,
            "  {:<24} {:?} [{}]",
            backend.label(),
            backend.status(),
            groups.join(", ")
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depres::model::Value;

    #[test]
    fn test_example_run_writes_one_line_per_point() {
        let config = RunConfig::example();
        let mut out = Vec::new();
        let results = run(&config, None, None, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), config.point.len());
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["model"], "SingletDM_Z2");

        assert!(results[0].is_valid());
        assert!(results[0]
            .value("lnL_Higgs_invisible")
            .and_then(Value::as_number)
            .is_some_and(|lnl| lnl < 0.0));
        // m_S < 0 is a tachyonic point.
        assert!(results[2].get("lnL_oh2").unwrap().is_invalidated());
    }

    #[test]
    fn test_shipped_run_file() {
        let config: RunConfig =
            toml::from_str(include_str!("../config/example_run.toml")).unwrap();
        assert_eq!(config.backend_pins["higgs_invisible_width"], "ToyCalc@1.0.0");
        let results = run(&config, None, None, &mut std::io::sink()).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[1].is_valid());
    }

    #[test]
    fn test_parallel_dispatch_matches_serial() {
        let config = RunConfig::example();
        let serial = run(&config, None, Some(Dispatch::Serial), &mut std::io::sink()).unwrap();
        let parallel = run(&config, None, Some(Dispatch::Parallel), &mut std::io::sink()).unwrap();
        for (s, p) in serial.iter().zip(&parallel) {
            assert_eq!(s.outcomes, p.outcomes);
        }
    }

    #[test]
    fn test_missing_plugin_is_listed_as_absent() {
        let config = RunConfig::example();
        let backends = discover_backends(&config, None).unwrap();
        let mut registry = toy::registry().unwrap();
        registry.apply_backend_status(&backends);

        let mut out = Vec::new();
        list(&registry, &backends, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Relic::RD_estimate_mc"));
        assert!(text.contains("disabled"));
        assert!(text.contains("Absent"));
    }
}
