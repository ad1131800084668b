use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use depres::backend::BackendRegistry;
use depres::error::LibraryError;
use depres::evaluation::{CapabilityOutcome, Executor, LoopState};
use depres::graph::{GraphBuilder, Request};
use depres::model::{Options, ParameterPoint, RunOptions, Value};
use depres::node::{AbortPolicy, LoopSpec, NodeContext, NodeFailure, NodeSpec};
use depres::registry::CapabilityRegistry;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spec(function: &str, capability: &str) -> NodeSpec {
    NodeSpec::new("Loop", function, capability, "double")
}

fn point() -> ParameterPoint {
    ParameterPoint::new("Toy", [("x", 1.0)])
}

/// Manager reporting `[iterations, state, estimate]`.
fn report_manager(ctx: &NodeContext<'_>) -> Result<Value, NodeFailure> {
    let report = ctx
        .loop_report()
        .ok_or_else(|| NodeFailure::fatal("manager without loop report"))?;
    let state = match report.state {
        LoopState::Converged => "converged",
        LoopState::Aborted => "aborted",
        LoopState::Idle | LoopState::Iterating => "unfinished",
    };
    let estimate = ctx.member("estimate")?.clone();
    Ok(Value::from(vec![
        Value::from(report.iterations as i64),
        Value::from(state),
        estimate,
    ]))
}

/// Registers a relic-density style loop whose `converged` member is true from iteration
/// `converge_at` on (never when `None`), and whose `estimate` member counts its calls.
fn loop_registry(
    converge_at: Option<u32>,
    max_iterations: u32,
    on_abort: AbortPolicy,
    estimate_calls: &Arc<AtomicUsize>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry
        .register_fn(
            spec("RD_oh2", "RD_oh2").manages_loop(
                LoopSpec::new("converged", max_iterations)
                    .reads("estimate")
                    .on_abort(on_abort),
            ),
            report_manager,
        )
        .unwrap();

    let calls = estimate_calls.clone();
    registry
        .register_fn(
            spec("estimate", "estimate").depends_on("mass").needs_manager("RD_oh2"),
            move |ctx: &NodeContext<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
                // Each iteration refines the previous estimate.
                let previous = ctx
                    .previous_iteration("estimate")
                    .and_then(Value::as_number)
                    .unwrap_or(0.0);
                Ok(Value::from(previous + ctx.number("mass")?))
            },
        )
        .unwrap();
    registry
        .register_fn(
            spec("converged", "converged")
                .depends_on("estimate")
                .needs_manager("RD_oh2"),
            move |ctx: &NodeContext<'_>| {
                let iteration = ctx
                    .iteration()
                    .ok_or_else(|| NodeFailure::fatal("member outside its loop"))?;
                Ok(Value::from(converge_at.is_some_and(|n| iteration >= n)))
            },
        )
        .unwrap();
    registry
        .register_fn(spec("mass", "mass"), |_: &NodeContext<'_>| Ok(Value::from(1.0)))
        .unwrap();
    registry
}

fn run(registry: &CapabilityRegistry, request: &Request) -> Result<CapabilityOutcome, LibraryError> {
    let backends = BackendRegistry::new();
    let graph = GraphBuilder::new(registry, &backends).build(request).unwrap();
    let results = Executor::new(Arc::new(graph)).evaluate(&point())?;
    Ok(results.get("RD_oh2").unwrap().clone())
}

#[test]
fn test_loop_stops_at_convergence() {
    init_logger();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = loop_registry(Some(3), 10, AbortPolicy::Invalidate, &calls);
    let outcome = run(&registry, &Request::new("Toy").request("RD_oh2")).unwrap();

    let value = outcome.value().and_then(Value::as_array).unwrap().to_vec();
    assert_eq!(value[0].as_integer(), Some(3));
    assert_eq!(value[1].as_str(), Some("converged"));
    // 1 + 1 + 1 from refining over three iterations.
    assert_eq!(value[2].as_number(), Some(3.0));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unconverged_loop_aborts_exactly_at_bound() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = loop_registry(None, 4, AbortPolicy::Accept, &calls);
    let outcome = run(&registry, &Request::new("Toy").request("RD_oh2")).unwrap();

    let value = outcome.value().and_then(Value::as_array).unwrap().to_vec();
    assert_eq!(value[0].as_integer(), Some(4));
    assert_eq!(value[1].as_str(), Some("aborted"));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_abort_policies() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = loop_registry(None, 2, AbortPolicy::Invalidate, &calls);
    match run(&registry, &Request::new("Toy").request("RD_oh2")).unwrap() {
        CapabilityOutcome::Invalidated { origin, .. } => assert_eq!(origin, "Loop::RD_oh2"),
        other => panic!("expected invalidation, got {other:?}"),
    }

    let registry = loop_registry(None, 2, AbortPolicy::Error, &calls);
    let outcome = run(&registry, &Request::new("Toy").request("RD_oh2")).unwrap();
    assert!(outcome.is_error());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_iteration_bound_can_be_overridden_by_option() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = loop_registry(None, 50, AbortPolicy::Accept, &calls);
    let mut options = RunOptions::default();
    options
        .nodes
        .insert("Loop::RD_oh2".to_string(), Options::new().with("max_iterations", 5));
    let outcome = run(
        &registry,
        &Request::new("Toy").request("RD_oh2").with_options(options),
    )
    .unwrap();
    let value = outcome.value().and_then(Value::as_array).unwrap().to_vec();
    assert_eq!(value[0].as_integer(), Some(5));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_invalid_member_ends_the_loop_immediately() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = CapabilityRegistry::new();
    registry
        .register_fn(
            spec("RD_oh2", "RD_oh2").manages_loop(LoopSpec::new("converged", 10)),
            |_: &NodeContext<'_>| Ok(Value::from(0.0)),
        )
        .unwrap();
    let counter = calls.clone();
    registry
        .register_fn(
            spec("estimate", "estimate").needs_manager("RD_oh2"),
            move |ctx: &NodeContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.iteration() == Some(2) {
                    return Err(NodeFailure::invalid("negative annihilation rate"));
                }
                Ok(Value::from(1.0))
            },
        )
        .unwrap();
    registry
        .register_fn(
            spec("converged", "converged")
                .depends_on("estimate")
                .needs_manager("RD_oh2"),
            |_: &NodeContext<'_>| Ok(Value::from(false)),
        )
        .unwrap();
    registry
        .register_fn(spec("prior", "prior"), |_: &NodeContext<'_>| Ok(Value::from(1.0)))
        .unwrap();

    let backends = BackendRegistry::new();
    let graph = GraphBuilder::new(&registry, &backends)
        .build(&Request::new("Toy").request("RD_oh2").request("prior"))
        .unwrap();
    let results = Executor::new(Arc::new(graph)).evaluate(&point()).unwrap();
    match results.get("RD_oh2").unwrap() {
        CapabilityOutcome::Invalidated { origin, reason } => {
            assert_eq!(origin, "Loop::estimate");
            assert_eq!(reason, "negative annihilation rate");
        }
        other => panic!("expected invalidation, got {other:?}"),
    }
    assert!(results.get("prior").unwrap().is_value());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_non_boolean_convergence_is_fatal() {
    let mut registry = CapabilityRegistry::new();
    registry
        .register_fn(
            spec("RD_oh2", "RD_oh2").manages_loop(LoopSpec::new("converged", 3)),
            |_: &NodeContext<'_>| Ok(Value::from(0.0)),
        )
        .unwrap();
    registry
        .register_fn(
            spec("converged", "converged").needs_manager("RD_oh2"),
            |_: &NodeContext<'_>| Ok(Value::from(0.5)),
        )
        .unwrap();

    let err = run(&registry, &Request::new("Toy").request("RD_oh2")).unwrap_err();
    assert!(matches!(err, LibraryError::Fatal { ref node, .. } if node == "Loop::converged"));
}

#[test]
fn test_nested_loop_runs_as_one_member() {
    init_logger();
    let inner_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = CapabilityRegistry::new();

    registry
        .register_fn(
            spec("outer", "outer").manages_loop(LoopSpec::new("outer_done", 10)),
            |ctx: &NodeContext<'_>| {
                let report = ctx
                    .loop_report()
                    .ok_or_else(|| NodeFailure::fatal("missing report"))?;
                Ok(Value::from(report.iterations as i64))
            },
        )
        .unwrap();
    registry
        .register_fn(
            spec("outer_done", "outer_done")
                .depends_on("inner")
                .needs_manager("outer"),
            |ctx: &NodeContext<'_>| Ok(Value::from(ctx.iteration().unwrap_or(0) >= 3)),
        )
        .unwrap();
    registry
        .register_fn(
            spec("inner", "inner")
                .needs_manager("outer")
                .manages_loop(LoopSpec::new("inner_done", 10)),
            |ctx: &NodeContext<'_>| {
                let outer = ctx.iteration().unwrap_or(0);
                Ok(Value::from(outer as i64))
            },
        )
        .unwrap();
    let counter = inner_calls.clone();
    registry
        .register_fn(
            spec("inner_step", "inner_step").needs_manager("inner"),
            move |ctx: &NodeContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let context = ctx
                    .loop_context()
                    .ok_or_else(|| NodeFailure::fatal("no loop context"))?;
                assert_eq!(context.region(), "Loop::inner");
                Ok(Value::from(context.iteration() as i64))
            },
        )
        .unwrap();
    registry
        .register_fn(
            spec("inner_done", "inner_done")
                .depends_on("inner_step")
                .needs_manager("inner"),
            |ctx: &NodeContext<'_>| Ok(Value::from(ctx.iteration().unwrap_or(0) >= 2)),
        )
        .unwrap();

    let backends = BackendRegistry::new();
    let graph = GraphBuilder::new(&registry, &backends)
        .build(&Request::new("Toy").request("outer"))
        .unwrap();
    assert_eq!(graph.regions().len(), 2);
    let inner = graph.find("inner").unwrap();
    let inner_region = graph.region(inner.manages().unwrap());
    assert_eq!(inner_region.parent(), inner.region());

    let results = Executor::new(Arc::new(graph)).evaluate(&point()).unwrap();
    assert_eq!(results.value("outer").and_then(Value::as_integer), Some(3));
    assert_eq!(inner_calls.load(Ordering::SeqCst), 6);
}
