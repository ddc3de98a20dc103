//! Pipeline handoff, integrity attribution, and failure-policy behavior.

use cairn_config::RuntimeConfig;
use cairn_pipeline::{
    ElementType, FailurePolicy, Orchestrator, PipelineError, PipelineNode, WorkError,
};
use std::time::Duration;

const RATES: &str = "bus://scenarios/rates";
const CASHFLOWS: &str = "bus://projection/cashflows";

fn config() -> RuntimeConfig {
    let mut c = RuntimeConfig::default();
    c.handoff_timeout_ms = 2_000;
    c
}

/// esg -> projection -> aggregation over two f64 blocks.
fn build_chain(policy: FailurePolicy, config: RuntimeConfig) -> Orchestrator {
    let mut orch = Orchestrator::new(config, policy);
    orch.add_resource(RATES, 800, ElementType::F64, "esg", &["projection"])
        .unwrap();
    orch.add_resource(CASHFLOWS, 800, ElementType::F64, "projection", &["aggregation"])
        .unwrap();

    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &[RATES],
        Box::new(|ctx| {
            let rates = ctx.output_f64_mut(RATES)?.iter_mut();
            for (i, r) in rates.enumerate() {
                *r = 0.03 + i as f64 * 1e-4;
            }
            Ok(())
        }),
    ))
    .unwrap();

    orch.add_node(PipelineNode::new(
        "projection",
        &[RATES],
        &[CASHFLOWS],
        Box::new(|ctx| {
            let rates: Vec<f64> = ctx.input_f64(RATES)?.to_vec();
            let out = ctx.output_f64_mut(CASHFLOWS)?;
            for (o, r) in out.iter_mut().zip(rates) {
                *o = 1_000.0 * (1.0 + r);
            }
            Ok(())
        }),
    ))
    .unwrap();

    orch.add_node(PipelineNode::new(
        "aggregation",
        &[CASHFLOWS],
        &[],
        Box::new(|ctx| {
            let total: f64 = ctx.input_f64(CASHFLOWS)?.iter().sum();
            if total > 0.0 {
                Ok(())
            } else {
                Err(WorkError::new("empty-aggregate", "no cashflows"))
            }
        }),
    ))
    .unwrap();

    orch
}

#[test]
fn chain_completes_in_dependency_order() {
    let mut orch = build_chain(FailurePolicy::FailFast, config());
    orch.allocate().unwrap();
    let report = orch.run().unwrap();

    assert!(report.success);
    assert_eq!(report.completed(), vec!["esg", "projection", "aggregation"]);
    assert!(report.failed().is_empty());
    assert!(report.skipped().is_empty());
    assert!(report.first_error().is_none());

    // Handoff order is visible in the report order (topological).
    let ids: Vec<&str> = report.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["esg", "projection", "aggregation"]);
}

#[test]
fn corruption_after_publish_is_attributed_to_the_producer() {
    let mut orch = Orchestrator::new(config(), FailurePolicy::ContinueOnError);
    orch.add_resource(RATES, 800, ElementType::F64, "esg", &["projection"])
        .unwrap();
    orch.add_resource(CASHFLOWS, 800, ElementType::F64, "projection", &["aggregation"])
        .unwrap();

    // esg writes the block, records its checksum, then scribbles one byte:
    // exactly the corruption window the checker exists to catch.
    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &[RATES],
        Box::new(|ctx| {
            {
                let rates = ctx.output_f64_mut(RATES)?;
                rates.fill(0.03);
            }
            ctx.publish(RATES)?;
            let bytes = ctx.output_mut(RATES)?;
            bytes[13] ^= 0xFF;
            Ok(())
        }),
    ))
    .unwrap();

    orch.add_node(PipelineNode::new(
        "projection",
        &[RATES],
        &[CASHFLOWS],
        Box::new(|_| must_not_run()),
    ))
    .unwrap();

    orch.add_node(PipelineNode::new(
        "aggregation",
        &[CASHFLOWS],
        &[],
        Box::new(|_| must_not_run()),
    ))
    .unwrap();

    orch.allocate().unwrap();
    let report = orch.run().unwrap();

    assert!(!report.success);
    assert_eq!(report.completed(), vec!["esg"]);
    assert_eq!(report.failed(), vec!["projection"]);
    // aggregation depends on the failed projection: skipped, not failed.
    assert_eq!(report.skipped(), vec!["aggregation"]);

    match report.first_error().unwrap() {
        PipelineError::IntegrityCheckFailed {
            resource,
            culprit,
            consumer,
            expected,
            actual,
        } => {
            assert_eq!(resource, RATES);
            assert_eq!(culprit, "esg");
            assert_eq!(consumer, "projection");
            assert_ne!(expected, actual);
        }
        other => panic!("expected integrity failure, got {other}"),
    }
}

/// Work units that must never run in a test.
fn must_not_run() -> Result<(), WorkError> {
    Err(WorkError::new("unreachable", "this unit must not have run"))
}

#[test]
fn disabled_integrity_lets_corruption_pass() {
    let mut cfg = config();
    cfg.integrity_checks = false;
    let mut orch = Orchestrator::new(cfg, FailurePolicy::FailFast);
    orch.add_resource(RATES, 64, ElementType::U8, "esg", &["projection"])
        .unwrap();
    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &[RATES],
        Box::new(|ctx| {
            {
                let b = ctx.output_mut(RATES)?;
                b.fill(7);
            }
            ctx.publish(RATES)?;
            let b = ctx.output_mut(RATES)?;
            b[0] = 99;
            Ok(())
        }),
    ))
    .unwrap();
    orch.add_node(PipelineNode::new(
        "projection",
        &[RATES],
        &[],
        Box::new(|ctx| {
            ctx.verify(RATES)?;
            Ok(())
        }),
    ))
    .unwrap();
    orch.allocate().unwrap();

    let report = orch.run().unwrap();
    assert!(report.success, "{:?}", report.first_error());
    assert_eq!(report.completed(), vec!["esg", "projection"]);
}

#[test]
fn failed_work_unit_reports_code_and_skips_dependents() {
    let mut orch = Orchestrator::new(config(), FailurePolicy::ContinueOnError);
    orch.add_resource(RATES, 80, ElementType::F64, "esg", &["projection"])
        .unwrap();
    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &[RATES],
        Box::new(|_| Err(WorkError::new("esg-503", "generator unavailable"))),
    ))
    .unwrap();
    orch.add_node(PipelineNode::new(
        "projection",
        &[RATES],
        &[],
        Box::new(|_| must_not_run()),
    ))
    .unwrap();
    // An independent branch keeps going in continue-on-error mode.
    orch.add_node(PipelineNode::new("audit", &[], &[], Box::new(|_| Ok(()))))
        .unwrap();
    orch.allocate().unwrap();

    let report = orch.run().unwrap();
    assert!(!report.success);
    assert_eq!(report.failed(), vec!["esg"]);
    assert_eq!(report.skipped(), vec!["projection"]);
    assert_eq!(report.completed(), vec!["audit"]);

    match report.first_error().unwrap() {
        PipelineError::NodeFailed { node, source } => {
            assert_eq!(node, "esg");
            assert_eq!(source.code, "esg-503");
        }
        other => panic!("expected node failure, got {other}"),
    }
}

#[test]
fn slow_producer_times_out_its_consumer() {
    let mut cfg = config();
    cfg.handoff_timeout_ms = 60;
    let mut orch = Orchestrator::new(cfg, FailurePolicy::ContinueOnError);
    orch.add_resource(RATES, 80, ElementType::F64, "esg", &["projection"])
        .unwrap();
    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &[RATES],
        Box::new(|_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        }),
    ))
    .unwrap();
    orch.add_node(PipelineNode::new(
        "projection",
        &[RATES],
        &[],
        Box::new(|_| must_not_run()),
    ))
    .unwrap();
    orch.allocate().unwrap();

    let report = orch.run().unwrap();
    assert!(!report.success);
    // The producer itself finishes fine; the consumer gave up first.
    assert_eq!(report.completed(), vec!["esg"]);
    assert_eq!(report.failed(), vec!["projection"]);
    match report.node("projection").unwrap().error.as_ref().unwrap() {
        PipelineError::UpstreamTimeout { node, producer, .. } => {
            assert_eq!(node, "projection");
            assert_eq!(producer, "esg");
        }
        other => panic!("expected upstream timeout, got {other}"),
    }
    // The consumer measurably waited its edge timeout.
    assert!(report.node("projection").unwrap().timing.wait >= Duration::from_millis(55));
}

#[test]
fn pure_sink_nodes_complete_normally() {
    let mut orch = Orchestrator::new(config(), FailurePolicy::ContinueOnError);
    orch.add_node(PipelineNode::new("sink", &[], &[], Box::new(|_| Ok(()))))
        .unwrap();
    orch.allocate().unwrap();
    let report = orch.run().unwrap();
    assert!(report.success);
    assert_eq!(report.completed(), vec!["sink"]);
}

#[test]
fn fallback_signaler_preserves_semantics() {
    let mut cfg = config();
    cfg.force_copy_transport = true;
    let mut orch = build_chain(FailurePolicy::FailFast, cfg);
    orch.allocate().unwrap();
    let report = orch.run().unwrap();
    assert!(report.success);
    assert_eq!(report.completed(), vec!["esg", "projection", "aggregation"]);
}

#[test]
fn wiring_is_validated_at_allocate() {
    // Unknown producer.
    let mut orch = Orchestrator::new(config(), FailurePolicy::FailFast);
    orch.add_resource(RATES, 80, ElementType::F64, "ghost", &[])
        .unwrap();
    assert!(matches!(
        orch.allocate(),
        Err(PipelineError::UnknownNode { .. })
    ));

    // Node writing an undeclared block.
    let mut orch = Orchestrator::new(config(), FailurePolicy::FailFast);
    orch.add_node(PipelineNode::new(
        "esg",
        &[],
        &["bus://missing"],
        Box::new(|_| Ok(())),
    ))
    .unwrap();
    assert!(matches!(
        orch.allocate(),
        Err(PipelineError::UndeclaredAccess { .. })
    ));

    // Bad scheme.
    let mut orch = Orchestrator::new(config(), FailurePolicy::FailFast);
    assert!(matches!(
        orch.add_resource("scenarios/rates", 80, ElementType::F64, "esg", &[]),
        Err(PipelineError::InvalidResourceName { .. })
    ));
}

#[test]
fn memory_limit_applies_to_allocation() {
    let mut cfg = config();
    cfg.max_memory_bytes = Some(64);
    let mut orch = Orchestrator::new(cfg, FailurePolicy::FailFast);
    orch.add_resource(RATES, 4_096, ElementType::F64, "esg", &[])
        .unwrap();
    orch.add_node(PipelineNode::new("esg", &[], &[RATES], Box::new(|_| Ok(()))))
        .unwrap();
    assert!(matches!(
        orch.allocate(),
        Err(PipelineError::CapacityExceeded { .. })
    ));
}

#[test]
fn reruns_reset_signals_and_checksums() {
    let mut orch = build_chain(FailurePolicy::FailFast, config());
    orch.allocate().unwrap();
    let first = orch.run().unwrap();
    let second = orch.run().unwrap();
    assert!(first.success);
    assert!(second.success);
    assert_eq!(second.completed(), vec!["esg", "projection", "aggregation"]);
}
