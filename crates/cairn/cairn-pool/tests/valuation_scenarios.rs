//! End-to-end valuation runs against the deterministic mock engine.

use cairn_config::RuntimeConfig;
use cairn_engine::mock::{self, MockBehavior, MockEngine};
use cairn_engine::{CalcEngine, EngineError, EngineFactory};
use cairn_model::{
    AssumptionSet, ExpenseAssumptions, Gender, LapseTable, MortalityTable, Policy, ProductType,
    RunRequest, ScenarioParams,
};
use cairn_pool::chunking::{split_evenly, sub_chunk_seed, worker_seed};
use cairn_pool::{PoolCapacities, PoolError, RunOutcome, ValuationPool};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BASE: f64 = 1_000_000.0;
const STDDEV: f64 = 100_000.0;

fn policies() -> Vec<Policy> {
    vec![
        Policy {
            policy_id: 1,
            age: 35,
            gender: Gender::Male,
            sum_assured: 100_000.0,
            premium: 1_000.0,
            term_years: 10,
            product_type: ProductType::Term,
        },
        Policy {
            policy_id: 2,
            age: 45,
            gender: Gender::Female,
            sum_assured: 200_000.0,
            premium: 2_500.0,
            term_years: 20,
            product_type: ProductType::WholeLife,
        },
        Policy {
            policy_id: 3,
            age: 29,
            gender: Gender::Female,
            sum_assured: 150_000.0,
            premium: 1_800.0,
            term_years: 25,
            product_type: ProductType::Endowment,
        },
    ]
}

fn assumptions() -> AssumptionSet {
    AssumptionSet {
        mortality: MortalityTable::from_rates(&[0.001; 121], &[0.0008; 121]),
        lapse: LapseTable::from_rates(&[0.05; 50]),
        expenses: ExpenseAssumptions {
            acquisition: 500.0,
            maintenance: 50.0,
            percent_premium: 0.02,
            claim: 150.0,
        },
    }
}

fn params() -> ScenarioParams {
    ScenarioParams {
        initial_rate: 0.03,
        drift: 0.0,
        volatility: 0.01,
        min_rate: 0.0,
        max_rate: 0.2,
    }
}

struct MockFactory {
    behavior: MockBehavior,
    delay: Option<Duration>,
}

impl EngineFactory for MockFactory {
    fn create(&self) -> Result<Box<dyn CalcEngine>, EngineError> {
        Ok(Box::new(match self.delay {
            Some(delay) => MockEngine::with_delay(self.behavior, delay),
            None => MockEngine::new(self.behavior),
        }))
    }
}

fn factory(behavior: MockBehavior) -> Arc<dyn EngineFactory> {
    Arc::new(MockFactory {
        behavior,
        delay: None,
    })
}

fn pool_with(
    workers: u32,
    behavior: MockBehavior,
    mutate: impl FnOnce(&mut RuntimeConfig),
) -> ValuationPool {
    let mut config = RuntimeConfig::default();
    mutate(&mut config);
    let mut pool = ValuationPool::initialize(
        workers,
        PoolCapacities {
            max_policies: 16,
            max_scenarios: 20_000,
        },
        factory(behavior),
        config,
    )
    .unwrap();
    pool.load_data(&policies(), &assumptions()).unwrap();
    pool
}

fn request(n: u32, seed: u64) -> RunRequest {
    let mut req = RunRequest::new(n, seed, params());
    req.store_distribution = true;
    req
}

fn completed(outcome: RunOutcome) -> cairn_model::RunResult {
    match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run unexpectedly cancelled"),
    }
}

/// The value stream the mean-mode mock produces for a given partitioning,
/// concatenated in worker order.
fn expected_distribution(
    n: u32,
    workers: u32,
    base_seed: u64,
    chunk_size: u32,
    mortality_mult: f64,
) -> Vec<f64> {
    let mut out = Vec::with_capacity(n as usize);
    for (w, &count) in split_evenly(n, workers).iter().enumerate() {
        let ws = worker_seed(base_seed, w as u32);
        let mut offset = 0;
        let mut sub = 0;
        while offset < count {
            let c = chunk_size.min(count - offset);
            let seed = sub_chunk_seed(ws, sub);
            for i in 0..c as u64 {
                out.push(BASE + (2.0 - mortality_mult) * mock::normal(seed, i) * STDDEV);
            }
            offset += c;
            sub += 1;
        }
    }
    out
}

#[test]
fn happy_path_single_worker() {
    let mut pool = pool_with(1, MockBehavior::mean_mode(), |_| {});
    let result = completed(pool.run(&request(10_000, 42)).unwrap());

    assert_eq!(result.scenario_count, 10_000);
    let s = result.statistics;
    assert!((s.mean - BASE).abs() / BASE < 0.05, "mean {}", s.mean);
    assert!(
        (s.std_dev - STDDEV).abs() / STDDEV < 0.20,
        "stddev {}",
        s.std_dev
    );
    assert!(s.p50 < s.p75);
    assert!(s.p75 < s.p90);
    assert!(s.p90 < s.p95);
    assert!(s.p95 < s.p99);

    // CTE-95 cannot exceed the 5th percentile.
    let mut sorted = result.distribution.clone().unwrap();
    sorted.sort_by(f64::total_cmp);
    let p5 = cairn_pool::stats::percentile(&sorted, 5.0);
    assert!(s.cte95 <= p5, "cte95 {} vs p5 {}", s.cte95, p5);
}

#[test]
fn distribution_matches_the_seed_rules_exactly() {
    // Small chunks force multiple descriptors per worker and live stealing;
    // placement by home slab keeps the output byte-identical regardless.
    let mut pool = pool_with(4, MockBehavior::mean_mode(), |c| {
        c.scenario_chunk_size = 7
    });
    let result = completed(pool.run(&request(103, 42)).unwrap());
    assert_eq!(result.scenario_count, 103);

    let expected = expected_distribution(103, 4, 42, 7, 1.0);
    let got = result.distribution.unwrap();
    assert_eq!(got.len(), expected.len());
    for (i, (g, e)) in got.iter().zip(&expected).enumerate() {
        assert_eq!(g.to_bits(), e.to_bits(), "scenario {i}");
    }
}

#[test]
fn uneven_request_distributes_remainder_to_first_workers() {
    assert_eq!(split_evenly(103, 4), vec![26, 26, 26, 25]);

    let mut pool = pool_with(4, MockBehavior::mean_mode(), |_| {});
    let result = completed(pool.run(&request(103, 7)).unwrap());
    assert_eq!(result.scenario_count, 103);
    assert_eq!(result.distribution.unwrap().len(), 103);
}

#[test]
fn repeated_runs_reproduce_bitwise() {
    let mut pool = pool_with(4, MockBehavior::mean_mode(), |c| {
        c.scenario_chunk_size = 11
    });
    let a = completed(pool.run(&request(5_000, 99)).unwrap());
    let b = completed(pool.run(&request(5_000, 99)).unwrap());

    assert_eq!(a.statistics, b.statistics);
    let (da, db) = (a.distribution.unwrap(), b.distribution.unwrap());
    for (x, y) in da.iter().zip(&db) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn worker_counts_agree_statistically() {
    let mut means = Vec::new();
    for workers in [1u32, 2, 4, 8] {
        let mut pool = pool_with(workers, MockBehavior::mean_mode(), |_| {});
        let result = completed(pool.run(&request(10_000, 42)).unwrap());
        assert_eq!(result.scenario_count, 10_000);

        // Same worker count, same request: identical to the last bit.
        let again = completed(pool.run(&request(10_000, 42)).unwrap());
        assert_eq!(result.statistics, again.statistics);

        means.push((workers, result.statistics));
    }
    // Across worker counts the additive seed rule changes the sample set;
    // the distributions must still agree tightly.
    for (workers, s) in &means {
        assert!(
            (s.mean - BASE).abs() < 10_000.0,
            "W={workers} mean {}",
            s.mean
        );
        assert!(
            (s.std_dev - STDDEV).abs() / STDDEV < 0.05,
            "W={workers} stddev {}",
            s.std_dev
        );
        assert!(
            (s.cte95 - means[0].1.cte95).abs() < 40_000.0,
            "W={workers} cte95 {}",
            s.cte95
        );
    }
}

#[test]
fn copy_transport_matches_shared_transport() {
    let mut shared = pool_with(2, MockBehavior::mean_mode(), |_| {});
    let mut copied = pool_with(2, MockBehavior::mean_mode(), |c| {
        c.force_copy_transport = true
    });
    let a = completed(shared.run(&request(1_000, 5)).unwrap());
    let b = completed(copied.run(&request(1_000, 5)).unwrap());
    assert_eq!(a.statistics, b.statistics);
    assert_eq!(a.distribution.unwrap(), b.distribution.unwrap());
}

#[test]
fn zero_scenarios_is_an_immediate_empty_success() {
    let mut pool = pool_with(4, MockBehavior::mean_mode(), |_| {});
    let result = completed(pool.run(&request(0, 42)).unwrap());
    assert_eq!(result.scenario_count, 0);
    assert_eq!(result.statistics.mean, 0.0);
    assert_eq!(result.distribution, Some(Vec::new()));
}

#[test]
fn one_scenario_with_many_workers() {
    let mut pool = pool_with(4, MockBehavior::mean_mode(), |_| {});
    let result = completed(pool.run(&request(1, 42)).unwrap());
    assert_eq!(result.scenario_count, 1);
    let d = result.distribution.unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(
        d[0].to_bits(),
        (BASE + mock::normal(worker_seed(42, 0), 0) * STDDEV).to_bits()
    );
}

#[test]
fn request_beyond_capacity_is_refused() {
    let mut pool = pool_with(2, MockBehavior::mean_mode(), |_| {});
    // Capacity is 20_000 scenarios.
    let err = pool.run(&request(20_001, 1)).unwrap_err();
    assert!(matches!(
        err,
        PoolError::Bus(cairn_bus::BusError::CapacityExceeded {
            kind: "scenario",
            ..
        })
    ));
}

#[test]
fn run_before_load_is_not_ready() {
    let mut pool = ValuationPool::initialize(
        1,
        PoolCapacities {
            max_policies: 4,
            max_scenarios: 100,
        },
        factory(MockBehavior::mean_mode()),
        RuntimeConfig::default(),
    )
    .unwrap();
    assert!(matches!(
        pool.run(&request(10, 1)),
        Err(PoolError::NotReady)
    ));
}

#[test]
fn transient_engine_failures_are_retried_once_and_succeed() {
    let behavior = MockBehavior::FailFirst {
        base: BASE,
        stddev: STDDEV,
        failures: 1,
    };
    let mut pool = pool_with(2, behavior, |_| {});
    let result = completed(pool.run(&request(200, 42)).unwrap());
    assert_eq!(result.scenario_count, 200);
    assert_eq!(result.distribution.unwrap().len(), 200);
}

#[test]
fn persistent_engine_failure_fails_the_run() {
    let mut pool = pool_with(2, MockBehavior::AlwaysFail, |_| {});
    let err = pool.run(&request(200, 42)).unwrap_err();
    match err {
        PoolError::Engine { source, .. } => {
            assert!(matches!(source, EngineError::ExecutionFailed { .. }));
        }
        other => panic!("expected engine failure, got {other:?}"),
    }
}

#[test]
fn non_finite_engine_output_fails_the_run() {
    let behavior = MockBehavior::PoisonAt {
        base: BASE,
        stddev: STDDEV,
        index: 3,
    };
    let mut pool = pool_with(1, behavior, |_| {});
    let err = pool.run(&request(100, 42)).unwrap_err();
    assert!(matches!(err, PoolError::Numerical { index: 3 }));
}

#[test]
fn cancellation_mid_run_returns_cancelled_without_statistics() {
    let mut config_pool = {
        let mut config = RuntimeConfig::default();
        config.scenario_chunk_size = 1;
        let mut pool = ValuationPool::initialize(
            2,
            PoolCapacities {
                max_policies: 16,
                max_scenarios: 20_000,
            },
            Arc::new(MockFactory {
                behavior: MockBehavior::mean_mode(),
                delay: Some(Duration::from_millis(30)),
            }),
            config,
        )
        .unwrap();
        pool.load_data(&policies(), &assumptions()).unwrap();
        pool
    };

    let cancel = config_pool.cancel_handle();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        cancel.cancel();
    });

    // 40 one-scenario chunks at 30 ms each across 2 workers: ~600 ms of
    // work, cancelled after ~100 ms.
    let outcome = config_pool.run(&request(40, 42)).unwrap();
    canceller.join().unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));
}

#[test]
fn stuck_worker_trips_the_watchdog_and_poisons_the_pool() {
    let mut config = RuntimeConfig::default();
    config.chunk_timeout_ms = 50;
    let mut pool = ValuationPool::initialize(
        1,
        PoolCapacities {
            max_policies: 16,
            max_scenarios: 100,
        },
        Arc::new(MockFactory {
            behavior: MockBehavior::mean_mode(),
            delay: Some(Duration::from_millis(1_000)),
        }),
        config,
    )
    .unwrap();
    pool.load_data(&policies(), &assumptions()).unwrap();

    let err = pool.run(&request(1, 42)).unwrap_err();
    assert!(matches!(
        err,
        PoolError::WorkerTimeout {
            worker: 0,
            deadline_ms: 50,
            ..
        }
    ));

    // The wedged worker poisons the pool for subsequent runs.
    assert!(matches!(
        pool.run(&request(1, 42)),
        Err(PoolError::InitFailed { .. })
    ));
}

#[test]
fn progress_is_published_monotonically_up_to_100() {
    let calls: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);

    let mut pool = pool_with(2, MockBehavior::mean_mode(), |c| {
        c.scenario_chunk_size = 50
    });
    pool.set_progress_callback(Arc::new(move |p| {
        sink.lock().unwrap().push(p);
    }));
    completed(pool.run(&request(2_000, 11)).unwrap());

    let calls = calls.lock().unwrap();
    assert!(!calls.is_empty());
    assert!(calls.windows(2).all(|w| w[0] <= w[1]), "{calls:?}");
    assert_eq!(*calls.last().unwrap(), 100);
}

#[test]
fn failing_engine_factory_fails_initialization() {
    struct BrokenFactory;
    impl EngineFactory for BrokenFactory {
        fn create(&self) -> Result<Box<dyn CalcEngine>, EngineError> {
            Err(EngineError::InitFailed {
                reason: "no kernel available".into(),
            })
        }
    }
    let err = ValuationPool::initialize(
        2,
        PoolCapacities {
            max_policies: 4,
            max_scenarios: 100,
        },
        Arc::new(BrokenFactory),
        RuntimeConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PoolError::InitFailed { .. }));
}

#[test]
fn memory_limit_is_enforced() {
    let mut config = RuntimeConfig::default();
    config.max_memory_bytes = Some(1_024);
    let err = ValuationPool::initialize(
        2,
        PoolCapacities {
            max_policies: 1_000,
            max_scenarios: 10_000,
        },
        factory(MockBehavior::mean_mode()),
        config,
    )
    .unwrap_err();
    assert!(matches!(err, PoolError::MemoryLimit { .. }));
}
