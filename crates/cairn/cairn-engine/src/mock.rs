//! Deterministic mock engine backing the test suites.
//!
//! In mean mode the NPV stream is
//! `npv(seed, i) = base + (2 - mortality_mult) * normal(seed, i) * stddev`
//! where `normal(seed, i)` is a standard normal deviate derived from the
//! pair alone; no generator state crosses scenario boundaries, so any
//! chunking of the same `(seed, index)` pairs reproduces the same values
//! bit for bit. The mixing is splitmix64 over the pair, Box-Muller for the
//! deviate.
//!
//! Failure behaviors exist to exercise the scheduler's retry and
//! escalation paths.

use crate::{
    AssumptionInput, CalcEngine, ChunkOutput, ChunkRequest, EngineError, EngineInfo, PolicyInput,
};
use cairn_model::POLICY_RECORD_BYTES;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// How the mock behaves per `run_chunk` call.
#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    /// Produce the deterministic normal stream around `base`.
    Mean { base: f64, stddev: f64 },
    /// Fail the first `failures` invocations on this instance, then behave
    /// like `Mean`. One instance lives per worker, so `failures = 1` makes
    /// every worker's first chunk fail once.
    FailFirst { base: f64, stddev: f64, failures: u32 },
    /// Every invocation fails.
    AlwaysFail,
    /// Produce a NaN at the given scenario index of every chunk.
    PoisonAt { base: f64, stddev: f64, index: u32 },
}

impl MockBehavior {
    /// The canonical mean-mode parameters used across the suites.
    pub fn mean_mode() -> Self {
        MockBehavior::Mean {
            base: 1_000_000.0,
            stddev: 100_000.0,
        }
    }
}

pub struct MockEngine {
    behavior: MockBehavior,
    initialized: bool,
    policy_count: u32,
    assumptions_loaded: bool,
    /// Invocations failed so far (FailFirst bookkeeping); atomic because
    /// `run_chunk` takes `&self`.
    failed: AtomicU32,
    /// Artificial per-chunk latency so cancellation and watchdog tests have
    /// a window to act in.
    chunk_delay: Option<Duration>,
}

impl MockEngine {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            initialized: false,
            policy_count: 0,
            assumptions_loaded: false,
            failed: AtomicU32::new(0),
            chunk_delay: None,
        }
    }

    pub fn with_delay(behavior: MockBehavior, delay: Duration) -> Self {
        let mut e = Self::new(behavior);
        e.chunk_delay = Some(delay);
        e
    }

    fn base_stddev(&self) -> Option<(f64, f64)> {
        match self.behavior {
            MockBehavior::Mean { base, stddev }
            | MockBehavior::FailFirst { base, stddev, .. }
            | MockBehavior::PoisonAt { base, stddev, .. } => Some((base, stddev)),
            MockBehavior::AlwaysFail => None,
        }
    }
}

/// splitmix64 finalizer.
#[inline]
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// A uniform in (0, 1) from 53 mantissa bits, nudged off zero so the log in
/// Box-Muller stays finite.
#[inline]
fn unit_open(x: u64) -> f64 {
    ((x >> 11) as f64 + 0.5) * (1.0 / 9_007_199_254_740_992.0)
}

/// Standard normal deviate as a pure function of `(seed, index)`.
pub fn normal(seed: u64, index: u64) -> f64 {
    let a = mix64(seed ^ mix64(index));
    let b = mix64(a);
    let u1 = unit_open(a);
    let u2 = unit_open(b);
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

impl CalcEngine for MockEngine {
    fn initialize(&mut self) -> Result<(), EngineError> {
        self.initialized = true;
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "mock-calc",
            version: "1.0.0",
            max_policies: 1_000_000,
            max_scenarios_per_chunk: 1_000_000,
            supports_binary_input: true,
        }
    }

    fn load_policies(&mut self, input: PolicyInput<'_>) -> Result<u32, EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        self.policy_count = match input {
            PolicyInput::Rows(rows) => rows.len() as u32,
            PolicyInput::Records(bytes) => (bytes.len() / POLICY_RECORD_BYTES) as u32,
        };
        Ok(self.policy_count)
    }

    fn load_assumptions(&mut self, _input: AssumptionInput<'_>) -> Result<(), EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        self.assumptions_loaded = true;
        Ok(())
    }

    fn clear_policies(&mut self) {
        self.policy_count = 0;
    }

    fn run_chunk(&self, req: &ChunkRequest<'_>) -> Result<ChunkOutput, EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        let started = Instant::now();
        if let Some(delay) = self.chunk_delay {
            std::thread::sleep(delay);
        }

        match self.behavior {
            MockBehavior::AlwaysFail => {
                return Err(EngineError::ExecutionFailed {
                    code: 500,
                    detail: "configured to fail".into(),
                });
            }
            MockBehavior::FailFirst { failures, .. } => {
                let prior = self.failed.fetch_add(1, Ordering::AcqRel);
                if prior < failures {
                    return Err(EngineError::ExecutionFailed {
                        code: 503,
                        detail: format!("transient failure {}", prior + 1),
                    });
                }
            }
            _ => {}
        }

        let (base, stddev) = self
            .base_stddev()
            .expect("failing behaviors returned above");
        let scale = 2.0 - req.mortality_mult;
        let mut npvs = Vec::with_capacity(req.num_scenarios as usize);
        for i in 0..req.num_scenarios as u64 {
            npvs.push(base + scale * normal(req.seed, i) * stddev);
        }

        if let MockBehavior::PoisonAt { index, .. } = self.behavior {
            if let Some(v) = npvs.get_mut(index as usize) {
                *v = f64::NAN;
            }
        }

        Ok(ChunkOutput {
            npvs,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn dispose(&mut self) {
        self.initialized = false;
        self.policy_count = 0;
        self.assumptions_loaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_model::ScenarioParams;

    fn params() -> ScenarioParams {
        ScenarioParams {
            initial_rate: 0.03,
            drift: 0.0,
            volatility: 0.01,
            min_rate: 0.0,
            max_rate: 0.2,
        }
    }

    fn chunk(seed: u64, n: u32, p: &ScenarioParams) -> ChunkRequest<'_> {
        ChunkRequest {
            num_scenarios: n,
            seed,
            scenario_params: p,
            mortality_mult: 1.0,
            lapse_mult: 1.0,
            expense_mult: 1.0,
        }
    }

    #[test]
    fn normal_is_a_pure_function_of_the_pair() {
        assert_eq!(normal(42, 7).to_bits(), normal(42, 7).to_bits());
        assert_ne!(normal(42, 7).to_bits(), normal(42, 8).to_bits());
        assert_ne!(normal(42, 7).to_bits(), normal(43, 7).to_bits());
    }

    #[test]
    fn mean_mode_matches_its_parameters() {
        let mut engine = MockEngine::new(MockBehavior::mean_mode());
        engine.initialize().unwrap();
        let p = params();
        let out = engine.run_chunk(&chunk(42, 50_000, &p)).unwrap();

        let n = out.npvs.len() as f64;
        let mean = out.npvs.iter().sum::<f64>() / n;
        let var = out.npvs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        assert!((mean - 1_000_000.0).abs() / 1_000_000.0 < 0.05, "mean {mean}");
        assert!(
            (var.sqrt() - 100_000.0).abs() / 100_000.0 < 0.20,
            "stddev {}",
            var.sqrt()
        );
    }

    #[test]
    fn identical_chunks_reproduce_bitwise() {
        let mut engine = MockEngine::new(MockBehavior::mean_mode());
        engine.initialize().unwrap();
        let p = params();
        let a = engine.run_chunk(&chunk(7, 100, &p)).unwrap();
        let b = engine.run_chunk(&chunk(7, 100, &p)).unwrap();
        for (x, y) in a.npvs.iter().zip(&b.npvs) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn mortality_mult_widens_the_spread() {
        let mut engine = MockEngine::new(MockBehavior::mean_mode());
        engine.initialize().unwrap();
        let p = params();
        let narrow = engine.run_chunk(&chunk(1, 10, &p)).unwrap();
        let wide = engine
            .run_chunk(&ChunkRequest {
                mortality_mult: 0.5,
                ..chunk(1, 10, &p)
            })
            .unwrap();
        // scale goes from 1.0 to 1.5 around the same base.
        for (n, w) in narrow.npvs.iter().zip(&wide.npvs) {
            let dn = n - 1_000_000.0;
            let dw = w - 1_000_000.0;
            assert!((dw - 1.5 * dn).abs() < 1e-6 * dn.abs().max(1.0));
        }
    }

    #[test]
    fn fail_first_recovers_on_retry() {
        let mut engine = MockEngine::new(MockBehavior::FailFirst {
            base: 1_000_000.0,
            stddev: 100_000.0,
            failures: 1,
        });
        engine.initialize().unwrap();
        let p = params();
        assert!(engine.run_chunk(&chunk(1, 10, &p)).is_err());
        assert!(engine.run_chunk(&chunk(1, 10, &p)).is_ok());
    }

    #[test]
    fn uninitialized_engine_refuses_work() {
        let engine = MockEngine::new(MockBehavior::mean_mode());
        let p = params();
        assert!(matches!(
            engine.run_chunk(&chunk(1, 1, &p)),
            Err(EngineError::NotInitialized)
        ));
    }
}
