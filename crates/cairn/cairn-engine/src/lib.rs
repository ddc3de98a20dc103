//! `cairn-engine`: the pluggable numerical kernel contract.
//!
//! The runtime never knows the valuation math. It hands an engine the
//! loaded policies, the assumption views and a chunk descriptor, and takes
//! back a vector of NPVs. Anything satisfying [`CalcEngine`] plugs in
//! through a registered [`EngineFactory`]; the deterministic [`mock`]
//! engine backs the test suites.

pub mod mock;
mod registry;

pub use registry::{EngineFactory, EngineRegistry};

use cairn_model::{Policy, ScenarioParams};

/// Static facts an engine reports about itself.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub max_policies: u32,
    pub max_scenarios_per_chunk: u32,
    /// Engines that accept the 32-byte wire records get the policies slab
    /// zero-copy; others receive decoded rows.
    pub supports_binary_input: bool,
}

/// Policy input in either representation.
pub enum PolicyInput<'a> {
    Rows(&'a [Policy]),
    /// Serialized 32-byte records, `policy_count × 32` bytes.
    Records(&'a [u8]),
}

/// Borrowed assumption views in wire order.
#[derive(Clone, Copy)]
pub struct AssumptionInput<'a> {
    /// 242 rates: 121 male then 121 female.
    pub mortality: &'a [f64],
    /// 50 annual rates.
    pub lapse: &'a [f64],
    /// acquisition, maintenance, percent-of-premium, claim.
    pub expenses: &'a [f64],
}

/// One chunk invocation.
#[derive(Clone, Copy)]
pub struct ChunkRequest<'a> {
    pub num_scenarios: u32,
    pub seed: u64,
    pub scenario_params: &'a ScenarioParams,
    pub mortality_mult: f64,
    pub lapse_mult: f64,
    pub expense_mult: f64,
}

/// One chunk's output.
#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub npvs: Vec<f64>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("engine initialization failed: {reason}")]
    InitFailed { reason: String },

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("chunk execution failed (code {code})")]
    ExecutionFailed { code: u32, detail: String },

    #[error("chunk execution exceeded {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    #[error("engine {kind} capacity exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded {
        kind: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("no engine registered under '{name}'")]
    Unknown { name: String },
}

/// The calc-engine contract.
///
/// Engines are stateless between `run_chunk` calls and reentrant: the same
/// loaded engine may evaluate any number of chunks in any order, and the
/// NPV stream is a function of `(seed, scenario index)` alone given fixed
/// inputs. Loading and lifecycle take `&mut self`; each worker owns its
/// engine instance exclusively for the worker's lifetime.
pub trait CalcEngine: Send {
    fn initialize(&mut self) -> Result<(), EngineError>;

    fn info(&self) -> EngineInfo;

    /// Returns the number of policies loaded.
    fn load_policies(&mut self, input: PolicyInput<'_>) -> Result<u32, EngineError>;

    fn load_assumptions(&mut self, input: AssumptionInput<'_>) -> Result<(), EngineError>;

    fn clear_policies(&mut self);

    fn run_chunk(&self, req: &ChunkRequest<'_>) -> Result<ChunkOutput, EngineError>;

    fn dispose(&mut self);
}
