//! `cairn-model`: domain types shared across the valuation runtime.
//!
//! Everything that crosses the shared-memory bus or the request/result
//! surface lives here: the 32-byte policy record, the fixed-size assumption
//! tables, scenario parameters, chunk descriptors, and the statistics shape
//! returned to callers.

pub mod assumptions;
pub mod chunk;
pub mod policy;
pub mod request;

pub use assumptions::{
    AssumptionSet, EXPENSE_FIELDS, ExpenseAssumptions, LAPSE_YEARS, LapseTable, MORTALITY_AGES,
    MORTALITY_RATES, MortalityTable,
};
pub use chunk::ChunkDescriptor;
pub use policy::{CodecError, Gender, POLICY_RECORD_BYTES, Policy, ProductType};
pub use request::{RunRequest, RunResult, ScenarioParams, Statistics};
