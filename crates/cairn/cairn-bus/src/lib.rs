//! `cairn-bus`: the shared data region for valuation runs.
//!
//! The scheduler materializes policies and assumption tables into a single
//! segment through a [`BusWriter`]; every worker attaches a [`BusReader`]
//! over the same segment and reads inputs zero-copy. Results flow back
//! through per-worker slabs inside the same region. Each slab has exactly
//! one writer, so no locking is needed anywhere on the data plane.

mod layout;
mod reader;
mod writer;

pub use layout::{
    ASSUMPTIONS_BYTES, BUS_MAGIC, BUS_VERSION, BusHeader, BusLayout, EXPENSE_BYTES, HEADER_BYTES,
    HeaderIssue, LAPSE_BYTES, MORTALITY_BYTES,
};
pub use reader::{BusReader, ResultSlab};
pub use writer::BusWriter;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{kind} capacity exceeded: requested {requested}, maximum {maximum}")]
    CapacityExceeded {
        kind: &'static str,
        requested: u64,
        maximum: u64,
    },

    #[error("region magic {found:#010x} does not identify a data bus")]
    MagicMismatch { found: u32 },

    #[error("region version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("region is {actual} bytes, layout needs {required}")]
    Truncated { required: usize, actual: usize },

    #[error("malformed region: {reason}")]
    Malformed { reason: &'static str },

    #[error("worker index {worker} out of range ({worker_count} workers)")]
    WorkerOutOfRange { worker: u32, worker_count: u32 },

    #[error("failed to map the data region")]
    Map(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] cairn_model::CodecError),
}

impl From<HeaderIssue> for BusError {
    fn from(issue: HeaderIssue) -> Self {
        match issue {
            HeaderIssue::Magic { found } => BusError::MagicMismatch { found },
            HeaderIssue::Version { found } => BusError::VersionMismatch {
                found,
                expected: BUS_VERSION,
            },
            HeaderIssue::Shape { reason } => BusError::Malformed { reason },
        }
    }
}
