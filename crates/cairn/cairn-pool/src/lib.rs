//! `cairn-pool`: the worker pool and scheduler for valuation runs.
//!
//! The scheduler owns both shared regions (data bus + deque pool), splits a
//! request into seeded scenario chunks, parks the chunks in per-worker
//! deques and releases the workers. Workers drain their own deque LIFO and
//! steal FIFO from random peers when idle; results land in per-worker slabs
//! and are aggregated in worker-index order, which keeps every statistic
//! independent of the steal topology.

pub mod chunking;
pub mod progress;
pub mod stats;
pub mod transport;

mod error;
mod scheduler;
mod worker;

pub use error::PoolError;
pub use scheduler::{CancelHandle, PoolCapacities, RunOutcome, ValuationPool};
