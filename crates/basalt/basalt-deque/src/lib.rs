//! `basalt-deque`: work-stealing deques over shared memory.
//!
//! One Chase-Lev deque per worker, all co-located in a single shared region
//! behind a magic-tagged header. The deque moves 32-bit task identifiers
//! only; resolving an identifier to an actual work descriptor is the
//! scheduler's business, which keeps the task word at 4 bytes and the slot
//! array dense.
//!
//! # Core Components
//!
//! - [`DequePool`]: creates or attaches to the pool region, hands out views
//! - [`OwnerDeque`]: the single-producer end (push + LIFO pop)
//! - [`ThiefDeque`]: the stealing end (FIFO CAS-steal), any thread
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ PoolHeader: magic │ workers │ capacity │ active   (16 B)     │
//! │               (padded to one cache line)                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Deque[0]:  bottom │ top │ slots[capacity]                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Deque[1]:  ...                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ownership discipline is expressed in the types: only an [`OwnerDeque`]
//! can push or pop, so an illegal mutation from a thief does not compile
//! rather than being rejected at run time.

mod deque;
mod layout;
mod pool;

pub use deque::{OwnerDeque, PopResult, PushResult, StealResult, TaskId, ThiefDeque};
pub use layout::{POOL_MAGIC, PoolHeader, bytes_for_pool, deque_stride};
pub use pool::{DequePool, PoolError};
