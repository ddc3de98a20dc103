//! `basalt-signal`: atomic node-state cells for producer→consumer handoff.
//!
//! A signal table is a compact array of 32-bit state cells, one per named
//! pipeline node. Producers publish lifecycle transitions; consumers block
//! on an upstream cell until it reaches a terminal state.
//!
//! Two implementations behind one trait:
//!
//! - [`SharedSignalTable`]: cells live in a shared memory region and are
//!   mutated with atomic load/store/compare-exchange; waiters park on a
//!   process-local condvar that is broadcast after every transition.
//! - [`ChannelSignaler`]: the degraded mode for environments without a
//!   shared region. Each cell keeps a one-shot queue of waiters that are
//!   handed the new state through channels. Observable semantics (allowed
//!   transitions, sticky errors, timeouts) are identical; only the zero-copy
//!   property is lost.

mod fallback;
mod state;
mod table;

pub use fallback::ChannelSignaler;
pub use state::NodeState;
pub use table::SharedSignalTable;

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    #[error("node index {node} out of range ({cells} cells)")]
    OutOfRange { node: usize, cells: usize },

    #[error("illegal transition {from:?} -> {to:?} on node {node}")]
    InvalidTransition {
        node: usize,
        from: NodeState,
        to: NodeState,
    },

    #[error("timed out after {waited_ms} ms waiting on node {node}")]
    Timeout { node: usize, waited_ms: u64 },
}

/// The handoff surface shared by the real table and the fallback.
pub trait Signaler: Send + Sync {
    /// Number of cells.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of a cell (acquire load).
    fn load(&self, node: usize) -> Result<NodeState, SignalError>;

    /// Apply a lifecycle transition. The transition is validated against the
    /// allowed set; an ERROR state is sticky until [`Signaler::reset`].
    /// Waiters are notified on success.
    fn transition(&self, node: usize, to: NodeState) -> Result<(), SignalError>;

    /// Block until `pred` holds for the cell's state, or `timeout` elapses.
    /// Returns the state that satisfied the predicate.
    fn wait_for(
        &self,
        node: usize,
        pred: &dyn Fn(NodeState) -> bool,
        timeout: Duration,
    ) -> Result<NodeState, SignalError>;

    /// Reset every cell to IDLE (between runs).
    fn reset(&self);
}
