//! Signal table over a shared memory span.
//!
//! The cells themselves are `AtomicU32` views into the region, so any party
//! attached to the segment observes the same states. Wait/notify is a
//! process-local condvar broadcast after every successful transition;
//! waiters re-check the atomic cell under the lock, so a missed wakeup
//! cannot strand a waiter beyond its next timeout slice.
//!
//! # Memory Ordering
//!
//! Reads are `Acquire`, writes `Release`, the transition CAS is `AcqRel`;
//! a consumer that observes COMPLETE therefore also observes every byte the
//! producer wrote before transitioning.

use crate::state::NodeState;
use crate::{SignalError, Signaler};
use basalt_mmap::Segment;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct SharedSignalTable {
    segment: Arc<Segment>,
    offset: usize,
    cells: usize,
    /// Lock + condvar pair backing wait/notify. The lock guards no data,
    /// only the sleep/wake protocol.
    wake: Mutex<()>,
    cond: Condvar,
}

impl SharedSignalTable {
    /// Bytes required for `cells` signal cells.
    pub fn bytes_for(cells: usize) -> usize {
        cells * size_of::<u32>()
    }

    /// View `cells` cells starting at `offset` inside the segment.
    /// The span must be 4-byte aligned and in bounds.
    pub fn new(segment: Arc<Segment>, offset: usize, cells: usize) -> Result<Self, SignalError> {
        let end = offset + Self::bytes_for(cells);
        assert!(end <= segment.len(), "signal table span out of bounds");
        assert_eq!(offset % 4, 0, "signal table must be 4-byte aligned");
        Ok(Self {
            segment,
            offset,
            cells,
            wake: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    fn cell(&self, node: usize) -> Result<&AtomicU32, SignalError> {
        if node >= self.cells {
            return Err(SignalError::OutOfRange {
                node,
                cells: self.cells,
            });
        }
        // SAFETY: bounds and alignment established in `new`; the segment is
        // kept alive by the Arc.
        Ok(unsafe { &*(self.segment.as_ptr().add(self.offset + node * 4) as *const AtomicU32) })
    }

    fn state_of(cell: &AtomicU32) -> NodeState {
        // Cells are only ever written with valid tags; a corrupt value reads
        // as Error so the run fails loudly instead of hanging.
        NodeState::from_u32(cell.load(Ordering::Acquire)).unwrap_or(NodeState::Error)
    }
}

impl Signaler for SharedSignalTable {
    fn len(&self) -> usize {
        self.cells
    }

    fn load(&self, node: usize) -> Result<NodeState, SignalError> {
        Ok(Self::state_of(self.cell(node)?))
    }

    fn transition(&self, node: usize, to: NodeState) -> Result<(), SignalError> {
        let cell = self.cell(node)?;
        loop {
            let cur = Self::state_of(cell);
            if !cur.permits(to) {
                return Err(SignalError::InvalidTransition {
                    node,
                    from: cur,
                    to,
                });
            }
            if cell
                .compare_exchange(cur as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Hold the lock across the broadcast so a waiter between its
                // predicate check and its sleep cannot miss the wakeup.
                let _g = self.wake.lock().unwrap();
                self.cond.notify_all();
                return Ok(());
            }
        }
    }

    fn wait_for(
        &self,
        node: usize,
        pred: &dyn Fn(NodeState) -> bool,
        timeout: Duration,
    ) -> Result<NodeState, SignalError> {
        let cell = self.cell(node)?;
        let deadline = Instant::now() + timeout;
        let mut guard = self.wake.lock().unwrap();
        loop {
            let state = Self::state_of(cell);
            if pred(state) {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SignalError::Timeout {
                    node,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let (g, _res) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    fn reset(&self) {
        for node in 0..self.cells {
            if let Ok(cell) = self.cell(node) {
                cell.store(NodeState::Idle as u32, Ordering::Release);
            }
        }
        let _g = self.wake.lock().unwrap();
        self.cond.notify_all();
    }
}
