//! Message-based signaler for environments without a shared region.
//!
//! Each cell is a mutex-guarded state plus a one-shot queue of waiters.
//! A transition drains the queue, handing every waiter the new state over
//! its channel; a waiter whose predicate is not yet satisfied re-registers
//! and keeps receiving until its deadline passes.

use crate::state::NodeState;
use crate::{SignalError, Signaler};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

struct Cell {
    state: NodeState,
    waiters: Vec<Sender<NodeState>>,
}

pub struct ChannelSignaler {
    cells: Vec<Mutex<Cell>>,
}

impl ChannelSignaler {
    pub fn new(cells: usize) -> Self {
        Self {
            cells: (0..cells)
                .map(|_| {
                    Mutex::new(Cell {
                        state: NodeState::Idle,
                        waiters: Vec::new(),
                    })
                })
                .collect(),
        }
    }

    fn cell(&self, node: usize) -> Result<&Mutex<Cell>, SignalError> {
        self.cells.get(node).ok_or(SignalError::OutOfRange {
            node,
            cells: self.cells.len(),
        })
    }

    /// Check the predicate and, if unsatisfied, register a waiter channel in
    /// one critical section so no transition can slip between the two.
    fn check_or_register(
        &self,
        node: usize,
        pred: &dyn Fn(NodeState) -> bool,
    ) -> Result<Result<NodeState, Receiver<NodeState>>, SignalError> {
        let mut cell = self.cell(node)?.lock().unwrap();
        if pred(cell.state) {
            return Ok(Ok(cell.state));
        }
        let (tx, rx) = mpsc::channel();
        cell.waiters.push(tx);
        Ok(Err(rx))
    }
}

impl Signaler for ChannelSignaler {
    fn len(&self) -> usize {
        self.cells.len()
    }

    fn load(&self, node: usize) -> Result<NodeState, SignalError> {
        Ok(self.cell(node)?.lock().unwrap().state)
    }

    fn transition(&self, node: usize, to: NodeState) -> Result<(), SignalError> {
        let mut cell = self.cell(node)?.lock().unwrap();
        if !cell.state.permits(to) {
            return Err(SignalError::InvalidTransition {
                node,
                from: cell.state,
                to,
            });
        }
        cell.state = to;
        // One-shot queue: every registered waiter gets the new state and is
        // dropped; unsatisfied waiters re-register on their next loop turn.
        for waiter in cell.waiters.drain(..) {
            let _ = waiter.send(to);
        }
        Ok(())
    }

    fn wait_for(
        &self,
        node: usize,
        pred: &dyn Fn(NodeState) -> bool,
        timeout: Duration,
    ) -> Result<NodeState, SignalError> {
        let deadline = Instant::now() + timeout;
        loop {
            let rx = match self.check_or_register(node, pred)? {
                Ok(state) => return Ok(state),
                Err(rx) => rx,
            };
            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SignalError::Timeout {
                        node,
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(state) if pred(state) => return Ok(state),
                    // Sender dropped after a one-shot delivery or a reset;
                    // re-register from the top.
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(SignalError::Timeout {
                            node,
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            }
        }
    }

    fn reset(&self) {
        for cell in &self.cells {
            let mut cell = cell.lock().unwrap();
            cell.state = NodeState::Idle;
            cell.waiters.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mirrors_shared_table_semantics() {
        let s = ChannelSignaler::new(2);
        assert_eq!(s.load(0).unwrap(), NodeState::Idle);
        s.transition(0, NodeState::Running).unwrap();
        s.transition(0, NodeState::Complete).unwrap();
        assert!(s.transition(1, NodeState::Complete).is_err());
        assert_eq!(s.load(0).unwrap(), NodeState::Complete);
    }

    #[test]
    fn sticky_error_until_reset() {
        let s = ChannelSignaler::new(1);
        s.transition(0, NodeState::Running).unwrap();
        s.transition(0, NodeState::Error).unwrap();
        assert!(s.transition(0, NodeState::Running).is_err());
        s.reset();
        assert_eq!(s.load(0).unwrap(), NodeState::Idle);
    }

    #[test]
    fn waiter_receives_transition() {
        let s = Arc::new(ChannelSignaler::new(1));
        let waiter = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                s.wait_for(0, &|st| st.is_terminal(), Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        s.transition(0, NodeState::Running).unwrap();
        s.transition(0, NodeState::Complete).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), NodeState::Complete);
    }

    #[test]
    fn waiter_times_out() {
        let s = ChannelSignaler::new(1);
        let err = s
            .wait_for(0, &|st| st.is_terminal(), Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, SignalError::Timeout { .. }));
    }

    #[test]
    fn intermediate_state_does_not_satisfy_waiter() {
        let s = Arc::new(ChannelSignaler::new(1));
        let waiter = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                s.wait_for(0, &|st| st == NodeState::Complete, Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        // Running does not satisfy the predicate; the waiter re-registers.
        s.transition(0, NodeState::Running).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        s.transition(0, NodeState::Complete).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), NodeState::Complete);
    }
}
