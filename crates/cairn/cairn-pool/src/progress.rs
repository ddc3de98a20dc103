//! Advisory progress reporting.
//!
//! Each worker owns one 32-bit cell and stores an integer percent at task
//! boundaries; the scheduler averages the cells and publishes through the
//! caller's callback. Progress never feeds back into scheduling.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct ProgressBoard {
    cells: Vec<AtomicU32>,
}

impl ProgressBoard {
    pub fn new(workers: u32) -> Self {
        Self {
            cells: (0..workers).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Store worker `w`'s percent, clamped to 100. Heavy stealers can
    /// execute more than their initial assignment; the clamp keeps the
    /// advisory number meaningful.
    pub fn set(&self, w: u32, percent: u32) {
        if let Some(cell) = self.cells.get(w as usize) {
            cell.store(percent.min(100), Ordering::Relaxed);
        }
    }

    /// Mean percent across workers, rounded down.
    pub fn average(&self) -> u8 {
        if self.cells.is_empty() {
            return 0;
        }
        let sum: u64 = self
            .cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed) as u64)
            .sum();
        (sum / self.cells.len() as u64) as u8
    }
}

/// Published to the caller with the averaged percent.
pub type ProgressCallback = dyn Fn(u8) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_rounds_down() {
        let b = ProgressBoard::new(4);
        b.set(0, 100);
        b.set(1, 50);
        b.set(2, 0);
        b.set(3, 0);
        assert_eq!(b.average(), 37);
    }

    #[test]
    fn percent_is_clamped() {
        let b = ProgressBoard::new(1);
        b.set(0, 250);
        assert_eq!(b.average(), 100);
    }

    #[test]
    fn out_of_range_worker_is_ignored() {
        let b = ProgressBoard::new(1);
        b.set(9, 40);
        assert_eq!(b.average(), 0);
    }
}
