//! The deque pool region: one deque per worker behind a magic-tagged header.

use crate::deque::{OwnerDeque, RawDeque, ThiefDeque};
use crate::layout::{POOL_MAGIC, PoolHeader, bytes_for_pool, deque_offset};
use basalt_mmap::Segment;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("deque pool region rejected: {reason}")]
    BadRegion { reason: &'static str },

    #[error("region is {actual} bytes, pool needs {required}")]
    Truncated { required: usize, actual: usize },

    #[error("worker index {worker} out of range (pool has {worker_count})")]
    WorkerOutOfRange { worker: u32, worker_count: u32 },
}

/// Handle over the pool region. Cloneable; every view it hands out keeps the
/// backing segment alive through the shared `Arc`.
#[derive(Clone)]
pub struct DequePool {
    segment: Arc<Segment>,
    worker_count: u32,
    capacity: u32,
}

impl DequePool {
    /// Initialize a pool of `worker_count` deques of `capacity` slots each
    /// inside a fresh segment. Writes the header; the segment must be at
    /// least [`bytes_for_pool`] bytes and zero-filled (freshly mapped).
    pub fn create(segment: Arc<Segment>, worker_count: u32, capacity: u32) -> Result<Self, PoolError> {
        if worker_count == 0 {
            return Err(PoolError::BadRegion {
                reason: "worker count must be non-zero",
            });
        }
        if !capacity.is_power_of_two() {
            return Err(PoolError::BadRegion {
                reason: "deque capacity must be a power of two",
            });
        }
        let required = bytes_for_pool(worker_count, capacity);
        if segment.len() < required {
            return Err(PoolError::Truncated {
                required,
                actual: segment.len(),
            });
        }

        // SAFETY: we own the freshly mapped region exclusively here; the
        // header span is in bounds and 4-byte aligned (mmap is page aligned).
        unsafe {
            let h = segment.as_ptr() as *mut PoolHeader;
            std::ptr::write(
                h,
                PoolHeader {
                    magic: POOL_MAGIC,
                    worker_count,
                    deque_capacity: capacity,
                    active_workers: AtomicU32::new(0),
                },
            );
        }

        Ok(Self {
            segment,
            worker_count,
            capacity,
        })
    }

    /// Attach to an existing pool region, validating the header first.
    pub fn attach(segment: Arc<Segment>) -> Result<Self, PoolError> {
        if segment.len() < size_of::<PoolHeader>() {
            return Err(PoolError::Truncated {
                required: size_of::<PoolHeader>(),
                actual: segment.len(),
            });
        }
        // SAFETY: length checked; the header is only read through shared refs.
        let header = unsafe { &*(segment.as_ptr() as *const PoolHeader) };
        header
            .validate()
            .map_err(|reason| PoolError::BadRegion { reason })?;

        let (worker_count, capacity) = (header.worker_count, header.deque_capacity);
        let required = bytes_for_pool(worker_count, capacity);
        if segment.len() < required {
            return Err(PoolError::Truncated {
                required,
                actual: segment.len(),
            });
        }

        Ok(Self {
            segment,
            worker_count,
            capacity,
        })
    }

    #[inline]
    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: validated at create/attach; lives as long as the segment.
        unsafe { &*(self.segment.as_ptr() as *const PoolHeader) }
    }

    fn raw_deque(&self, w: u32) -> Result<RawDeque, PoolError> {
        if w >= self.worker_count {
            return Err(PoolError::WorkerOutOfRange {
                worker: w,
                worker_count: self.worker_count,
            });
        }
        let off = deque_offset(w, self.capacity);
        // SAFETY: offset is within the validated region; capacity checked at
        // create/attach.
        Ok(unsafe { RawDeque::new(self.segment.as_ptr().add(off), self.capacity) })
    }

    /// The owner view of worker `w`'s deque. Exactly one live owner per
    /// deque is the caller's contract; the scheduler hands each worker its
    /// own index.
    pub fn owner(&self, w: u32) -> Result<OwnerDeque, PoolError> {
        Ok(OwnerDeque::from_raw(self.raw_deque(w)?))
    }

    /// A thief view of worker `w`'s deque; any thread may steal through it.
    pub fn thief(&self, w: u32) -> Result<ThiefDeque, PoolError> {
        Ok(ThiefDeque::from_raw(self.raw_deque(w)?))
    }

    /// The live-worker counter.
    pub fn active_workers(&self) -> &AtomicU32 {
        &self.header().active_workers
    }

    /// Reset every deque to empty and arm the live-worker counter.
    /// Only called between runs, while no worker touches the region.
    pub fn reset_for_run(&self) {
        for w in 0..self.worker_count {
            // Index is in range by construction.
            if let Ok(raw) = self.raw_deque(w) {
                raw.reset();
            }
        }
        self.header()
            .active_workers
            .store(self.worker_count, Ordering::Release);
    }

    /// Best-effort check that every deque looks empty. A quiescence hint;
    /// the worker protocol combines it with the live-worker counter.
    pub fn all_empty_hint(&self) -> bool {
        (0..self.worker_count).all(|w| {
            self.thief(w)
                .map(|t| t.is_empty_hint())
                .unwrap_or(true)
        })
    }
}
