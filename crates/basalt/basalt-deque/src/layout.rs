//! Shared memory layout of the deque pool region.
//!
//! The region holds a small header followed by one deque per worker. The
//! header occupies the first cache line so it never shares a line with
//! deque[0], and each deque starts on a cache-line boundary so one worker's
//! `bottom` churn does not invalidate a neighbour's slots.
//!
//! Wire format, little-endian:
//!
//! ```text
//! header:  magic(u32) | worker_count(u32) | deque_capacity(u32) | active_workers(u32)
//! deque:   bottom(i32) | top(i32) | slots[capacity](u32)
//! ```

use std::mem::size_of;
use std::sync::atomic::AtomicU32;

/// Magic number identifying a valid deque pool region.
///
/// ASCII "DQPL" read as a little-endian u32.
pub const POOL_MAGIC: u32 = 0x4C50_5144;

/// Cache line size used for header padding and per-deque alignment.
pub(crate) const CACHE_LINE: usize = 64;

/// Bytes of the bottom/top pair preceding the slot array in each deque.
pub(crate) const DEQUE_CONTROL_BYTES: usize = 8;

/// Header at offset 0 of the pool region. Exactly 16 bytes.
///
/// `active_workers` is the live-worker counter for quiescence detection:
/// reset to the worker count at run start, decremented by each worker on its
/// idle path. Zero with all deques empty means the run is globally quiescent.
#[repr(C)]
pub struct PoolHeader {
    pub magic: u32,
    pub worker_count: u32,
    pub deque_capacity: u32,
    pub active_workers: AtomicU32,
}

impl PoolHeader {
    /// Validates the header against an expected shape.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != POOL_MAGIC {
            return Err("bad magic");
        }
        if self.worker_count == 0 {
            return Err("worker count must be non-zero");
        }
        if !(self.deque_capacity as usize).is_power_of_two() {
            return Err("deque capacity must be a power of two");
        }
        Ok(())
    }
}

/// Byte stride of one deque (control words + slots), rounded up to a whole
/// number of cache lines.
pub fn deque_stride(capacity: u32) -> usize {
    let raw = DEQUE_CONTROL_BYTES + capacity as usize * size_of::<u32>();
    raw.next_multiple_of(CACHE_LINE)
}

/// Total bytes required for a pool region hosting `worker_count` deques of
/// `capacity` slots each.
pub fn bytes_for_pool(worker_count: u32, capacity: u32) -> usize {
    CACHE_LINE + worker_count as usize * deque_stride(capacity)
}

/// Byte offset of worker `w`'s deque within the region.
pub(crate) fn deque_offset(w: u32, capacity: u32) -> usize {
    CACHE_LINE + w as usize * deque_stride(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_16_bytes() {
        assert_eq!(size_of::<PoolHeader>(), 16, "PoolHeader layout changed");
    }

    #[test]
    fn stride_is_cache_line_multiple() {
        for cap in [8u32, 64, 1024, 4096] {
            let s = deque_stride(cap);
            assert_eq!(s % CACHE_LINE, 0);
            assert!(s >= DEQUE_CONTROL_BYTES + cap as usize * 4);
        }
    }

    #[test]
    fn pool_bytes_cover_all_deques() {
        let total = bytes_for_pool(4, 1024);
        assert_eq!(total, CACHE_LINE + 4 * deque_stride(1024));
        assert_eq!(deque_offset(0, 1024), CACHE_LINE);
        assert_eq!(deque_offset(3, 1024), CACHE_LINE + 3 * deque_stride(1024));
    }
}
