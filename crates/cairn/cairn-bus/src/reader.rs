//! The worker-side view: validates the header and reads inputs zero-copy.

use crate::layout::{BusHeader, BusLayout, HEADER_BYTES};
use crate::BusError;
use basalt_mmap::Segment;
use cairn_model::{
    EXPENSE_FIELDS, ExpenseAssumptions, LAPSE_YEARS, MORTALITY_RATES, POLICY_RECORD_BYTES, Policy,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Read view over an attached data region.
///
/// Counts are read through the header, not inferred from slab sizes: a
/// loader that yields fewer rows than the declared maximum leaves trailing
/// slab bytes zero, and those bytes are not policies.
#[derive(Clone)]
pub struct BusReader {
    segment: Arc<Segment>,
    layout: BusLayout,
}

impl BusReader {
    /// Attach to a region, validating magic and version before any read.
    pub fn attach(segment: Arc<Segment>) -> Result<Self, BusError> {
        if segment.len() < HEADER_BYTES {
            return Err(BusError::Truncated {
                required: HEADER_BYTES,
                actual: segment.len(),
            });
        }
        // SAFETY: length checked; the header is read-only from this side.
        let header = unsafe { &*(segment.as_ptr() as *const BusHeader) };
        header.validate().map_err(BusError::from)?;

        let worker_count = header.worker_count;
        let results_off = header.results_off as usize;
        if results_off > segment.len()
            || header.assumptions_off as usize > results_off
            || header.policies_off > header.assumptions_off
        {
            return Err(BusError::Malformed {
                reason: "header offsets exceed the region",
            });
        }
        let results_len = segment.len() - results_off;
        if results_len % worker_count as usize != 0 {
            return Err(BusError::Malformed {
                reason: "results slab is not evenly divisible among workers",
            });
        }
        let result_stride = results_len / worker_count as usize;

        let policies_off = header.policies_off as usize;
        let assumptions_off = header.assumptions_off as usize;
        let max_policies = ((assumptions_off - policies_off) / POLICY_RECORD_BYTES) as u32;

        Ok(Self {
            layout: BusLayout {
                max_policies,
                // The writer's scenario capacity is not on the wire; derive
                // the only bound a reader needs, the per-slab capacity.
                max_scenarios: (result_stride / 8 * worker_count as usize) as u32,
                worker_count,
                policies_off,
                assumptions_off,
                results_off,
                result_stride,
                total_bytes: segment.len(),
            },
            segment,
        })
    }

    fn header(&self) -> &BusHeader {
        // SAFETY: validated at attach.
        unsafe { &*(self.segment.as_ptr() as *const BusHeader) }
    }

    pub fn policy_count(&self) -> u32 {
        self.header().policy_count.load(Ordering::Acquire)
    }

    pub fn scenario_count(&self) -> u32 {
        self.header().scenario_count.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> u32 {
        self.layout.worker_count
    }

    fn f64_slice(&self, offset: usize, len: usize) -> &[f64] {
        debug_assert!(offset % 8 == 0, "f64 view must be 8-byte aligned");
        debug_assert!(offset + len * 8 <= self.segment.len());
        // SAFETY: offsets come from the validated layout, the region is
        // 8-byte aligned at every assumption/result offset, and writes to
        // these spans are sequenced before the barrier release.
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr().add(offset) as *const f64, len) }
    }

    /// The serialized policy records (`policy_count × 32` bytes), for
    /// engines that consume the wire form directly.
    pub fn policy_bytes(&self) -> &[u8] {
        let count = self.policy_count() as usize;
        // SAFETY: count ≤ max_policies enforced by the writer.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.layout.policies_off),
                count * POLICY_RECORD_BYTES,
            )
        }
    }

    /// Decode policy `i`.
    pub fn policy(&self, i: u32) -> Result<Policy, BusError> {
        if i >= self.policy_count() {
            return Err(BusError::Malformed {
                reason: "policy index beyond policy_count",
            });
        }
        let off = i as usize * POLICY_RECORD_BYTES;
        Ok(Policy::decode(&self.policy_bytes()[off..off + POLICY_RECORD_BYTES])?)
    }

    /// Decode every policy row.
    pub fn policies(&self) -> Result<Vec<Policy>, BusError> {
        (0..self.policy_count()).map(|i| self.policy(i)).collect()
    }

    /// All 242 mortality rates, male block then female block.
    pub fn mortality(&self) -> &[f64] {
        self.f64_slice(self.layout.mortality_off(), MORTALITY_RATES)
    }

    /// The 50 annual lapse rates.
    pub fn lapse(&self) -> &[f64] {
        self.f64_slice(self.layout.lapse_off(), LAPSE_YEARS)
    }

    /// The 4 expense values in wire order.
    pub fn expense_values(&self) -> &[f64] {
        self.f64_slice(self.layout.expenses_off(), EXPENSE_FIELDS)
    }

    pub fn expenses(&self) -> ExpenseAssumptions {
        ExpenseAssumptions::from_flat(self.expense_values())
    }

    /// Worker `w`'s result slab.
    pub fn result_slab(&self, w: u32) -> Result<ResultSlab, BusError> {
        if w >= self.layout.worker_count {
            return Err(BusError::WorkerOutOfRange {
                worker: w,
                worker_count: self.layout.worker_count,
            });
        }
        let offset = self.layout.results_off + w as usize * self.layout.result_stride;
        Ok(ResultSlab {
            segment: Arc::clone(&self.segment),
            offset,
            capacity: self.layout.result_stride / 8,
        })
    }
}

/// One worker's exclusive result range.
///
/// Chunk descriptors carve disjoint sub-ranges out of a slab, and the deque
/// protocol delivers each chunk exactly once, so concurrent `write_chunk`
/// calls from different executors never overlap.
#[derive(Clone)]
pub struct ResultSlab {
    segment: Arc<Segment>,
    offset: usize,
    capacity: usize,
}

impl ResultSlab {
    /// Scenario capacity of this slab.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write one chunk's NPVs at its descriptor offset.
    pub fn write_chunk(&self, scenario_offset: u32, npvs: &[f64]) -> Result<(), BusError> {
        let start = scenario_offset as usize;
        if start + npvs.len() > self.capacity {
            return Err(BusError::Malformed {
                reason: "chunk write beyond slab capacity",
            });
        }
        // SAFETY: range checked against the slab; chunk ranges are disjoint
        // by construction (see type docs).
        unsafe {
            let dst = self.segment.as_ptr().add(self.offset + start * 8) as *mut f64;
            std::ptr::copy_nonoverlapping(npvs.as_ptr(), dst, npvs.len());
        }
        Ok(())
    }

    /// The first `count` written scenarios.
    pub fn written(&self, count: usize) -> Result<&[f64], BusError> {
        if count > self.capacity {
            return Err(BusError::Malformed {
                reason: "result count beyond slab capacity",
            });
        }
        // SAFETY: range checked; reads happen only after workers quiesce.
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.offset) as *const f64,
                count,
            )
        })
    }
}
