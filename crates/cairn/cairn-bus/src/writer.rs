//! The scheduler-side view: allocates the region and writes inputs.

use crate::layout::{BUS_MAGIC, BUS_VERSION, BusHeader, BusLayout};
use crate::{BusError, reader::BusReader};
use basalt_mmap::Segment;
use cairn_model::{
    AssumptionSet, ExpenseAssumptions, LapseTable, MortalityTable, POLICY_RECORD_BYTES, Policy,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Owns the data region for the lifetime of a pool.
///
/// Writes happen strictly before the run barrier is released, and result
/// slabs are wiped only while all workers are parked, so no field here needs
/// a lock beyond the two atomic header counters.
pub struct BusWriter {
    segment: Arc<Segment>,
    layout: BusLayout,
}

impl BusWriter {
    /// Allocate an anonymous region sized for the stated capacities, zero it
    /// (fresh mappings are zero-filled) and write the header.
    pub fn allocate(
        max_policies: u32,
        max_scenarios: u32,
        worker_count: u32,
    ) -> Result<Self, BusError> {
        let layout = BusLayout::compute(max_policies, max_scenarios, worker_count);
        let segment = Arc::new(Segment::anon(layout.total_bytes)?);
        Ok(Self::init(segment, layout))
    }

    /// Allocate a file-backed region so other processes can attach.
    pub fn allocate_at<P: AsRef<Path>>(
        path: P,
        max_policies: u32,
        max_scenarios: u32,
        worker_count: u32,
    ) -> Result<Self, BusError> {
        let layout = BusLayout::compute(max_policies, max_scenarios, worker_count);
        let segment = Arc::new(Segment::create(path, layout.total_bytes)?);
        Ok(Self::init(segment, layout))
    }

    fn init(segment: Arc<Segment>, layout: BusLayout) -> Self {
        // SAFETY: freshly mapped region owned exclusively here; header span
        // is in bounds and page-aligned.
        unsafe {
            let h = segment.as_ptr() as *mut BusHeader;
            std::ptr::write(
                h,
                BusHeader {
                    magic: BUS_MAGIC,
                    version: BUS_VERSION,
                    policy_count: 0.into(),
                    scenario_count: 0.into(),
                    worker_count: layout.worker_count,
                    policies_off: layout.policies_off as u32,
                    assumptions_off: layout.assumptions_off as u32,
                    results_off: layout.results_off as u32,
                },
            );
        }
        Self { segment, layout }
    }

    pub fn layout(&self) -> &BusLayout {
        &self.layout
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn header(&self) -> &BusHeader {
        // SAFETY: written in `init`; lives as long as the segment.
        unsafe { &*(self.segment.as_ptr() as *const BusHeader) }
    }

    fn write_f64s(&self, offset: usize, values: &[f64]) {
        debug_assert!(offset + values.len() * 8 <= self.segment.len());
        // SAFETY: callers pass offsets from the layout; bounds asserted.
        unsafe {
            let mut p = self.segment.as_ptr().add(offset);
            for v in values {
                std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 8);
                p = p.add(8);
            }
        }
    }

    /// Serialize policies into the slab in order. Fails without touching the
    /// header when the rows exceed the allocated capacity.
    pub fn write_policies(&self, rows: &[Policy]) -> Result<u32, BusError> {
        if rows.len() as u64 > self.layout.max_policies as u64 {
            return Err(BusError::CapacityExceeded {
                kind: "policy",
                requested: rows.len() as u64,
                maximum: self.layout.max_policies as u64,
            });
        }
        let mut record = [0u8; POLICY_RECORD_BYTES];
        for (i, row) in rows.iter().enumerate() {
            row.encode_into(&mut record);
            let off = self.layout.policies_off + i * POLICY_RECORD_BYTES;
            // SAFETY: i < max_policies, so the record stays inside the slab.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    record.as_ptr(),
                    self.segment.as_ptr().add(off),
                    POLICY_RECORD_BYTES,
                );
            }
        }
        let count = rows.len() as u32;
        self.header().policy_count.store(count, Ordering::Release);
        Ok(count)
    }

    pub fn write_mortality(&self, table: &MortalityTable) {
        self.write_f64s(self.layout.mortality_off(), &table.flat());
    }

    pub fn write_lapse(&self, table: &LapseTable) {
        self.write_f64s(self.layout.lapse_off(), &table.annual);
    }

    pub fn write_expenses(&self, expenses: &ExpenseAssumptions) {
        self.write_f64s(self.layout.expenses_off(), &expenses.flat());
    }

    pub fn write_assumptions(&self, set: &AssumptionSet) {
        self.write_mortality(&set.mortality);
        self.write_lapse(&set.lapse);
        self.write_expenses(&set.expenses);
    }

    /// Record the scenario count for the upcoming run.
    pub fn set_scenario_count(&self, n: u32) -> Result<(), BusError> {
        if n > self.layout.max_scenarios {
            return Err(BusError::CapacityExceeded {
                kind: "scenario",
                requested: n as u64,
                maximum: self.layout.max_scenarios as u64,
            });
        }
        self.header().scenario_count.store(n, Ordering::Release);
        Ok(())
    }

    /// Byte offset of worker `w`'s result slab.
    pub fn worker_results_offset(&self, w: u32) -> Result<usize, BusError> {
        if w >= self.layout.worker_count {
            return Err(BusError::WorkerOutOfRange {
                worker: w,
                worker_count: self.layout.worker_count,
            });
        }
        Ok(self.layout.results_off + w as usize * self.layout.result_stride)
    }

    /// Zero all result slabs. Only called between runs while workers are
    /// parked.
    pub fn wipe_results(&self) {
        self.segment.zero_range(
            self.layout.results_off,
            self.layout.worker_count as usize * self.layout.result_stride,
        );
    }

    /// Concatenate per-worker result slices in worker order.
    ///
    /// `counts[w]` is the number of scenarios worker `w`'s slab holds for
    /// this run; the fixed worker order is what makes aggregation
    /// independent of steal topology.
    pub fn read_all_results(&self, counts: &[u32]) -> Result<Vec<f64>, BusError> {
        if counts.len() != self.layout.worker_count as usize {
            return Err(BusError::Malformed {
                reason: "result counts must cover every worker",
            });
        }
        let reader = BusReader::attach(Arc::clone(&self.segment))?;
        let mut out = Vec::with_capacity(counts.iter().map(|&c| c as usize).sum());
        for (w, &count) in counts.iter().enumerate() {
            let slab = reader.result_slab(w as u32)?;
            out.extend_from_slice(slab.written(count as usize)?);
        }
        Ok(out)
    }
}
