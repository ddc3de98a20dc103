//! Scenario partitioning and the chunk descriptor table.
//!
//! The deques move 32-bit task ids; each id indexes this table. A chunk
//! stays tied to its home worker's result slab no matter who executes it.

use basalt_deque::TaskId;
use cairn_model::ChunkDescriptor;
use std::sync::atomic::{AtomicBool, Ordering};

/// Split `n` scenarios over `workers`: the first `n mod workers` workers
/// take one extra scenario.
pub fn split_evenly(n: u32, workers: u32) -> Vec<u32> {
    assert!(workers > 0);
    let base = n / workers;
    let extra = n % workers;
    (0..workers)
        .map(|w| base + u32::from(w < extra))
        .collect()
}

/// Per-worker seed: additive over the base seed, bit-reproducible run to
/// run for a fixed worker count.
pub fn worker_seed(base_seed: u64, worker: u32) -> u64 {
    base_seed.wrapping_add(worker as u64)
}

/// Sub-chunk seed: a deterministic function of the worker seed and the
/// sub-chunk index. Index zero keeps the worker seed itself.
pub fn sub_chunk_seed(worker_seed: u64, sub_index: u32) -> u64 {
    worker_seed ^ (sub_index as u64).rotate_left(17)
}

/// One table row.
pub struct ChunkEntry {
    pub desc: ChunkDescriptor,
    /// The worker whose slab receives this chunk's NPVs.
    pub home_worker: u32,
    /// Set on the first failure; a second failure escalates.
    retried: AtomicBool,
}

impl ChunkEntry {
    /// Claims the single retry. True exactly once.
    pub fn claim_retry(&self) -> bool {
        !self.retried.swap(true, Ordering::AcqRel)
    }

    pub fn was_retried(&self) -> bool {
        self.retried.load(Ordering::Acquire)
    }
}

/// Immutable-per-run table of chunk descriptors, plus the initial
/// per-worker assignment.
pub struct ChunkTable {
    entries: Vec<ChunkEntry>,
    assigned: Vec<Vec<TaskId>>,
    counts: Vec<u32>,
}

impl ChunkTable {
    /// Partition `n` scenarios into per-worker chunks of at most
    /// `max_chunk` scenarios each.
    pub fn build(n: u32, workers: u32, base_seed: u64, max_chunk: u32) -> Self {
        assert!(max_chunk > 0);
        let counts = split_evenly(n, workers);
        let mut entries = Vec::new();
        let mut assigned: Vec<Vec<TaskId>> = vec![Vec::new(); workers as usize];

        for (w, &count) in counts.iter().enumerate() {
            let ws = worker_seed(base_seed, w as u32);
            let mut offset = 0u32;
            let mut sub = 0u32;
            while offset < count {
                let scenario_count = max_chunk.min(count - offset);
                let id = entries.len() as TaskId;
                entries.push(ChunkEntry {
                    desc: ChunkDescriptor {
                        seed: sub_chunk_seed(ws, sub),
                        scenario_count,
                        result_offset: offset,
                    },
                    home_worker: w as u32,
                    retried: AtomicBool::new(false),
                });
                assigned[w].push(id);
                offset += scenario_count;
                sub += 1;
            }
        }

        Self {
            entries,
            assigned,
            counts,
        }
    }

    pub fn entry(&self, id: TaskId) -> &ChunkEntry {
        &self.entries[id as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Task ids initially assigned to worker `w`, in sub-chunk order.
    pub fn assigned(&self, w: u32) -> &[TaskId] {
        &self.assigned[w as usize]
    }

    /// Scenario count each worker's slab will hold after the run.
    pub fn per_worker_counts(&self) -> &[u32] {
        &self.counts
    }
}
