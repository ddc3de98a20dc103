//! Pipeline nodes and the context their work units run against.

use crate::error::{PipelineError, WorkError};
use crate::resource::{AllocatedBlock, OffsetMap, ResourceSpec};
use basalt_integrity::IntegrityChecker;
use basalt_mmap::Segment;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

/// A node's work unit. Runs on an orchestrator thread with exclusive access
/// to the node's declared outputs for the duration of the call.
pub type WorkUnit = Box<dyn Fn(&mut NodeCtx<'_>) -> Result<(), WorkError> + Send + Sync>;

/// One pipeline stage.
pub struct PipelineNode {
    pub id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub work: WorkUnit,
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, inputs: &[&str], outputs: &[&str], work: WorkUnit) -> Self {
        Self {
            id: id.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            work,
        }
    }
}

/// Topological order over the nodes induced by producer→consumer edges,
/// ties broken lexicographically by node id.
pub(crate) fn topo_order(
    nodes: &BTreeMap<String, PipelineNode>,
    resources: &[ResourceSpec],
) -> Result<Vec<String>, PipelineError> {
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();

    for spec in resources {
        if !nodes.contains_key(&spec.producer) {
            continue;
        }
        for consumer in &spec.consumers {
            if !nodes.contains_key(consumer) || consumer == &spec.producer {
                continue;
            }
            dependents
                .entry(spec.producer.as_str())
                .or_default()
                .push(consumer.as_str());
            *in_degree.get_mut(consumer.as_str()).expect("known node") += 1;
        }
    }

    // Kahn over a sorted ready set: the minimum id always leaves first.
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        for &dep in dependents.get(next).map(Vec::as_slice).unwrap_or(&[]) {
            let d = in_degree.get_mut(dep).expect("known node");
            *d -= 1;
            if *d == 0 {
                ready.insert(dep);
            }
        }
    }

    if order.len() != nodes.len() {
        let remaining: Vec<String> = in_degree
            .iter()
            .filter(|&(_, &d)| d > 0)
            .map(|(&id, _)| id.to_string())
            .collect();
        return Err(PipelineError::CyclicDependency { nodes: remaining });
    }
    Ok(order)
}

/// What a work unit sees: its declared blocks, plus explicit checksum
/// publish/verify. Undeclared access is rejected, which keeps the declared
/// DAG the actual dataflow.
pub struct NodeCtx<'run> {
    pub(crate) node: &'run str,
    pub(crate) inputs: &'run [String],
    pub(crate) outputs: &'run [String],
    pub(crate) segment: &'run Arc<Segment>,
    pub(crate) map: &'run OffsetMap,
    pub(crate) checker: &'run IntegrityChecker,
    /// Outputs the unit has already checksummed; the orchestrator computes
    /// checksums for the rest after the unit returns.
    pub(crate) published: &'run Mutex<HashSet<String>>,
}

impl<'run> NodeCtx<'run> {
    pub fn node_id(&self) -> &str {
        self.node
    }

    fn declared(&self, name: &str, list: &[String], direction: &'static str) -> Result<(), PipelineError> {
        if list.iter().any(|n| n == name) {
            Ok(())
        } else {
            Err(PipelineError::UndeclaredAccess {
                node: self.node.to_string(),
                name: name.to_string(),
                direction,
            })
        }
    }

    pub(crate) fn block_bytes(&self, block: &AllocatedBlock) -> &'run [u8] {
        // SAFETY: block spans come from the validated offset map and the
        // segment outlives the run scope.
        unsafe {
            std::slice::from_raw_parts(self.segment.as_ptr().add(block.offset), block.len)
        }
    }

    /// Read view of a declared input block.
    pub fn input(&self, name: &str) -> Result<&'run [u8], PipelineError> {
        self.declared(name, self.inputs, "an input")?;
        Ok(self.block_bytes(self.map.block(name)?))
    }

    /// Read view of a declared f64 input block.
    pub fn input_f64(&self, name: &str) -> Result<&'run [f64], PipelineError> {
        let bytes = self.input(name)?;
        // Blocks are 16-byte aligned, so the f64 view is always valid.
        Ok(unsafe {
            std::slice::from_raw_parts(bytes.as_ptr() as *const f64, bytes.len() / 8)
        })
    }

    /// Write view of a declared output block. Exclusive during the unit:
    /// the orchestrator never runs two units over the same output, because
    /// a block has exactly one producer.
    pub fn output_mut(&mut self, name: &str) -> Result<&'run mut [u8], PipelineError> {
        self.declared(name, self.outputs, "an output")?;
        let block = self.map.block(name)?;
        // SAFETY: span from the validated map; single-producer exclusivity
        // per the type docs.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.segment.as_ptr().add(block.offset), block.len)
        })
    }

    /// Write view of a declared f64 output block.
    pub fn output_f64_mut(&mut self, name: &str) -> Result<&'run mut [f64], PipelineError> {
        let bytes = self.output_mut(name)?;
        Ok(unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f64, bytes.len() / 8)
        })
    }

    fn checksum_slot(&self, block: &AllocatedBlock) -> Option<&'run AtomicU32> {
        block.checksum_slot.map(|off| {
            // SAFETY: slot offsets are 4-aligned inside the checksum region.
            unsafe { &*(self.segment.as_ptr().add(off) as *const AtomicU32) }
        })
    }

    /// Record the checksum of a produced output. Idempotent per run; the
    /// orchestrator auto-publishes any output the unit did not.
    pub fn publish(&self, name: &str) -> Result<u32, PipelineError> {
        self.declared(name, self.outputs, "an output")?;
        let block = self.map.block(name)?;
        let crc = self
            .checker
            .compute(name, self.node, self.block_bytes(block), self.checksum_slot(block));
        self.published.lock().unwrap().insert(name.to_string());
        Ok(crc)
    }

    /// Verify an input against its recorded checksum. A mismatch names the
    /// last producer as the culprit and this node as the consumer.
    pub fn verify(&self, name: &str) -> Result<(), PipelineError> {
        self.declared(name, self.inputs, "an input")?;
        let block = self.map.block(name)?;
        let v = self.checker.verify(name, self.block_bytes(block));
        if v.valid {
            return Ok(());
        }
        Err(PipelineError::IntegrityCheckFailed {
            resource: name.to_string(),
            expected: v.expected.unwrap_or(0),
            actual: v.actual.unwrap_or(0),
            culprit: v.culprit.unwrap_or_default(),
            consumer: self.node.to_string(),
        })
    }
}
