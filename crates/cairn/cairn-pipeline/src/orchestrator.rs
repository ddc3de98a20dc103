//! The pipeline orchestrator.
//!
//! Nodes run on scoped threads, one per node, gated purely by the signal
//! table: a consumer blocks until every producer's cell reaches a terminal
//! state, so execution order is exactly the declared DAG. Checksums are
//! verified before a node consumes an input and recorded after it produces
//! an output; a failed node's cell goes ERROR (sticky), which is also how
//! skips propagate to dependents without waiting out their edge timeouts.

use crate::error::PipelineError;
use crate::node::{NodeCtx, PipelineNode, topo_order};
use crate::report::{NodeOutcome, NodeReport, NodeTiming, PipelineReport};
use crate::resource::{ElementType, OffsetMap, ResourceSpec};
use basalt_integrity::IntegrityChecker;
use basalt_mmap::Segment;
use basalt_signal::{ChannelSignaler, NodeState, SharedSignalTable, SignalError, Signaler};
use cairn_config::RuntimeConfig;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What happens to the rest of the pipeline when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort every node that has not started yet.
    FailFast,
    /// Skip dependents of the failed node; independent branches continue.
    ContinueOnError,
}

struct Allocation {
    segment: Arc<Segment>,
    map: OffsetMap,
    signals: Arc<dyn Signaler>,
    checker: Arc<IntegrityChecker>,
}

pub struct Orchestrator {
    config: RuntimeConfig,
    policy: FailurePolicy,
    resources: Vec<ResourceSpec>,
    nodes: BTreeMap<String, PipelineNode>,
    alloc: Option<Allocation>,
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig, policy: FailurePolicy) -> Self {
        Self {
            config,
            policy,
            resources: Vec::new(),
            nodes: BTreeMap::new(),
            alloc: None,
        }
    }

    /// Declare a bus resource. Must precede [`Orchestrator::allocate`].
    pub fn add_resource(
        &mut self,
        name: &str,
        size_bytes: usize,
        element_type: ElementType,
        producer: &str,
        consumers: &[&str],
    ) -> Result<(), PipelineError> {
        if self.alloc.is_some() {
            return Err(PipelineError::AlreadyAllocated);
        }
        let spec = ResourceSpec {
            name: name.to_string(),
            size_bytes,
            element_type,
            producer: producer.to_string(),
            consumers: consumers.iter().map(|c| c.to_string()).collect(),
        };
        spec.validate()?;
        if self.resources.iter().any(|r| r.name == spec.name) {
            return Err(PipelineError::DuplicateResource { name: spec.name });
        }
        self.resources.push(spec);
        Ok(())
    }

    /// Declare a node. Must precede [`Orchestrator::allocate`].
    pub fn add_node(&mut self, node: PipelineNode) -> Result<(), PipelineError> {
        if self.alloc.is_some() {
            return Err(PipelineError::AlreadyAllocated);
        }
        if self.nodes.contains_key(&node.id) {
            return Err(PipelineError::DuplicateNode { node: node.id });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Compute the offset map, reserve the segment, and wire the signal
    /// table and integrity checker. The map is immutable afterwards.
    pub fn allocate(&mut self) -> Result<(), PipelineError> {
        if self.alloc.is_some() {
            return Err(PipelineError::AlreadyAllocated);
        }

        // Wiring must be closed: every declared party is a known node and
        // every node access matches a declaration.
        for spec in &self.resources {
            if !self.nodes.contains_key(&spec.producer) {
                return Err(PipelineError::UnknownNode {
                    name: spec.name.clone(),
                    node: spec.producer.clone(),
                });
            }
            for consumer in &spec.consumers {
                if !self.nodes.contains_key(consumer) {
                    return Err(PipelineError::UnknownNode {
                        name: spec.name.clone(),
                        node: consumer.clone(),
                    });
                }
            }
        }
        for node in self.nodes.values() {
            for output in &node.outputs {
                let ok = self
                    .resources
                    .iter()
                    .any(|r| &r.name == output && r.producer == node.id);
                if !ok {
                    return Err(PipelineError::UndeclaredAccess {
                        node: node.id.clone(),
                        name: output.clone(),
                        direction: "an output",
                    });
                }
            }
            for input in &node.inputs {
                let ok = self
                    .resources
                    .iter()
                    .any(|r| &r.name == input && r.consumers.contains(&node.id));
                if !ok {
                    return Err(PipelineError::UndeclaredAccess {
                        node: node.id.clone(),
                        name: input.clone(),
                        direction: "an input",
                    });
                }
            }
        }

        let node_ids: Vec<String> = self.nodes.keys().cloned().collect();
        let map = OffsetMap::compute(&node_ids, &self.resources, self.config.integrity_checks);
        if let Some(limit) = self.config.max_memory_bytes {
            if map.total_bytes as u64 > limit {
                return Err(PipelineError::CapacityExceeded {
                    required: map.total_bytes as u64,
                    limit,
                });
            }
        }

        let segment = Arc::new(Segment::anon(map.total_bytes.max(16)).map_err(|e| {
            PipelineError::AllocationFailed {
                reason: e.to_string(),
            }
        })?);

        // The fallback toggle swaps the shared signal table for the
        // message-based signaler; observable semantics are identical.
        let signals: Arc<dyn Signaler> = if self.config.force_copy_transport {
            Arc::new(ChannelSignaler::new(map.node_count()))
        } else {
            Arc::new(SharedSignalTable::new(
                Arc::clone(&segment),
                map.status_offset,
                map.node_count(),
            )?)
        };
        let checker = Arc::new(IntegrityChecker::new(self.config.integrity_checks));

        debug!(
            nodes = map.node_count(),
            blocks = map.blocks().len(),
            bytes = map.total_bytes,
            "pipeline allocated"
        );

        self.alloc = Some(Allocation {
            segment,
            map,
            signals,
            checker,
        });
        Ok(())
    }

    pub fn offset_map(&self) -> Result<&OffsetMap, PipelineError> {
        Ok(&self.alloc.as_ref().ok_or(PipelineError::NotAllocated)?.map)
    }

    /// Execute the pipeline once. Node failures land in the report;
    /// `Err` is reserved for structural problems (no allocation, cycles).
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let alloc = self.alloc.as_ref().ok_or(PipelineError::NotAllocated)?;
        let order = topo_order(&self.nodes, &self.resources)?;

        alloc.signals.reset();
        alloc.checker.clear();
        let published: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let abort = AtomicBool::new(false);
        let reports: Mutex<BTreeMap<String, NodeReport>> = Mutex::new(BTreeMap::new());
        let started = Instant::now();

        std::thread::scope(|scope| {
            for id in &order {
                let node = self.nodes.get(id.as_str()).expect("ordered node exists");
                let published = &published;
                let abort = &abort;
                let reports = &reports;
                scope.spawn(move || {
                    let report = self.run_node(node, alloc, published, abort);
                    reports.lock().unwrap().insert(report.id.clone(), report);
                });
            }
        });

        let mut by_id = reports.into_inner().unwrap();
        let nodes: Vec<NodeReport> = order
            .iter()
            .map(|id| by_id.remove(id).expect("every node reports"))
            .collect();
        let success = nodes.iter().all(|n| n.outcome != NodeOutcome::Failed);
        let report = PipelineReport {
            success,
            nodes,
            total: started.elapsed(),
        };
        info!(
            success = report.success,
            completed = report.completed().len(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            "pipeline run finished"
        );
        Ok(report)
    }

    fn run_node(
        &self,
        node: &PipelineNode,
        alloc: &Allocation,
        published: &Mutex<HashSet<String>>,
        abort: &AtomicBool,
    ) -> NodeReport {
        let signals = &*alloc.signals;
        let cell = alloc
            .map
            .node_cell(&node.id)
            .expect("allocation covers every node");
        let fail_fast = self.policy == FailurePolicy::FailFast;
        let edge_timeout = Duration::from_millis(self.config.handoff_timeout_ms);
        let node_start = Instant::now();
        let mut timing = NodeTiming::default();

        // Wait phase: block on each input's producer cell.
        let wait_start = Instant::now();
        let mut upstream_error: Option<PipelineError> = None;
        let mut skip = false;
        for input in &node.inputs {
            let producer = &self
                .resources
                .iter()
                .find(|r| &r.name == input)
                .expect("allocation validated inputs")
                .producer;
            if producer == &node.id {
                continue;
            }
            let pcell = alloc.map.node_cell(producer).expect("validated producer");
            if signals
                .load(pcell)
                .is_ok_and(|s| s == NodeState::Complete)
            {
                continue;
            }
            // Record that this node is parked on an upstream producer.
            if matches!(signals.load(cell), Ok(NodeState::Idle)) {
                let _ = signals.transition(cell, NodeState::Waiting);
            }
            match wait_terminal(signals, pcell, edge_timeout, abort) {
                WaitOutcome::Complete => {}
                WaitOutcome::UpstreamFailed => {
                    if fail_fast {
                        upstream_error = Some(PipelineError::UpstreamError {
                            node: node.id.clone(),
                            producer: producer.clone(),
                        });
                    } else {
                        skip = true;
                    }
                    break;
                }
                WaitOutcome::Aborted => {
                    skip = true;
                    break;
                }
                WaitOutcome::TimedOut => {
                    upstream_error = Some(PipelineError::UpstreamTimeout {
                        node: node.id.clone(),
                        producer: producer.clone(),
                        waited_ms: edge_timeout.as_millis() as u64,
                    });
                    break;
                }
            }
        }
        timing.wait = wait_start.elapsed();

        if abort.load(Ordering::Acquire) && upstream_error.is_none() {
            skip = true;
        }

        if skip {
            // Sticky ERROR propagates the skip to dependents immediately
            // instead of letting them wait out their edge timeouts.
            mark_error(signals, cell);
            timing.total = node_start.elapsed();
            return NodeReport {
                id: node.id.clone(),
                outcome: NodeOutcome::Skipped,
                timing,
                error: None,
            };
        }
        if let Some(error) = upstream_error {
            return self.fail_node(node, signals, cell, timing, node_start, error, abort);
        }

        if let Err(e) = transition_running(signals, cell) {
            return self.fail_node(node, signals, cell, timing, node_start, e.into(), abort);
        }

        // Init phase: verify every input before consuming it.
        let init_start = Instant::now();
        let mut ctx = NodeCtx {
            node: &node.id,
            inputs: &node.inputs,
            outputs: &node.outputs,
            segment: &alloc.segment,
            map: &alloc.map,
            checker: &alloc.checker,
            published,
        };
        for input in &node.inputs {
            if let Err(error) = ctx.verify(input) {
                timing.init = init_start.elapsed();
                return self.fail_node(node, signals, cell, timing, node_start, error, abort);
            }
        }
        timing.init = init_start.elapsed();

        // Execute phase.
        let exec_start = Instant::now();
        let result = (node.work)(&mut ctx);
        timing.execute = exec_start.elapsed();
        if let Err(source) = result {
            let error = PipelineError::NodeFailed {
                node: node.id.clone(),
                source,
            };
            return self.fail_node(node, signals, cell, timing, node_start, error, abort);
        }

        // Handoff phase: checksum anything the unit did not publish, then
        // go COMPLETE and wake the waiters.
        let handoff_start = Instant::now();
        for output in &node.outputs {
            let already = published.lock().unwrap().contains(output);
            if !already {
                if let Err(error) = ctx.publish(output) {
                    timing.handoff = handoff_start.elapsed();
                    return self.fail_node(node, signals, cell, timing, node_start, error, abort);
                }
            }
        }
        if let Err(e) = signals.transition(cell, NodeState::Complete) {
            return self.fail_node(node, signals, cell, timing, node_start, e.into(), abort);
        }
        timing.handoff = handoff_start.elapsed();
        timing.total = node_start.elapsed();

        if self.config.timing_log {
            info!(
                target: "cairn::timing",
                node = %node.id,
                wait_us = timing.wait.as_micros() as u64,
                init_us = timing.init.as_micros() as u64,
                execute_us = timing.execute.as_micros() as u64,
                handoff_us = timing.handoff.as_micros() as u64,
                "node complete"
            );
        }

        NodeReport {
            id: node.id.clone(),
            outcome: NodeOutcome::Completed,
            timing,
            error: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fail_node(
        &self,
        node: &PipelineNode,
        signals: &dyn Signaler,
        cell: usize,
        mut timing: NodeTiming,
        node_start: Instant,
        error: PipelineError,
        abort: &AtomicBool,
    ) -> NodeReport {
        warn!(node = %node.id, %error, "node failed");
        mark_error(signals, cell);
        if self.policy == FailurePolicy::FailFast {
            abort.store(true, Ordering::Release);
        }
        timing.total = node_start.elapsed();
        NodeReport {
            id: node.id.clone(),
            outcome: NodeOutcome::Failed,
            timing,
            error: Some(error),
        }
    }
}

enum WaitOutcome {
    Complete,
    UpstreamFailed,
    TimedOut,
    Aborted,
}

/// Wait for a producer cell to reach a terminal state, polling the abort
/// flag between short wait slices.
fn wait_terminal(
    signals: &dyn Signaler,
    producer_cell: usize,
    timeout: Duration,
    abort: &AtomicBool,
) -> WaitOutcome {
    let deadline = Instant::now() + timeout;
    loop {
        if abort.load(Ordering::Acquire) {
            return WaitOutcome::Aborted;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let slice = (deadline - now).min(Duration::from_millis(10));
        match signals.wait_for(producer_cell, &|s| s.is_terminal(), slice) {
            Ok(NodeState::Complete) => return WaitOutcome::Complete,
            Ok(_) => return WaitOutcome::UpstreamFailed,
            Err(SignalError::Timeout { .. }) => {}
            Err(_) => return WaitOutcome::TimedOut,
        }
    }
}

/// (Idle | Waiting) -> Running.
fn transition_running(signals: &dyn Signaler, cell: usize) -> Result<(), SignalError> {
    signals.transition(cell, NodeState::Running)
}

/// Drive the cell to sticky ERROR through a valid chain.
fn mark_error(signals: &dyn Signaler, cell: usize) {
    if matches!(
        signals.load(cell),
        Ok(NodeState::Idle) | Ok(NodeState::Waiting)
    ) {
        let _ = signals.transition(cell, NodeState::Running);
    }
    if let Err(e) = signals.transition(cell, NodeState::Error) {
        warn!(cell, error = %e, "could not mark node cell as errored");
    }
}
