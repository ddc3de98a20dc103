//! The scheduler: owns the shared regions and the worker lifecycle,
//! orchestrates one run end to end.

use crate::chunking::ChunkTable;
use crate::error::PoolError;
use crate::progress::{ProgressBoard, ProgressCallback};
use crate::stats;
use crate::transport::{InputSnapshot, Transport};
use crate::worker::{Command, Event, Heartbeat, RunContext, spawn_worker};
use basalt_deque::{DequePool, PushResult, bytes_for_pool};
use basalt_mmap::Segment;
use cairn_bus::BusWriter;
use cairn_config::RuntimeConfig;
use cairn_engine::{EngineFactory, EngineInfo};
use cairn_model::{AssumptionSet, Policy, RunRequest, RunResult, Statistics};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared-region capacities fixed at initialization.
#[derive(Debug, Clone, Copy)]
pub struct PoolCapacities {
    pub max_policies: u32,
    pub max_scenarios: u32,
}

/// Terminal state of a run that did not error.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunResult),
    /// The cancel token was observed; remaining chunks were not executed
    /// and no partial statistics are produced.
    Cancelled,
}

/// Cooperative cancel token. Cloneable into other threads; idempotent.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct WorkerHandle {
    commands: Sender<Command>,
    join: Option<JoinHandle<()>>,
}

/// The valuation pool: long-lived workers over two shared regions.
pub struct ValuationPool {
    config: RuntimeConfig,
    worker_count: u32,
    bus: BusWriter,
    deque_segment: Arc<Segment>,
    deques: DequePool,
    workers: Vec<WorkerHandle>,
    events: Receiver<Event>,
    engine_info: EngineInfo,
    has_data: bool,
    data_version: u64,
    policies: Vec<Policy>,
    assumptions: Option<AssumptionSet>,
    cancel: CancelHandle,
    on_progress: Option<Arc<ProgressCallback>>,
    /// Set when a worker blew its chunk deadline; joins would hang, so
    /// teardown abandons the threads instead.
    poisoned: bool,
    terminated: bool,
}

impl std::fmt::Debug for ValuationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuationPool")
            .field("worker_count", &self.worker_count)
            .field("has_data", &self.has_data)
            .field("data_version", &self.data_version)
            .field("poisoned", &self.poisoned)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl ValuationPool {
    /// Allocate both shared regions, spawn `worker_count` workers, and wait
    /// for every worker to attach and initialize its engine. On any failure
    /// all partially spawned workers are torn down.
    pub fn initialize(
        worker_count: u32,
        capacities: PoolCapacities,
        factory: Arc<dyn EngineFactory>,
        config: RuntimeConfig,
    ) -> Result<Self, PoolError> {
        if worker_count == 0 {
            return Err(PoolError::InitFailed {
                reason: "worker count must be at least 1".into(),
            });
        }

        let bus = match &config.segment_dir {
            Some(dir) => BusWriter::allocate_at(
                dir.join(format!("cairn_bus_{}", std::process::id())),
                capacities.max_policies,
                capacities.max_scenarios,
                worker_count,
            )?,
            None => BusWriter::allocate(
                capacities.max_policies,
                capacities.max_scenarios,
                worker_count,
            )?,
        };

        let deque_bytes = bytes_for_pool(worker_count, config.deque_capacity);
        let required = (bus.layout().total_bytes + deque_bytes) as u64;
        if let Some(limit) = config.max_memory_bytes {
            if required > limit {
                return Err(PoolError::MemoryLimit { required, limit });
            }
        }
        let deque_segment = Arc::new(Segment::anon(deque_bytes).map_err(cairn_bus::BusError::from)?);
        let deques = DequePool::create(
            Arc::clone(&deque_segment),
            worker_count,
            config.deque_capacity,
        )?;

        let (event_tx, events) = mpsc::channel();
        let mut workers = Vec::with_capacity(worker_count as usize);
        for w in 0..worker_count {
            let (cmd_tx, cmd_rx) = mpsc::channel();
            let join = spawn_worker(w, Arc::clone(&factory), cmd_rx, event_tx.clone()).map_err(
                |e| PoolError::InitFailed {
                    reason: format!("failed to spawn worker {w}: {e}"),
                },
            )?;
            workers.push(WorkerHandle {
                commands: cmd_tx,
                join: Some(join),
            });
        }

        // Init barrier: every worker reports Ready before the pool exists.
        let deadline = Instant::now() + Duration::from_millis(config.init_timeout_ms);
        let mut ready = 0u32;
        let mut engine_info: Option<EngineInfo> = None;
        while ready < worker_count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(Event::Ready { info, .. }) => {
                    engine_info.get_or_insert(info);
                    ready += 1;
                }
                Ok(Event::ReadyFailed { worker, error }) => {
                    teardown(&mut workers, false);
                    return Err(PoolError::InitFailed {
                        reason: format!("worker {worker} engine init failed: {error}"),
                    });
                }
                Ok(_) => {}
                Err(_) => {
                    teardown(&mut workers, false);
                    return Err(PoolError::InitFailed {
                        reason: format!(
                            "{} of {} workers ready within {} ms",
                            ready, worker_count, config.init_timeout_ms
                        ),
                    });
                }
            }
        }
        let engine_info = engine_info.expect("ready barrier passed");

        info!(
            workers = worker_count,
            engine = engine_info.name,
            bus_bytes = bus.layout().total_bytes,
            deque_bytes,
            "valuation pool initialized"
        );

        Ok(Self {
            config,
            worker_count,
            bus,
            deque_segment,
            deques,
            workers,
            events,
            engine_info,
            has_data: false,
            data_version: 0,
            policies: Vec::new(),
            assumptions: None,
            cancel: CancelHandle::default(),
            on_progress: None,
            poisoned: false,
            terminated: false,
        })
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn engine_info(&self) -> &EngineInfo {
        &self.engine_info
    }

    /// Register the progress callback invoked with the averaged percent.
    pub fn set_progress_callback(&mut self, callback: Arc<ProgressCallback>) {
        self.on_progress = Some(callback);
    }

    /// A cancel handle valid for the pool's current and future runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cancellation of the active run. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Write policies and assumptions into the shared region. Workers
    /// refresh their engine-side data at the next run boundary.
    pub fn load_data(
        &mut self,
        policies: &[Policy],
        assumptions: &AssumptionSet,
    ) -> Result<(), PoolError> {
        if self.terminated {
            return Err(PoolError::NotInitialized);
        }
        self.bus.write_policies(policies)?;
        self.bus.write_assumptions(assumptions);
        self.policies = policies.to_vec();
        self.assumptions = Some(assumptions.clone());
        self.data_version += 1;
        self.has_data = true;
        debug!(
            policies = policies.len(),
            version = self.data_version,
            "inputs loaded into the data region"
        );
        Ok(())
    }

    /// Execute one valuation request to completion, cancellation or error.
    pub fn run(&mut self, request: &RunRequest) -> Result<RunOutcome, PoolError> {
        if self.terminated {
            return Err(PoolError::NotInitialized);
        }
        if self.poisoned {
            // A timed-out worker is still wedged inside the previous run.
            return Err(PoolError::InitFailed {
                reason: "pool is poisoned by a timed-out worker; re-initialize".into(),
            });
        }
        if !self.has_data {
            return Err(PoolError::NotReady);
        }

        let started = Instant::now();
        let n = request.num_scenarios;

        if n == 0 {
            // No worker activity at all for an empty request.
            return Ok(RunOutcome::Completed(RunResult {
                statistics: Statistics::zeroed(),
                execution_time_ms: 0,
                scenario_count: 0,
                distribution: request.store_distribution.then(Vec::new),
            }));
        }

        self.bus.set_scenario_count(n)?;

        let chunk_size = self
            .config
            .scenario_chunk_size
            .min(self.engine_info.max_scenarios_per_chunk)
            .max(1);
        let chunks = Arc::new(ChunkTable::build(
            n,
            self.worker_count,
            request.base_seed,
            chunk_size,
        ));

        // Reset the run-scoped shared state while every worker is parked.
        self.bus.wipe_results();
        self.deques.reset_for_run();
        self.cancel.clear();

        // Seed each owner's deque bottom-first: owners pop their newest
        // chunk first, thieves see the oldest.
        for w in 0..self.worker_count {
            let mut owner = self.deques.owner(w)?;
            let assigned = chunks.assigned(w);
            for &id in assigned {
                if owner.push(id) == PushResult::Full {
                    return Err(PoolError::DequeOverflow {
                        worker: w,
                        chunks: assigned.len(),
                        capacity: self.config.deque_capacity,
                    });
                }
            }
        }

        let transport = if self.config.force_copy_transport {
            Transport::Copy
        } else {
            Transport::Shared
        };
        let copied = match transport {
            Transport::Copy => {
                let assumptions = self.assumptions.as_ref().expect("has_data checked");
                Some(Arc::new(InputSnapshot::capture(&self.policies, assumptions)))
            }
            Transport::Shared => None,
        };

        let progress = Arc::new(ProgressBoard::new(self.worker_count));
        let heartbeat = Arc::new(Heartbeat::new(self.worker_count));
        let request_arc = Arc::new(request.clone());

        debug!(
            scenarios = n,
            chunks = chunks.len(),
            chunk_size,
            ?transport,
            "run start"
        );

        // Barrier release: hand every worker its run context.
        for (w, handle) in self.workers.iter().enumerate() {
            let ctx = RunContext {
                data_version: self.data_version,
                bus_segment: Arc::clone(self.bus.segment()),
                deque_segment: Arc::clone(&self.deque_segment),
                copied: copied.clone(),
                request: Arc::clone(&request_arc),
                chunks: Arc::clone(&chunks),
                cancel: self.cancel.clone(),
                progress: Arc::clone(&progress),
                heartbeat: Arc::clone(&heartbeat),
                worker_count: self.worker_count,
            };
            handle
                .commands
                .send(Command::Run(Box::new(ctx)))
                .map_err(|_| {
                    warn!(worker = w, "worker command channel closed");
                    PoolError::WorkersGone
                })?;
        }

        let failure = self.await_quiescence(&heartbeat, &progress)?;

        if let Some(error) = failure {
            return Err(error);
        }
        if self.cancel.is_cancelled() {
            info!("run cancelled; no partial statistics");
            return Ok(RunOutcome::Cancelled);
        }

        // Aggregate in worker-index order; completion order never matters.
        let counts = chunks.per_worker_counts();
        let distribution = self.bus.read_all_results(counts)?;
        debug_assert_eq!(distribution.len() as u32, n);
        if let Some(index) = stats::first_non_finite(&distribution) {
            return Err(PoolError::Numerical { index });
        }
        let statistics = stats::summarize(&distribution);

        if let Some(cb) = &self.on_progress {
            cb(100);
        }

        let execution_time_ms = started.elapsed().as_millis() as u64;
        if self.config.timing_log {
            info!(
                target: "cairn::timing",
                execution_time_ms,
                scenarios = n,
                chunks = chunks.len(),
                "run complete"
            );
        }

        Ok(RunOutcome::Completed(RunResult {
            statistics,
            execution_time_ms,
            scenario_count: n,
            distribution: request.store_distribution.then(|| distribution),
        }))
    }

    /// Wait until every worker reports a terminal event, publishing
    /// progress and running the chunk watchdog from the wait loop.
    fn await_quiescence(
        &mut self,
        heartbeat: &Heartbeat,
        progress: &ProgressBoard,
    ) -> Result<Option<PoolError>, PoolError> {
        let mut finished = 0u32;
        let mut failure: Option<PoolError> = None;
        // Chunk -> grace-window start, per worker.
        let mut graced: HashMap<u32, (u32, u64)> = HashMap::new();
        let mut last_published: Option<u8> = None;

        while finished < self.worker_count {
            match self.events.recv_timeout(Duration::from_millis(50)) {
                Ok(Event::Finished { worker, .. }) => {
                    debug!(worker, "worker finished");
                    finished += 1;
                }
                Ok(Event::Failed { worker, error }) => {
                    warn!(worker, %error, "worker failed; cancelling peers");
                    if failure.is_none() {
                        failure = Some(error);
                    }
                    // Fail-fast: stop the survivors at their next boundary.
                    self.cancel.cancel();
                    finished += 1;
                }
                Ok(Event::Ready { .. } | Event::ReadyFailed { .. }) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if failure.is_none() {
                        if let Some(timeout) =
                            self.watchdog(heartbeat, &mut graced)
                        {
                            failure = Some(timeout);
                            self.cancel.cancel();
                            self.poisoned = true;
                            // The stuck thread will never report; stop
                            // waiting for it.
                            return Ok(failure);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::WorkersGone),
            }

            if let Some(cb) = &self.on_progress {
                let avg = progress.average();
                if last_published != Some(avg) {
                    cb(avg);
                    last_published = Some(avg);
                }
            }
        }
        Ok(failure)
    }

    /// One watchdog sweep. A chunk past its deadline gets a single grace
    /// window (a stuck OS thread cannot be preempted, so the "retry" is a
    /// second full deadline); a chunk past its grace window fails the run.
    fn watchdog(
        &self,
        heartbeat: &Heartbeat,
        graced: &mut HashMap<u32, (u32, u64)>,
    ) -> Option<PoolError> {
        let deadline = self.config.chunk_timeout_ms;
        let now = heartbeat.now_ms();
        for w in 0..self.worker_count {
            let Some((chunk, started)) = heartbeat.snapshot(w) else {
                continue;
            };
            if now.saturating_sub(started) <= deadline {
                continue;
            }
            match graced.get(&w) {
                Some(&(graced_chunk, grace_start)) if graced_chunk == chunk => {
                    if now.saturating_sub(grace_start) > deadline {
                        return Some(PoolError::WorkerTimeout {
                            worker: w,
                            chunk,
                            deadline_ms: deadline,
                        });
                    }
                }
                _ => {
                    warn!(
                        worker = w,
                        chunk, deadline_ms = deadline,
                        "chunk deadline exceeded; granting one grace window"
                    );
                    graced.insert(w, (chunk, now));
                }
            }
        }
        None
    }

    /// Stop all workers and release the shared regions.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        teardown(&mut self.workers, self.poisoned);
        self.terminated = true;
        self.has_data = false;
    }
}

fn teardown(workers: &mut [WorkerHandle], poisoned: bool) {
    for handle in workers.iter() {
        let _ = handle.commands.send(Command::Terminate);
    }
    if poisoned {
        // A stuck worker never drains its channel; joining would hang.
        for handle in workers.iter_mut() {
            drop(handle.join.take());
        }
        return;
    }
    for handle in workers.iter_mut() {
        if let Some(join) = handle.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ValuationPool {
    fn drop(&mut self) {
        self.terminate();
    }
}
