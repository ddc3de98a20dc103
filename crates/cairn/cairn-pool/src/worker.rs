//! The worker: one long-lived OS thread executing scenario chunks.
//!
//! Per run a worker attaches fresh views over both shared regions
//! (validating each header), refreshes its engine's data if the load
//! generation moved, then enters the work loop: drain the own deque LIFO;
//! when empty, steal FIFO from a uniformly random peer; when everything
//! looks empty, enter the quiescence protocol on the live-worker counter.
//!
//! Quiescence is derived, not literal: an idle worker decrements the
//! counter, re-checks every deque, re-arms (increments) and resumes if work
//! appeared, and exits once the counter reads zero with all deques empty.
//! A retry push only ever targets the failing worker's own deque while that
//! worker is still active, so no task can appear after the counter hits
//! zero.

use crate::chunking::ChunkTable;
use crate::error::PoolError;
use crate::progress::ProgressBoard;
use crate::scheduler::CancelHandle;
use crate::transport::{InputSnapshot, WorkerInputs};
use basalt_deque::{DequePool, OwnerDeque, PopResult, PushResult, StealResult, TaskId, ThiefDeque};
use basalt_mmap::Segment;
use cairn_bus::{BusReader, ResultSlab};
use cairn_engine::{
    AssumptionInput, CalcEngine, ChunkRequest, EngineError, EngineFactory, EngineInfo, PolicyInput,
};
use cairn_model::RunRequest;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::warn;

/// Everything one run hands to a worker.
pub(crate) struct RunContext {
    pub data_version: u64,
    pub bus_segment: Arc<Segment>,
    pub deque_segment: Arc<Segment>,
    /// Present in copy-transport mode; workers read the snapshot instead of
    /// the bus slabs.
    pub copied: Option<Arc<InputSnapshot>>,
    pub request: Arc<RunRequest>,
    pub chunks: Arc<ChunkTable>,
    pub cancel: CancelHandle,
    pub progress: Arc<ProgressBoard>,
    pub heartbeat: Arc<Heartbeat>,
    pub worker_count: u32,
}

pub(crate) enum Command {
    Run(Box<RunContext>),
    Terminate,
}

pub(crate) enum Event {
    Ready { worker: u32, info: EngineInfo },
    ReadyFailed { worker: u32, error: EngineError },
    Finished { worker: u32, executed_scenarios: u32 },
    Failed { worker: u32, error: PoolError },
}

/// Per-worker liveness stamps for the scheduler's chunk watchdog.
///
/// A worker publishes `(chunk, started)` when it picks a chunk up and
/// clears the chunk cell when the engine returns. The scheduler polls;
/// nothing here feeds back into the workers.
pub(crate) struct Heartbeat {
    origin: Instant,
    chunks: Vec<AtomicU32>,
    started_ms: Vec<AtomicU64>,
}

/// Idle marker in the chunk cell.
const NO_CHUNK: u32 = u32::MAX;

impl Heartbeat {
    pub fn new(workers: u32) -> Self {
        Self {
            origin: Instant::now(),
            chunks: (0..workers).map(|_| AtomicU32::new(NO_CHUNK)).collect(),
            started_ms: (0..workers).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn start(&self, w: u32, chunk: TaskId) {
        self.started_ms[w as usize].store(self.now_ms(), Ordering::Relaxed);
        self.chunks[w as usize].store(chunk, Ordering::Release);
    }

    fn clear(&self, w: u32) {
        self.chunks[w as usize].store(NO_CHUNK, Ordering::Release);
    }

    /// `(chunk, started_ms)` when worker `w` is mid-chunk.
    pub fn snapshot(&self, w: u32) -> Option<(TaskId, u64)> {
        let chunk = self.chunks[w as usize].load(Ordering::Acquire);
        if chunk == NO_CHUNK {
            return None;
        }
        Some((chunk, self.started_ms[w as usize].load(Ordering::Relaxed)))
    }
}

/// Spawn worker `index`. It creates and initializes its engine, reports
/// readiness, then parks on the command channel between runs.
pub(crate) fn spawn_worker(
    index: u32,
    factory: Arc<dyn EngineFactory>,
    commands: Receiver<Command>,
    events: Sender<Event>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("cairn-worker-{index}"))
        .spawn(move || {
            let mut engine = match factory.create().and_then(|mut engine| {
                engine.initialize()?;
                Ok(engine)
            }) {
                Ok(engine) => engine,
                Err(error) => {
                    let _ = events.send(Event::ReadyFailed {
                        worker: index,
                        error,
                    });
                    return;
                }
            };
            let _ = events.send(Event::Ready {
                worker: index,
                info: engine.info(),
            });

            let mut loaded_version = 0u64;
            while let Ok(command) = commands.recv() {
                match command {
                    Command::Terminate => break,
                    Command::Run(ctx) => {
                        let event = run_once(index, engine.as_mut(), &mut loaded_version, &ctx);
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
            engine.dispose();
        })
}

fn run_once(
    index: u32,
    engine: &mut dyn CalcEngine,
    loaded_version: &mut u64,
    ctx: &RunContext,
) -> Event {
    match drive(index, engine, loaded_version, ctx) {
        Ok(executed_scenarios) => Event::Finished {
            worker: index,
            executed_scenarios,
        },
        Err(error) => Event::Failed {
            worker: index,
            error,
        },
    }
}

fn drive(
    index: u32,
    engine: &mut dyn CalcEngine,
    loaded_version: &mut u64,
    ctx: &RunContext,
) -> Result<u32, PoolError> {
    // Attach both regions; headers are validated on every run boundary.
    let bus = BusReader::attach(Arc::clone(&ctx.bus_segment))?;
    let deques = DequePool::attach(Arc::clone(&ctx.deque_segment))?;

    let inputs = match &ctx.copied {
        Some(snapshot) => WorkerInputs::Copied(Arc::clone(snapshot)),
        None => WorkerInputs::Shared(bus.clone()),
    };

    if *loaded_version != ctx.data_version {
        refresh_engine(index, engine, &inputs)?;
        *loaded_version = ctx.data_version;
    }

    let slabs: Vec<ResultSlab> = (0..ctx.worker_count)
        .map(|w| bus.result_slab(w))
        .collect::<Result<_, _>>()?;
    let thieves: Vec<ThiefDeque> = (0..ctx.worker_count)
        .map(|w| deques.thief(w))
        .collect::<Result<_, _>>()?;
    let mut own = deques.owner(index)?;
    let active = deques.active_workers();

    let assigned = ctx.chunks.per_worker_counts()[index as usize];
    let mut executed: u32 = 0;
    let mut consecutive_aborts: u32 = 0;
    let mut idle_decremented = false;
    let mut rng = rand::thread_rng();
    let mut victims: Vec<u32> = (0..ctx.worker_count).filter(|&w| w != index).collect();

    let outcome: Result<(), PoolError> = 'work: loop {
        // Cancellation is cooperative: checked at every task boundary, a
        // running chunk is never aborted.
        if ctx.cancel.is_cancelled() {
            break Ok(());
        }

        match own.pop() {
            PopResult::Task(id) => {
                match execute_chunk(index, engine, ctx, &slabs, &mut own, id) {
                    Ok(done) => {
                        executed += done;
                        consecutive_aborts = 0;
                        report_progress(ctx, index, executed, assigned);
                    }
                    Err(error) => break Err(error),
                }
                continue 'work;
            }
            PopResult::Empty => {}
        }

        // Steal phase: uniformly random victim order, reshuffled per round.
        victims.shuffle(&mut rng);
        let mut any_abort = false;
        let mut stolen: Option<TaskId> = None;
        for &victim in &victims {
            match thieves[victim as usize].steal() {
                StealResult::Task(id) => {
                    stolen = Some(id);
                    break;
                }
                StealResult::Abort => any_abort = true,
                StealResult::Empty => {}
            }
        }

        if let Some(id) = stolen {
            consecutive_aborts = 0;
            match execute_chunk(index, engine, ctx, &slabs, &mut own, id) {
                Ok(done) => {
                    executed += done;
                    report_progress(ctx, index, executed, assigned);
                }
                Err(error) => break Err(error),
            }
            continue 'work;
        }

        if any_abort {
            consecutive_aborts += 1;
            if consecutive_aborts >= ctx.worker_count {
                // Contention plateau: one brief suspension, then retry.
                std::thread::park_timeout(Duration::from_micros(100));
                consecutive_aborts = 0;
            } else {
                std::hint::spin_loop();
            }
            continue 'work;
        }

        // Everything looked empty: quiescence protocol.
        active.fetch_sub(1, Ordering::AcqRel);
        idle_decremented = true;
        loop {
            if ctx.cancel.is_cancelled() {
                break 'work Ok(());
            }
            if !deques.all_empty_hint() {
                active.fetch_add(1, Ordering::AcqRel);
                idle_decremented = false;
                continue 'work;
            }
            if active.load(Ordering::Acquire) == 0 {
                break 'work Ok(());
            }
            std::thread::park_timeout(Duration::from_micros(200));
        }
    };

    if !idle_decremented {
        active.fetch_sub(1, Ordering::AcqRel);
    }
    outcome.map(|()| executed)
}

fn refresh_engine(
    index: u32,
    engine: &mut dyn CalcEngine,
    inputs: &WorkerInputs,
) -> Result<(), PoolError> {
    let load = if engine.info().supports_binary_input {
        engine.load_policies(PolicyInput::Records(inputs.policy_bytes()))
    } else {
        let rows = inputs.policies()?;
        engine.load_policies(PolicyInput::Rows(&rows))
    };
    load.and_then(|_| {
        engine.load_assumptions(AssumptionInput {
            mortality: inputs.mortality(),
            lapse: inputs.lapse(),
            expenses: inputs.expenses(),
        })
    })
    .map_err(|source| PoolError::Engine {
        worker: index,
        source,
    })
}

fn report_progress(ctx: &RunContext, index: u32, executed: u32, assigned: u32) {
    let percent = if assigned == 0 {
        100
    } else {
        executed.saturating_mul(100) / assigned
    };
    ctx.progress.set(index, percent);
}

/// Execute one chunk. `Ok(n)` scenarios landed in the home slab; `Ok(0)`
/// means the chunk failed once and went back onto the own deque for its
/// single retry. A second failure, or a bus fault, escalates.
fn execute_chunk(
    index: u32,
    engine: &dyn CalcEngine,
    ctx: &RunContext,
    slabs: &[ResultSlab],
    own: &mut OwnerDeque,
    id: TaskId,
) -> Result<u32, PoolError> {
    let entry = ctx.chunks.entry(id);
    let desc = entry.desc;
    ctx.heartbeat.start(index, id);
    let result = engine
        .run_chunk(&ChunkRequest {
            num_scenarios: desc.scenario_count,
            seed: desc.seed,
            scenario_params: &ctx.request.scenario_params,
            mortality_mult: ctx.request.mortality_mult,
            lapse_mult: ctx.request.lapse_mult,
            expense_mult: ctx.request.expense_mult,
        })
        .and_then(|out| {
            if out.npvs.len() == desc.scenario_count as usize {
                Ok(out)
            } else {
                Err(EngineError::ExecutionFailed {
                    code: 400,
                    detail: format!(
                        "engine returned {} NPVs for a {}-scenario chunk",
                        out.npvs.len(),
                        desc.scenario_count
                    ),
                })
            }
        });
    ctx.heartbeat.clear(index);

    match result {
        Ok(out) => {
            slabs[entry.home_worker as usize].write_chunk(desc.result_offset, &out.npvs)?;
            Ok(desc.scenario_count)
        }
        Err(error) => {
            if entry.claim_retry() {
                warn!(worker = index, chunk = id, %error, "chunk failed, retrying once");
                match own.push(id) {
                    PushResult::Pushed => Ok(0),
                    PushResult::Full => Err(PoolError::Engine {
                        worker: index,
                        source: error,
                    }),
                }
            } else {
                Err(PoolError::Engine {
                    worker: index,
                    source: error,
                })
            }
        }
    }
}
