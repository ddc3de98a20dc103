//! Error taxonomy for pool operations.

use cairn_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is not initialized")]
    NotInitialized,

    #[error("pool is already initialized")]
    AlreadyInitialized,

    #[error("no data loaded; call load_data before run")]
    NotReady,

    #[error("worker pool failed to initialize: {reason}")]
    InitFailed { reason: String },

    #[error("pool would need {required} bytes of shared memory, limit is {limit}")]
    MemoryLimit { required: u64, limit: u64 },

    #[error("worker {worker} deque cannot hold {chunks} chunks (capacity {capacity})")]
    DequeOverflow {
        worker: u32,
        chunks: usize,
        capacity: u32,
    },

    #[error("engine failure on worker {worker}")]
    Engine {
        worker: u32,
        #[source]
        source: EngineError,
    },

    #[error("worker {worker} exceeded the {deadline_ms} ms chunk deadline on chunk {chunk}")]
    WorkerTimeout {
        worker: u32,
        chunk: u32,
        deadline_ms: u64,
    },

    #[error("non-finite engine output at scenario {index}")]
    Numerical { index: usize },

    #[error(transparent)]
    Bus(#[from] cairn_bus::BusError),

    #[error(transparent)]
    Deques(#[from] basalt_deque::PoolError),

    #[error("worker channels disconnected mid-run")]
    WorkersGone,
}
