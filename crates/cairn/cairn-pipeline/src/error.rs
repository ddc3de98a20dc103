//! Structured pipeline errors: codes and fields, no prose from the core.

/// Failure raised by a node's work unit. The code is the node author's
/// machine-readable tag; the orchestrator never interprets it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("work unit failed (code {code}): {message}")]
pub struct WorkError {
    pub code: String,
    pub message: String,
}

impl WorkError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Lets work units use `?` on context operations.
impl From<PipelineError> for WorkError {
    fn from(e: PipelineError) -> Self {
        WorkError::new("pipeline", e.to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("resource name '{name}' must begin with bus://")]
    InvalidResourceName { name: String },

    #[error("invalid resource '{name}': {reason}")]
    InvalidResource { name: String, reason: &'static str },

    #[error("duplicate resource '{name}'")]
    DuplicateResource { name: String },

    #[error("duplicate node '{node}'")]
    DuplicateNode { node: String },

    #[error("resource '{name}' references unknown node '{node}'")]
    UnknownNode { name: String, node: String },

    #[error("node '{node}' does not declare '{name}' as {direction}")]
    UndeclaredAccess {
        node: String,
        name: String,
        direction: &'static str,
    },

    #[error("no block allocated under '{name}'")]
    UnknownBlock { name: String },

    #[error("pipeline is not allocated")]
    NotAllocated,

    #[error("pipeline is already allocated")]
    AlreadyAllocated,

    #[error("pipeline needs {required} bytes, memory limit is {limit}")]
    CapacityExceeded { required: u64, limit: u64 },

    #[error("allocation failed: {reason}")]
    AllocationFailed { reason: String },

    #[error("dependency cycle among nodes {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },

    #[error(
        "checksum mismatch on '{resource}': expected {expected:#010x}, got {actual:#010x} \
         (producer '{culprit}', consumer '{consumer}')"
    )]
    IntegrityCheckFailed {
        resource: String,
        expected: u32,
        actual: u32,
        culprit: String,
        consumer: String,
    },

    #[error("node '{node}' timed out after {waited_ms} ms waiting for producer '{producer}'")]
    UpstreamTimeout {
        node: String,
        producer: String,
        waited_ms: u64,
    },

    #[error("node '{node}' observed failure of producer '{producer}'")]
    UpstreamError { node: String, producer: String },

    #[error("node '{node}': {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: WorkError,
    },

    #[error("signal table fault: {0}")]
    Signal(String),
}

impl From<basalt_signal::SignalError> for PipelineError {
    fn from(e: basalt_signal::SignalError) -> Self {
        PipelineError::Signal(e.to_string())
    }
}
