use crate::types::{DataType, Rank, SessionId, WorkerAddress};

pub type Result<T> = std::result::Result<T, CohortError>;

#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("comms session is not initialized")]
    NotInitialized,

    #[error("comms session is already initialized; call destroy() first")]
    AlreadyInitialized,

    #[error("no workers available: cannot form a clique")]
    EmptyCluster,

    #[error("worker {worker} is listed more than once")]
    DuplicateWorker { worker: WorkerAddress },

    #[error("session {0} was already torn down on this worker")]
    SessionRetired(SessionId),

    #[error("worker {worker} is not part of this session")]
    UnknownWorker { worker: WorkerAddress },

    #[error("clique formation failed on {} worker(s): {}", .failures.len(), join_failures(.failures))]
    CliqueFormation {
        failures: Vec<(WorkerAddress, String)>,
    },

    #[error("invalid root {root}: clique size is {world_size}")]
    InvalidRoot { root: Rank, world_size: u32 },

    #[error("split needs at least one color")]
    NoSplitColors,

    #[error("point-to-point comms not enabled for this session")]
    P2PNotEnabled,

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("worker {worker} unreachable: {reason}")]
    WorkerUnreachable {
        worker: WorkerAddress,
        reason: String,
    },

    #[error("point-to-point transport engine unavailable")]
    TransportUnavailable,

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("{operation} failed on {} worker(s): {}", .failures.len(), join_failures(.failures))]
    OperationFailed {
        operation: String,
        failures: Vec<(WorkerAddress, String)>,
    },

    #[error("teardown failed on {} worker(s): {}", .workers.len(), join_failures(.workers))]
    TeardownFailed {
        workers: Vec<(WorkerAddress, String)>,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("buffer of {len} bytes is not a whole number of {dtype} elements")]
    PartialElement { len: usize, dtype: DataType },

    #[error(
        "count {count} is not evenly divisible by world size {world_size} (required by {operation})"
    )]
    IndivisibleCount {
        count: usize,
        world_size: usize,
        operation: &'static str,
    },

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u8, remote: u8 },

    #[error("RPC handler not registered for fn_id={fn_id}")]
    RpcNotRegistered { fn_id: u16 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_failures(failures: &[(WorkerAddress, String)]) -> String {
    failures
        .iter()
        .map(|(w, reason)| format!("{w}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CohortError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: after.as_millis() as u64,
        }
    }
}
