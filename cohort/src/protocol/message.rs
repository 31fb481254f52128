use crate::dispatch::Operation;
use crate::error::CohortError;
use crate::types::{CliqueId, Rank, SessionId, WorkerAddress};

/// Frames exchanged between a controller and its workers.
///
/// Handles never appear here: everything a worker needs to find its
/// process-local state is the session id.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum CohortMessage {
    Task { task_id: u64, task: WorkerTask },
    Reply { task_id: u64, reply: TaskReply },
}

/// Work a controller can submit to a named worker.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum WorkerTask {
    /// Bind a point-to-point listener for the session and report its endpoint.
    OpenTransport { session: SessionId },

    /// Join the clique and register the resulting handle under `session`.
    BuildContext {
        session: SessionId,
        clique: CliqueId,
        rank: Rank,
        world_size: u32,
        /// `(rank, endpoint)` for every member when p2p is enabled.
        peers: Option<Vec<(Rank, String)>>,
    },

    /// Drop the session's handle and any staged transport.
    Teardown { session: SessionId },

    /// Report whether a handle is registered for `session`.
    HasHandle { session: SessionId },

    /// Run one operation against the session's handle.
    Dispatch { session: SessionId, op: Operation },

    /// Invoke a handler registered in the worker's RPC registry.
    Rpc { fn_id: u16, payload: Vec<u8> },
}

impl WorkerTask {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerTask::OpenTransport { .. } => "open_transport",
            WorkerTask::BuildContext { .. } => "build_context",
            WorkerTask::Teardown { .. } => "teardown",
            WorkerTask::HasHandle { .. } => "has_handle",
            WorkerTask::Dispatch { .. } => "dispatch",
            WorkerTask::Rpc { .. } => "rpc",
        }
    }
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum TaskReply {
    Done,
    Flag(bool),
    /// Context built; echoes the rank the worker registered under.
    Joined { rank: Rank },
    /// Transport listener bound at this endpoint.
    Endpoint(String),
    Payload(Vec<u8>),
    Failed(TaskFailure),
}

impl TaskReply {
    /// Turn a `Failed` reply from `worker` back into an error.
    pub fn into_result(self, worker: &WorkerAddress, operation: &str) -> crate::error::Result<Self> {
        match self {
            TaskReply::Failed(failure) => Err(failure.into_error(worker, operation)),
            reply => Ok(reply),
        }
    }
}

/// A worker-side error flattened for the trip back to the controller.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum FailureKind {
    NotInitialized,
    AlreadyInitialized,
    InvalidRoot { root: Rank, world_size: u32 },
    P2PNotEnabled,
    TransportUnavailable,
    Timeout { timeout_ms: u64 },
    RpcNotRegistered { fn_id: u16 },
    Other,
}

impl From<&CohortError> for TaskFailure {
    fn from(e: &CohortError) -> Self {
        let kind = match e {
            CohortError::NotInitialized => FailureKind::NotInitialized,
            CohortError::AlreadyInitialized => FailureKind::AlreadyInitialized,
            CohortError::InvalidRoot { root, world_size } => FailureKind::InvalidRoot {
                root: *root,
                world_size: *world_size,
            },
            CohortError::P2PNotEnabled => FailureKind::P2PNotEnabled,
            CohortError::TransportUnavailable => FailureKind::TransportUnavailable,
            CohortError::Timeout { timeout_ms, .. } => FailureKind::Timeout {
                timeout_ms: *timeout_ms,
            },
            CohortError::RpcNotRegistered { fn_id } => {
                FailureKind::RpcNotRegistered { fn_id: *fn_id }
            }
            _ => FailureKind::Other,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

impl TaskFailure {
    /// Rebuild the controller-side error for a failure reported by `worker`
    /// while running `operation`.
    pub fn into_error(self, worker: &WorkerAddress, operation: &str) -> CohortError {
        match self.kind {
            FailureKind::NotInitialized => CohortError::NotInitialized,
            FailureKind::AlreadyInitialized => CohortError::AlreadyInitialized,
            FailureKind::InvalidRoot { root, world_size } => {
                CohortError::InvalidRoot { root, world_size }
            }
            FailureKind::P2PNotEnabled => CohortError::P2PNotEnabled,
            FailureKind::TransportUnavailable => CohortError::TransportUnavailable,
            FailureKind::Timeout { timeout_ms } => CohortError::Timeout {
                operation: "worker task",
                timeout_ms,
            },
            FailureKind::RpcNotRegistered { fn_id } => CohortError::RpcNotRegistered { fn_id },
            FailureKind::Other => CohortError::OperationFailed {
                operation: operation.to_string(),
                failures: vec![(worker.clone(), self.message)],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_variants_roundtrip() {
        let session = SessionId::generate();
        let messages = vec![
            WorkerTask::OpenTransport { session },
            WorkerTask::BuildContext {
                session,
                clique: CliqueId::generate(),
                rank: 0,
                world_size: 1,
                peers: None,
            },
            WorkerTask::Teardown { session },
            WorkerTask::HasHandle { session },
            WorkerTask::Dispatch {
                session,
                op: Operation::SendRecv { n_trials: 5 },
            },
            WorkerTask::Rpc {
                fn_id: 3,
                payload: vec![1, 2, 3],
            },
        ];

        for task in messages {
            let msg = CohortMessage::Task { task_id: 1, task };
            let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&msg).unwrap();
            let back: CohortMessage =
                rkyv::from_bytes::<CohortMessage, rkyv::rancor::Error>(&bytes).unwrap();
            assert_eq!(msg, back, "roundtrip failed for {msg:?}");
        }
    }

    #[test]
    fn test_failure_preserves_kind() {
        let worker = WorkerAddress::from("w1");
        let err = CohortError::InvalidRoot {
            root: 5,
            world_size: 4,
        };
        let failure = TaskFailure::from(&err);
        assert!(matches!(
            failure.into_error(&worker, "dispatch"),
            CohortError::InvalidRoot {
                root: 5,
                world_size: 4
            }
        ));
    }

    #[test]
    fn test_other_failure_names_worker() {
        let worker = WorkerAddress::from("w3");
        let err = CohortError::CollectiveFailed {
            operation: "allgather",
            rank: 1,
            reason: "peer left".into(),
        };
        let rebuilt = TaskFailure::from(&err).into_error(&worker, "dispatch");
        match rebuilt {
            CohortError::OperationFailed { failures, .. } => {
                assert_eq!(failures[0].0, worker);
                assert!(failures[0].1.contains("peer left"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_task_names() {
        let session = SessionId::generate();
        assert_eq!(WorkerTask::Teardown { session }.name(), "teardown");
        assert_eq!(WorkerTask::HasHandle { session }.name(), "has_handle");
    }
}
