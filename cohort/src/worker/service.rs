use super::registry::{Handle, WorkerRegistry};
use crate::config::CommsConfig;
use crate::dispatch::dispatch;
use crate::engine::CollectiveEngine;
use crate::error::{CohortError, Result};
use crate::protocol::{TaskFailure, TaskReply, WorkerTask};
use crate::rpc::RpcRegistry;
use crate::transport::TcpTransport;
use crate::types::WorkerAddress;
use std::sync::Arc;

/// Everything a worker process needs to serve controller tasks.
pub struct WorkerService {
    address: WorkerAddress,
    registry: WorkerRegistry,
    engine: Arc<dyn CollectiveEngine>,
    transport: Option<TcpTransport>,
    rpc: RpcRegistry,
    config: CommsConfig,
}

impl WorkerService {
    /// A worker with a collective engine and no point-to-point transport.
    pub fn new(address: WorkerAddress, engine: Arc<dyn CollectiveEngine>, config: CommsConfig) -> Self {
        Self {
            address,
            registry: WorkerRegistry::new(),
            engine,
            transport: None,
            rpc: RpcRegistry::new(),
            config,
        }
    }

    pub fn with_transport(mut self, transport: TcpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_rpc(mut self, rpc: RpcRegistry) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Run one task. Failures are flattened into [`TaskReply::Failed`].
    pub async fn handle_task(&self, task: WorkerTask) -> TaskReply {
        let name = task.name();
        match self.run(task).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(worker = %self.address, task = name, "task failed: {e}");
                TaskReply::Failed(TaskFailure::from(&e))
            }
        }
    }

    async fn run(&self, task: WorkerTask) -> Result<TaskReply> {
        match task {
            WorkerTask::OpenTransport { session } => {
                let transport = self
                    .transport
                    .as_ref()
                    .ok_or(CohortError::TransportUnavailable)?;
                self.registry.ensure_live(&session)?;
                let staged = transport.listen().await?;
                let endpoint = staged.endpoint();
                // A retired session drops the listener here.
                self.registry.stage_transport(session, staged)?;
                Ok(TaskReply::Endpoint(endpoint))
            }

            WorkerTask::BuildContext {
                session,
                clique,
                rank,
                world_size,
                peers,
            } => {
                self.registry.ensure_live(&session)?;
                if self.registry.local_handle(&session).is_some() {
                    return Err(CohortError::AlreadyInitialized);
                }
                let p2p = match peers {
                    Some(peers) => {
                        let staged = self
                            .registry
                            .take_staged(&session)?
                            .ok_or(CohortError::TransportUnavailable)?;
                        Some(staged.into_mesh(rank, &peers, self.config.p2p_timeout)?)
                    }
                    None => None,
                };
                let collective = self.engine.create_context(clique, rank, world_size).await?;
                let handle = Handle::new(session, rank, world_size, Arc::clone(&collective), p2p);
                if let Err(e) = self.registry.register(handle) {
                    // Torn down while the rendezvous was in flight.
                    collective.destroy();
                    tracing::debug!(worker = %self.address, %session, "discarding late context: {e}");
                    return Err(e);
                }
                tracing::debug!(worker = %self.address, rank, world_size, %session, "joined clique");
                Ok(TaskReply::Joined { rank })
            }

            WorkerTask::Teardown { session } => {
                if let Some(handle) = self.registry.remove(&session)? {
                    handle.close();
                    tracing::debug!(worker = %self.address, %session, "handle destroyed");
                }
                Ok(TaskReply::Done)
            }

            WorkerTask::HasHandle { session } => {
                Ok(TaskReply::Flag(self.registry.local_handle(&session).is_some()))
            }

            WorkerTask::Dispatch { session, op } => {
                let handle = self
                    .registry
                    .local_handle(&session)
                    .ok_or(CohortError::NotInitialized)?;
                let ok = dispatch(&handle, &op).await?;
                if !ok {
                    tracing::warn!(worker = %self.address, rank = handle.rank(), %op, "verification failed");
                }
                Ok(TaskReply::Flag(ok))
            }

            WorkerTask::Rpc { fn_id, payload } => Ok(TaskReply::Payload(self.rpc.call(fn_id, &payload)?)),
        }
    }
}
