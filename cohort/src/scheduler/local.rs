use super::TaskScheduler;
use crate::config::CommsConfig;
use crate::engine::{CollectiveEngine, LocalCollectiveEngine};
use crate::error::{CohortError, Result};
use crate::protocol::{CohortMessage, TaskReply, WorkerTask, decode_message, encode_message};
use crate::rpc::{RpcHandler, RpcRegistry};
use crate::transport::TcpTransport;
use crate::types::WorkerAddress;
use crate::worker::WorkerService;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// An encoded task frame and where to send the encoded reply.
type Request = (Vec<u8>, oneshot::Sender<Vec<u8>>);

struct LocalWorker {
    address: WorkerAddress,
    service: Arc<WorkerService>,
    /// `None` once the worker has been stopped.
    inbox: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    serve_task: tokio::task::JoinHandle<()>,
}

/// In-process cluster: every worker is a tokio task serving encoded task
/// frames over a channel.
pub struct LocalCluster {
    workers: Vec<LocalWorker>,
    next_task_id: AtomicU64,
}

/// Configures a [`LocalCluster`]. Workers are named `worker-0`, `worker-1`, ...
pub struct LocalClusterBuilder {
    size: usize,
    config: CommsConfig,
    engine: Option<Arc<dyn CollectiveEngine>>,
    engine_overrides: HashMap<usize, Arc<dyn CollectiveEngine>>,
    without_transport: HashSet<usize>,
    rpc: RpcRegistry,
}

impl LocalClusterBuilder {
    pub fn config(mut self, config: CommsConfig) -> Self {
        self.config = config;
        self
    }

    /// Collective engine shared by every worker. Defaults to a
    /// [`LocalCollectiveEngine`] using the config's collective timeout.
    pub fn engine(mut self, engine: Arc<dyn CollectiveEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Give worker `index` its own engine.
    pub fn engine_for(mut self, index: usize, engine: Arc<dyn CollectiveEngine>) -> Self {
        self.engine_overrides.insert(index, engine);
        self
    }

    /// Start worker `index` without a point-to-point transport engine.
    pub fn without_transport(mut self, index: usize) -> Self {
        self.without_transport.insert(index);
        self
    }

    /// Register an RPC handler on every worker.
    pub fn rpc(mut self, fn_id: u16, handler: RpcHandler) -> Self {
        self.rpc.register(fn_id, handler);
        self
    }

    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn build(self) -> LocalCluster {
        let shared: Arc<dyn CollectiveEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(LocalCollectiveEngine::new(self.config.collective_timeout)),
        };
        let transport = TcpTransport::new(self.config.transport_bind);

        let workers = (0..self.size)
            .map(|i| {
                let address = WorkerAddress::new(format!("worker-{i}"));
                let engine = self
                    .engine_overrides
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&shared));
                let mut service = WorkerService::new(address.clone(), engine, self.config.clone())
                    .with_rpc(self.rpc.clone());
                if !self.without_transport.contains(&i) {
                    service = service.with_transport(transport.clone());
                }
                let service = Arc::new(service);

                let (tx, rx) = mpsc::unbounded_channel();
                let serve_task = tokio::spawn(serve(Arc::clone(&service), rx));
                LocalWorker {
                    address,
                    service,
                    inbox: Mutex::new(Some(tx)),
                    serve_task,
                }
            })
            .collect();

        tracing::debug!(size = self.size, "local cluster started");
        LocalCluster {
            workers,
            next_task_id: AtomicU64::new(0),
        }
    }
}

impl LocalCluster {
    pub fn builder(size: usize) -> LocalClusterBuilder {
        LocalClusterBuilder {
            size,
            config: CommsConfig::default(),
            engine: None,
            engine_overrides: HashMap::new(),
            without_transport: HashSet::new(),
            rpc: RpcRegistry::new(),
        }
    }

    /// `size` workers with default config.
    pub fn new(size: usize) -> Self {
        Self::builder(size).build()
    }

    /// The service behind `worker`, for inspecting its registry.
    pub fn service(&self, worker: &WorkerAddress) -> Option<Arc<WorkerService>> {
        self.find(worker).map(|w| Arc::clone(&w.service))
    }

    /// Stop serving `worker`. Later submissions to it fail with
    /// `WorkerUnreachable`; it stays listed in [`TaskScheduler::workers`].
    pub fn stop_worker(&self, worker: &WorkerAddress) -> Result<()> {
        let w = self.find(worker).ok_or_else(|| CohortError::UnknownWorker {
            worker: worker.clone(),
        })?;
        w.inbox
            .lock()
            .map_err(|_| CohortError::LockPoisoned("local worker inbox"))?
            .take();
        w.serve_task.abort();
        tracing::debug!(%worker, "local worker stopped");
        Ok(())
    }

    fn find(&self, worker: &WorkerAddress) -> Option<&LocalWorker> {
        self.workers.iter().find(|w| &w.address == worker)
    }

    fn sender(&self, worker: &WorkerAddress) -> Result<mpsc::UnboundedSender<Request>> {
        let w = self.find(worker).ok_or_else(|| unreachable(worker, "not in cluster"))?;
        let inbox = w
            .inbox
            .lock()
            .map_err(|_| CohortError::LockPoisoned("local worker inbox"))?;
        inbox.clone().ok_or_else(|| unreachable(worker, "worker stopped"))
    }
}

impl TaskScheduler for LocalCluster {
    fn workers(&self) -> Vec<WorkerAddress> {
        self.workers.iter().map(|w| w.address.clone()).collect()
    }

    fn submit(&self, worker: &WorkerAddress, task: WorkerTask) -> BoxFuture<'static, Result<TaskReply>> {
        let worker = worker.clone();
        let operation = task.name();
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let sender = self.sender(&worker);

        Box::pin(async move {
            let frame = encode_message(&CohortMessage::Task { task_id, task })?;
            let (reply_tx, reply_rx) = oneshot::channel();
            sender?
                .send((frame, reply_tx))
                .map_err(|_| unreachable(&worker, "worker stopped"))?;
            let bytes = reply_rx
                .await
                .map_err(|_| unreachable(&worker, "worker dropped the task"))?;

            match decode_message(&bytes)? {
                (_, CohortMessage::Reply { task_id: id, reply }) if id == task_id => {
                    reply.into_result(&worker, operation)
                }
                (_, other) => Err(CohortError::DecodeFailed(format!(
                    "worker {worker} answered task {task_id} with {other:?}"
                ))),
            }
        })
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for w in &self.workers {
            w.serve_task.abort();
        }
    }
}

/// Worker loop: each request is decoded and handled on its own task.
async fn serve(service: Arc<WorkerService>, mut inbox: mpsc::UnboundedReceiver<Request>) {
    while let Some((frame, reply_tx)) = inbox.recv().await {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let (task_id, task) = match decode_message(&frame) {
                Ok((_, CohortMessage::Task { task_id, task })) => (task_id, task),
                Ok((_, other)) => {
                    tracing::warn!(worker = %service.address(), "expected a task, got {other:?}");
                    return;
                }
                Err(e) => {
                    tracing::warn!(worker = %service.address(), "undecodable task frame: {e}");
                    return;
                }
            };
            let reply = CohortMessage::Reply {
                task_id,
                reply: service.handle_task(task).await,
            };
            match encode_message(&reply) {
                Ok(bytes) => {
                    let _ = reply_tx.send(bytes);
                }
                Err(e) => tracing::warn!(worker = %service.address(), "reply encode failed: {e}"),
            }
        });
    }
}

fn unreachable(worker: &WorkerAddress, reason: &str) -> CohortError {
    CohortError::WorkerUnreachable {
        worker: worker.clone(),
        reason: reason.to_string(),
    }
}
