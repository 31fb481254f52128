//! Boundary to whatever runs tasks on workers.

mod local;

pub use local::{LocalCluster, LocalClusterBuilder};

use crate::error::{CohortError, Result};
use crate::protocol::{TaskReply, WorkerTask};
use crate::types::WorkerAddress;
use futures::future::BoxFuture;
use std::time::Duration;

/// Delivers tasks to named workers and collects their replies.
pub trait TaskScheduler: Send + Sync {
    /// Workers currently reachable, in a stable order.
    fn workers(&self) -> Vec<WorkerAddress>;

    /// Submit `task` to `worker`.
    ///
    /// Resolves to the worker's reply; a `Failed` reply comes back as the
    /// matching error. Delivery problems surface as `WorkerUnreachable`.
    fn submit(&self, worker: &WorkerAddress, task: WorkerTask) -> BoxFuture<'static, Result<TaskReply>>;
}

/// Outstanding task futures, one per worker.
pub type Pending<T> = Vec<(WorkerAddress, BoxFuture<'static, Result<T>>)>;

/// Await every future against one shared deadline.
///
/// Results come back in submission order. A future still pending at the
/// deadline yields `Timeout` for its worker; the others keep their results.
pub async fn wait_all<T>(
    pending: Pending<T>,
    timeout: Duration,
    operation: &'static str,
) -> Vec<(WorkerAddress, Result<T>)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let waits = pending.into_iter().map(|(worker, fut)| async move {
        let result = match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(CohortError::timeout(operation, timeout)),
        };
        (worker, result)
    });
    futures::future::join_all(waits).await
}
