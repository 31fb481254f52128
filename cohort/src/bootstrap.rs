//! Point-to-point transport bootstrap.
//!
//! Every worker binds a listener for the session and reports its endpoint.
//! The resulting table travels with the build-context task so each worker
//! can open connections on demand.

use crate::clique::teardown;
use crate::error::{CohortError, Result};
use crate::protocol::{TaskReply, WorkerTask};
use crate::scheduler::{Pending, TaskScheduler, wait_all};
use crate::types::{SessionId, WorkerAddress};
use std::collections::HashMap;
use std::time::Duration;

/// Collect a transport endpoint from every member.
///
/// A single failure discards every staged listener. If every failure is a
/// missing transport engine the result is `TransportUnavailable`, which
/// callers may treat as "run without p2p".
pub async fn bootstrap<S: TaskScheduler + ?Sized>(
    scheduler: &S,
    session: SessionId,
    members: &[WorkerAddress],
    timeout: Duration,
) -> Result<HashMap<WorkerAddress, String>> {
    let pending: Pending<TaskReply> = members
        .iter()
        .map(|w| (w.clone(), scheduler.submit(w, WorkerTask::OpenTransport { session })))
        .collect();

    let mut endpoints = HashMap::with_capacity(members.len());
    let mut failures: Vec<(WorkerAddress, CohortError)> = Vec::new();
    for (worker, result) in wait_all(pending, timeout, "transport bootstrap").await {
        match result {
            Ok(TaskReply::Endpoint(endpoint)) => {
                endpoints.insert(worker, endpoint);
            }
            Ok(other) => {
                let reason = format!("unexpected reply {other:?}");
                failures.push((worker, CohortError::transport(reason)));
            }
            Err(e) => failures.push((worker, e)),
        }
    }
    if failures.is_empty() {
        tracing::debug!(%session, workers = endpoints.len(), "transport bootstrap complete");
        return Ok(endpoints);
    }

    let leftovers = teardown(scheduler, session, members, timeout).await;
    if !leftovers.is_empty() {
        tracing::warn!(%session, "{} worker(s) kept staged listeners", leftovers.len());
    }

    if failures
        .iter()
        .all(|(_, e)| matches!(e, CohortError::TransportUnavailable))
    {
        return Err(CohortError::TransportUnavailable);
    }
    if failures.len() == 1
        && let Some((_, e)) = failures.pop()
    {
        return Err(e);
    }
    Err(CohortError::OperationFailed {
        operation: "transport bootstrap".into(),
        failures: failures
            .into_iter()
            .map(|(w, e)| (w, e.to_string()))
            .collect(),
    })
}
