//! Rank assignment and clique formation across a set of workers.

use crate::error::{CohortError, Result};
use crate::protocol::{TaskReply, WorkerTask};
use crate::scheduler::{Pending, TaskScheduler, wait_all};
use crate::types::{CliqueId, Rank, SessionId, WorkerAddress};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Ranked membership of one session: worker `i` of the observed order gets
/// rank `i`.
#[derive(Debug, Clone)]
pub struct CliquePlan {
    clique: CliqueId,
    members: Vec<WorkerAddress>,
}

impl CliquePlan {
    pub fn new(workers: Vec<WorkerAddress>) -> Result<Self> {
        if workers.is_empty() {
            return Err(CohortError::EmptyCluster);
        }
        let mut seen = HashSet::with_capacity(workers.len());
        for w in &workers {
            if !seen.insert(w) {
                return Err(CohortError::DuplicateWorker { worker: w.clone() });
            }
        }
        Ok(Self {
            clique: CliqueId::generate(),
            members: workers,
        })
    }

    pub fn clique(&self) -> CliqueId {
        self.clique
    }

    pub fn world_size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn members(&self) -> &[WorkerAddress] {
        &self.members
    }

    pub fn rank_of(&self, worker: &WorkerAddress) -> Option<Rank> {
        self.members
            .iter()
            .position(|w| w == worker)
            .map(|i| i as Rank)
    }

    pub fn ranks(&self) -> impl Iterator<Item = (Rank, &WorkerAddress)> {
        self.members.iter().enumerate().map(|(i, w)| (i as Rank, w))
    }
}

/// Build a collective context on every member.
///
/// All-or-nothing: if any member fails, every member is torn down
/// (best-effort) before `CliqueFormation` is returned.
pub async fn form<S: TaskScheduler + ?Sized>(
    scheduler: &S,
    session: SessionId,
    plan: &CliquePlan,
    endpoints: Option<&HashMap<WorkerAddress, String>>,
    timeout: Duration,
) -> Result<()> {
    let peers: Option<Vec<(Rank, String)>> = endpoints.map(|eps| {
        plan.ranks()
            .filter_map(|(rank, w)| eps.get(w).map(|ep| (rank, ep.clone())))
            .collect()
    });

    let pending: Pending<TaskReply> = plan
        .ranks()
        .map(|(rank, w)| {
            let task = WorkerTask::BuildContext {
                session,
                clique: plan.clique(),
                rank,
                world_size: plan.world_size(),
                peers: peers.clone(),
            };
            (w.clone(), scheduler.submit(w, task))
        })
        .collect();

    let mut failures = Vec::new();
    for ((worker, result), expected) in wait_all(pending, timeout, "build_context")
        .await
        .into_iter()
        .zip(0..)
    {
        match result {
            Ok(TaskReply::Joined { rank }) if rank == expected => {
                tracing::trace!(%worker, rank, "rank confirmed");
            }
            Ok(other) => failures.push((worker, format!("expected rank {expected}, got {other:?}"))),
            Err(e) => failures.push((worker, e.to_string())),
        }
    }
    if failures.is_empty() {
        return Ok(());
    }

    tracing::warn!(
        %session,
        failed = failures.len(),
        "clique formation failed, tearing down"
    );
    let leftovers = teardown(scheduler, session, plan.members(), timeout).await;
    if !leftovers.is_empty() {
        tracing::warn!(%session, "teardown after failed formation left {} worker(s) dirty", leftovers.len());
    }
    Err(CohortError::CliqueFormation { failures })
}

/// Send `Teardown` to every worker and return the ones that failed.
pub async fn teardown<S: TaskScheduler + ?Sized>(
    scheduler: &S,
    session: SessionId,
    members: &[WorkerAddress],
    timeout: Duration,
) -> Vec<(WorkerAddress, String)> {
    let pending: Pending<TaskReply> = members
        .iter()
        .map(|w| (w.clone(), scheduler.submit(w, WorkerTask::Teardown { session })))
        .collect();

    wait_all(pending, timeout, "teardown")
        .await
        .into_iter()
        .filter_map(|(worker, result)| match result {
            Ok(TaskReply::Done) => None,
            Ok(other) => Some((worker, format!("unexpected reply {other:?}"))),
            Err(e) => Some((worker, e.to_string())),
        })
        .collect()
}
