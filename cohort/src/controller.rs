use crate::bootstrap::bootstrap;
use crate::clique::{self, CliquePlan};
use crate::config::CommsConfig;
use crate::dispatch::Operation;
use crate::error::{CohortError, Result};
use crate::protocol::{TaskReply, WorkerTask};
use crate::scheduler::{Pending, TaskScheduler, wait_all};
use crate::types::{Rank, SessionId, WorkerAddress};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle messages go to `info` when the session is verbose, `debug` otherwise.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommsOptions {
    /// Bootstrap the point-to-point transport before forming the clique.
    pub comms_p2p: bool,
    pub verbose: bool,
}

/// What the controller knows about one member of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub rank: Rank,
    /// Set when the point-to-point transport is up.
    pub p2p_endpoint: Option<String>,
}

struct Session {
    id: SessionId,
    plan: CliquePlan,
    endpoints: Option<HashMap<WorkerAddress, String>>,
}

/// Client-side owner of a communicator session.
///
/// Turns the scheduler's workers into a ranked clique on [`init`](Self::init)
/// and tears it down on [`destroy`](Self::destroy). The controller is the
/// only place that knows whether a session is live.
///
/// Dropping a `Comms` does not tear down workers; call `destroy()` first.
pub struct Comms<S: TaskScheduler> {
    scheduler: Arc<S>,
    options: CommsOptions,
    config: CommsConfig,
    session: Option<Session>,
    nccl_initialized: bool,
    ucx_initialized: bool,
}

impl<S: TaskScheduler> Comms<S> {
    pub fn new(scheduler: Arc<S>, options: CommsOptions) -> Self {
        Self::with_config(scheduler, options, CommsConfig::default())
    }

    pub fn with_config(scheduler: Arc<S>, options: CommsOptions, config: CommsConfig) -> Self {
        Self {
            scheduler,
            options,
            config,
            session: None,
            nccl_initialized: false,
            ucx_initialized: false,
        }
    }

    /// Form a new session over every worker the scheduler reports.
    ///
    /// With `comms_p2p`, the transport bootstrap runs first. Workers without
    /// a transport engine degrade the session to collective-only; any other
    /// bootstrap failure aborts.
    pub async fn init(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(CohortError::AlreadyInitialized);
        }
        let plan = CliquePlan::new(self.scheduler.workers())?;
        let id = SessionId::generate();
        let verbose = self.options.verbose;
        let timeout = self.config.task_timeout;
        lifecycle!(verbose, %id, workers = plan.world_size(), "initializing comms session");

        let endpoints = if self.options.comms_p2p {
            match bootstrap(self.scheduler.as_ref(), id, plan.members(), timeout).await {
                Ok(endpoints) => Some(endpoints),
                Err(CohortError::TransportUnavailable) => {
                    tracing::warn!(%id, "p2p transport unavailable, continuing collective-only");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        for (rank, worker) in plan.ranks() {
            tracing::debug!(%worker, rank, "assigned rank");
        }
        clique::form(self.scheduler.as_ref(), id, &plan, endpoints.as_ref(), timeout).await?;

        self.ucx_initialized = endpoints.is_some();
        self.nccl_initialized = true;
        lifecycle!(
            verbose,
            %id,
            p2p = self.ucx_initialized,
            "comms session initialized"
        );
        self.session = Some(Session {
            id,
            plan,
            endpoints,
        });
        Ok(())
    }

    /// Tear down every worker's handle and forget the session.
    ///
    /// Local state is cleared even when some workers fail; those are
    /// reported in `TeardownFailed`. A no-op when not initialized.
    pub async fn destroy(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.nccl_initialized = false;
        self.ucx_initialized = false;

        let failures = clique::teardown(
            self.scheduler.as_ref(),
            session.id,
            session.plan.members(),
            self.config.task_timeout,
        )
        .await;
        if !failures.is_empty() {
            tracing::warn!(id = %session.id, failed = failures.len(), "teardown incomplete");
            return Err(CohortError::TeardownFailed { workers: failures });
        }
        lifecycle!(self.options.verbose, id = %session.id, "comms session destroyed");
        Ok(())
    }

    pub fn nccl_initialized(&self) -> bool {
        self.nccl_initialized
    }

    pub fn ucx_initialized(&self) -> bool {
        self.ucx_initialized
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Members in rank order, as captured by `init()`.
    pub fn worker_addresses(&self) -> Result<&[WorkerAddress]> {
        Ok(self.session()?.plan.members())
    }

    pub fn worker_info(&self, addresses: &[WorkerAddress]) -> Result<HashMap<WorkerAddress, WorkerInfo>> {
        let session = self.session()?;
        addresses
            .iter()
            .map(|w| {
                let rank = session
                    .plan
                    .rank_of(w)
                    .ok_or_else(|| CohortError::UnknownWorker { worker: w.clone() })?;
                let p2p_endpoint = session
                    .endpoints
                    .as_ref()
                    .and_then(|eps| eps.get(w).cloned());
                Ok((w.clone(), WorkerInfo { rank, p2p_endpoint }))
            })
            .collect()
    }

    /// Run `op` on every member and require every one to succeed.
    pub async fn run(&self, op: Operation) -> Result<()> {
        let members = self.session()?.plan.members().to_vec();
        self.run_on(&members, op).await
    }

    /// Run `op` on a subset of members.
    ///
    /// Collectives need every member, so a strict subset normally fails once
    /// the engine's receive timeout fires; this is how a missing participant
    /// is observed.
    pub async fn run_on(&self, workers: &[WorkerAddress], op: Operation) -> Result<()> {
        let session = self.session()?;
        if let Some(stranger) = workers.iter().find(|w| session.plan.rank_of(w).is_none()) {
            return Err(CohortError::UnknownWorker {
                worker: stranger.clone(),
            });
        }

        let pending: Pending<TaskReply> = workers
            .iter()
            .map(|w| {
                let task = WorkerTask::Dispatch {
                    session: session.id,
                    op: op.clone(),
                };
                (w.clone(), self.scheduler.submit(w, task))
            })
            .collect();
        let results = wait_all(pending, self.config.task_timeout, "dispatch").await;
        aggregate(&op, results)
    }

    /// Call RPC `fn_id` on one worker. Does not require a session.
    pub async fn rpc(&self, worker: &WorkerAddress, fn_id: u16, payload: Vec<u8>) -> Result<Vec<u8>> {
        let fut = self.scheduler.submit(worker, WorkerTask::Rpc { fn_id, payload });
        let timeout = self.config.task_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(TaskReply::Payload(bytes))) => Ok(bytes),
            Ok(Ok(other)) => Err(CohortError::OperationFailed {
                operation: format!("rpc {fn_id}"),
                failures: vec![(worker.clone(), format!("unexpected reply {other:?}"))],
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CohortError::timeout("rpc", timeout)),
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(CohortError::NotInitialized)
    }
}

/// Fold per-worker dispatch results into one outcome.
///
/// When every worker failed with the same kind of error, that error is
/// returned as-is; anything else becomes `OperationFailed` naming each
/// failing worker.
fn aggregate(op: &Operation, results: Vec<(WorkerAddress, Result<TaskReply>)>) -> Result<()> {
    let total = results.len();
    let mut errors = Vec::new();
    let mut failures = Vec::new();
    for (worker, result) in results {
        match result {
            Ok(TaskReply::Flag(true)) => {}
            Ok(TaskReply::Flag(false)) => failures.push((worker, "received wrong values".to_string())),
            Ok(other) => failures.push((worker, format!("unexpected reply {other:?}"))),
            Err(e) => errors.push((worker, e)),
        }
    }
    if errors.is_empty() && failures.is_empty() {
        return Ok(());
    }

    if failures.is_empty() && errors.len() == total {
        let first = std::mem::discriminant(&errors[0].1);
        let uniform = errors
            .iter()
            .all(|(_, e)| std::mem::discriminant(e) == first);
        if uniform && !matches!(errors[0].1, CohortError::OperationFailed { .. }) {
            let (_, e) = errors.swap_remove(0);
            return Err(e);
        }
    }

    failures.extend(errors.into_iter().map(|(w, e)| (w, e.to_string())));
    Err(CohortError::OperationFailed {
        operation: op.to_string(),
        failures,
    })
}
