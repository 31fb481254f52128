use cohort::protocol::{TaskReply, WorkerTask};
use cohort::{Comms, CommsConfig, CommsOptions, LocalCluster, SessionId, TaskScheduler, WorkerAddress};
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so tests that expect a failure finish quickly.
pub fn test_config() -> CommsConfig {
    CommsConfig {
        task_timeout: Duration::from_secs(10),
        collective_timeout: Duration::from_secs(2),
        p2p_timeout: Duration::from_secs(1),
        ..CommsConfig::default()
    }
}

pub fn collective_only() -> CommsOptions {
    CommsOptions::default()
}

pub fn with_p2p() -> CommsOptions {
    CommsOptions {
        comms_p2p: true,
        verbose: false,
    }
}

/// Start an `n`-worker local cluster and an initialized controller over it.
pub async fn start(n: usize, options: CommsOptions) -> (Arc<LocalCluster>, Comms<LocalCluster>) {
    let cluster = Arc::new(LocalCluster::builder(n).config(test_config()).build());
    let mut comms = Comms::with_config(Arc::clone(&cluster), options, test_config());
    comms.init().await.unwrap();
    (cluster, comms)
}

/// Ask `worker` directly whether it holds a handle for `session`.
pub async fn has_handle(cluster: &LocalCluster, worker: &WorkerAddress, session: SessionId) -> bool {
    match cluster
        .submit(worker, WorkerTask::HasHandle { session })
        .await
        .unwrap()
    {
        TaskReply::Flag(flag) => flag,
        other => panic!("unexpected reply {other:?}"),
    }
}
