use super::helpers::{collective_only, has_handle, start, test_config, with_p2p};
use cohort::protocol::WorkerTask;
use cohort::{CohortError, CollectiveKind, Comms, LocalCluster, Operation, TaskScheduler};
use std::sync::Arc;

#[tokio::test]
async fn test_reinit_gives_new_session() {
    let (cluster, mut comms) = start(3, collective_only()).await;
    let first = comms.session_id().unwrap();
    let members = comms.worker_addresses().unwrap().to_vec();

    comms.destroy().await.unwrap();
    comms.init().await.unwrap();

    let second = comms.session_id().unwrap();
    assert_ne!(first, second);
    assert_eq!(comms.worker_addresses().unwrap(), members.as_slice());
    for worker in cluster.workers() {
        assert!(!has_handle(&cluster, &worker, first).await);
        assert!(has_handle(&cluster, &worker, second).await);
    }
    comms.run(Operation::Barrier).await.unwrap();
}

#[tokio::test]
async fn test_destroy_then_run_not_initialized() {
    let (cluster, mut comms) = start(2, collective_only()).await;
    let session = comms.session_id().unwrap();
    comms.destroy().await.unwrap();

    assert!(!comms.nccl_initialized());
    assert!(comms.session_id().is_none());
    assert!(matches!(
        comms.run(Operation::Barrier).await,
        Err(CohortError::NotInitialized)
    ));

    // Workers reject the stale session id too.
    let worker = cluster.workers()[0].clone();
    let err = cluster
        .submit(
            &worker,
            WorkerTask::Dispatch {
                session,
                op: Operation::Barrier,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::NotInitialized));
}

#[tokio::test]
async fn test_destroy_when_not_initialized_is_noop() {
    let cluster = Arc::new(LocalCluster::new(2));
    let mut comms = Comms::with_config(cluster, collective_only(), test_config());
    comms.destroy().await.unwrap();
    comms.destroy().await.unwrap();
}

#[tokio::test]
async fn test_destroy_clears_p2p_state() {
    let (_cluster, mut comms) = start(2, with_p2p()).await;
    assert!(comms.ucx_initialized());
    comms.destroy().await.unwrap();
    assert!(!comms.ucx_initialized());

    comms.init().await.unwrap();
    assert!(comms.ucx_initialized());
    comms
        .run(Operation::SendRecv { n_trials: 1 })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_four_worker_scenario() {
    let (_cluster, mut comms) = start(4, collective_only()).await;
    assert!(comms.nccl_initialized());
    assert!(!comms.ucx_initialized());

    let addresses = comms.worker_addresses().unwrap().to_vec();
    let info = comms.worker_info(&addresses).unwrap();
    let mut ranks: Vec<u32> = info.values().map(|i| i.rank).collect();
    ranks.sort();
    assert_eq!(ranks, vec![0, 1, 2, 3]);

    for root in 0..4 {
        comms
            .run(Operation::Collective {
                kind: CollectiveKind::Allreduce,
                root,
            })
            .await
            .unwrap();
    }

    comms.destroy().await.unwrap();
    assert!(matches!(
        comms.worker_info(&addresses),
        Err(CohortError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_independent_sessions_share_workers() {
    let cluster = Arc::new(LocalCluster::builder(3).config(test_config()).build());
    let mut a = Comms::with_config(Arc::clone(&cluster), collective_only(), test_config());
    let mut b = Comms::with_config(Arc::clone(&cluster), collective_only(), test_config());
    a.init().await.unwrap();
    b.init().await.unwrap();
    assert_ne!(a.session_id(), b.session_id());

    a.run(Operation::Barrier).await.unwrap();
    b.run(Operation::Barrier).await.unwrap();
    a.destroy().await.unwrap();
    b.run(Operation::Barrier).await.unwrap();
    b.destroy().await.unwrap();
}
