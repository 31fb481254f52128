use super::helpers::{collective_only, start, test_config, with_p2p};
use cohort::{CohortError, Comms, LocalCluster, Operation, WorkerAddress};
use std::sync::Arc;

#[tokio::test]
async fn test_init_without_p2p() {
    let (_cluster, comms) = start(4, collective_only()).await;
    assert!(comms.nccl_initialized());
    assert!(!comms.ucx_initialized());
    assert!(comms.session_id().is_some());

    let info = comms.worker_info(comms.worker_addresses().unwrap()).unwrap();
    assert_eq!(info.len(), 4);
    let mut ranks: Vec<u32> = info.values().map(|i| i.rank).collect();
    ranks.sort();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
    assert!(info.values().all(|i| i.p2p_endpoint.is_none()));
}

#[tokio::test]
async fn test_init_with_p2p() {
    let (_cluster, comms) = start(3, with_p2p()).await;
    assert!(comms.nccl_initialized());
    assert!(comms.ucx_initialized());

    let info = comms.worker_info(comms.worker_addresses().unwrap()).unwrap();
    assert!(info.values().all(|i| i.p2p_endpoint.is_some()));
}

#[tokio::test]
async fn test_ranks_follow_scheduler_order() {
    let (_cluster, comms) = start(3, collective_only()).await;
    let addresses = comms.worker_addresses().unwrap().to_vec();
    let info = comms.worker_info(&addresses).unwrap();
    for (i, worker) in addresses.iter().enumerate() {
        assert_eq!(info[worker].rank as usize, i);
    }
}

#[tokio::test]
async fn test_single_worker() {
    let (_cluster, comms) = start(1, collective_only()).await;
    let info = comms.worker_info(comms.worker_addresses().unwrap()).unwrap();
    assert_eq!(info.len(), 1);
    comms.run(Operation::Barrier).await.unwrap();
}

#[tokio::test]
async fn test_double_init_rejected() {
    let (_cluster, mut comms) = start(2, collective_only()).await;
    let session = comms.session_id();

    let err = comms.init().await.unwrap_err();
    assert!(matches!(err, CohortError::AlreadyInitialized));
    assert_eq!(comms.session_id(), session);
    assert!(comms.nccl_initialized());
    comms.run(Operation::Barrier).await.unwrap();
}

#[tokio::test]
async fn test_empty_cluster_rejected() {
    let cluster = Arc::new(LocalCluster::new(0));
    let mut comms = Comms::with_config(cluster, collective_only(), test_config());
    let err = comms.init().await.unwrap_err();
    assert!(matches!(err, CohortError::EmptyCluster));
    assert!(!comms.nccl_initialized());
    assert!(comms.session_id().is_none());
}

#[tokio::test]
async fn test_accessors_before_init() {
    let cluster = Arc::new(LocalCluster::new(2));
    let comms = Comms::with_config(cluster, collective_only(), test_config());
    assert!(matches!(
        comms.worker_addresses(),
        Err(CohortError::NotInitialized)
    ));
    assert!(matches!(
        comms.worker_info(&[WorkerAddress::from("worker-0")]),
        Err(CohortError::NotInitialized)
    ));
    assert!(matches!(
        comms.run(Operation::Barrier).await,
        Err(CohortError::NotInitialized)
    ));
    assert!(!comms.nccl_initialized());
    assert!(!comms.ucx_initialized());
}

#[tokio::test]
async fn test_worker_info_unknown_address() {
    let (_cluster, comms) = start(2, collective_only()).await;
    let err = comms
        .worker_info(&[WorkerAddress::from("worker-0"), WorkerAddress::from("elsewhere")])
        .unwrap_err();
    match err {
        CohortError::UnknownWorker { worker } => assert_eq!(worker.as_str(), "elsewhere"),
        other => panic!("unexpected {other:?}"),
    }
}
