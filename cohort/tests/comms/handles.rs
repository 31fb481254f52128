use super::helpers::{collective_only, has_handle, start, with_p2p};
use cohort::{SessionId, TaskScheduler};

#[tokio::test]
async fn test_every_worker_holds_a_handle() {
    let (cluster, mut comms) = start(4, collective_only()).await;
    let session = comms.session_id().unwrap();

    for worker in cluster.workers() {
        assert!(has_handle(&cluster, &worker, session).await, "{worker} has no handle");
        let handle = cluster
            .service(&worker)
            .unwrap()
            .registry()
            .local_handle(&session)
            .unwrap();
        assert_eq!(handle.world_size(), 4);
        assert!(handle.p2p().is_none());
    }

    comms.destroy().await.unwrap();
    for worker in cluster.workers() {
        assert!(!has_handle(&cluster, &worker, session).await);
        assert_eq!(cluster.service(&worker).unwrap().registry().session_count(), 0);
    }
}

#[tokio::test]
async fn test_handle_ranks_match_worker_info() {
    let (cluster, comms) = start(3, with_p2p()).await;
    let session = comms.session_id().unwrap();
    let info = comms.worker_info(comms.worker_addresses().unwrap()).unwrap();

    for worker in cluster.workers() {
        let handle = cluster
            .service(&worker)
            .unwrap()
            .registry()
            .local_handle(&session)
            .unwrap();
        assert_eq!(handle.rank(), info[&worker].rank);
        assert_eq!(handle.p2p().map(|m| m.rank()), Some(handle.rank()));
    }
}

#[tokio::test]
async fn test_unknown_session_has_no_handle() {
    let (cluster, _comms) = start(2, collective_only()).await;
    let stranger = SessionId::generate();
    for worker in cluster.workers() {
        assert!(!has_handle(&cluster, &worker, stranger).await);
    }
}
