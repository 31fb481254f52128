use super::helpers::{collective_only, test_config};
use cohort::{CohortError, Comms, LocalCluster, TaskScheduler};
use std::sync::Arc;

const ECHO_LEN: u16 = 1;

#[tokio::test]
async fn test_rpc_on_each_worker() {
    let cluster = Arc::new(
        LocalCluster::builder(3)
            .config(test_config())
            .rpc(ECHO_LEN, Arc::new(|p: &[u8]| (p.len() as u32).to_le_bytes().to_vec()))
            .build(),
    );
    let comms = Comms::with_config(Arc::clone(&cluster), collective_only(), test_config());

    for worker in cluster.workers() {
        let reply = comms.rpc(&worker, ECHO_LEN, vec![0; 17]).await.unwrap();
        assert_eq!(reply, 17u32.to_le_bytes());
    }
}

#[tokio::test]
async fn test_rpc_unregistered() {
    let cluster = Arc::new(LocalCluster::builder(1).config(test_config()).build());
    let comms = Comms::with_config(Arc::clone(&cluster), collective_only(), test_config());
    let worker = cluster.workers()[0].clone();
    let err = comms.rpc(&worker, 99, Vec::new()).await.unwrap_err();
    assert!(matches!(err, CohortError::RpcNotRegistered { fn_id: 99 }));
}
