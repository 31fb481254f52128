use super::helpers::{collective_only, start, with_p2p};
use cohort::{CohortError, Operation};

#[tokio::test]
async fn test_send_recv_one_trial() {
    let (_cluster, comms) = start(4, with_p2p()).await;
    comms
        .run(Operation::SendRecv { n_trials: 1 })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_send_recv_five_trials() {
    let (_cluster, comms) = start(4, with_p2p()).await;
    comms
        .run(Operation::SendRecv { n_trials: 5 })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_send_recv_repeated_calls() {
    let (_cluster, comms) = start(3, with_p2p()).await;
    for _ in 0..3 {
        comms
            .run(Operation::SendRecv { n_trials: 2 })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_send_recv_without_p2p() {
    let (_cluster, comms) = start(2, collective_only()).await;
    let err = comms
        .run(Operation::SendRecv { n_trials: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::P2PNotEnabled));
}

#[tokio::test]
async fn test_send_recv_withheld_worker_fails() {
    let (_cluster, comms) = start(4, with_p2p()).await;
    let subset = comms.worker_addresses().unwrap()[..3].to_vec();
    for n_trials in [1, 5] {
        let result = comms.run_on(&subset, Operation::SendRecv { n_trials }).await;
        assert!(result.is_err(), "n_trials={n_trials} succeeded without rank 3");
    }
}

#[tokio::test]
async fn test_send_recv_mixed_with_collectives() {
    let (_cluster, comms) = start(3, with_p2p()).await;
    comms.run(Operation::Barrier).await.unwrap();
    comms
        .run(Operation::SendRecv { n_trials: 3 })
        .await
        .unwrap();
    comms.run(Operation::Barrier).await.unwrap();
}
