use super::helpers::{collective_only, start};
use cohort::{CohortError, CollectiveKind, Operation};

const WORKERS: usize = 4;

/// Every valid root succeeds on every worker; `root == N` is rejected.
async fn check_kind(kind: CollectiveKind) {
    let (_cluster, mut comms) = start(WORKERS, collective_only()).await;

    for root in 0..WORKERS as u32 {
        comms
            .run(Operation::Collective { kind, root })
            .await
            .unwrap_or_else(|e| panic!("{kind} root={root}: {e}"));
    }

    let err = comms
        .run(Operation::Collective {
            kind,
            root: WORKERS as u32,
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, CohortError::InvalidRoot { root: 4, world_size: 4 }),
        "{kind}: unexpected {err:?}"
    );

    comms.destroy().await.unwrap();
}

#[tokio::test]
async fn test_allreduce() {
    check_kind(CollectiveKind::Allreduce).await;
}

#[tokio::test]
async fn test_allgather() {
    check_kind(CollectiveKind::Allgather).await;
}

#[tokio::test]
async fn test_allgatherv() {
    check_kind(CollectiveKind::Allgatherv).await;
}

#[tokio::test]
async fn test_broadcast() {
    check_kind(CollectiveKind::Broadcast).await;
}

#[tokio::test]
async fn test_inplace_broadcast() {
    check_kind(CollectiveKind::InplaceBroadcast).await;
}

#[tokio::test]
async fn test_reduce() {
    check_kind(CollectiveKind::Reduce).await;
}

#[tokio::test]
async fn test_reduce_scatter() {
    check_kind(CollectiveKind::ReduceScatter).await;
}

#[tokio::test]
async fn test_barrier_repeated() {
    let (_cluster, comms) = start(5, collective_only()).await;
    for _ in 0..3 {
        comms.run(Operation::Barrier).await.unwrap();
    }
}

#[tokio::test]
async fn test_kinds_interleaved() {
    let (_cluster, comms) = start(3, collective_only()).await;
    for kind in CollectiveKind::ALL {
        comms
            .run(Operation::Collective { kind, root: 1 })
            .await
            .unwrap_or_else(|e| panic!("{kind}: {e}"));
    }
}

#[tokio::test]
async fn test_missing_participant_fails() {
    let (_cluster, comms) = start(3, collective_only()).await;
    let subset = comms.worker_addresses().unwrap()[..2].to_vec();
    let result = comms
        .run_on(
            &subset,
            Operation::Collective {
                kind: CollectiveKind::Allreduce,
                root: 0,
            },
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_split_into_sub_cliques() {
    let (_cluster, mut comms) = start(WORKERS, collective_only()).await;
    for color_mod in [1, 2, 3] {
        comms
            .run(Operation::Split { color_mod })
            .await
            .unwrap_or_else(|e| panic!("color_mod={color_mod}: {e}"));
    }
    // The parent clique is untouched by its splits.
    comms
        .run(Operation::Collective {
            kind: CollectiveKind::Allreduce,
            root: 0,
        })
        .await
        .unwrap();

    let err = comms.run(Operation::Split { color_mod: 0 }).await.unwrap_err();
    assert!(matches!(err, CohortError::OperationFailed { .. }), "got {err:?}");
    comms.destroy().await.unwrap();
}
