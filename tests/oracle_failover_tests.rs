//! Oracle failure and takeover.

mod common;

use std::time::Duration;

use common::{TestCluster, STABILIZATION};

#[tokio::test]
async fn test_new_oracle_after_oracle_stops() {
    let mut cluster = TestCluster::new(3).await;
    tokio::time::sleep(STABILIZATION).await;
    cluster
        .wait_for_consensus(Duration::from_millis(50), Duration::from_secs(30), false)
        .await;

    let old_oracle = cluster.oracle().await.expect("no oracle elected");
    let old_oracle_id = cluster.node_id(old_oracle).await;
    let old_epoch = cluster
        .status((old_oracle + 1) % 3)
        .await
        .expect("status failed")
        .epoch;

    cluster.stop(old_oracle).await;

    // A survivor claims oracleship at a higher epoch.
    cluster
        .wait_until(Duration::from_secs(30), |c| async move {
            match c.oracle().await {
                Some(idx) => idx != old_oracle,
                None => false,
            }
        })
        .await;
    cluster
        .wait_for_consensus(Duration::from_millis(100), Duration::from_secs(30), true)
        .await;

    let observer = cluster.running_indices()[0];
    let status = cluster.status(observer).await.expect("status failed");
    assert_ne!(status.oracle_id, old_oracle_id, "oracle did not change");
    assert!(
        status.epoch > old_epoch,
        "epoch did not advance: {} -> {}",
        old_epoch,
        status.epoch
    );

    // The old oracle rejoins as a follower and converges.
    cluster.start(old_oracle).await.expect("restart failed");
    tokio::time::sleep(STABILIZATION).await;
    cluster
        .wait_for_consensus(Duration::from_millis(100), Duration::from_secs(60), false)
        .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_epoch_rises_across_repeated_failovers() {
    let mut cluster = TestCluster::new(3).await;
    tokio::time::sleep(STABILIZATION).await;
    cluster
        .wait_for_consensus(Duration::from_millis(50), Duration::from_secs(30), false)
        .await;

    let mut last_epoch = 0;
    for _ in 0..2 {
        let oracle = cluster.oracle().await.expect("no oracle elected");
        cluster.stop(oracle).await;

        cluster
            .wait_until(Duration::from_secs(30), |c| async move {
                match c.oracle().await {
                    Some(idx) => idx != oracle,
                    None => false,
                }
            })
            .await;

        let observer = cluster.running_indices()[0];
        let epoch = cluster.status(observer).await.expect("status failed").epoch;
        assert!(epoch > last_epoch, "epoch stalled at {}", epoch);
        last_epoch = epoch;

        cluster.start(oracle).await.expect("restart failed");
        tokio::time::sleep(STABILIZATION).await;
    }

    cluster
        .wait_for_consensus(Duration::from_millis(100), Duration::from_secs(60), false)
        .await;
    cluster.shutdown().await;
}
