//! Behavior under simulated clock drift.

mod common;

use std::time::{Duration, Instant};

use common::{TestCluster, STABILIZATION, TEST_TICK};

#[tokio::test]
async fn test_consensus_bound_under_drift() {
    let cluster = TestCluster::new(4).await;
    tokio::time::sleep(STABILIZATION).await;
    cluster
        .wait_for_consensus(Duration::from_millis(50), Duration::from_secs(30), false)
        .await;

    // Fixed factors spanning the acceptance range [0.95, 1.05].
    let factors = [0.95, 0.98, 1.02, 1.05];
    for (i, factor) in factors.iter().enumerate() {
        cluster.set_drift(i, *factor, 0).await;
    }

    // The spread may widen between oracle syncs, but stays bounded while
    // drift is live.
    let bound = Duration::from_millis(100).as_nanos() as i64;
    for _ in 0..15 {
        let spread = cluster
            .measure_spread(false)
            .await
            .expect("spread measurement failed");
        assert!(spread <= bound, "spread {}ns exceeds bound {}ns", spread, bound);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cluster_rate_follows_oracle_drift() {
    let cluster = TestCluster::new(3).await;
    tokio::time::sleep(STABILIZATION).await;
    cluster
        .wait_for_consensus(Duration::from_millis(50), Duration::from_secs(30), false)
        .await;

    let oracle = cluster.oracle().await.expect("no oracle elected");
    let drift_factor = 1.05;
    cluster.set_drift(oracle, drift_factor, 0).await;
    tokio::time::sleep(5 * TEST_TICK).await;

    let mut old_times = Vec::new();
    for i in 0..3 {
        old_times.push(cluster.time(i).await.expect("time query failed"));
    }
    let wall_start = Instant::now();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let wall_elapsed = wall_start.elapsed().as_nanos() as f64;

    let mut new_times = Vec::new();
    for i in 0..3 {
        new_times.push(cluster.time(i).await.expect("time query failed"));
    }

    // RPC latency and sync cadence put a floor on the achievable precision.
    let slack = (wall_elapsed * 0.05) as i64 + 50_000_000;

    let oracle_elapsed = new_times[oracle] - old_times[oracle];
    let expected = (drift_factor * wall_elapsed) as i64;
    assert!(
        (oracle_elapsed - expected).abs() <= slack,
        "oracle advanced {}ns, expected ~{}ns",
        oracle_elapsed,
        expected
    );

    // Every node's flow of time matches the oracle's.
    for i in 0..3 {
        let elapsed = new_times[i] - old_times[i];
        assert!(
            (elapsed - oracle_elapsed).abs() <= slack,
            "node {} advanced {}ns while the oracle advanced {}ns",
            i,
            elapsed,
            oracle_elapsed
        );
    }

    // The injected config is visible in diagnostics.
    let drift = cluster.drift_config(oracle).await;
    assert!((drift.drift_factor - drift_factor).abs() < f64::EPSILON);

    cluster.shutdown().await;
}
