//! In-process multi-node test harness.
//!
//! Each test node is a full `Node` (raft driver, gRPC listeners, oracle
//! loop) on loopback ports with an insecure transport and a fast oracle
//! tick, so whole-cluster scenarios run in one process.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use kronos::config::NodeConfig;
use kronos::error::{KronosError, Result};
use kronos::grpc_client;
use kronos::node::Node;
use kronos::proto::{DriftTimeConfig, RemoveNodeRequest, StatusResponse};

/// Fast tick so scenarios converge in a few seconds.
pub const TEST_TICK: Duration = Duration::from_millis(100);

/// Roughly the "stabilization buffer" of the acceptance scenarios, scaled
/// down to the test tick.
pub const STABILIZATION: Duration = Duration::from_secs(5);

pub fn get_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    let port = listener.local_addr().expect("failed to get local addr").port();
    drop(listener);
    port
}

pub struct TestNode {
    pub data_dir: TempDir,
    pub raft_port: u16,
    pub grpc_port: u16,
    pub node: Option<Node>,
}

impl TestNode {
    pub fn grpc_addr(&self) -> String {
        format!("127.0.0.1:{}", self.grpc_port)
    }

    pub fn is_running(&self) -> bool {
        self.node.is_some()
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    snap_count: u64,
}

impl TestCluster {
    pub async fn new(num_nodes: usize) -> Self {
        Self::new_with_snap_count(num_nodes, 1000).await
    }

    pub async fn new_with_snap_count(num_nodes: usize, snap_count: u64) -> Self {
        let mut cluster = Self {
            nodes: Vec::new(),
            snap_count,
        };
        for _ in 0..num_nodes {
            cluster.nodes.push(TestNode {
                data_dir: TempDir::new().expect("failed to create temp dir"),
                raft_port: get_available_port(),
                grpc_port: get_available_port(),
                node: None,
            });
        }
        for i in 0..num_nodes {
            cluster.start(i).await.expect("failed to start test node");
            // Let each joiner come up before admitting the next.
            cluster
                .wait_until(Duration::from_secs(30), |c| async move {
                    c.time(i).await.is_ok()
                })
                .await;
        }
        cluster
    }

    fn config(&self, index: usize) -> NodeConfig {
        let seeds = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| *i != index && n.is_running())
            .map(|(_, n)| n.grpc_addr())
            .collect();
        NodeConfig {
            data_dir: self.nodes[index].data_dir.path().to_path_buf(),
            advertise_host: "127.0.0.1".to_string(),
            raft_port: self.nodes[index].raft_port,
            grpc_port: self.nodes[index].grpc_port,
            seed_hosts: seeds,
            insecure: true,
            cert_dir: None,
            manage_oracle_tick_interval: TEST_TICK,
            raft_snap_count: self.snap_count,
            allow_drift_injection: true,
        }
    }

    pub async fn start(&mut self, index: usize) -> Result<()> {
        assert!(self.nodes[index].node.is_none(), "node already running");
        let node = Node::start(self.config(index)).await?;
        self.nodes[index].node = Some(node);
        Ok(())
    }

    pub async fn stop(&mut self, index: usize) {
        if let Some(node) = self.nodes[index].node.take() {
            node.stop().await;
        }
    }

    pub async fn restart(&mut self, index: usize) {
        self.stop(index).await;
        self.start(index).await.expect("failed to restart node");
    }

    /// Wipe a slot and join it back as a brand-new member (fresh node id).
    pub async fn start_fresh(&mut self, index: usize) {
        self.stop(index).await;
        self.nodes[index].data_dir = TempDir::new().expect("failed to create temp dir");
        self.start(index).await.expect("failed to start fresh node");
    }

    pub fn data_dir(&self, index: usize) -> PathBuf {
        self.nodes[index].data_dir.path().to_path_buf()
    }

    pub fn grpc_addr(&self, index: usize) -> String {
        self.nodes[index].grpc_addr()
    }

    pub fn running_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_running())
            .map(|(i, _)| i)
            .collect()
    }

    pub async fn time(&self, index: usize) -> Result<i64> {
        let (time, _, _) = grpc_client::fetch_now(&self.grpc_addr(index), None).await?;
        Ok(time)
    }

    pub async fn status(&self, index: usize) -> Result<StatusResponse> {
        grpc_client::fetch_status(&self.grpc_addr(index), None).await
    }

    pub async fn node_id(&self, index: usize) -> String {
        self.status(index).await.expect("status failed").node_id
    }

    pub async fn set_drift(&self, index: usize, drift_factor: f64, offset: i64) {
        let mut client = grpc_client::time_client(&self.grpc_addr(index), None)
            .await
            .expect("failed to connect");
        client
            .set_drift(DriftTimeConfig {
                drift_factor,
                offset,
            })
            .await
            .expect("set_drift failed");
    }

    pub async fn drift_config(&self, index: usize) -> DriftTimeConfig {
        self.status(index)
            .await
            .expect("status failed")
            .drift
            .expect("status carries drift config")
    }

    /// Which running node is the oracle, per the replicated state.
    pub async fn oracle(&self) -> Option<usize> {
        let indices = self.running_indices();
        let observer = *indices.first()?;
        let status = self.status(observer).await.ok()?;
        if status.oracle_id.is_empty() {
            return None;
        }
        for i in indices {
            if let Ok(s) = self.status(i).await {
                if s.node_id == status.oracle_id {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Propose a RemoveNode through whichever running node is leader.
    pub async fn remove_node_id(&self, node_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut last_err = String::new();
        while Instant::now() < deadline {
            for i in self.running_indices() {
                let mut client = match grpc_client::admin_client(&self.grpc_addr(i), None).await {
                    Ok(client) => client,
                    Err(e) => {
                        last_err = e.to_string();
                        continue;
                    }
                };
                match client
                    .remove_node(RemoveNodeRequest {
                        node_id: node_id.to_string(),
                    })
                    .await
                {
                    Ok(_) => return,
                    Err(e) => last_err = e.to_string(),
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!("remove_node({}) never succeeded: {}", node_id, last_err);
    }

    pub async fn is_removed_according_to(&self, observer: usize, node_id: &str) -> bool {
        let nodes = grpc_client::fetch_node_ls(&self.grpc_addr(observer), None)
            .await
            .expect("node_ls failed");
        nodes
            .iter()
            .any(|n| n.node_id == node_id && n.is_removed)
    }

    /// Query all (running) nodes back-to-back and return the worst pairwise
    /// time difference, normalized for the query latency between calls.
    pub async fn measure_spread(&self, only_running: bool) -> Result<i64> {
        let base = Instant::now();
        let mut normalized = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if only_running && !node.is_running() {
                continue;
            }
            let time = self.time(i).await?;
            normalized.push(time - base.elapsed().as_nanos() as i64);
        }
        let min = *normalized.iter().min().expect("no nodes measured");
        let max = *normalized.iter().max().expect("no nodes measured");
        Ok(max - min)
    }

    /// Poll until every queried node's time agrees within `threshold`.
    pub async fn wait_for_consensus(
        &self,
        threshold: Duration,
        timeout: Duration,
        only_running: bool,
    ) {
        let deadline = Instant::now() + timeout;
        let mut last: Result<i64> = Err(KronosError::Internal {
            message: "never measured".to_string(),
        });
        while Instant::now() < deadline {
            last = self.measure_spread(only_running).await;
            if let Ok(spread) = &last {
                if *spread <= threshold.as_nanos() as i64 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!(
            "cluster never converged within {:?}; last measurement: {:?}",
            threshold, last
        );
    }

    pub async fn wait_until<'a, F, Fut>(&'a self, timeout: Duration, mut check: F)
    where
        F: FnMut(&'a TestCluster) -> Fut,
        Fut: std::future::Future<Output = bool> + 'a,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check(self).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!("condition not met within {:?}", timeout);
    }

    pub async fn shutdown(mut self) {
        for i in 0..self.nodes.len() {
            self.stop(i).await;
        }
    }
}
