//! Node assembly: wires the metadata store, clock, state machine, raft
//! driver, gRPC listeners and oracle loop together, and owns their
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use raft::Storage as RaftStorageTrait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::cluster_info::{cluster_info_exists, Cluster, ClusterInfo};
use crate::config::{NodeConfig, RETRY_BACKOFF_MAX, RETRY_BACKOFF_MIN};
use crate::error::{KronosError, Result};
use crate::grpc_client;
use crate::grpc_server;
use crate::node_shared::SharedNodeState;
use crate::oracle::OracleLoop;
use crate::peer_connector::PeerConnector;
use crate::raft_manager::RaftManager;
use crate::raft_storage::RaftStorage;
use crate::state_machine::TimeStateMachine;
use crate::tls;
use crate::types::{generate_node_id, raft_id, KronosCommand, NodeDescriptor};

pub const RAFT_DB_FILENAME: &str = "kronos.db";

/// A running kronos node.
pub struct Node {
    shared: Arc<SharedNodeState>,
    shutdown_tx: watch::Sender<bool>,
    oracle_task: Option<JoinHandle<Result<()>>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let client_tls =
            tls::client_tls_for(config.insecure, config.cert_dir.as_deref()).await?;

        // Establish identity: rejoin with the persisted one, bootstrap a
        // fresh cluster, or join through a seed.
        let had_identity = cluster_info_exists(&config.data_dir);
        let bootstrap = !had_identity && config.seed_hosts.is_empty();
        let cluster = if had_identity {
            let cluster = Cluster::load(&config.data_dir)?;
            info!(node_id = %cluster.self_id(), "rejoining cluster with persisted identity");
            Arc::new(cluster)
        } else if bootstrap {
            let node_id = generate_node_id();
            info!(node_id = %node_id, "bootstrapping a new single-node cluster");
            let mut cluster_info = ClusterInfo::new(node_id.clone());
            cluster_info.nodes.insert(
                node_id.clone(),
                NodeDescriptor::new(node_id.clone(), config.raft_addr(), config.grpc_addr()),
            );
            Arc::new(Cluster::create(&config.data_dir, cluster_info)?)
        } else {
            let (node_id, members) = join_via_seeds(&config, client_tls.as_ref()).await?;
            info!(node_id = %node_id, "joined cluster through seed");
            let mut cluster_info = ClusterInfo::new(node_id.clone());
            for desc in members {
                cluster_info.nodes.insert(desc.node_id.clone(), desc);
            }
            cluster_info
                .nodes
                .entry(node_id.clone())
                .or_insert_with(|| {
                    NodeDescriptor::new(node_id.clone(), config.raft_addr(), config.grpc_addr())
                });
            Arc::new(Cluster::create(&config.data_dir, cluster_info)?)
        };

        if cluster.is_removed(&cluster.self_id()) {
            return Err(KronosError::Removed);
        }

        let storage = RaftStorage::open(&config.data_dir.join(RAFT_DB_FILENAME))?;
        if bootstrap {
            storage.initialize_single_node(raft_id(&cluster.self_id()))?;
        } else if !had_identity {
            storage.initialize_joining_node()?;
        }

        let clock = Arc::new(MonotonicClock::new());
        let state_machine = Arc::new(TimeStateMachine::new(cluster.clone()));
        let peers = Arc::new(PeerConnector::new(client_tls.clone()));
        peers.refresh(&cluster.all_nodes());

        // Replay starts from the persisted snapshot, if any.
        if storage.snapshot_index() > 0 {
            let snapshot = RaftStorageTrait::snapshot(&storage, 0, 0)
                .map_err(|e| KronosError::raft("load stored snapshot", e))?;
            if !snapshot.get_data().is_empty() {
                state_machine.restore(snapshot.get_data())?;
            }
        }

        let shared = Arc::new(SharedNodeState::new(
            config.clone(),
            cluster,
            clock,
            state_machine.clone(),
            peers.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut raft_manager, raft_handle) = RaftManager::new(
            shared.clone(),
            storage,
            state_machine,
            peers,
            shutdown_rx.clone(),
        )?;
        shared.set_raft(raft_handle.clone());

        if bootstrap {
            raft_manager.bootstrap_single_node().await?;
        }

        let mut background_tasks = Vec::new();
        background_tasks.push(tokio::spawn(raft_manager.run()));

        let server_tls = match (config.insecure, config.cert_dir.as_deref()) {
            (true, _) => None,
            (false, Some(cert_dir)) => Some(tls::server_tls_config(cert_dir).await?),
            (false, None) => {
                return Err(KronosError::Config(
                    "either --insecure or --cert-dir is required".into(),
                ))
            }
        };
        background_tasks.push(
            grpc_server::start_raft_server(shared.clone(), server_tls.clone(), shutdown_rx.clone())
                .await?,
        );
        background_tasks.push(
            grpc_server::start_time_server(shared.clone(), server_tls, shutdown_rx.clone()).await?,
        );

        if bootstrap {
            // Record our own membership in the replicated log so snapshots
            // and later joiners see the founding member.
            let cmd = KronosCommand::AddNode {
                node_id: shared.node_id().clone(),
                raft_addr: config.raft_addr(),
                grpc_addr: config.grpc_addr(),
            };
            let mut backoff = RETRY_BACKOFF_MIN;
            loop {
                match raft_handle.propose(cmd.clone()).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        debug!(error = %e, "retrying founding-member proposal");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let oracle_loop = OracleLoop::new(shared.clone(), client_tls);
        let oracle_task = tokio::spawn(oracle_loop.run(shutdown_rx));

        info!(
            node_id = %shared.node_id(),
            raft_addr = %config.raft_addr(),
            grpc_addr = %config.grpc_addr(),
            "kronos node started"
        );
        Ok(Self {
            shared,
            shutdown_tx,
            oracle_task: Some(oracle_task),
            background_tasks,
        })
    }

    pub fn shared(&self) -> Arc<SharedNodeState> {
        self.shared.clone()
    }

    /// Block until the node fails structurally (e.g. learns of its own
    /// removal). Returns `Ok(())` if the node was shut down instead.
    pub async fn wait(&mut self) -> Result<()> {
        match self.oracle_task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(KronosError::Internal {
                    message: format!("oracle loop panicked: {}", e),
                }),
            },
            None => Ok(()),
        }
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.peers().shutdown();

        if let Some(task) = self.oracle_task.take() {
            let _ = task.await;
        }
        for task in self.background_tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        if let Err(e) = self.shared.cluster().close() {
            warn!(error = %e, "failed to persist cluster metadata on shutdown");
        }
        info!(node_id = %self.shared.node_id(), "kronos node stopped");
    }
}

/// Ask each seed in turn (with backoff) to admit this node.
async fn join_via_seeds(
    config: &NodeConfig,
    tls: Option<&ClientTlsConfig>,
) -> Result<(String, Vec<NodeDescriptor>)> {
    let raft_addr = config.raft_addr();
    let grpc_addr = config.grpc_addr();
    let mut backoff = RETRY_BACKOFF_MIN;
    let mut last_err: Option<KronosError> = None;

    for _ in 0..30 {
        for seed in &config.seed_hosts {
            match grpc_client::request_add_node(seed, tls, &raft_addr, &grpc_addr).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed did not admit us yet");
                    last_err = Some(e);
                }
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
    }
    Err(last_err.unwrap_or_else(|| {
        KronosError::Cluster("no seed hosts configured".to_string())
    }))
}
