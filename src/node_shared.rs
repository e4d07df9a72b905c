//! State shared between the RPC handlers, the raft driver and the oracle
//! loop. Everything here is Send + Sync and safe behind an `Arc`.

use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use crate::clock::MonotonicClock;
use crate::cluster_info::Cluster;
use crate::config::NodeConfig;
use crate::error::{KronosError, Result};
use crate::peer_connector::PeerConnector;
use crate::raft_manager::RaftHandle;
use crate::state_machine::TimeStateMachine;
use crate::types::{raft_id, NodeId, NodeRole};

#[derive(Debug, Clone, Default)]
pub struct RaftStatus {
    pub is_leader: bool,
    pub leader_id: u64,
    pub term: u64,
    pub voters: Vec<u64>,
}

pub struct SharedNodeState {
    pub config: NodeConfig,
    node_id: NodeId,
    raft_node_id: u64,
    cluster: Arc<Cluster>,
    clock: Arc<MonotonicClock>,
    state_machine: Arc<TimeStateMachine>,
    peers: Arc<PeerConnector>,
    raft: Mutex<Option<RaftHandle>>,
    raft_status: RwLock<RaftStatus>,
    role: RwLock<NodeRole>,
}

impl SharedNodeState {
    pub fn new(
        config: NodeConfig,
        cluster: Arc<Cluster>,
        clock: Arc<MonotonicClock>,
        state_machine: Arc<TimeStateMachine>,
        peers: Arc<PeerConnector>,
    ) -> Self {
        let node_id = cluster.self_id();
        let raft_node_id = raft_id(&node_id);
        Self {
            config,
            node_id,
            raft_node_id,
            cluster,
            clock,
            state_machine,
            peers,
            raft: Mutex::new(None),
            raft_status: RwLock::new(RaftStatus::default()),
            role: RwLock::new(NodeRole::Unknown),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn raft_node_id(&self) -> u64 {
        self.raft_node_id
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.clock
    }

    pub fn state_machine(&self) -> &Arc<TimeStateMachine> {
        &self.state_machine
    }

    pub fn peers(&self) -> &Arc<PeerConnector> {
        &self.peers
    }

    pub fn set_raft(&self, handle: RaftHandle) {
        *self.raft.lock().unwrap() = Some(handle);
    }

    pub fn raft(&self) -> Result<RaftHandle> {
        self.raft
            .lock()
            .unwrap()
            .clone()
            .ok_or(KronosError::ShuttingDown)
    }

    pub fn update_raft_status(&self, status: RaftStatus) {
        *self.raft_status.write().unwrap() = status;
    }

    pub fn raft_status(&self) -> RaftStatus {
        self.raft_status.read().unwrap().clone()
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read().unwrap()
    }

    pub fn set_role(&self, role: NodeRole) {
        let mut current = self.role.write().unwrap();
        if *current != role {
            info!(from = %*current, to = %role, "oracle role changed");
            *current = role;
        }
    }

    /// True once a committed RemoveNode has tombstoned this node.
    pub fn is_self_removed(&self) -> bool {
        self.cluster.is_removed(&self.node_id)
    }
}
