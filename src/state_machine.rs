use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster_info::Cluster;
use crate::error::{KronosError, Result};
use crate::types::{KronosCommand, NodeDescriptor, OracleState};

/// What applying a committed command did to the replicated state.
///
/// A rejection is not a raft-level error: the entry is committed everywhere
/// and no-ops identically on every node. The error inside is only reported
/// back to the local proposer, which re-reads the state and retries.
#[derive(Debug)]
pub enum ApplyOutcome {
    Accepted,
    Rejected(KronosError),
}

impl ApplyOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            ApplyOutcome::Accepted => Ok(()),
            ApplyOutcome::Rejected(err) => Err(err),
        }
    }
}

/// The replicated state machine: interprets the committed command stream,
/// owns the authoritative `OracleState`, and pushes membership changes into
/// the durable cluster metadata store.
pub struct TimeStateMachine {
    cluster: Arc<Cluster>,
    state: RwLock<OracleState>,
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    oracle: OracleState,
    nodes: Vec<NodeDescriptor>,
}

impl TimeStateMachine {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            state: RwLock::new(OracleState::default()),
        }
    }

    /// Consistent copy of the current oracle state.
    pub fn read_state(&self) -> OracleState {
        self.state.read().unwrap().clone()
    }

    /// Apply one committed command. `Err` means the apply itself failed
    /// (storage trouble); command-level rejections come back as
    /// `ApplyOutcome::Rejected`.
    pub fn apply(&self, command: &KronosCommand) -> Result<ApplyOutcome> {
        match command {
            KronosCommand::OracleClaim {
                proposer_id,
                proposed_time_cap,
                proposed_delta,
                epoch,
            } => Ok(self.apply_oracle_claim(proposer_id, *proposed_time_cap, *proposed_delta, *epoch)),
            KronosCommand::DeltaUpdate {
                oracle_id,
                new_time_cap,
                new_delta,
                epoch,
            } => Ok(self.apply_delta_update(oracle_id, *new_time_cap, *new_delta, *epoch)),
            KronosCommand::AddNode {
                node_id,
                raft_addr,
                grpc_addr,
            } => self.apply_add_node(node_id, raft_addr, grpc_addr),
            KronosCommand::RemoveNode { node_id } => self.apply_remove_node(node_id),
        }
    }

    fn apply_oracle_claim(
        &self,
        proposer_id: &str,
        proposed_time_cap: i64,
        proposed_delta: i64,
        epoch: u64,
    ) -> ApplyOutcome {
        let mut state = self.state.write().unwrap();
        if epoch != state.epoch + 1 {
            return ApplyOutcome::Rejected(KronosError::StaleEpoch);
        }
        if proposed_time_cap < state.oracle_time_cap {
            return ApplyOutcome::Rejected(KronosError::Rejected {
                reason: format!(
                    "claimed time cap {} is below the committed cap {}",
                    proposed_time_cap, state.oracle_time_cap
                ),
            });
        }
        info!(
            oracle = proposer_id,
            epoch,
            time_cap = proposed_time_cap,
            "oracle changed"
        );
        state.oracle_node_id = proposer_id.to_string();
        state.oracle_time_cap = proposed_time_cap;
        state.kronos_uptime_delta = proposed_delta;
        state.time_cap_delta = proposed_time_cap - proposed_delta;
        state.epoch = epoch;
        ApplyOutcome::Accepted
    }

    fn apply_delta_update(
        &self,
        oracle_id: &str,
        new_time_cap: i64,
        new_delta: i64,
        epoch: u64,
    ) -> ApplyOutcome {
        let mut state = self.state.write().unwrap();
        if oracle_id != state.oracle_node_id || epoch != state.epoch {
            return ApplyOutcome::Rejected(KronosError::StaleEpoch);
        }
        if new_time_cap < state.oracle_time_cap {
            return ApplyOutcome::Rejected(KronosError::Rejected {
                reason: format!(
                    "delta update rewinds time cap from {} to {}",
                    state.oracle_time_cap, new_time_cap
                ),
            });
        }
        state.oracle_time_cap = new_time_cap;
        state.kronos_uptime_delta = new_delta;
        state.time_cap_delta = new_time_cap - new_delta;
        ApplyOutcome::Accepted
    }

    fn apply_add_node(
        &self,
        node_id: &str,
        raft_addr: &str,
        grpc_addr: &str,
    ) -> Result<ApplyOutcome> {
        match self.cluster.descriptor(node_id) {
            Some(existing) if existing.is_removed => {
                return Ok(ApplyOutcome::Rejected(KronosError::Rejected {
                    reason: format!(
                        "node id {} was removed; re-adding requires a fresh id",
                        node_id
                    ),
                }));
            }
            // Replayed entry. The local addresses win even when they differ:
            // addresses are immutable per node id except through an operator
            // re-IP, which a replay must not undo.
            Some(_) => return Ok(ApplyOutcome::Accepted),
            None => {}
        }
        info!(node_id, raft_addr, grpc_addr, "adding cluster member");
        self.cluster.add_or_update(NodeDescriptor::new(
            node_id.to_string(),
            raft_addr.to_string(),
            grpc_addr.to_string(),
        ));
        self.cluster.persist()?;
        Ok(ApplyOutcome::Accepted)
    }

    fn apply_remove_node(&self, node_id: &str) -> Result<ApplyOutcome> {
        if self.cluster.descriptor(node_id).is_none() {
            return Ok(ApplyOutcome::Rejected(KronosError::Rejected {
                reason: format!("unknown node id: {}", node_id),
            }));
        }
        self.cluster.mark_removed(node_id)?;
        self.cluster.persist()?;

        let mut state = self.state.write().unwrap();
        if state.oracle_node_id == node_id {
            // The next tick on some live node will claim with epoch + 1.
            warn!(node_id, epoch = state.epoch, "removed node was the oracle");
            state.oracle_node_id = String::new();
        }
        Ok(ApplyOutcome::Accepted)
    }

    /// Serialize the full replicated state for a raft snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = StateSnapshot {
            oracle: self.read_state(),
            nodes: self.cluster.all_nodes(),
        };
        bincode::serialize(&snapshot)
            .map_err(|e| KronosError::serialization("serialize state snapshot", e))
    }

    /// Install a snapshot received from the leader. Membership learned here
    /// is persisted, which is how a long-dead node finds out about removals
    /// and re-additions it slept through. Local tombstones are never
    /// resurrected.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let snapshot: StateSnapshot = bincode::deserialize(data)
            .map_err(|e| KronosError::serialization("deserialize state snapshot", e))?;

        info!(
            oracle = %snapshot.oracle.oracle_node_id,
            epoch = snapshot.oracle.epoch,
            nodes = snapshot.nodes.len(),
            "restoring state machine from snapshot"
        );

        for desc in snapshot.nodes {
            match self.cluster.descriptor(&desc.node_id) {
                // Known member: only the tombstone can move, and only one
                // way. Local addresses stay (re-IP).
                Some(local) => {
                    if desc.is_removed && !local.is_removed {
                        self.cluster.mark_removed(&desc.node_id)?;
                    }
                }
                None => self.cluster.add_or_update(desc),
            }
        }
        self.cluster.persist()?;

        *self.state.write().unwrap() = snapshot.oracle;
        Ok(())
    }
}
