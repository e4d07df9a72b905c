use serde::{Deserialize, Serialize};

/// Opaque node identity, unique per node instance (not per host).
/// 32 lowercase hex chars; regenerated whenever a node is wiped and re-added.
pub type NodeId = String;

pub fn generate_node_id() -> NodeId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Raft wants integer ids; derive one from the leading 64 bits of the node id.
pub fn raft_id(node_id: &str) -> u64 {
    if node_id.len() >= 16 {
        if let Ok(id) = u64::from_str_radix(&node_id[..16], 16) {
            return id;
        }
    }
    // Non-hex ids (hand-written configs) fall back to an FNV-1a fold.
    node_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

/// One member of the cluster. Descriptors are never deleted: removal flips
/// `is_removed` so that a long-dead returnee can still learn its own fate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub raft_addr: String,
    pub grpc_addr: String,
    pub is_removed: bool,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, raft_addr: String, grpc_addr: String) -> Self {
        Self {
            node_id,
            raft_addr,
            grpc_addr,
            is_removed: false,
        }
    }
}

/// Replicated output of the time state machine. All times are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleState {
    /// Empty until the first committed claim, and after the oracle is removed.
    pub oracle_node_id: NodeId,
    /// Largest cluster time the oracle has promised; never rewound.
    pub oracle_time_cap: i64,
    /// Anchors cluster time to the oracle's local monotonic reading.
    pub kronos_uptime_delta: i64,
    pub time_cap_delta: i64,
    /// Bumped on every oracle change; stale epochs are rejected.
    pub epoch: u64,
}

impl OracleState {
    pub fn has_oracle(&self) -> bool {
        !self.oracle_node_id.is_empty()
    }
}

/// Test-only simulated clock drift, applied via the SetDrift RPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftTimeConfig {
    /// Scale applied to monotonic ticks, within [0, 2].
    pub drift_factor: f64,
    pub offset_ns: i64,
}

impl Default for DriftTimeConfig {
    fn default() -> Self {
        Self {
            drift_factor: 1.0,
            offset_ns: 0,
        }
    }
}

/// Commands replicated through the raft log and interpreted by the
/// time state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KronosCommand {
    OracleClaim {
        proposer_id: NodeId,
        proposed_time_cap: i64,
        proposed_delta: i64,
        epoch: u64,
    },
    DeltaUpdate {
        oracle_id: NodeId,
        new_time_cap: i64,
        new_delta: i64,
        epoch: u64,
    },
    AddNode {
        node_id: NodeId,
        raft_addr: String,
        grpc_addr: String,
    },
    RemoveNode {
        node_id: NodeId,
    },
}

/// A node's view of its own role in the oracle protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Unknown,
    Follower,
    Oracle,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unknown => write!(f, "unknown"),
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Oracle => write!(f, "oracle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_hex_and_unique() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_raft_id_is_stable() {
        let id = generate_node_id();
        assert_eq!(raft_id(&id), raft_id(&id));
        assert_eq!(
            raft_id("00000000000000ff0000000000000000"),
            0xff
        );
    }

    #[test]
    fn test_raft_id_non_hex_fallback() {
        assert_ne!(raft_id("node-one"), 0);
        assert_ne!(raft_id("node-one"), raft_id("node-two"));
    }
}
