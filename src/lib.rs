//! Kronos: a monotonic, cluster-synchronized time service.
//!
//! A small set of cooperating nodes agree on a single logical cluster time
//! that advances at roughly wall-clock rate, never goes backward anywhere,
//! and survives clock drift, restarts, membership changes and partitions.
//! One node at a time acts as the *oracle*, publishing the authoritative
//! time through a raft-replicated state machine; everyone else re-anchors
//! their local clock against it.

pub mod backup;
pub mod checksumfile;
pub mod cli;
pub mod clock;
pub mod cluster_info;
pub mod config;
pub mod error;
pub mod grpc_client;
pub mod grpc_server;
pub mod node;
pub mod node_shared;
pub mod oracle;
pub mod peer_connector;
pub mod raft_codec;
pub mod raft_manager;
pub mod raft_storage;
pub mod state_machine;
pub mod tls;
pub mod types;

// Generated gRPC code.
pub mod proto {
    tonic::include_proto!("kronos");
}
