//! gRPC services: time queries, membership administration, and the raft
//! peer transport. The time/admin services share one listener; the raft
//! transport gets its own on the raft port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::config::{RETRY_BACKOFF_MAX, RETRY_BACKOFF_MIN};
use crate::error::{KronosError, Result};
use crate::node_shared::SharedNodeState;
use crate::proto::admin_service_server::{AdminService, AdminServiceServer};
use crate::proto::raft_transport_server::{RaftTransport, RaftTransportServer};
use crate::proto::time_service_server::{TimeService, TimeServiceServer};
use crate::proto::{
    AddNodeRequest, AddNodeResponse, DriftTimeConfig as ProtoDriftTimeConfig, NodeLsRequest,
    NodeLsResponse, NowRequest, NowResponse, OracleTimeRequest, OracleTimeResponse, RaftAck,
    RaftPayload, RemoveNodeRequest, RemoveNodeResponse, SetDriftResponse, StatusRequest,
    StatusResponse,
};
use crate::raft_codec;
use crate::raft_manager::{ConfChangeKind, RaftHandle};
use crate::types::{generate_node_id, raft_id, DriftTimeConfig, KronosCommand, NodeDescriptor, NodeRole};

fn error_to_status(err: KronosError) -> Status {
    match err {
        KronosError::NotLeader => Status::failed_precondition("not the raft leader"),
        KronosError::NotOracle => Status::failed_precondition("not the current oracle"),
        KronosError::Removed => Status::failed_precondition("node removed"),
        KronosError::StaleEpoch => Status::failed_precondition("stale oracle epoch"),
        KronosError::Rejected { reason } => Status::failed_precondition(reason),
        KronosError::Timeout { operation } => {
            Status::deadline_exceeded(format!("timed out during {}", operation))
        }
        KronosError::Config(msg) => Status::invalid_argument(msg),
        KronosError::Cluster(msg) => Status::failed_precondition(msg),
        KronosError::ShuttingDown => Status::unavailable("node is shutting down"),
        other => Status::internal(other.to_string()),
    }
}

/// Raft admits one configuration change at a time; a proposal raced against
/// an in-flight change is dropped and worth retrying, but only while this
/// node is still the leader.
async fn propose_conf_change_with_retry(
    shared: &SharedNodeState,
    raft: &RaftHandle,
    kind: ConfChangeKind,
    raft_id: u64,
    raft_addr: String,
) -> Result<()> {
    let mut backoff = RETRY_BACKOFF_MIN;
    let mut last_err = KronosError::NotLeader;
    for _ in 0..20 {
        match raft
            .propose_conf_change(kind, raft_id, raft_addr.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(KronosError::NotLeader) if shared.raft_status().is_leader => {
                last_err = KronosError::NotLeader;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

fn descriptor_to_proto(desc: NodeDescriptor) -> crate::proto::NodeDescriptor {
    crate::proto::NodeDescriptor {
        node_id: desc.node_id,
        raft_addr: desc.raft_addr,
        grpc_addr: desc.grpc_addr,
        is_removed: desc.is_removed,
    }
}

pub struct TimeServiceImpl {
    shared: Arc<SharedNodeState>,
}

impl TimeServiceImpl {
    pub fn new(shared: Arc<SharedNodeState>) -> Self {
        Self { shared }
    }

    fn check_not_removed(&self) -> std::result::Result<(), Status> {
        if self.shared.is_self_removed() {
            return Err(error_to_status(KronosError::Removed));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl TimeService for TimeServiceImpl {
    async fn now(
        &self,
        _request: Request<NowRequest>,
    ) -> std::result::Result<Response<NowResponse>, Status> {
        self.check_not_removed()?;
        let state = self.shared.state_machine().read_state();
        Ok(Response::new(NowResponse {
            time: self.shared.clock().now_nanos(),
            oracle_id: state.oracle_node_id,
            epoch: state.epoch,
        }))
    }

    async fn oracle_time(
        &self,
        _request: Request<OracleTimeRequest>,
    ) -> std::result::Result<Response<OracleTimeResponse>, Status> {
        self.check_not_removed()?;
        let state = self.shared.state_machine().read_state();
        let is_oracle = self.shared.role() == NodeRole::Oracle
            && state.oracle_node_id == *self.shared.node_id();
        if !is_oracle {
            return Err(error_to_status(KronosError::NotOracle));
        }
        Ok(Response::new(OracleTimeResponse {
            time: self.shared.clock().now_nanos(),
            epoch: state.epoch,
        }))
    }

    async fn set_drift(
        &self,
        request: Request<ProtoDriftTimeConfig>,
    ) -> std::result::Result<Response<SetDriftResponse>, Status> {
        if !self.shared.config.allow_drift_injection {
            return Err(Status::permission_denied(
                "drift injection is not enabled on this node",
            ));
        }
        let req = request.into_inner();
        let cfg = DriftTimeConfig {
            drift_factor: req.drift_factor,
            offset_ns: req.offset,
        };
        self.shared
            .clock()
            .set_drift_config(cfg)
            .map_err(error_to_status)?;
        info!(drift_factor = req.drift_factor, offset = req.offset, "drift config updated");
        Ok(Response::new(SetDriftResponse {}))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let state = self.shared.state_machine().read_state();
        let raft_status = self.shared.raft_status();
        let drift = self.shared.clock().drift_config();
        let nodes = self
            .shared
            .cluster()
            .all_nodes()
            .into_iter()
            .map(descriptor_to_proto)
            .collect();
        Ok(Response::new(StatusResponse {
            node_id: self.shared.node_id().clone(),
            role: self.shared.role().to_string(),
            oracle_id: state.oracle_node_id,
            epoch: state.epoch,
            oracle_time_cap: state.oracle_time_cap,
            raft_leader: raft_status.leader_id,
            raft_term: raft_status.term,
            nodes,
            drift: Some(ProtoDriftTimeConfig {
                drift_factor: drift.drift_factor,
                offset: drift.offset_ns,
            }),
        }))
    }
}

pub struct AdminServiceImpl {
    shared: Arc<SharedNodeState>,
}

impl AdminServiceImpl {
    pub fn new(shared: Arc<SharedNodeState>) -> Self {
        Self { shared }
    }

    /// A node id whose derived raft id collides with an existing member is
    /// regenerated; 64 random bits make this all but unreachable.
    fn fresh_node_id(&self) -> std::result::Result<String, Status> {
        let existing: Vec<u64> = self
            .shared
            .cluster()
            .all_nodes()
            .iter()
            .map(|d| raft_id(&d.node_id))
            .collect();
        for _ in 0..8 {
            let candidate = generate_node_id();
            if !existing.contains(&raft_id(&candidate)) {
                return Ok(candidate);
            }
        }
        Err(Status::internal("could not generate a unique node id"))
    }
}

#[tonic::async_trait]
impl AdminService for AdminServiceImpl {
    async fn add_node(
        &self,
        request: Request<AddNodeRequest>,
    ) -> std::result::Result<Response<AddNodeResponse>, Status> {
        let req = request.into_inner();
        if req.raft_addr.is_empty() || req.grpc_addr.is_empty() {
            return Err(Status::invalid_argument(
                "raft_addr and grpc_addr are required",
            ));
        }

        // A retried join (e.g. the first reply timed out on the caller's
        // side) must get its original id back, not a second membership.
        if let Some(existing) = self
            .shared
            .cluster()
            .all_nodes()
            .into_iter()
            .find(|d| !d.is_removed && d.raft_addr == req.raft_addr && d.grpc_addr == req.grpc_addr)
        {
            let nodes = self
                .shared
                .cluster()
                .all_nodes()
                .into_iter()
                .map(descriptor_to_proto)
                .collect();
            return Ok(Response::new(AddNodeResponse {
                node_id: existing.node_id,
                nodes,
            }));
        }

        let node_id = self.fresh_node_id()?;
        let raft = self.shared.raft().map_err(error_to_status)?;

        raft.propose(KronosCommand::AddNode {
            node_id: node_id.clone(),
            raft_addr: req.raft_addr.clone(),
            grpc_addr: req.grpc_addr.clone(),
        })
        .await
        .map_err(error_to_status)?;

        if let Err(e) = propose_conf_change_with_retry(
            &self.shared,
            &raft,
            ConfChangeKind::AddVoter,
            raft_id(&node_id),
            req.raft_addr,
        )
        .await
        {
            // The membership entry committed but the voter never joined;
            // tombstone the id so the caller can retry with a fresh one.
            let _ = raft
                .propose(KronosCommand::RemoveNode {
                    node_id: node_id.clone(),
                })
                .await;
            return Err(error_to_status(e));
        }

        info!(node_id = %node_id, "admitted new cluster member");
        let nodes = self
            .shared
            .cluster()
            .all_nodes()
            .into_iter()
            .map(descriptor_to_proto)
            .collect();
        Ok(Response::new(AddNodeResponse { node_id, nodes }))
    }

    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> std::result::Result<Response<RemoveNodeResponse>, Status> {
        let req = request.into_inner();
        let desc = match self.shared.cluster().descriptor(&req.node_id) {
            None => return Err(Status::not_found(format!("unknown node id: {}", req.node_id))),
            Some(desc) => desc,
        };
        if desc.is_removed {
            // Idempotent, but repair a half-finished removal where the
            // tombstone committed and the voter did not go away.
            if self
                .shared
                .raft_status()
                .voters
                .contains(&raft_id(&req.node_id))
            {
                let raft = self.shared.raft().map_err(error_to_status)?;
                propose_conf_change_with_retry(
                    &self.shared,
                    &raft,
                    ConfChangeKind::RemoveVoter,
                    raft_id(&req.node_id),
                    String::new(),
                )
                .await
                .map_err(error_to_status)?;
            }
            return Ok(Response::new(RemoveNodeResponse {}));
        }

        let raft = self.shared.raft().map_err(error_to_status)?;
        raft.propose(KronosCommand::RemoveNode {
            node_id: req.node_id.clone(),
        })
        .await
        .map_err(error_to_status)?;

        propose_conf_change_with_retry(
            &self.shared,
            &raft,
            ConfChangeKind::RemoveVoter,
            raft_id(&req.node_id),
            String::new(),
        )
        .await
        .map_err(error_to_status)?;

        info!(node_id = %req.node_id, "removed cluster member");
        Ok(Response::new(RemoveNodeResponse {}))
    }

    async fn node_ls(
        &self,
        _request: Request<NodeLsRequest>,
    ) -> std::result::Result<Response<NodeLsResponse>, Status> {
        let nodes = self
            .shared
            .cluster()
            .all_nodes()
            .into_iter()
            .map(descriptor_to_proto)
            .collect();
        Ok(Response::new(NodeLsResponse { nodes }))
    }
}

pub struct RaftTransportImpl {
    shared: Arc<SharedNodeState>,
}

impl RaftTransportImpl {
    pub fn new(shared: Arc<SharedNodeState>) -> Self {
        Self { shared }
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportImpl {
    async fn send(
        &self,
        request: Request<RaftPayload>,
    ) -> std::result::Result<Response<RaftAck>, Status> {
        let payload = request.into_inner();
        let msg = match raft_codec::deserialize_message(&payload.data) {
            Ok(msg) => msg,
            Err(e) => {
                return Ok(Response::new(RaftAck {
                    success: false,
                    error: e.to_string(),
                }))
            }
        };
        let raft = self.shared.raft().map_err(error_to_status)?;
        match raft.step_message(payload.from, msg) {
            Ok(()) => Ok(Response::new(RaftAck {
                success: true,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(RaftAck {
                success: false,
                error: e.to_string(),
            })),
        }
    }
}

/// Serve the time and admin services on the grpc port.
pub async fn start_time_server(
    shared: Arc<SharedNodeState>,
    tls: Option<ServerTlsConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = shared
        .config
        .grpc_addr()
        .parse()
        .map_err(|e| KronosError::Config(format!("invalid grpc address: {}", e)))?;

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    let router = builder
        .add_service(TimeServiceServer::new(TimeServiceImpl::new(shared.clone())))
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(shared)));

    Ok(tokio::spawn(async move {
        if let Err(e) = router
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await
        {
            error!(error = %e, %addr, "time service listener failed");
        }
    }))
}

/// Serve the raft transport on the raft port.
pub async fn start_raft_server(
    shared: Arc<SharedNodeState>,
    tls: Option<ServerTlsConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = shared
        .config
        .raft_addr()
        .parse()
        .map_err(|e| KronosError::Config(format!("invalid raft address: {}", e)))?;

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    let router = builder.add_service(RaftTransportServer::new(RaftTransportImpl::new(shared)));

    Ok(tokio::spawn(async move {
        if let Err(e) = router
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await
        {
            error!(error = %e, %addr, "raft transport listener failed");
        }
    }))
}
