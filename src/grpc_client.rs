//! gRPC client plumbing: channel construction plus thin wrappers used by the
//! oracle loop, the join flow and the CLI commands.

use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::config::{ADMIN_RPC_TIMEOUT, ORACLE_FETCH_TIMEOUT, RPC_TIMEOUT};
use crate::error::Result;
use crate::proto::admin_service_client::AdminServiceClient;
use crate::proto::time_service_client::TimeServiceClient;
use crate::proto::{
    AddNodeRequest, NodeLsRequest, NowRequest, OracleTimeRequest, StatusRequest,
};
use crate::types::NodeDescriptor;

pub async fn connect(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
    timeout: Duration,
) -> Result<Channel> {
    let scheme = if tls.is_some() { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, addr))?
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(1)));
    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls.clone())?;
    }
    Ok(endpoint.connect().await?)
}

pub async fn time_client(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
) -> Result<TimeServiceClient<Channel>> {
    Ok(TimeServiceClient::new(connect(addr, tls, RPC_TIMEOUT).await?))
}

pub async fn admin_client(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
) -> Result<AdminServiceClient<Channel>> {
    Ok(AdminServiceClient::new(
        connect(addr, tls, ADMIN_RPC_TIMEOUT).await?,
    ))
}

/// One oracle-time fetch attempt, bounded by `ORACLE_FETCH_TIMEOUT`.
pub async fn fetch_oracle_time(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
) -> Result<(i64, u64)> {
    let channel = connect(addr, tls, ORACLE_FETCH_TIMEOUT).await?;
    let mut client = TimeServiceClient::new(channel);
    let resp = client.oracle_time(OracleTimeRequest {}).await?.into_inner();
    Ok((resp.time, resp.epoch))
}

pub async fn fetch_now(addr: &str, tls: Option<&ClientTlsConfig>) -> Result<(i64, String, u64)> {
    let mut client = time_client(addr, tls).await?;
    let resp = client.now(NowRequest {}).await?.into_inner();
    Ok((resp.time, resp.oracle_id, resp.epoch))
}

pub async fn fetch_status(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
) -> Result<crate::proto::StatusResponse> {
    let mut client = time_client(addr, tls).await?;
    Ok(client.status(StatusRequest {}).await?.into_inner())
}

/// Ask an existing member to admit a new node; returns the assigned node id
/// and the member list as of admission.
pub async fn request_add_node(
    seed_addr: &str,
    tls: Option<&ClientTlsConfig>,
    raft_addr: &str,
    grpc_addr: &str,
) -> Result<(String, Vec<NodeDescriptor>)> {
    let mut client = admin_client(seed_addr, tls).await?;
    let resp = client
        .add_node(AddNodeRequest {
            raft_addr: raft_addr.to_string(),
            grpc_addr: grpc_addr.to_string(),
        })
        .await?
        .into_inner();
    let nodes = resp
        .nodes
        .into_iter()
        .map(|n| NodeDescriptor {
            node_id: n.node_id,
            raft_addr: n.raft_addr,
            grpc_addr: n.grpc_addr,
            is_removed: n.is_removed,
        })
        .collect();
    Ok((resp.node_id, nodes))
}

pub async fn fetch_node_ls(
    addr: &str,
    tls: Option<&ClientTlsConfig>,
) -> Result<Vec<NodeDescriptor>> {
    let mut client = admin_client(addr, tls).await?;
    let resp = client.node_ls(NodeLsRequest {}).await?.into_inner();
    Ok(resp
        .nodes
        .into_iter()
        .map(|n| NodeDescriptor {
            node_id: n.node_id,
            raft_addr: n.raft_addr,
            grpc_addr: n.grpc_addr,
            is_removed: n.is_removed,
        })
        .collect())
}
