//! Command-line front-end.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::backup;
use crate::config::{parse_duration, NodeConfig};
use crate::error::{KronosError, Result};
use crate::grpc_client;
use crate::node::Node;
use crate::tls;

#[derive(Parser)]
#[command(name = "kronos")]
#[command(version)]
#[command(about = "Monotonic, cluster-synchronized time service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone)]
pub struct ClientOpts {
    /// Host of the node to talk to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// gRPC port of the node to talk to
    #[arg(long, default_value_t = 5767)]
    pub port: u16,

    /// Use plaintext instead of TLS
    #[arg(long)]
    pub insecure: bool,

    /// Directory holding ca.crt, node.crt and node.key
    #[arg(long)]
    pub cert_dir: Option<PathBuf>,
}

impl ClientOpts {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a kronos node
    Start {
        /// Host other members use to reach this node
        #[arg(long, default_value = "127.0.0.1")]
        advertise_host: String,

        /// Port for the raft peer transport
        #[arg(long, default_value_t = 5766)]
        raft_port: u16,

        /// Port for the time and admin services
        #[arg(long, default_value_t = 5767)]
        grpc_port: u16,

        /// Data directory for cluster metadata and the raft log
        #[arg(long, default_value = "./kronos-data")]
        data_dir: PathBuf,

        /// Comma-separated gRPC addresses of existing members to join through
        #[arg(long, value_delimiter = ',')]
        seed_hosts: Vec<String>,

        /// Use plaintext instead of TLS
        #[arg(long)]
        insecure: bool,

        /// Directory holding ca.crt, node.crt and node.key
        #[arg(long)]
        cert_dir: Option<PathBuf>,

        /// Oracle loop tick interval (e.g. 1s, 250ms)
        #[arg(long, default_value = "1s")]
        manage_oracle_tick_interval: String,

        /// Snapshot the replicated state after this many applied entries
        #[arg(long, default_value_t = 1000)]
        raft_snap_count: u64,

        /// Allow the test-only SetDrift RPC on this node
        #[arg(long)]
        drift_clock: bool,
    },

    /// Print a node's status
    Status {
        #[command(flatten)]
        client: ClientOpts,
    },

    /// Print a node's current cluster time
    Time {
        #[command(flatten)]
        client: ClientOpts,
    },

    /// Admit a new node to the cluster
    AddNode {
        #[command(flatten)]
        client: ClientOpts,

        /// Raft transport address of the new node
        #[arg(long)]
        raft_addr: String,

        /// gRPC address of the new node
        #[arg(long)]
        grpc_addr: String,
    },

    /// Remove a node from the cluster
    RemoveNode {
        #[command(flatten)]
        client: ClientOpts,

        /// Id of the node to remove
        #[arg(long)]
        node_id: String,
    },

    /// List cluster members, tombstones included
    NodeLs {
        #[command(flatten)]
        client: ClientOpts,
    },

    /// Archive a stopped node's data directory
    Backup {
        #[arg(long)]
        data_dir: PathBuf,

        /// Archive file to write
        #[arg(long)]
        file: PathBuf,
    },

    /// Restore a stopped node's data directory from an archive
    Restore {
        #[arg(long)]
        data_dir: PathBuf,

        /// Archive file to read
        #[arg(long)]
        file: PathBuf,
    },

    /// Rewrite peer addresses in a stopped node's cluster metadata
    ReIp {
        #[arg(long)]
        data_dir: PathBuf,

        /// old_grpc_addr=new_raft_addr,new_grpc_addr (repeatable)
        #[arg(long = "mapping", required = true)]
        mappings: Vec<String>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start {
            advertise_host,
            raft_port,
            grpc_port,
            data_dir,
            seed_hosts,
            insecure,
            cert_dir,
            manage_oracle_tick_interval,
            raft_snap_count,
            drift_clock,
        } => {
            let config = NodeConfig {
                data_dir,
                advertise_host,
                raft_port,
                grpc_port,
                seed_hosts,
                insecure,
                cert_dir,
                manage_oracle_tick_interval: parse_duration(&manage_oracle_tick_interval)?,
                raft_snap_count,
                allow_drift_injection: drift_clock,
            };
            let mut node = Node::start(config).await?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                    node.stop().await;
                    Ok(())
                }
                result = node.wait() => {
                    node.stop().await;
                    result
                }
            }
        }

        Commands::Status { client } => {
            let tls = tls::client_tls_for(client.insecure, client.cert_dir.as_deref()).await?;
            let status = grpc_client::fetch_status(&client.addr(), tls.as_ref()).await?;
            println!("node id:     {}", status.node_id);
            println!("role:        {}", status.role);
            println!("oracle:      {}", status.oracle_id);
            println!("epoch:       {}", status.epoch);
            println!("time cap:    {}", status.oracle_time_cap);
            println!("raft leader: {:x}", status.raft_leader);
            println!("raft term:   {}", status.raft_term);
            println!("members:");
            for node in status.nodes {
                let removed = if node.is_removed { " (removed)" } else { "" };
                println!(
                    "  {} raft={} grpc={}{}",
                    node.node_id, node.raft_addr, node.grpc_addr, removed
                );
            }
            Ok(())
        }

        Commands::Time { client } => {
            let tls = tls::client_tls_for(client.insecure, client.cert_dir.as_deref()).await?;
            let (time, oracle_id, epoch) =
                grpc_client::fetch_now(&client.addr(), tls.as_ref()).await?;
            println!("{}", time);
            println!("oracle: {} epoch: {}", oracle_id, epoch);
            Ok(())
        }

        Commands::AddNode {
            client,
            raft_addr,
            grpc_addr,
        } => {
            let tls = tls::client_tls_for(client.insecure, client.cert_dir.as_deref()).await?;
            let (node_id, _) = grpc_client::request_add_node(
                &client.addr(),
                tls.as_ref(),
                &raft_addr,
                &grpc_addr,
            )
            .await?;
            println!("{}", node_id);
            Ok(())
        }

        Commands::RemoveNode { client, node_id } => {
            let tls = tls::client_tls_for(client.insecure, client.cert_dir.as_deref()).await?;
            let mut admin = grpc_client::admin_client(&client.addr(), tls.as_ref()).await?;
            admin
                .remove_node(crate::proto::RemoveNodeRequest { node_id })
                .await
                .map_err(KronosError::Rpc)?;
            Ok(())
        }

        Commands::NodeLs { client } => {
            let tls = tls::client_tls_for(client.insecure, client.cert_dir.as_deref()).await?;
            let nodes = grpc_client::fetch_node_ls(&client.addr(), tls.as_ref()).await?;
            for node in nodes {
                let removed = if node.is_removed { " (removed)" } else { "" };
                println!(
                    "{} raft={} grpc={}{}",
                    node.node_id, node.raft_addr, node.grpc_addr, removed
                );
            }
            Ok(())
        }

        Commands::Backup { data_dir, file } => backup::backup(&data_dir, &file),

        Commands::Restore { data_dir, file } => backup::restore(&data_dir, &file),

        Commands::ReIp { data_dir, mappings } => {
            let mappings = mappings
                .iter()
                .map(|m| m.parse())
                .collect::<Result<Vec<_>>>()?;
            backup::re_ip(&data_dir, &mappings)
        }
    }
}
