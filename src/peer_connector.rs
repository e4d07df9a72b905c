//! Peer connection management for the raft transport.
//!
//! Outgoing raft messages are routed into a per-peer queue, each drained by
//! its own task holding a cached gRPC client. A slow or dead peer therefore
//! never stalls traffic to healthy ones; its queue just fills up and drops,
//! which raft tolerates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use raft::prelude::Message;
use tokio::sync::mpsc;
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::{debug, warn};

use crate::config::RPC_TIMEOUT;
use crate::grpc_client;
use crate::proto::raft_transport_client::RaftTransportClient;
use crate::proto::RaftPayload;
use crate::raft_codec;
use crate::types::{raft_id, NodeDescriptor};

const PEER_QUEUE_DEPTH: usize = 256;

pub struct PeerConnector {
    tls: Option<ClientTlsConfig>,
    raft_addrs: RwLock<HashMap<u64, String>>,
    senders: Mutex<HashMap<u64, mpsc::Sender<Message>>>,
}

impl PeerConnector {
    pub fn new(tls: Option<ClientTlsConfig>) -> Self {
        Self {
            tls,
            raft_addrs: RwLock::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_peer(&self, id: u64, raft_addr: String) {
        let mut addrs = self.raft_addrs.write().unwrap();
        let changed = addrs.get(&id).map(|a| a != &raft_addr).unwrap_or(true);
        addrs.insert(id, raft_addr);
        if changed {
            // Force a reconnect with the new address.
            self.senders.lock().unwrap().remove(&id);
        }
    }

    pub fn remove_peer(&self, id: u64) {
        self.raft_addrs.write().unwrap().remove(&id);
        self.senders.lock().unwrap().remove(&id);
    }

    /// Reconcile the peer map with the current membership.
    pub fn refresh(&self, descriptors: &[NodeDescriptor]) {
        for desc in descriptors {
            let id = raft_id(&desc.node_id);
            if desc.is_removed {
                self.remove_peer(id);
            } else {
                self.set_peer(id, desc.raft_addr.clone());
            }
        }
    }

    pub fn peer_addr(&self, id: u64) -> Option<String> {
        self.raft_addrs.read().unwrap().get(&id).cloned()
    }

    /// Queue a raft message for delivery. Never blocks; drops when the
    /// peer's queue is full or its address is unknown.
    pub fn route(this: &Arc<Self>, msg: Message) {
        let to = msg.to;
        if this.peer_addr(to).is_none() {
            debug!(to, "dropping raft message for unknown peer");
            return;
        }

        let sender = {
            let mut senders = this.senders.lock().unwrap();
            senders
                .entry(to)
                .or_insert_with(|| Arc::clone(this).spawn_peer_task(to))
                .clone()
        };
        if sender.try_send(msg).is_err() {
            debug!(to, "peer queue full; dropping raft message");
        }
    }

    fn spawn_peer_task(self: Arc<Self>, to: u64) -> mpsc::Sender<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut client: Option<RaftTransportClient<Channel>> = None;
            while let Some(msg) = rx.recv().await {
                // Re-resolved on every send so re-IP takes effect.
                let Some(addr) = self.peer_addr(to) else {
                    break;
                };
                if client.is_none() {
                    match grpc_client::connect(&addr, self.tls.as_ref(), RPC_TIMEOUT).await {
                        Ok(channel) => client = Some(RaftTransportClient::new(channel)),
                        Err(e) => {
                            debug!(to, %addr, error = %e, "failed to connect to raft peer");
                            continue;
                        }
                    }
                }

                let payload = match raft_codec::serialize_message(&msg) {
                    Ok(data) => RaftPayload { from: msg.from, data },
                    Err(e) => {
                        warn!(to, error = %e, "failed to encode raft message");
                        continue;
                    }
                };
                if let Some(c) = client.as_mut() {
                    if let Err(e) = c.send(payload).await {
                        debug!(to, error = %e, "raft send failed; resetting connection");
                        client = None;
                    }
                }
            }
            debug!(to, "peer sender task exiting");
        });
        tx
    }

    /// Drop all queues; per-peer tasks drain and exit.
    pub fn shutdown(&self) {
        self.senders.lock().unwrap().clear();
    }
}
