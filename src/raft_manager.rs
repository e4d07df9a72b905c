//! The raft driver: wraps a `raft::RawNode`, pumps ticks, proposals, peer
//! messages and conf changes through it, and applies committed entries onto
//! the time state machine.
//!
//! Proposals resolve once the entry commits *and* the state machine accepts
//! it; a command the state machine rejects still commits at the raft layer
//! but resolves the proposer's future with the rejection error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raft::prelude::*;
use raft::{Config, RawNode, StateRole};
use slog::o;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::PROPOSE_TIMEOUT;
use crate::error::{KronosError, Result};
use crate::node_shared::{RaftStatus, SharedNodeState};
use crate::peer_connector::PeerConnector;
use crate::raft_codec;
use crate::raft_storage::RaftStorage;
use crate::state_machine::TimeStateMachine;
use crate::types::KronosCommand;

const RAFT_TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub enum ConfChangeKind {
    AddVoter,
    RemoveVoter,
}

#[derive(Debug)]
pub struct RaftProposal {
    pub id: Vec<u8>,
    pub command: KronosCommand,
    pub response_tx: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Debug)]
pub struct RaftConfChange {
    pub kind: ConfChangeKind,
    pub raft_id: u64,
    pub raft_addr: String,
    pub response_tx: Option<oneshot::Sender<Result<()>>>,
}

/// Cheaply cloneable facade over the driver's input channels.
#[derive(Clone)]
pub struct RaftHandle {
    proposal_tx: mpsc::UnboundedSender<RaftProposal>,
    conf_change_tx: mpsc::UnboundedSender<RaftConfChange>,
    message_tx: mpsc::UnboundedSender<(u64, Message)>,
}

impl RaftHandle {
    /// Propose a command and wait for the commit + apply verdict.
    pub async fn propose(&self, command: KronosCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let proposal = RaftProposal {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            command,
            response_tx: Some(tx),
        };
        self.proposal_tx
            .send(proposal)
            .map_err(|_| KronosError::ShuttingDown)?;
        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Err(_) => Err(KronosError::timeout("raft propose")),
            Ok(Err(_)) => Err(KronosError::ShuttingDown),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn propose_conf_change(
        &self,
        kind: ConfChangeKind,
        raft_id: u64,
        raft_addr: String,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let change = RaftConfChange {
            kind,
            raft_id,
            raft_addr,
            response_tx: Some(tx),
        };
        self.conf_change_tx
            .send(change)
            .map_err(|_| KronosError::ShuttingDown)?;
        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Err(_) => Err(KronosError::timeout("raft conf change")),
            Ok(Err(_)) => Err(KronosError::ShuttingDown),
            Ok(Ok(result)) => result,
        }
    }

    /// Feed a message received from a peer into the driver.
    pub fn step_message(&self, from: u64, msg: Message) -> Result<()> {
        self.message_tx
            .send((from, msg))
            .map_err(|_| KronosError::ShuttingDown)
    }
}

pub struct RaftManager {
    raft_id: u64,
    node: RawNode<RaftStorage>,
    storage: RaftStorage,
    state_machine: Arc<TimeStateMachine>,
    peers: Arc<PeerConnector>,
    shared: Arc<SharedNodeState>,

    snap_count: u64,
    applied_since_snapshot: u64,
    pending: HashMap<Vec<u8>, oneshot::Sender<Result<()>>>,
    needs_replication_trigger: bool,

    proposal_rx: mpsc::UnboundedReceiver<RaftProposal>,
    conf_change_rx: mpsc::UnboundedReceiver<RaftConfChange>,
    message_rx: mpsc::UnboundedReceiver<(u64, Message)>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RaftManager {
    pub fn new(
        shared: Arc<SharedNodeState>,
        storage: RaftStorage,
        state_machine: Arc<TimeStateMachine>,
        peers: Arc<PeerConnector>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Self, RaftHandle)> {
        let raft_id = shared.raft_node_id();
        let cfg = Config {
            id: raft_id,
            election_tick: 10,
            heartbeat_tick: 3,
            applied: storage.snapshot_index(),
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            // A long-dead returnee campaigning on a stale membership must
            // not be able to inflate the live cluster's term.
            pre_vote: true,
            ..Default::default()
        };
        let logger = slog::Logger::root(slog::Discard, o!());
        let node = RawNode::new(&cfg, storage.clone(), &logger)
            .map_err(|e| KronosError::raft("create raft node", e))?;

        let (proposal_tx, proposal_rx) = mpsc::unbounded_channel();
        let (conf_change_tx, conf_change_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let manager = Self {
            raft_id,
            node,
            storage,
            state_machine,
            peers,
            snap_count: shared.config.raft_snap_count,
            shared,
            applied_since_snapshot: 0,
            pending: HashMap::new(),
            needs_replication_trigger: false,
            proposal_rx,
            conf_change_rx,
            message_rx,
            shutdown_rx,
        };
        let handle = RaftHandle {
            proposal_tx,
            conf_change_tx,
            message_tx,
        };
        Ok((manager, handle))
    }

    /// Campaign immediately and commit an empty entry so a fresh single-node
    /// cluster has a working leader before any RPC arrives.
    pub async fn bootstrap_single_node(&mut self) -> Result<()> {
        self.node
            .campaign()
            .map_err(|e| KronosError::raft("bootstrap campaign", e))?;
        while self.on_ready()? {}

        if self.node.raft.state == StateRole::Leader {
            self.node
                .propose(vec![], vec![])
                .map_err(|e| KronosError::raft("bootstrap propose", e))?;
        }
        while self.on_ready()? {}

        info!(raft_id = self.raft_id, "bootstrapped single-node raft group");
        Ok(())
    }

    pub async fn run(mut self) {
        let mut tick_timer = interval(RAFT_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    self.node.tick();
                }
                Some(proposal) = self.proposal_rx.recv() => {
                    self.handle_proposal(proposal);
                }
                Some(change) = self.conf_change_rx.recv() => {
                    self.handle_conf_change(change);
                }
                Some((from, msg)) = self.message_rx.recv() => {
                    self.handle_message(from, msg);
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
            }

            loop {
                match self.on_ready() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = %e, "failed to process raft ready state");
                        break;
                    }
                }
            }

            if self.needs_replication_trigger {
                self.needs_replication_trigger = false;
                if self.node.raft.state == StateRole::Leader {
                    // An empty entry makes the leader open streams to the
                    // freshly added voter right away.
                    let _ = self.node.propose(vec![], vec![]);
                }
            }

            self.maybe_create_snapshot();
            self.update_shared_status();
        }

        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(KronosError::ShuttingDown));
        }
        debug!("raft driver exiting");
    }

    fn handle_proposal(&mut self, proposal: RaftProposal) {
        if self.node.raft.state != StateRole::Leader {
            if let Some(tx) = proposal.response_tx {
                let _ = tx.send(Err(KronosError::NotLeader));
            }
            return;
        }

        let data = match bincode::serialize(&proposal.command) {
            Ok(data) => data,
            Err(e) => {
                if let Some(tx) = proposal.response_tx {
                    let _ = tx.send(Err(KronosError::serialization("serialize command", e)));
                }
                return;
            }
        };

        if let Some(tx) = proposal.response_tx {
            self.pending.insert(proposal.id.clone(), tx);
        }
        if let Err(e) = self.node.propose(proposal.id.clone(), data) {
            if let Some(tx) = self.pending.remove(&proposal.id) {
                let _ = tx.send(Err(map_propose_error(e)));
            }
        }
    }

    fn handle_conf_change(&mut self, change: RaftConfChange) {
        if self.node.raft.state != StateRole::Leader {
            if let Some(tx) = change.response_tx {
                let _ = tx.send(Err(KronosError::NotLeader));
            }
            return;
        }

        let mut cc = ConfChange::default();
        cc.set_node_id(change.raft_id);
        match change.kind {
            ConfChangeKind::AddVoter => {
                cc.set_change_type(ConfChangeType::AddNode);
                match bincode::serialize(&change.raft_addr) {
                    Ok(context) => cc.set_context(context.into()),
                    Err(e) => {
                        if let Some(tx) = change.response_tx {
                            let _ =
                                tx.send(Err(KronosError::serialization("serialize peer addr", e)));
                        }
                        return;
                    }
                }
            }
            ConfChangeKind::RemoveVoter => {
                cc.set_change_type(ConfChangeType::RemoveNode);
            }
        }

        let cc_id = uuid::Uuid::new_v4().as_bytes().to_vec();
        if let Some(tx) = change.response_tx {
            self.pending.insert(cc_id.clone(), tx);
        }
        if let Err(e) = self.node.propose_conf_change(cc_id.clone(), cc) {
            if let Some(tx) = self.pending.remove(&cc_id) {
                let _ = tx.send(Err(map_propose_error(e)));
            }
        }
    }

    fn handle_message(&mut self, from: u64, msg: Message) {
        if let Err(e) = self.node.step(msg) {
            warn!(from, error = %e, "failed to step raft message");
        }
    }

    fn on_ready(&mut self) -> Result<bool> {
        if !self.node.has_ready() {
            return Ok(false);
        }
        let mut ready = self.node.ready();

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.storage.apply_snapshot(&snapshot)?;
            self.state_machine.restore(snapshot.get_data())?;
            self.peers.refresh(&self.shared.cluster().all_nodes());
        }

        let committed = ready.take_committed_entries();
        self.apply_committed_entries(committed);

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.save_hard_state(hs)?;
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        let mut light_rd = self.node.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.send_messages(light_rd.take_messages());
        let committed = light_rd.take_committed_entries();
        self.apply_committed_entries(committed);
        self.node.advance_apply();

        Ok(true)
    }

    fn apply_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            self.applied_since_snapshot += 1;
            if entry.data.is_empty() {
                // Leader no-op entry.
                continue;
            }
            match entry.entry_type {
                EntryType::EntryNormal => self.apply_normal_entry(&entry),
                EntryType::EntryConfChange => self.apply_conf_change_entry(&entry),
                EntryType::EntryConfChangeV2 => {
                    warn!("ignoring unsupported EntryConfChangeV2");
                }
            }
        }
    }

    fn apply_normal_entry(&mut self, entry: &Entry) {
        let mut membership_changed = false;
        let result = match bincode::deserialize::<KronosCommand>(&entry.data) {
            Ok(command) => {
                membership_changed = matches!(
                    command,
                    KronosCommand::AddNode { .. } | KronosCommand::RemoveNode { .. }
                );
                match self.state_machine.apply(&command) {
                    Ok(outcome) => outcome.into_result(),
                    Err(e) => {
                        error!(error = %e, index = entry.index, "state machine apply failed");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(KronosError::serialization("deserialize command", e)),
        };

        if membership_changed {
            self.peers.refresh(&self.shared.cluster().all_nodes());
        }
        if !entry.context.is_empty() {
            if let Some(tx) = self.pending.remove(entry.context.as_ref() as &[u8]) {
                let _ = tx.send(result);
            }
        }
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry) {
        let cc = match raft_codec::deserialize_conf_change(&entry.data) {
            Ok(cc) => cc,
            Err(e) => {
                warn!(error = %e, index = entry.index, "failed to parse conf change entry");
                return;
            }
        };

        let result = match self.node.apply_conf_change(&cc) {
            Ok(cs) => {
                info!(
                    node_id = cc.node_id,
                    change = ?cc.change_type,
                    voters = ?cs.voters,
                    "applied raft conf change"
                );
                match self.storage.save_conf_state(&cs) {
                    Ok(()) => {
                        match cc.change_type {
                            ConfChangeType::AddNode => {
                                if let Some(addr) = self.peer_addr_for(cc.node_id, &cc.context) {
                                    self.peers.set_peer(cc.node_id, addr);
                                }
                                self.needs_replication_trigger = true;
                            }
                            ConfChangeType::RemoveNode => {
                                self.peers.remove_peer(cc.node_id);
                            }
                            _ => {}
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(KronosError::raft("apply conf change", e)),
        };

        if !entry.context.is_empty() {
            if let Some(tx) = self.pending.remove(entry.context.as_ref() as &[u8]) {
                let _ = tx.send(result);
            }
        }
    }

    /// The address for a freshly added voter. The metadata store wins over
    /// the conf change context: a replayed entry must not undo a re-IP.
    fn peer_addr_for(&self, raft_node_id: u64, context: &[u8]) -> Option<String> {
        let from_metadata = self
            .shared
            .cluster()
            .all_nodes()
            .into_iter()
            .find(|d| !d.is_removed && crate::types::raft_id(&d.node_id) == raft_node_id)
            .map(|d| d.raft_addr);
        if from_metadata.is_some() {
            return from_metadata;
        }
        if context.is_empty() {
            return None;
        }
        bincode::deserialize::<String>(context).ok()
    }

    fn send_messages(&self, msgs: Vec<Message>) {
        for msg in msgs {
            PeerConnector::route(&self.peers, msg);
        }
    }

    fn maybe_create_snapshot(&mut self) {
        if self.snap_count == 0 || self.applied_since_snapshot < self.snap_count {
            return;
        }
        let applied = self.node.raft.raft_log.applied;
        if applied <= self.storage.snapshot_index() {
            return;
        }
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "failed to serialize state machine snapshot");
                return;
            }
        };
        if let Err(e) = self
            .storage
            .create_snapshot(applied, self.storage.conf_state(), data)
        {
            error!(error = %e, applied, "failed to create raft snapshot");
            return;
        }
        debug!(applied, "created snapshot and compacted raft log");
        self.applied_since_snapshot = 0;
    }

    fn update_shared_status(&self) {
        self.shared.update_raft_status(RaftStatus {
            is_leader: self.node.raft.state == StateRole::Leader,
            leader_id: self.node.raft.leader_id,
            term: self.node.raft.term,
            voters: self.storage.conf_state().voters.to_vec(),
        });
    }
}

fn map_propose_error(e: raft::Error) -> KronosError {
    match e {
        raft::Error::ProposalDropped => KronosError::NotLeader,
        other => KronosError::raft("propose", other),
    }
}
