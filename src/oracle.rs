//! The oracle management loop.
//!
//! Every tick the node reads the replicated oracle state and acts on it: the
//! oracle extends its promised time cap through the raft log, everyone else
//! fetches the oracle's time and re-anchors the local clock. A follower that
//! cannot reach the oracle for `oracle_timeout` claims oracleship with a
//! bumped epoch; only the raft leader's claim can commit, so dueling
//! claimants resolve through the log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use tonic::transport::ClientTlsConfig;

use crate::config::{ORACLE_TIMEOUT_TICKS, ORACLE_TIME_CAP_SAFETY_FACTOR};
use crate::error::{KronosError, Result};
use crate::grpc_client;
use crate::node_shared::SharedNodeState;
use crate::types::{KronosCommand, NodeRole, OracleState};

pub struct OracleLoop {
    shared: Arc<SharedNodeState>,
    tls: Option<ClientTlsConfig>,
    tick: Duration,
    fetch_failures: u32,
    /// Set when a DeltaUpdate bounced with NotLeader; suppresses acting as
    /// oracle for that epoch until the state moves on.
    demoted_at_epoch: Option<u64>,
}

impl OracleLoop {
    pub fn new(shared: Arc<SharedNodeState>, tls: Option<ClientTlsConfig>) -> Self {
        let tick = shared.config.manage_oracle_tick_interval;
        Self {
            shared,
            tls,
            tick,
            fetch_failures: 0,
            demoted_at_epoch: None,
        }
    }

    /// Runs until shutdown, or until this node learns of its own removal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await?;
                }
                _ = shutdown.changed() => {
                    debug!("oracle loop exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if self.shared.is_self_removed() {
            warn!("this node is tombstoned in the cluster metadata");
            return Err(KronosError::Removed);
        }

        let state = self.shared.state_machine().read_state();
        if !state.has_oracle() {
            self.try_claim(&state).await;
            return Ok(());
        }

        let self_is_oracle = state.oracle_node_id == *self.shared.node_id();
        if self_is_oracle && self.demoted_at_epoch != Some(state.epoch) {
            self.extend_time_cap(&state).await;
        } else {
            self.sync_with_oracle(&state).await;
        }
        Ok(())
    }

    /// Oracle path: push the promised cap ahead of the clock so followers
    /// can trust readings up to it.
    async fn extend_time_cap(&mut self, state: &OracleState) {
        self.shared.set_role(NodeRole::Oracle);
        let clock = self.shared.clock();

        let mut now = clock.now_nanos();
        if now < state.oracle_time_cap {
            // Freshly claimed or restarted: never serve below the cap the
            // previous regime promised.
            clock.rebase(state.oracle_time_cap);
            now = clock.now_nanos();
        }

        let tick_ns = self.tick.as_nanos() as i64;
        let new_time_cap =
            (now + tick_ns * i64::from(ORACLE_TIME_CAP_SAFETY_FACTOR)).max(state.oracle_time_cap);
        let command = KronosCommand::DeltaUpdate {
            oracle_id: self.shared.node_id().clone(),
            new_time_cap,
            new_delta: now - clock.uptime_nanos(),
            epoch: state.epoch,
        };

        let raft = match self.shared.raft() {
            Ok(raft) => raft,
            Err(_) => return,
        };
        match raft.propose(command).await {
            Ok(()) => {
                debug!(new_time_cap, epoch = state.epoch, "extended oracle time cap");
            }
            Err(KronosError::NotLeader) => {
                warn!(epoch = state.epoch, "lost raft leadership; demoting from oracle");
                self.demoted_at_epoch = Some(state.epoch);
                self.shared.set_role(NodeRole::Follower);
            }
            Err(KronosError::StaleEpoch) | Err(KronosError::Rejected { .. }) => {
                debug!("delta update rejected; re-reading oracle state next tick");
            }
            Err(e) => {
                warn!(error = %e, "failed to propose delta update");
            }
        }
    }

    /// Follower path: fetch the oracle's time and re-anchor the local clock.
    async fn sync_with_oracle(&mut self, state: &OracleState) {
        self.shared.set_role(NodeRole::Follower);

        let oracle_addr = self
            .shared
            .cluster()
            .descriptor(&state.oracle_node_id)
            .filter(|d| !d.is_removed)
            .map(|d| d.grpc_addr);

        let fetched = match oracle_addr {
            Some(addr) => grpc_client::fetch_oracle_time(&addr, self.tls.as_ref()).await,
            None => Err(KronosError::Cluster(format!(
                "no address for oracle {}",
                state.oracle_node_id
            ))),
        };

        match fetched {
            Ok((oracle_time, epoch)) => {
                if epoch < state.epoch {
                    debug!(epoch, local = state.epoch, "ignoring stale oracle response");
                    return;
                }
                self.shared.clock().rebase(oracle_time);
                self.fetch_failures = 0;
            }
            Err(e) => {
                self.fetch_failures += 1;
                debug!(
                    error = %e,
                    failures = self.fetch_failures,
                    oracle = %state.oracle_node_id,
                    "failed to fetch oracle time"
                );
                if self.fetch_failures >= ORACLE_TIMEOUT_TICKS {
                    warn!(
                        oracle = %state.oracle_node_id,
                        epoch = state.epoch,
                        "oracle unreachable; claiming oracleship"
                    );
                    self.try_claim(state).await;
                }
            }
        }
    }

    async fn try_claim(&mut self, state: &OracleState) {
        let clock = self.shared.clock();
        let now = clock.now_nanos();
        let tick_ns = self.tick.as_nanos() as i64;
        let proposed_time_cap = now.max(state.oracle_time_cap)
            + tick_ns * i64::from(ORACLE_TIME_CAP_SAFETY_FACTOR);

        let command = KronosCommand::OracleClaim {
            proposer_id: self.shared.node_id().clone(),
            proposed_time_cap,
            proposed_delta: now - clock.uptime_nanos(),
            epoch: state.epoch + 1,
        };

        let raft = match self.shared.raft() {
            Ok(raft) => raft,
            Err(_) => return,
        };
        match raft.propose(command).await {
            Ok(()) => {
                info!(epoch = state.epoch + 1, proposed_time_cap, "claimed oracleship");
                self.demoted_at_epoch = None;
                self.shared.set_role(NodeRole::Oracle);
            }
            Err(KronosError::NotLeader) => {
                debug!("not the raft leader; leaving the claim to the leader");
            }
            Err(KronosError::StaleEpoch) | Err(KronosError::Rejected { .. }) => {
                debug!("lost the oracle claim race");
            }
            Err(e) => {
                warn!(error = %e, "failed to propose oracle claim");
            }
        }
        self.fetch_failures = 0;
    }
}
