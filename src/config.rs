use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KronosError, Result};

/// How long `propose` waits for a raft commit before giving up.
pub const PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attempt deadline for fetching time from the oracle.
pub const ORACLE_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline applied to client RPC calls.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Admin calls chain two raft proposals (command + conf change), so their
/// deadline must comfortably exceed a propose timeout.
pub const ADMIN_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive fetch-failure ticks tolerated before a follower claims
/// oracleship (i.e. oracle_timeout = 3 x tick interval).
pub const ORACLE_TIMEOUT_TICKS: u32 = 3;

/// The oracle extends its time cap this many tick intervals ahead of now.
pub const ORACLE_TIME_CAP_SAFETY_FACTOR: u32 = 2;

/// Retry backoff bounds for transient errors.
pub const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub advertise_host: String,
    pub raft_port: u16,
    pub grpc_port: u16,
    /// gRPC addresses of existing members to join through; empty means
    /// bootstrap a fresh single-node cluster (unless already initialized).
    pub seed_hosts: Vec<String>,
    pub insecure: bool,
    pub cert_dir: Option<PathBuf>,
    pub manage_oracle_tick_interval: Duration,
    /// Take a state snapshot after this many applied entries.
    pub raft_snap_count: u64,
    /// Allow the test-only SetDrift RPC.
    pub allow_drift_injection: bool,
}

impl NodeConfig {
    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.raft_port)
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.grpc_port)
    }

    pub fn oracle_timeout(&self) -> Duration {
        self.manage_oracle_tick_interval * ORACLE_TIMEOUT_TICKS
    }

    pub fn validate(&self) -> Result<()> {
        if self.advertise_host.is_empty() {
            return Err(KronosError::Config("advertise host must not be empty".into()));
        }
        if self.raft_port == self.grpc_port {
            return Err(KronosError::Config(
                "raft port and grpc port must differ".into(),
            ));
        }
        if self.manage_oracle_tick_interval < Duration::from_millis(10) {
            return Err(KronosError::Config(
                "manage-oracle-tick-interval must be at least 10ms".into(),
            ));
        }
        if !self.insecure && self.cert_dir.is_none() {
            return Err(KronosError::Config(
                "either --insecure or --cert-dir is required".into(),
            ));
        }
        Ok(())
    }
}

/// Parse durations of the form "500ms", "1s", "2m".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| KronosError::Config(format!("invalid duration: {}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Err(KronosError::Config(format!("invalid duration unit: {}", s))),
    }
}
