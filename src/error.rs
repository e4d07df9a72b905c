use thiserror::Error;

#[derive(Error, Debug)]
pub enum KronosError {
    #[error("not the raft leader")]
    NotLeader,

    #[error("not the current oracle")]
    NotOracle,

    #[error("timed out during {operation}")]
    Timeout { operation: String },

    #[error("node has been removed from the cluster")]
    Removed,

    #[error("checksum mismatch reading {path}")]
    Corrupt { path: String },

    #[error("node is running; stop it before offline operations")]
    NodeRunning,

    #[error("stale oracle epoch")]
    StaleEpoch,

    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("serialization error during {operation}: {source}")]
    Serialization {
        operation: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("raft error during {operation}: {source}")]
    Raft {
        operation: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KronosError {
    pub fn storage<E>(operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KronosError::Storage {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    pub fn serialization<E>(operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KronosError::Serialization {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    pub fn raft<E>(operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KronosError::Raft {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    pub fn timeout(operation: &str) -> Self {
        KronosError::Timeout {
            operation: operation.to_string(),
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KronosError::NotLeader
                | KronosError::Timeout { .. }
                | KronosError::Network(_)
                | KronosError::Rpc(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KronosError>;
