//! Custom error types for the backup agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A StartBackup precondition failed; the run never entered `running`.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Snapshot creation failed: {0}")]
    SnapshotCreate(String),

    #[error("Send stream error: {0}")]
    Stream(String),

    #[error("Remote channel error: {0}")]
    Remote(String),

    #[error("Remote object already exists: {0}")]
    RemoteConflict(String),

    #[error("No committed parent available for incremental backup of '{0}'")]
    MissingParent(String),

    #[error("Lineage violation: {0}")]
    LineageViolation(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Store pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("A backup run is already active")]
    AlreadyRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
