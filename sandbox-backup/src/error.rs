//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("capture failed for sandbox {sandbox_id}: {reason}")]
    Capture { sandbox_id: String, reason: String },

    #[error("backup catalog {path} is corrupt: {reason}")]
    CatalogCorrupt { path: PathBuf, reason: String },

    #[error("record {record_id} not found in catalog")]
    RecordNotFound { record_id: String },

    #[error("record {record_id} has {dependents} dependent record(s); delete with cascade to remove the chain")]
    Dependency { record_id: String, dependents: usize },

    #[error("sandbox {sandbox_id} has no backup to chain from")]
    NoParent { sandbox_id: String },

    #[error("chain integrity failure at record {record_id}: {reason}")]
    ChainIntegrity { record_id: String, reason: String },

    #[error("liveness probe failed in sandbox {sandbox_id}: {reason}")]
    Liveness { sandbox_id: String, reason: String },

    #[error("restore of record {record_id} timed out after {minutes} minute(s)")]
    Timeout { record_id: String, minutes: u64 },

    #[error("network error for host {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Process exit code for the CLI wrapping this engine: `2` for
    /// validation-family failures, `1` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Validation(_)
            | BackupError::ChainIntegrity { .. }
            | BackupError::Dependency { .. }
            | BackupError::NoParent { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
