//! Backup record model and the on-disk catalog document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const CATALOG_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// One immutable backup in the catalog. An `Incremental` record always names
/// a `parent_id` for the same sandbox; following parents from any record ends
/// at exactly one `Full` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub sandbox_id: String,
    pub kind: BackupKind,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored archive bytes (post-compression).
    pub checksum: String,
    pub archive_path: PathBuf,
    /// Number of files in the delta; `None` for full backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_file_count: Option<usize>,
    /// Whether the archive payload was zstd-compressed at capture time.
    #[serde(default)]
    pub compressed: bool,
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }
}

/// What the catalog file actually contains.
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: u32,
    pub records: Vec<BackupRecord>,
}
