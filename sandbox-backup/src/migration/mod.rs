//! Migration packaging and batch deployment.
//!
//! A migration package is a self-contained bundle built from a full backup:
//! the archive, a manifest describing where it came from and what the
//! sandbox looked like, declarative install/validate plans, and a README.
//! The layout is fixed for compatibility with the remote install path.

pub mod deploy;
pub mod packager;

pub use deploy::{DeploymentCoordinator, DeploymentReport, DeploymentResult};
pub use packager::{MigrationPackage, MigrationPackager, PackageOptions};

use crate::adapters::{SandboxConfiguration, SystemInfo};
use crate::catalog::BackupRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INSTALL_SCRIPT_FILE: &str = "install.script";
pub const VALIDATE_SCRIPT_FILE: &str = "validate.script";
pub const README_FILE: &str = "README";

/// Checksummed entry for one file shipped inside a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFile {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Immutable description of a migration package. Always anchors to a `Full`
/// record — a chain would not be self-contained — and holds that record as a
/// non-owning copy: deleting the record from the catalog later does not
/// invalidate an already-written package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationManifest {
    pub migration_id: String,
    pub source_sandbox_id: String,
    pub created_at: DateTime<Utc>,
    pub creator_principal: String,
    pub origin_host: String,
    pub backup_record: BackupRecord,
    pub sandbox_configuration: SandboxConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
    pub file_manifest: Vec<PackageFile>,
}
