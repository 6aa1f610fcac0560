//! Engine configuration, loaded from the environment with sane defaults.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for catalog, archives and generated migration packages.
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub archives_dir: PathBuf,
    pub packages_dir: PathBuf,
    /// Default wall-clock bound for a whole restore run.
    pub restore_timeout_minutes: u64,
    /// Engine-wide cap on simultaneous captures (per-sandbox serialization
    /// is handled separately by the catalog locks).
    pub max_concurrent_backups: usize,
    /// zstd level used for compressed archives and delta payloads.
    pub compression_level: i32,
    /// Directory names skipped by the incremental change scan.
    pub scan_excludes: Vec<String>,
    /// Command executed inside a freshly restored sandbox to verify liveness.
    pub liveness_probe: String,
    /// Remote directory migration packages are staged into before install.
    pub remote_staging_dir: String,
    /// Install command run on deployment targets; `{package}` is replaced
    /// with the staged package path.
    pub remote_install_command: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("SANDBOX_BACKUP_DATA_DIR")
                .unwrap_or_else(|_| "/var/lib/sandbox-backup".into()),
        );

        Self {
            restore_timeout_minutes: std::env::var("SANDBOX_BACKUP_RESTORE_TIMEOUT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            max_concurrent_backups: std::env::var("SANDBOX_BACKUP_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            compression_level: std::env::var("SANDBOX_BACKUP_COMPRESSION_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            remote_staging_dir: std::env::var("SANDBOX_BACKUP_REMOTE_STAGING_DIR")
                .unwrap_or_else(|_| "/tmp".into()),
            remote_install_command: std::env::var("SANDBOX_BACKUP_INSTALL_COMMAND")
                .unwrap_or_else(|_| "sandbox-backup install {package}".into()),
            ..Self::with_data_dir(data_dir)
        }
    }

    /// Configuration rooted at an explicit data directory, defaults for the
    /// rest. This is the entry point tests use with a temp directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            catalog_path: data_dir.join("catalog.json"),
            archives_dir: data_dir.join("archives"),
            packages_dir: data_dir.join("migrations"),
            data_dir,
            restore_timeout_minutes: 60,
            max_concurrent_backups: 4,
            compression_level: 3,
            scan_excludes: default_scan_excludes(),
            liveness_probe: "true".into(),
            remote_staging_dir: "/tmp".into(),
            remote_install_command: "sandbox-backup install {package}".into(),
        }
    }
}

/// Virtual and volatile filesystems that never belong in a delta.
fn default_scan_excludes() -> Vec<String> {
    ["proc", "sys", "dev", "tmp"].map(String::from).to_vec()
}
