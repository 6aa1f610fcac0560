//! Migration package assembly.

use super::{
    MigrationManifest, PackageFile, INSTALL_SCRIPT_FILE, MANIFEST_FILE, README_FILE,
    VALIDATE_SCRIPT_FILE,
};
use crate::adapters::{ConfigIntrospector, SandboxConfiguration};
use crate::archive;
use crate::catalog::BackupRecord;
use crate::engine::{BackupEngine, FullBackupOptions};
use crate::error::{BackupError, Result};
use crate::integrity;
use crate::scan::ScanOptions;
use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PackageOptions {
    pub include_system_info: bool,
    /// Pack the package directory into a single `.pkg` file.
    pub compress: bool,
    /// Capture a fresh full backup instead of reusing the newest one.
    pub fresh_snapshot: bool,
    /// Destination directory; the engine's packages dir when `None`.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MigrationPackage {
    pub manifest: MigrationManifest,
    /// Package directory, or the single `.pkg` file when compressed.
    pub path: PathBuf,
    pub compressed: bool,
}

pub struct MigrationPackager {
    engine: Arc<BackupEngine>,
    introspector: Arc<dyn ConfigIntrospector>,
}

impl MigrationPackager {
    pub fn new(engine: Arc<BackupEngine>, introspector: Arc<dyn ConfigIntrospector>) -> Self {
        Self { engine, introspector }
    }

    /// Build a self-contained migration package for a sandbox.
    ///
    /// Reuses the newest full backup, capturing one when none exists or when
    /// `fresh_snapshot` is set. Any failure removes the partially built
    /// package directory before returning.
    pub async fn create_package(
        &self,
        sandbox_id: &str,
        options: PackageOptions,
    ) -> Result<MigrationPackage> {
        let record = self.ensure_full_backup(sandbox_id, &options).await?;

        let configuration = self
            .introspector
            .inspect(sandbox_id)
            .await
            .context("configuration introspection failed")?;
        let system_info = if options.include_system_info {
            Some(
                self.introspector
                    .system_info()
                    .await
                    .context("system info introspection failed")?,
            )
        } else {
            None
        };

        let migration_id = Uuid::new_v4().to_string();
        let base = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.engine.config().packages_dir.clone());
        let package_dir = base.join(format!("{sandbox_id}-{migration_id}"));
        if package_dir.exists() {
            return Err(BackupError::Validation(format!(
                "package directory {} already exists",
                package_dir.display()
            )));
        }

        tracing::info!(
            sandbox = %sandbox_id,
            migration_id = %migration_id,
            record_id = %record.id,
            "Building migration package"
        );

        let built = self
            .build_package(sandbox_id, &migration_id, &package_dir, &record, configuration, system_info)
            .await;

        match built {
            Ok(manifest) => {
                let package = if options.compress {
                    let path = self.compress_package(&package_dir).await?;
                    MigrationPackage { manifest, path, compressed: true }
                } else {
                    MigrationPackage { manifest, path: package_dir, compressed: false }
                };
                tracing::info!(
                    migration_id = %package.manifest.migration_id,
                    path = %package.path.display(),
                    "Migration package ready"
                );
                Ok(package)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&package_dir).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            path = %package_dir.display(),
                            "Failed to clean up partial package: {}", rm
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// A migration always anchors to a full record, never a chain.
    async fn ensure_full_backup(
        &self,
        sandbox_id: &str,
        options: &PackageOptions,
    ) -> Result<BackupRecord> {
        if !options.fresh_snapshot {
            if let Some(record) = self.engine.catalog().latest_full(sandbox_id).await {
                return Ok(record);
            }
        }
        self.engine
            .create_full_backup(sandbox_id, FullBackupOptions::default())
            .await
    }

    async fn build_package(
        &self,
        sandbox_id: &str,
        migration_id: &str,
        package_dir: &Path,
        record: &BackupRecord,
        configuration: SandboxConfiguration,
        system_info: Option<crate::adapters::SystemInfo>,
    ) -> Result<MigrationManifest> {
        tokio::fs::create_dir_all(package_dir).await?;

        let archive_name = format!("{sandbox_id}.archive");
        tokio::fs::copy(&record.archive_path, package_dir.join(&archive_name)).await?;

        let created_at = Utc::now();
        let origin_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let creator_principal = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".into());

        let install = render_install_script(sandbox_id, &archive_name, &configuration);
        let validate = render_validate_script(sandbox_id, &configuration);
        let readme = render_readme(sandbox_id, migration_id, record, &configuration, &origin_host);
        tokio::fs::write(package_dir.join(INSTALL_SCRIPT_FILE), install).await?;
        tokio::fs::write(package_dir.join(VALIDATE_SCRIPT_FILE), validate).await?;
        tokio::fs::write(package_dir.join(README_FILE), readme).await?;

        let mut file_manifest = Vec::new();
        for name in [archive_name.as_str(), INSTALL_SCRIPT_FILE, VALIDATE_SCRIPT_FILE, README_FILE] {
            let path = package_dir.join(name);
            let size_bytes = tokio::fs::metadata(&path).await?.len();
            let checksum = integrity::checksum_file(&path).await?;
            file_manifest.push(PackageFile {
                name: name.to_string(),
                size_bytes,
                checksum,
            });
        }

        let manifest = MigrationManifest {
            migration_id: migration_id.to_string(),
            source_sandbox_id: sandbox_id.to_string(),
            created_at,
            creator_principal,
            origin_host,
            backup_record: record.clone(),
            sandbox_configuration: configuration,
            system_info,
            file_manifest,
        };

        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(package_dir.join(MANIFEST_FILE), manifest_json).await?;

        Ok(manifest)
    }

    /// Pack the finished package directory into one `.pkg` file and drop the
    /// directory.
    async fn compress_package(&self, package_dir: &Path) -> Result<PathBuf> {
        let pkg_path = package_dir.with_extension("pkg");
        let dir = package_dir.to_path_buf();
        let level = self.engine.config().compression_level;

        let bytes = tokio::task::spawn_blocking(move || {
            let tree = archive::collect_directory(&dir, &ScanOptions::default())?;
            archive::pack(&tree, level)
        })
        .await
        .map_err(anyhow::Error::new)??;

        tokio::fs::write(&pkg_path, bytes).await?;
        tokio::fs::remove_dir_all(package_dir).await?;
        Ok(pkg_path)
    }
}

fn render_install_script(
    sandbox_id: &str,
    archive_name: &str,
    configuration: &SandboxConfiguration,
) -> String {
    let services = configuration
        .services
        .iter()
        .map(|s| format!("enable-service {s}\n"))
        .collect::<String>();

    format!(
        r#"# Migration install plan for sandbox {sandbox_id}
# Steps are executed top to bottom by the installer.
version 1
import-archive {archive_name} as {sandbox_id}
set-default-user {user}
apply-environment {manifest}
{services}run-validation {validate}
"#,
        user = configuration.default_user,
        manifest = MANIFEST_FILE,
        validate = VALIDATE_SCRIPT_FILE,
    )
}

fn render_validate_script(sandbox_id: &str, configuration: &SandboxConfiguration) -> String {
    format!(
        r#"# Migration validation plan for sandbox {sandbox_id}
version 1
sandbox-exists {sandbox_id}
exec-probe {sandbox_id} true
expect-default-user {user}
expect-package-count {packages}
expect-service-count {services}
"#,
        user = configuration.default_user,
        packages = configuration.packages.len(),
        services = configuration.services.len(),
    )
}

fn render_readme(
    sandbox_id: &str,
    migration_id: &str,
    record: &BackupRecord,
    configuration: &SandboxConfiguration,
    origin_host: &str,
) -> String {
    format!(
        r#"Sandbox migration package
=========================

Migration:   {migration_id}
Sandbox:     {sandbox_id}
Origin host: {origin_host}
Backup:      {record_id} ({size} bytes, sha256 {checksum})
Packages:    {packages}
Services:    {services}

Contents
--------
- {manifest}: machine-readable manifest (this package's source of truth)
- {sandbox_id}.archive: full filesystem snapshot
- {install}: declarative install plan
- {validate}: declarative post-install checks
- README: this file

To deploy, copy this package to the target host and run the installer
against {install}. The installer imports the archive as a new sandbox,
applies the recorded configuration and runs {validate}.
"#,
        record_id = record.id,
        size = record.size_bytes,
        checksum = record.checksum,
        packages = configuration.packages.len(),
        services = configuration.services.len(),
        manifest = MANIFEST_FILE,
        install = INSTALL_SCRIPT_FILE,
        validate = VALIDATE_SCRIPT_FILE,
    )
}
