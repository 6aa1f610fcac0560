//! Directory-backed snapshot adapter.
//!
//! Treats every sandbox as a plain directory under one root, the layout used
//! by chroot-style runtimes. Capture encodes the whole tree with the engine's
//! file-list codec; materialize decodes it into a fresh directory. Commands
//! run with the sandbox root as working directory.

use super::{ArchiveStream, ExecOutput, SnapshotAdapter};
use crate::archive;
use crate::scan::ScanOptions;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

pub struct LocalDirAdapter {
    root: PathBuf,
    scan_options: ScanOptions,
}

impl LocalDirAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scan_options: ScanOptions::default(),
        }
    }

    pub fn with_scan_options(mut self, scan_options: ScanOptions) -> Self {
        self.scan_options = scan_options;
        self
    }

    fn dir_of(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(sandbox_id)
    }
}

#[async_trait]
impl SnapshotAdapter for LocalDirAdapter {
    async fn exists(&self, sandbox_id: &str) -> anyhow::Result<bool> {
        Ok(self.dir_of(sandbox_id).is_dir())
    }

    async fn capture(&self, sandbox_id: &str) -> anyhow::Result<ArchiveStream> {
        let dir = self.dir_of(sandbox_id);
        if !dir.is_dir() {
            anyhow::bail!("sandbox {sandbox_id} not found under {}", self.root.display());
        }

        let options = self.scan_options.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            let tree = archive::collect_directory(&dir, &options)?;
            archive::encode(&tree)
        })
        .await
        .context("capture task failed")??;

        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn materialize(&self, sandbox_id: &str, mut archive_stream: ArchiveStream) -> anyhow::Result<()> {
        let dir = self.dir_of(sandbox_id);
        if dir.exists() {
            anyhow::bail!("sandbox {sandbox_id} already exists");
        }

        let mut bytes = Vec::new();
        archive_stream.read_to_end(&mut bytes).await?;

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let tree = archive::decode(&bytes)?;
            archive::apply_to_directory(&tree, &dir)?;
            Ok::<_, crate::error::BackupError>(())
        })
        .await
        .context("materialize task failed")??;

        Ok(())
    }

    async fn sandbox_root(&self, sandbox_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.dir_of(sandbox_id);
        if !dir.is_dir() {
            anyhow::bail!("sandbox {sandbox_id} not found under {}", self.root.display());
        }
        Ok(dir)
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> anyhow::Result<ExecOutput> {
        let dir = self.dir_of(sandbox_id);
        if !dir.is_dir() {
            anyhow::bail!("sandbox {sandbox_id} not found under {}", self.root.display());
        }

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .output()
            .await
            .with_context(|| format!("failed to run command in sandbox {sandbox_id}"))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
