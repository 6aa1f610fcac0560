//! Full backup capture.

use super::{BackupEngine, FullBackupOptions};
use crate::adapters::ArchiveStream;
use crate::catalog::{BackupKind, BackupRecord};
use crate::error::{BackupError, Result};
use crate::events::EngineEvent;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

impl BackupEngine {
    /// Capture a sandbox's entire filesystem into a new `Full` record.
    ///
    /// The archive is streamed to disk while its checksum is computed in the
    /// same pass. On any failure the partial archive is removed and no
    /// catalog record is created.
    pub async fn create_full_backup(
        &self,
        sandbox_id: &str,
        options: FullBackupOptions,
    ) -> Result<BackupRecord> {
        let lock = self.catalog().sandbox_lock(sandbox_id);
        let _serial = lock.acquire().await.map_err(anyhow::Error::new)?;
        let _slot = self.capture_slots.acquire().await.map_err(anyhow::Error::new)?;

        self.events().publish(EngineEvent::BackupStarted {
            sandbox_id: sandbox_id.to_string(),
            kind: BackupKind::Full.to_string(),
        });
        tracing::info!(sandbox = %sandbox_id, compress = options.compress, "Starting full backup");

        match self.capture_full(sandbox_id, &options).await {
            Ok(record) => {
                self.events().publish(EngineEvent::BackupCompleted {
                    sandbox_id: sandbox_id.to_string(),
                    record_id: record.id.clone(),
                    size_bytes: record.size_bytes,
                });
                tracing::info!(
                    sandbox = %sandbox_id,
                    record_id = %record.id,
                    size_bytes = record.size_bytes,
                    "Full backup completed"
                );
                Ok(record)
            }
            Err(e) => {
                self.events().publish(EngineEvent::BackupFailed {
                    sandbox_id: sandbox_id.to_string(),
                    error: e.to_string(),
                });
                tracing::error!(sandbox = %sandbox_id, error = %e, "Full backup failed");
                Err(e)
            }
        }
    }

    async fn capture_full(
        &self,
        sandbox_id: &str,
        options: &FullBackupOptions,
    ) -> Result<BackupRecord> {
        let capture_err = |reason: String| BackupError::Capture {
            sandbox_id: sandbox_id.to_string(),
            reason,
        };

        let exists = self
            .snapshots()
            .exists(sandbox_id)
            .await
            .map_err(|e| capture_err(format!("{e:#}")))?;
        if !exists {
            return Err(capture_err("sandbox does not exist".into()));
        }

        let stream = self
            .snapshots()
            .capture(sandbox_id)
            .await
            .map_err(|e| capture_err(format!("{e:#}")))?;

        let id = Uuid::new_v4().to_string();
        let dir = self.config().archives_dir.join(sandbox_id);
        tokio::fs::create_dir_all(&dir).await?;
        let archive_path = dir.join(format!("{id}.archive"));
        let partial_path = dir.join(format!("{id}.archive.partial"));

        let written = write_archive(
            stream,
            &partial_path,
            options.compress,
            self.config().compression_level,
        )
        .await;

        let (size_bytes, checksum) = match written {
            Ok(v) => v,
            Err(e) => {
                remove_partial(&partial_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial_path, &archive_path).await {
            remove_partial(&partial_path).await;
            return Err(e.into());
        }

        let record = BackupRecord {
            id,
            sandbox_id: sandbox_id.to_string(),
            kind: BackupKind::Full,
            parent_id: None,
            created_at: Utc::now(),
            size_bytes,
            checksum,
            archive_path: archive_path.clone(),
            changed_file_count: None,
            compressed: options.compress,
        };

        if let Err(e) = self.catalog().add_record(record.clone()).await {
            // Registration failed: don't leave an orphan archive behind.
            remove_partial(&archive_path).await;
            return Err(e);
        }

        Ok(record)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "Failed to remove partial archive: {}", e);
        }
    }
}

/// Stream `source` into `dest`, hashing the stored bytes in the same pass.
/// With `compress` the stream runs through a zstd encoder first, so the
/// checksum covers exactly what lands on disk.
async fn write_archive(
    source: ArchiveStream,
    dest: &Path,
    compress: bool,
    level: i32,
) -> Result<(u64, String)> {
    use async_compression::tokio::bufread::ZstdEncoder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

    let mut reader: ArchiveStream = if compress {
        Box::new(ZstdEncoder::with_quality(
            BufReader::new(source),
            async_compression::Level::Precise(level),
        ))
    } else {
        source
    };

    let file = tokio::fs::File::create(dest).await?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    Ok((total, format!("{:x}", hasher.finalize())))
}
