//! Incremental backup capture.

use super::{BackupEngine, IncrementalOutcome};
use crate::archive::{self, DeltaArchive};
use crate::catalog::{BackupKind, BackupRecord};
use crate::error::{BackupError, Result};
use crate::events::EngineEvent;
use crate::integrity;
use crate::scan;
use chrono::Utc;
use uuid::Uuid;

impl BackupEngine {
    /// Capture the files changed since a parent record into a chained
    /// `Incremental` record.
    ///
    /// Without an explicit `parent_id` the most recently created record for
    /// the sandbox is used. Change detection compares file mtimes against the
    /// parent's `created_at` (strictly newer); when nothing changed the call
    /// returns `Skipped` and the catalog is left untouched.
    pub async fn create_incremental_backup(
        &self,
        sandbox_id: &str,
        parent_id: Option<&str>,
    ) -> Result<IncrementalOutcome> {
        let lock = self.catalog().sandbox_lock(sandbox_id);
        let _serial = lock.acquire().await.map_err(anyhow::Error::new)?;
        let _slot = self.capture_slots.acquire().await.map_err(anyhow::Error::new)?;

        let parent = match parent_id {
            Some(id) => {
                let record = self.catalog().get_record(id).await?;
                if record.sandbox_id != sandbox_id {
                    return Err(BackupError::Validation(format!(
                        "parent record {} belongs to sandbox {}, not {}",
                        record.id, record.sandbox_id, sandbox_id
                    )));
                }
                record
            }
            None => self
                .catalog()
                .latest_record(sandbox_id)
                .await
                .ok_or_else(|| BackupError::NoParent {
                    sandbox_id: sandbox_id.to_string(),
                })?,
        };

        self.events().publish(EngineEvent::BackupStarted {
            sandbox_id: sandbox_id.to_string(),
            kind: BackupKind::Incremental.to_string(),
        });
        tracing::info!(sandbox = %sandbox_id, parent_id = %parent.id, "Starting incremental backup");

        match self.capture_incremental(sandbox_id, &parent).await {
            Ok(IncrementalOutcome::Skipped { parent_id }) => {
                self.events().publish(EngineEvent::BackupSkipped {
                    sandbox_id: sandbox_id.to_string(),
                    parent_id: parent_id.clone(),
                });
                tracing::info!(
                    sandbox = %sandbox_id,
                    parent_id = %parent_id,
                    "No changes since parent, skipping incremental backup"
                );
                Ok(IncrementalOutcome::Skipped { parent_id })
            }
            Ok(outcome) => {
                if let Some(record) = outcome.record() {
                    self.events().publish(EngineEvent::BackupCompleted {
                        sandbox_id: sandbox_id.to_string(),
                        record_id: record.id.clone(),
                        size_bytes: record.size_bytes,
                    });
                    tracing::info!(
                        sandbox = %sandbox_id,
                        record_id = %record.id,
                        changed_files = record.changed_file_count.unwrap_or(0),
                        "Incremental backup completed"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                self.events().publish(EngineEvent::BackupFailed {
                    sandbox_id: sandbox_id.to_string(),
                    error: e.to_string(),
                });
                tracing::error!(sandbox = %sandbox_id, error = %e, "Incremental backup failed");
                Err(e)
            }
        }
    }

    async fn capture_incremental(
        &self,
        sandbox_id: &str,
        parent: &BackupRecord,
    ) -> Result<IncrementalOutcome> {
        let root = self
            .snapshots()
            .sandbox_root(sandbox_id)
            .await
            .map_err(|e| BackupError::Capture {
                sandbox_id: sandbox_id.to_string(),
                reason: format!("{e:#}"),
            })?;

        let options = self.scan_options();
        let cutoff = parent.created_at;
        let level = self.config().compression_level;

        // Scan, read and pack in one blocking task; the walk is unbounded by
        // design and must stay off the runtime threads.
        let packed = tokio::task::spawn_blocking(move || -> Result<Option<(Vec<u8>, usize)>> {
            let changed = scan::changed_since(&root, &options, cutoff)?;
            if changed.is_empty() {
                return Ok(None);
            }
            let mut delta = DeltaArchive::new();
            delta.entries = archive::read_entries(&changed)?;
            let bytes = archive::pack(&delta, level)?;
            Ok(Some((bytes, changed.len())))
        })
        .await
        .map_err(anyhow::Error::new)??;

        let Some((bytes, changed_file_count)) = packed else {
            return Ok(IncrementalOutcome::Skipped {
                parent_id: parent.id.clone(),
            });
        };

        let checksum = integrity::checksum_bytes(&bytes);
        let size_bytes = bytes.len() as u64;

        let id = Uuid::new_v4().to_string();
        let dir = self.config().archives_dir.join(sandbox_id);
        tokio::fs::create_dir_all(&dir).await?;
        let archive_path = dir.join(format!("{id}.archive"));
        let partial_path = dir.join(format!("{id}.archive.partial"));

        if let Err(e) = tokio::fs::write(&partial_path, &bytes).await {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&partial_path, &archive_path).await {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(e.into());
        }

        let record = BackupRecord {
            id,
            sandbox_id: sandbox_id.to_string(),
            kind: BackupKind::Incremental,
            parent_id: Some(parent.id.clone()),
            created_at: Utc::now(),
            size_bytes,
            checksum,
            archive_path: archive_path.clone(),
            changed_file_count: Some(changed_file_count),
            compressed: true,
        };

        if let Err(e) = self.catalog().add_record(record.clone()).await {
            let _ = tokio::fs::remove_file(&archive_path).await;
            return Err(e);
        }

        Ok(IncrementalOutcome::Created(record))
    }
}
