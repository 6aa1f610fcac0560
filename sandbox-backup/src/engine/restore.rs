//! Restore orchestration: chain validation and replay into a new sandbox.

use super::BackupEngine;
use crate::adapters::ArchiveStream;
use crate::archive;
use crate::error::{BackupError, Result};
use crate::events::EngineEvent;
use crate::integrity::{self, ValidationOutcome};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Pending,
    ValidatingChain,
    Extracting,
    Applying,
    Verifying,
    Completed,
    Failed,
    TimedOut,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Pending => "pending",
            RestorePhase::ValidatingChain => "validating_chain",
            RestorePhase::Extracting => "extracting",
            RestorePhase::Applying => "applying",
            RestorePhase::Verifying => "verifying",
            RestorePhase::Completed => "completed",
            RestorePhase::Failed => "failed",
            RestorePhase::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Wall-clock bound for the whole restore; engine default when `None`.
    pub timeout_minutes: Option<u64>,
    /// Proceed past checksum mismatches during chain validation.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub record_id: String,
    pub sandbox_id: String,
    /// Records replayed: one full plus any incrementals.
    pub chain_length: usize,
    /// Files overwritten while applying incremental deltas.
    pub files_applied: usize,
    pub duration_secs: u64,
}

impl BackupEngine {
    /// Replay a record's full lineage into a new sandbox.
    ///
    /// Phases: `Pending → ValidatingChain → Extracting → Applying →
    /// Verifying`, each published on the event bus. Checksum mismatches abort
    /// before anything is materialized unless `force` is set. Failures in
    /// later phases leave the half-built sandbox in place for inspection, and
    /// a timeout leaves cleanup to the caller: tearing down mid-extraction
    /// risks leaving the snapshot adapter inconsistent.
    pub async fn restore(
        &self,
        target_record_id: &str,
        new_sandbox_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let minutes = options
            .timeout_minutes
            .unwrap_or(self.config().restore_timeout_minutes);
        let started = Instant::now();

        self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Pending);
        tracing::info!(
            record_id = %target_record_id,
            sandbox = %new_sandbox_id,
            timeout_minutes = minutes,
            "Starting restore"
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(minutes * 60),
            self.restore_inner(target_record_id, new_sandbox_id, &options, started),
        )
        .await;

        match outcome {
            Ok(Ok(report)) => {
                self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Completed);
                tracing::info!(
                    record_id = %target_record_id,
                    sandbox = %new_sandbox_id,
                    chain_length = report.chain_length,
                    duration_secs = report.duration_secs,
                    "Restore completed"
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Failed);
                tracing::error!(
                    record_id = %target_record_id,
                    sandbox = %new_sandbox_id,
                    error = %e,
                    "Restore failed"
                );
                Err(e)
            }
            Err(_) => {
                self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::TimedOut);
                tracing::error!(
                    record_id = %target_record_id,
                    sandbox = %new_sandbox_id,
                    minutes,
                    "Restore timed out"
                );
                Err(BackupError::Timeout {
                    record_id: target_record_id.to_string(),
                    minutes,
                })
            }
        }
    }

    async fn restore_inner(
        &self,
        target_record_id: &str,
        new_sandbox_id: &str,
        options: &RestoreOptions,
        started: Instant,
    ) -> Result<RestoreReport> {
        let chain = self.catalog().chain_for(target_record_id).await?;

        // Serialize against backups/restores targeting the same sandbox name.
        let lock = self.catalog().sandbox_lock(new_sandbox_id);
        let _serial = lock.acquire().await.map_err(anyhow::Error::new)?;

        let exists = self
            .snapshots()
            .exists(new_sandbox_id)
            .await
            .map_err(|e| BackupError::Capture {
                sandbox_id: new_sandbox_id.to_string(),
                reason: format!("{e:#}"),
            })?;
        if exists {
            return Err(BackupError::Validation(format!(
                "target sandbox {new_sandbox_id} already exists"
            )));
        }

        self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::ValidatingChain);
        for record in &chain {
            let outcome = integrity::validate(&record.archive_path, &record.checksum).await?;
            if !outcome.is_valid() {
                let reason = match outcome {
                    ValidationOutcome::Mismatch { actual } => {
                        format!("checksum mismatch (stored {}, actual {})", record.checksum, actual)
                    }
                    ValidationOutcome::MissingFile => "archive file is missing".into(),
                    ValidationOutcome::Valid => unreachable!(),
                };
                if options.force {
                    tracing::warn!(
                        record_id = %record.id,
                        "Chain validation failure overridden by force: {}", reason
                    );
                } else {
                    return Err(BackupError::ChainIntegrity {
                        record_id: record.id.clone(),
                        reason,
                    });
                }
            }
        }

        self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Extracting);
        let full = &chain[0];
        let file = tokio::fs::File::open(&full.archive_path).await?;
        let stream: ArchiveStream = if full.compressed {
            use async_compression::tokio::bufread::ZstdDecoder;
            Box::new(ZstdDecoder::new(tokio::io::BufReader::new(file)))
        } else {
            Box::new(file)
        };
        self.snapshots()
            .materialize(new_sandbox_id, stream)
            .await
            .map_err(|e| BackupError::Capture {
                sandbox_id: new_sandbox_id.to_string(),
                reason: format!("{e:#}"),
            })?;

        self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Applying);
        let mut files_applied = 0usize;
        if chain.len() > 1 {
            let root = self
                .snapshots()
                .sandbox_root(new_sandbox_id)
                .await
                .map_err(|e| BackupError::Capture {
                    sandbox_id: new_sandbox_id.to_string(),
                    reason: format!("{e:#}"),
                })?;

            // Deltas only add and overwrite: a file deleted between two
            // increments survives in the restored sandbox.
            for record in &chain[1..] {
                let bytes = tokio::fs::read(&record.archive_path).await?;
                let target_root = root.clone();
                let applied = tokio::task::spawn_blocking(move || {
                    let delta = archive::unpack(&bytes)?;
                    archive::apply_to_directory(&delta, &target_root)
                })
                .await
                .map_err(anyhow::Error::new)??;

                files_applied += applied;
                tracing::debug!(record_id = %record.id, applied, "Applied incremental delta");
            }
        }

        self.publish_phase(target_record_id, new_sandbox_id, RestorePhase::Verifying);
        let probe = self
            .snapshots()
            .exec(new_sandbox_id, &self.config().liveness_probe)
            .await
            .map_err(|e| BackupError::Liveness {
                sandbox_id: new_sandbox_id.to_string(),
                reason: format!("{e:#}"),
            })?;
        if !probe.success() {
            // The half-built sandbox is kept for manual inspection.
            return Err(BackupError::Liveness {
                sandbox_id: new_sandbox_id.to_string(),
                reason: format!(
                    "probe {:?} exited with {}",
                    self.config().liveness_probe,
                    probe.exit_code
                ),
            });
        }

        Ok(RestoreReport {
            record_id: target_record_id.to_string(),
            sandbox_id: new_sandbox_id.to_string(),
            chain_length: chain.len(),
            files_applied,
            duration_secs: started.elapsed().as_secs(),
        })
    }

    fn publish_phase(&self, record_id: &str, sandbox_id: &str, phase: RestorePhase) {
        self.events().publish(EngineEvent::RestorePhase {
            record_id: record_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            phase: phase.as_str().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackupKind, BackupRecord};
    use crate::engine::FullBackupOptions;
    use crate::testutil::{advance_past_mtime_granularity, TestEnv};
    use chrono::Utc;

    #[tokio::test]
    async fn test_restore_full_only_round_trip() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("etc/issue", b"demo"), ("data/log", b"entries")]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        let report = env
            .engine
            .restore(&full.id, "distroA-restored", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.chain_length, 1);
        assert_eq!(report.files_applied, 0);

        let restored = env.sandbox_path("distroA-restored");
        assert_eq!(std::fs::read(restored.join("etc/issue")).unwrap(), b"demo");
        assert_eq!(std::fs::read(restored.join("data/log")).unwrap(), b"entries");

        // Round-trip property: a fresh capture of the unchanged restored
        // sandbox validates against the original checksum.
        let recapture = env
            .engine
            .create_full_backup("distroA-restored", FullBackupOptions::default())
            .await
            .unwrap();
        assert!(
            crate::integrity::validate(&recapture.archive_path, &full.checksum)
                .await
                .unwrap()
                .is_valid()
        );
    }

    #[tokio::test]
    async fn test_restore_replays_incremental_chain_in_order() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("a", b"1"), ("b", b"2"), ("c", b"3")]);

        env.engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        advance_past_mtime_granularity().await;
        env.write_sandbox_file("distroA", "b", b"2-modified");
        let incremental = env
            .engine
            .create_incremental_backup("distroA", None)
            .await
            .unwrap()
            .record()
            .expect("incremental record")
            .clone();

        // Scenario 4: restored sandbox carries the three originals with the
        // modified file at its latest content.
        let report = env
            .engine
            .restore(&incremental.id, "distroA-restored", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.chain_length, 2);
        assert_eq!(report.files_applied, 1);

        let restored = env.sandbox_path("distroA-restored");
        assert_eq!(std::fs::read(restored.join("a")).unwrap(), b"1");
        assert_eq!(std::fs::read(restored.join("b")).unwrap(), b"2-modified");
        assert_eq!(std::fs::read(restored.join("c")).unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts_before_materialization() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("f", b"x")]);

        let good = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        // A record whose stored checksum never matched its archive.
        let bad = BackupRecord {
            id: "bad-checksum".into(),
            sandbox_id: "distroA".into(),
            kind: BackupKind::Full,
            parent_id: None,
            created_at: Utc::now(),
            size_bytes: good.size_bytes,
            checksum: "ff".repeat(32),
            archive_path: good.archive_path.clone(),
            changed_file_count: None,
            compressed: false,
        };
        env.catalog().add_record(bad).await.unwrap();

        let err = env
            .engine
            .restore("bad-checksum", "distroA-bad", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ChainIntegrity { .. }));
        assert!(!env.sandbox_path("distroA-bad").exists());

        // force overrides validation; the archive itself is intact.
        env.engine
            .restore(
                "bad-checksum",
                "distroA-forced",
                RestoreOptions { force: true, ..RestoreOptions::default() },
            )
            .await
            .unwrap();
        assert!(env.sandbox_path("distroA-forced").exists());
    }

    #[tokio::test]
    async fn test_failed_liveness_probe_keeps_sandbox_for_inspection() {
        let env = TestEnv::with_config(|config| {
            config.liveness_probe = "exit 7".into();
        });
        env.seed_sandbox("distroA", &[("f", b"x")]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        let err = env
            .engine
            .restore(&full.id, "distroA-restored", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Liveness { .. }));
        assert!(
            env.sandbox_path("distroA-restored").exists(),
            "half-built sandbox must be preserved"
        );
    }

    #[tokio::test]
    async fn test_zero_minute_timeout_reports_timed_out() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("f", b"x")]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        let err = env
            .engine
            .restore(
                &full.id,
                "distroA-restored",
                RestoreOptions { timeout_minutes: Some(0), force: false },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Timeout { minutes: 0, .. }));
    }

    #[tokio::test]
    async fn test_restore_refuses_existing_target() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("f", b"x")]);
        env.seed_sandbox("occupied", &[("g", b"y")]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        let err = env
            .engine
            .restore(&full.id, "occupied", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn test_restore_of_compressed_full_backup() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("big", "data ".repeat(400).as_bytes())]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions { compress: true })
            .await
            .unwrap();

        env.engine
            .restore(&full.id, "distroA-restored", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(env.sandbox_path("distroA-restored").join("big")).unwrap(),
            "data ".repeat(400).as_bytes()
        );
    }

    #[tokio::test]
    async fn test_phases_are_published_in_order() {
        let env = TestEnv::new();
        env.seed_sandbox("distroA", &[("f", b"x")]);

        let full = env
            .engine
            .create_full_backup("distroA", FullBackupOptions::default())
            .await
            .unwrap();

        let mut rx = env.engine.events().subscribe();
        env.engine
            .restore(&full.id, "distroA-restored", RestoreOptions::default())
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::events::EngineEvent::RestorePhase { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                "pending",
                "validating_chain",
                "extracting",
                "applying",
                "verifying",
                "completed"
            ]
        );
    }
}
