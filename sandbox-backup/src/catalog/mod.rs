//! Durable registry of backup records and their chain structure.
//!
//! The catalog is the single source of truth for what backups exist. It is an
//! append-mostly record list persisted as a JSON document; every mutation
//! rewrites the document via write-temp-then-atomic-rename so a crash never
//! leaves a half-written store behind. A store that fails to parse is treated
//! as corrupt and refused outright rather than silently dropping entries.

pub mod record;

pub use record::{BackupKind, BackupRecord};

use crate::error::{BackupError, Result};
use crate::integrity::{self, ValidationOutcome};
use dashmap::DashMap;
use record::{CatalogDocument, CATALOG_FORMAT_VERSION};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

pub struct BackupCatalog {
    store_path: PathBuf,
    records: RwLock<Vec<BackupRecord>>,
    sandbox_locks: DashMap<String, Arc<Semaphore>>,
}

/// Outcome of re-validating one record during a catalog audit.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub record_id: String,
    pub sandbox_id: String,
    pub outcome: ValidationOutcome,
}

impl BackupCatalog {
    /// Open (or initialize) the catalog at `store_path`. A present but
    /// unparseable store fails closed with `CatalogCorrupt`.
    pub fn open(store_path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = store_path.into();
        let records = if store_path.exists() {
            let raw = std::fs::read_to_string(&store_path)?;
            let doc: CatalogDocument =
                serde_json::from_str(&raw).map_err(|e| BackupError::CatalogCorrupt {
                    path: store_path.clone(),
                    reason: e.to_string(),
                })?;
            if doc.version != CATALOG_FORMAT_VERSION {
                return Err(BackupError::CatalogCorrupt {
                    path: store_path.clone(),
                    reason: format!("unsupported catalog version {}", doc.version),
                });
            }
            doc.records
        } else {
            Vec::new()
        };

        tracing::debug!(path = %store_path.display(), records = records.len(), "Opened backup catalog");

        Ok(Self {
            store_path,
            records: RwLock::new(records),
            sandbox_locks: DashMap::new(),
        })
    }

    /// Advisory lock serializing backup/restore work per sandbox. Operations
    /// on different sandboxes proceed independently.
    pub fn sandbox_lock(&self, sandbox_id: &str) -> Arc<Semaphore> {
        self.sandbox_locks
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Validate and append a record, persisting atomically. Returns the id.
    pub async fn add_record(&self, record: BackupRecord) -> Result<String> {
        let mut records = self.records.write().await;

        match record.kind {
            BackupKind::Incremental => {
                let parent_id = record.parent_id.as_deref().ok_or_else(|| {
                    BackupError::Validation("incremental record requires a parent_id".into())
                })?;
                let parent = records
                    .iter()
                    .find(|r| r.id == parent_id)
                    .ok_or_else(|| BackupError::RecordNotFound {
                        record_id: parent_id.to_string(),
                    })?;
                if parent.sandbox_id != record.sandbox_id {
                    return Err(BackupError::Validation(format!(
                        "parent record {} belongs to sandbox {}, not {}",
                        parent.id, parent.sandbox_id, record.sandbox_id
                    )));
                }
            }
            BackupKind::Full => {
                if record.parent_id.is_some() {
                    return Err(BackupError::Validation(
                        "full record must not have a parent_id".into(),
                    ));
                }
            }
        }

        let id = record.id.clone();
        records.push(record);
        self.persist(&records).await?;
        Ok(id)
    }

    /// Records filtered by sandbox and kind, most recently created first.
    pub async fn list_records(
        &self,
        sandbox_id: Option<&str>,
        kind: Option<BackupKind>,
    ) -> Vec<BackupRecord> {
        let records = self.records.read().await;
        let mut out: Vec<BackupRecord> = records
            .iter()
            .filter(|r| sandbox_id.map_or(true, |s| r.sandbox_id == s))
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub async fn get_record(&self, id: &str) -> Result<BackupRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| BackupError::RecordNotFound {
                record_id: id.to_string(),
            })
    }

    /// Most recently created record for a sandbox, any kind. This is the
    /// default parent for a new incremental: by construction it belongs to
    /// the newest chain.
    pub async fn latest_record(&self, sandbox_id: &str) -> Option<BackupRecord> {
        self.list_records(Some(sandbox_id), None).await.into_iter().next()
    }

    /// Most recently created full record for a sandbox.
    pub async fn latest_full(&self, sandbox_id: &str) -> Option<BackupRecord> {
        self.list_records(Some(sandbox_id), Some(BackupKind::Full))
            .await
            .into_iter()
            .next()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Resolve the ordered lineage `[Full, Incremental…, target]` for a
    /// record by walking parent pointers. Broken parents and cycles surface
    /// as `ChainIntegrity`.
    pub async fn chain_for(&self, record_id: &str) -> Result<Vec<BackupRecord>> {
        let records = self.records.read().await;

        let mut current = records
            .iter()
            .find(|r| r.id == record_id)
            .ok_or_else(|| BackupError::RecordNotFound {
                record_id: record_id.to_string(),
            })?;

        let mut chain = vec![current.clone()];
        let mut visited: HashSet<&str> = HashSet::from([current.id.as_str()]);

        while !current.is_full() {
            let parent_id = current.parent_id.as_deref().ok_or_else(|| {
                BackupError::ChainIntegrity {
                    record_id: record_id.to_string(),
                    reason: "chain does not terminate at a full record".into(),
                }
            })?;
            if !visited.insert(parent_id) {
                return Err(BackupError::ChainIntegrity {
                    record_id: record_id.to_string(),
                    reason: format!("cycle through record {parent_id}"),
                });
            }
            current = records.iter().find(|r| r.id == parent_id).ok_or_else(|| {
                BackupError::ChainIntegrity {
                    record_id: record_id.to_string(),
                    reason: format!("parent record {parent_id} is missing"),
                }
            })?;
            if current.sandbox_id != chain[0].sandbox_id {
                return Err(BackupError::ChainIntegrity {
                    record_id: record_id.to_string(),
                    reason: format!(
                        "parent record {} belongs to a different sandbox",
                        current.id
                    ),
                });
            }
            chain.push(current.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Delete a record. With dependents and `cascade == false` this fails
    /// with `Dependency`; with `cascade == true` the whole dependent subtree
    /// is removed, children first. Archive files of removed records are
    /// deleted best-effort after the store is persisted. Returns the removed
    /// records.
    pub async fn delete_record(&self, id: &str, cascade: bool) -> Result<Vec<BackupRecord>> {
        let mut records = self.records.write().await;

        if !records.iter().any(|r| r.id == id) {
            return Err(BackupError::RecordNotFound {
                record_id: id.to_string(),
            });
        }

        let direct_dependents = records
            .iter()
            .filter(|r| r.parent_id.as_deref() == Some(id))
            .count();
        if direct_dependents > 0 && !cascade {
            return Err(BackupError::Dependency {
                record_id: id.to_string(),
                dependents: direct_dependents,
            });
        }

        // Breadth-first over the dependent subtree, then remove leaves first.
        let mut doomed: Vec<String> = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = doomed[cursor].clone();
            for r in records.iter() {
                if r.parent_id.as_deref() == Some(parent.as_str()) {
                    doomed.push(r.id.clone());
                }
            }
            cursor += 1;
        }
        doomed.reverse();

        let doomed_set: HashSet<&str> = doomed.iter().map(String::as_str).collect();
        let mut removed: Vec<BackupRecord> = Vec::with_capacity(doomed.len());
        records.retain(|r| {
            if doomed_set.contains(r.id.as_str()) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        removed.sort_by_key(|r| doomed.iter().position(|d| d == &r.id));

        self.persist(&records).await?;
        drop(records);

        for record in &removed {
            if let Err(e) = tokio::fs::remove_file(&record.archive_path).await {
                tracing::warn!(
                    record_id = %record.id,
                    path = %record.archive_path.display(),
                    "Failed to remove archive file: {}", e
                );
            }
        }

        tracing::info!(record_id = %id, removed = removed.len(), cascade, "Deleted backup record(s)");
        Ok(removed)
    }

    /// Re-checksum every record's archive. Read-only: repeated audits never
    /// change the store. Missing archives show up as `MissingFile` outcomes
    /// so one bad record never stops the sweep.
    pub async fn audit(&self) -> Result<Vec<AuditEntry>> {
        let records = self.records.read().await.clone();
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let outcome = integrity::validate(&record.archive_path, &record.checksum).await?;
            if !outcome.is_valid() {
                tracing::warn!(record_id = %record.id, ?outcome, "Audit found a bad archive");
            }
            entries.push(AuditEntry {
                record_id: record.id,
                sandbox_id: record.sandbox_id,
                outcome,
            });
        }
        Ok(entries)
    }

    async fn persist(&self, records: &[BackupRecord]) -> Result<()> {
        let doc = CatalogDocument {
            version: CATALOG_FORMAT_VERSION,
            records: records.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.store_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.store_path.with_file_name(".catalog.json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.store_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    fn record(
        sandbox_id: &str,
        kind: BackupKind,
        parent_id: Option<&str>,
        age_secs: i64,
        archive_path: &Path,
    ) -> BackupRecord {
        BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            sandbox_id: sandbox_id.into(),
            kind,
            parent_id: parent_id.map(String::from),
            created_at: Utc::now() - Duration::seconds(age_secs),
            size_bytes: 128,
            checksum: "00".repeat(32),
            archive_path: archive_path.to_path_buf(),
            changed_file_count: matches!(kind, BackupKind::Incremental).then_some(1),
            compressed: false,
        }
    }

    fn catalog(dir: &TempDir) -> BackupCatalog {
        BackupCatalog::open(dir.path().join("catalog.json")).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_and_list_ordering() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let old = record("distroA", BackupKind::Full, None, 120, Path::new("/tmp/a"));
        let old_id = cat.add_record(old.clone()).await.unwrap();
        let newer = record(
            "distroA",
            BackupKind::Incremental,
            Some(&old_id),
            10,
            Path::new("/tmp/b"),
        );
        let newer_id = cat.add_record(newer).await.unwrap();
        cat.add_record(record("distroB", BackupKind::Full, None, 5, Path::new("/tmp/c")))
            .await
            .unwrap();

        assert_eq!(cat.get_record(&old_id).await.unwrap().sandbox_id, "distroA");

        let listed = cat.list_records(Some("distroA"), None).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer_id, "most recent first");

        let fulls = cat.list_records(None, Some(BackupKind::Full)).await;
        assert_eq!(fulls.len(), 2);

        assert_eq!(cat.latest_record("distroA").await.unwrap().id, newer_id);
        assert_eq!(cat.latest_full("distroA").await.unwrap().id, old_id);
    }

    #[tokio::test]
    async fn test_incremental_requires_existing_parent_in_same_sandbox() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let orphan = record(
            "distroA",
            BackupKind::Incremental,
            Some("no-such-record"),
            0,
            Path::new("/tmp/x"),
        );
        assert!(matches!(
            cat.add_record(orphan).await,
            Err(BackupError::RecordNotFound { .. })
        ));

        let other_full = record("distroB", BackupKind::Full, None, 10, Path::new("/tmp/y"));
        let other_id = cat.add_record(other_full).await.unwrap();
        let cross = record(
            "distroA",
            BackupKind::Incremental,
            Some(&other_id),
            0,
            Path::new("/tmp/z"),
        );
        assert!(matches!(
            cat.add_record(cross).await,
            Err(BackupError::Validation(_))
        ));
        assert_eq!(cat.len().await, 1);
    }

    #[tokio::test]
    async fn test_chain_resolution() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let full_id = cat
            .add_record(record("distroA", BackupKind::Full, None, 300, Path::new("/tmp/f")))
            .await
            .unwrap();
        let inc1_id = cat
            .add_record(record(
                "distroA",
                BackupKind::Incremental,
                Some(&full_id),
                200,
                Path::new("/tmp/i1"),
            ))
            .await
            .unwrap();
        let inc2_id = cat
            .add_record(record(
                "distroA",
                BackupKind::Incremental,
                Some(&inc1_id),
                100,
                Path::new("/tmp/i2"),
            ))
            .await
            .unwrap();

        let chain = cat.chain_for(&inc2_id).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![full_id.as_str(), inc1_id.as_str(), inc2_id.as_str()]);

        // A full record is its own chain.
        assert_eq!(cat.chain_for(&full_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_cycle_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.json");

        // Hand-write a store with a parent cycle; add_record would refuse it.
        let a = record("distroA", BackupKind::Incremental, Some("b"), 10, Path::new("/tmp/a"));
        let mut a = a;
        a.id = "a".into();
        let mut b = record("distroA", BackupKind::Incremental, Some("a"), 20, Path::new("/tmp/b"));
        b.id = "b".into();
        let doc = CatalogDocument { version: CATALOG_FORMAT_VERSION, records: vec![a, b] };
        std::fs::write(&store, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

        let cat = BackupCatalog::open(&store).unwrap();
        assert!(matches!(
            cat.chain_for("a").await,
            Err(BackupError::ChainIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_record_dependency_and_cascade() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let full_archive = dir.path().join("full.archive");
        let inc_archive = dir.path().join("inc.archive");
        std::fs::write(&full_archive, b"full").unwrap();
        std::fs::write(&inc_archive, b"inc").unwrap();

        let full_id = cat
            .add_record(record("distroA", BackupKind::Full, None, 100, &full_archive))
            .await
            .unwrap();
        cat.add_record(record(
            "distroA",
            BackupKind::Incremental,
            Some(&full_id),
            10,
            &inc_archive,
        ))
        .await
        .unwrap();

        // Scenario 6: refusing without cascade, removing everything with it.
        assert!(matches!(
            cat.delete_record(&full_id, false).await,
            Err(BackupError::Dependency { dependents: 1, .. })
        ));

        let removed = cat.delete_record(&full_id, true).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed.last().unwrap().id, full_id, "children removed first");
        assert_eq!(cat.len().await, 0);
        assert!(!full_archive.exists());
        assert!(!inc_archive.exists());
    }

    #[tokio::test]
    async fn test_audit_reports_per_record_outcomes() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let good_archive = dir.path().join("good.archive");
        std::fs::write(&good_archive, b"good bytes").unwrap();
        let mut good = record("distroA", BackupKind::Full, None, 30, &good_archive);
        good.checksum = crate::integrity::checksum_bytes(b"good bytes");
        let good_id = cat.add_record(good).await.unwrap();

        let stale_archive = dir.path().join("stale.archive");
        std::fs::write(&stale_archive, b"tampered").unwrap();
        let stale_id = cat
            .add_record(record("distroA", BackupKind::Full, None, 20, &stale_archive))
            .await
            .unwrap();

        let gone_id = cat
            .add_record(record("distroB", BackupKind::Full, None, 10, Path::new("/tmp/gone")))
            .await
            .unwrap();

        let entries = cat.audit().await.unwrap();
        assert_eq!(entries.len(), 3);
        let outcome_of = |id: &str| {
            entries
                .iter()
                .find(|e| e.record_id == id)
                .map(|e| e.outcome.clone())
                .unwrap()
        };
        assert!(outcome_of(&good_id).is_valid());
        assert!(matches!(
            outcome_of(&stale_id),
            crate::integrity::ValidationOutcome::Mismatch { .. }
        ));
        assert_eq!(
            outcome_of(&gone_id),
            crate::integrity::ValidationOutcome::MissingFile
        );

        // Auditing never mutates the store.
        assert_eq!(cat.len().await, 3);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.json");

        let cat = BackupCatalog::open(&store).unwrap();
        let id = cat
            .add_record(record("distroA", BackupKind::Full, None, 0, Path::new("/tmp/a")))
            .await
            .unwrap();
        drop(cat);

        let reopened = BackupCatalog::open(&store).unwrap();
        assert_eq!(reopened.get_record(&id).await.unwrap().sandbox_id, "distroA");
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("catalog.json");
        std::fs::write(&store, "{ not json").unwrap();

        assert!(matches!(
            BackupCatalog::open(&store),
            Err(BackupError::CatalogCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_sandbox_lock_is_shared_per_sandbox() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);

        let a1 = cat.sandbox_lock("distroA");
        let a2 = cat.sandbox_lock("distroA");
        let b = cat.sandbox_lock("distroB");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        // Holding the permit blocks a second acquisition on the same sandbox.
        let permit = a1.acquire().await.unwrap();
        assert!(a2.try_acquire().is_err());
        drop(permit);
        assert!(a2.try_acquire().is_ok());
    }
}
