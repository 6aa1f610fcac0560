//! Backup engine wiring and shared operation types.

pub mod full;
pub mod incremental;
pub mod restore;

pub use restore::{RestoreOptions, RestorePhase, RestoreReport};

use crate::adapters::SnapshotAdapter;
use crate::catalog::{BackupCatalog, BackupRecord};
use crate::config::EngineConfig;
use crate::events::EngineEvents;
use crate::scan::ScanOptions;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct BackupEngine {
    catalog: Arc<BackupCatalog>,
    snapshots: Arc<dyn SnapshotAdapter>,
    config: EngineConfig,
    events: EngineEvents,
    /// Engine-wide cap on simultaneous captures. Per-sandbox serialization
    /// is the catalog's per-sandbox lock; this bounds total load.
    capture_slots: Arc<Semaphore>,
}

impl BackupEngine {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        snapshots: Arc<dyn SnapshotAdapter>,
        config: EngineConfig,
    ) -> Self {
        let capture_slots = Arc::new(Semaphore::new(config.max_concurrent_backups.max(1)));
        Self {
            catalog,
            snapshots,
            config,
            events: EngineEvents::new(),
            capture_slots,
        }
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EngineEvents {
        &self.events
    }

    pub(crate) fn snapshots(&self) -> &Arc<dyn SnapshotAdapter> {
        &self.snapshots
    }

    pub(crate) fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            follow_links: false,
            exclude_names: self.config.scan_excludes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FullBackupOptions {
    /// zstd-compress the archive payload while storing it.
    pub compress: bool,
}

/// What an incremental backup attempt produced. `Skipped` means the change
/// scan found nothing newer than the parent; no record was created.
#[derive(Debug)]
pub enum IncrementalOutcome {
    Created(BackupRecord),
    Skipped { parent_id: String },
}

impl IncrementalOutcome {
    pub fn record(&self) -> Option<&BackupRecord> {
        match self {
            IncrementalOutcome::Created(record) => Some(record),
            IncrementalOutcome::Skipped { .. } => None,
        }
    }
}
