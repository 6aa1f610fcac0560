//! Engine event bus.
//!
//! Lifecycle events for backups, restores and deployments are published on a
//! broadcast channel so an embedding process (CLI, UI bridge) can follow
//! long-running operations without polling.

use serde::Serialize;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BackupStarted {
        sandbox_id: String,
        kind: String,
    },
    BackupCompleted {
        sandbox_id: String,
        record_id: String,
        size_bytes: u64,
    },
    BackupSkipped {
        sandbox_id: String,
        parent_id: String,
    },
    BackupFailed {
        sandbox_id: String,
        error: String,
    },
    RestorePhase {
        record_id: String,
        sandbox_id: String,
        phase: String,
    },
    DeployTargetFinished {
        host: String,
        success: bool,
        skipped: bool,
    },
    DeployBatchCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

#[derive(Clone)]
pub struct EngineEvents {
    tx: broadcast::Sender<EngineEvent>,
}

impl EngineEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish; events are dropped when nobody subscribes.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EngineEvents {
    fn default() -> Self {
        Self::new()
    }
}
