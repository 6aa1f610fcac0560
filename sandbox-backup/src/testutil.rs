//! Shared fixtures for the crate's tests.

use crate::adapters::local::LocalDirAdapter;
use crate::adapters::{
    NetworkInfo, SandboxConfiguration, SnapshotAdapter, StaticConfigIntrospector, SystemInfo,
};
use crate::catalog::BackupCatalog;
use crate::config::EngineConfig;
use crate::engine::BackupEngine;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .try_init();
}

/// Engine on a temp directory with sandboxes as plain directories.
pub(crate) struct TestEnv {
    pub dir: TempDir,
    pub engine: Arc<BackupEngine>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(dir.path().join("data"));
        tweak(&mut config);
        let adapter = Arc::new(LocalDirAdapter::new(dir.path().join("sandboxes")));
        Self::build(dir, config, adapter)
    }

    pub fn with_snapshot_adapter(adapter: Arc<dyn SnapshotAdapter>) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::with_data_dir(dir.path().join("data"));
        Self::build(dir, config, adapter)
    }

    fn build(dir: TempDir, config: EngineConfig, adapter: Arc<dyn SnapshotAdapter>) -> Self {
        let catalog = Arc::new(BackupCatalog::open(&config.catalog_path).unwrap());
        let engine = Arc::new(BackupEngine::new(catalog, adapter, config));
        Self { dir, engine }
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        self.engine.catalog()
    }

    pub fn sandbox_path(&self, sandbox_id: &str) -> PathBuf {
        self.dir.path().join("sandboxes").join(sandbox_id)
    }

    pub fn seed_sandbox(&self, sandbox_id: &str, files: &[(&str, &[u8])]) {
        let root = self.sandbox_path(sandbox_id);
        std::fs::create_dir_all(&root).unwrap();
        for (name, contents) in files {
            self.write_sandbox_file(sandbox_id, name, contents);
        }
    }

    pub fn write_sandbox_file(&self, sandbox_id: &str, relative: &str, contents: &[u8]) {
        let path = self.sandbox_path(sandbox_id).join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

/// Change detection compares whole seconds; wait until modifications land in
/// a strictly later second than anything written before.
pub(crate) async fn advance_past_mtime_granularity() {
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
}

pub(crate) fn static_introspector() -> StaticConfigIntrospector {
    StaticConfigIntrospector::new(
        SandboxConfiguration {
            default_user: "dev".into(),
            packages: vec!["bash".into(), "coreutils".into()],
            environment: BTreeMap::from([
                ("LANG".into(), "C.UTF-8".into()),
                ("PATH".into(), "/usr/bin:/bin".into()),
            ]),
            services: vec!["sshd".into()],
            network: Some(NetworkInfo {
                hostname: "distro-a".into(),
                addresses: vec!["10.0.0.5".into()],
            }),
        },
        SystemInfo {
            hostname: "builder".into(),
            os_release: "Ubuntu 24.04".into(),
            kernel: "6.8.0".into(),
            cpu_count: 8,
        },
    )
}
