//! Capability seams to the sandbox runtime, configuration introspection and
//! remote execution.
//!
//! The engine never talks to an OS tool directly; everything external comes
//! in through these traits. Implementations return `anyhow::Result` so a
//! collaborator can fail with whatever it has; the engine maps those
//! failures into its own taxonomy at the call site.

pub mod local;
#[cfg(test)]
pub mod mock;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// Opaque archive byte stream handed between the engine and an adapter.
pub type ArchiveStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capture/restore surface of the sandbox runtime.
#[async_trait]
pub trait SnapshotAdapter: Send + Sync {
    async fn exists(&self, sandbox_id: &str) -> anyhow::Result<bool>;

    /// Stream the sandbox's entire filesystem as one archive blob. The blob
    /// format belongs to the adapter; the engine only stores and hashes it.
    async fn capture(&self, sandbox_id: &str) -> anyhow::Result<ArchiveStream>;

    /// Materialize a previously captured archive as a new sandbox. Fails if
    /// the sandbox already exists.
    async fn materialize(&self, sandbox_id: &str, archive: ArchiveStream) -> anyhow::Result<()>;

    /// Filesystem root of a live sandbox, used for incremental change scans
    /// and delta application.
    async fn sandbox_root(&self, sandbox_id: &str) -> anyhow::Result<PathBuf>;

    /// Run a command inside the sandbox.
    async fn exec(&self, sandbox_id: &str, command: &str) -> anyhow::Result<ExecOutput>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub hostname: String,
    pub addresses: Vec<String>,
}

/// A sandbox's effective configuration as reported by the runtime.
/// Serialized into migration manifests, hence the camelCase keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfiguration {
    pub default_user: String,
    pub packages: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os_release: String,
    pub kernel: String,
    pub cpu_count: usize,
}

/// Reads sandbox configuration and host system info for migration manifests.
#[async_trait]
pub trait ConfigIntrospector: Send + Sync {
    async fn inspect(&self, sandbox_id: &str) -> anyhow::Result<SandboxConfiguration>;
    async fn system_info(&self) -> anyhow::Result<SystemInfo>;
}

/// Introspector answering from pre-supplied data. Useful when the real
/// runtime introspection runs out-of-process and hands its result in, and
/// for tests.
pub struct StaticConfigIntrospector {
    configuration: SandboxConfiguration,
    system: SystemInfo,
}

impl StaticConfigIntrospector {
    pub fn new(configuration: SandboxConfiguration, system: SystemInfo) -> Self {
        Self { configuration, system }
    }
}

#[async_trait]
impl ConfigIntrospector for StaticConfigIntrospector {
    async fn inspect(&self, _sandbox_id: &str) -> anyhow::Result<SandboxConfiguration> {
        Ok(self.configuration.clone())
    }

    async fn system_info(&self) -> anyhow::Result<SystemInfo> {
        Ok(self.system.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: 22 }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Copies files to and runs commands on remote hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn copy_file(
        &self,
        target: &RemoteTarget,
        credentials: &Credentials,
        local: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()>;

    async fn run_command(
        &self,
        target: &RemoteTarget,
        credentials: &Credentials,
        command: &str,
    ) -> anyhow::Result<ExecOutput>;
}
