//! Scripted adapters for exercising failure paths in tests.

use super::{ArchiveStream, Credentials, ExecOutput, RemoteExecutor, RemoteTarget, SnapshotAdapter};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Remote executor that records every call and fails for scripted hosts.
pub struct MockRemoteExecutor {
    fail_hosts: HashSet<String>,
    pub copies: Mutex<Vec<(String, String)>>,
    pub commands: Mutex<Vec<(String, String)>>,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self {
            fail_hosts: HashSet::new(),
            copies: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_for(hosts: &[&str]) -> Self {
        let mut mock = Self::new();
        mock.fail_hosts = hosts.iter().map(|h| h.to_string()).collect();
        mock
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn copy_file(
        &self,
        target: &RemoteTarget,
        _credentials: &Credentials,
        _local: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()> {
        if self.fail_hosts.contains(&target.host) {
            anyhow::bail!("connection refused by {}", target.host);
        }
        self.copies
            .lock()
            .unwrap()
            .push((target.host.clone(), remote_path.to_string()));
        Ok(())
    }

    async fn run_command(
        &self,
        target: &RemoteTarget,
        _credentials: &Credentials,
        command: &str,
    ) -> anyhow::Result<ExecOutput> {
        if self.fail_hosts.contains(&target.host) {
            anyhow::bail!("connection refused by {}", target.host);
        }
        self.commands
            .lock()
            .unwrap()
            .push((target.host.clone(), command.to_string()));
        Ok(ExecOutput {
            exit_code: 0,
            stdout: "deployed-sandbox\n".into(),
            stderr: String::new(),
        })
    }
}

/// Archive stream that yields a few bytes, then an I/O error.
struct BrokenStream {
    sent: bool,
}

impl AsyncRead for BrokenStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.sent {
            self.sent = true;
            buf.put_slice(b"partial archive bytes");
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(std::io::Error::other("capture stream interrupted")))
        }
    }
}

/// Snapshot adapter whose capture stream dies mid-transfer.
pub struct BrokenCaptureAdapter;

#[async_trait]
impl SnapshotAdapter for BrokenCaptureAdapter {
    async fn exists(&self, _sandbox_id: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn capture(&self, _sandbox_id: &str) -> anyhow::Result<ArchiveStream> {
        Ok(Box::new(BrokenStream { sent: false }))
    }

    async fn materialize(
        &self,
        _sandbox_id: &str,
        _archive: ArchiveStream,
    ) -> anyhow::Result<()> {
        anyhow::bail!("not supported")
    }

    async fn sandbox_root(&self, _sandbox_id: &str) -> anyhow::Result<PathBuf> {
        anyhow::bail!("not supported")
    }

    async fn exec(&self, _sandbox_id: &str, _command: &str) -> anyhow::Result<ExecOutput> {
        anyhow::bail!("not supported")
    }
}
