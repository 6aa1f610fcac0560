//! SSH-backed remote executor.
//!
//! Password-authenticated SSH with SFTP uploads. ssh2 is a blocking library,
//! so every operation runs inside `spawn_blocking`.

use super::{Credentials, ExecOutput, RemoteExecutor, RemoteTarget};
use anyhow::Context;
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};

pub struct SshRemoteExecutor;

impl SshRemoteExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SshRemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for SshRemoteExecutor {
    async fn copy_file(
        &self,
        target: &RemoteTarget,
        credentials: &Credentials,
        local: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()> {
        let target = target.clone();
        let credentials = credentials.clone();
        let local: PathBuf = local.to_path_buf();
        let remote_path = remote_path.to_string();

        tokio::task::spawn_blocking(move || {
            let sess = connect(&target, &credentials)?;
            upload(&sess, &local, &remote_path)
        })
        .await
        .context("ssh upload task failed")?
    }

    async fn run_command(
        &self,
        target: &RemoteTarget,
        credentials: &Credentials,
        command: &str,
    ) -> anyhow::Result<ExecOutput> {
        let target = target.clone();
        let credentials = credentials.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let sess = connect(&target, &credentials)?;
            exec(&sess, &command)
        })
        .await
        .context("ssh exec task failed")?
    }
}

fn connect(target: &RemoteTarget, credentials: &Credentials) -> anyhow::Result<ssh2::Session> {
    let tcp = std::net::TcpStream::connect((target.host.as_str(), target.port))
        .with_context(|| format!("failed to reach {}:{}", target.host, target.port))?;
    let mut sess = ssh2::Session::new()?;
    sess.set_tcp_stream(tcp);
    sess.handshake()?;

    sess.userauth_password(&credentials.username, &credentials.password)
        .map_err(|e| anyhow::anyhow!("SSH authentication failed for {}: {}", target.host, e))?;
    if !sess.authenticated() {
        anyhow::bail!("SSH authentication failed for {}", target.host);
    }

    Ok(sess)
}

fn upload(sess: &ssh2::Session, local: &Path, remote_path: &str) -> anyhow::Result<()> {
    let data = std::fs::read(local)
        .with_context(|| format!("failed to read {}", local.display()))?;

    let sftp = sess.sftp()?;
    let mut remote_file = sftp.create(Path::new(remote_path))?;
    std::io::Write::write_all(&mut remote_file, &data)?;
    Ok(())
}

fn exec(sess: &ssh2::Session, command: &str) -> anyhow::Result<ExecOutput> {
    let mut channel = sess.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(ExecOutput { exit_code, stdout, stderr })
}
