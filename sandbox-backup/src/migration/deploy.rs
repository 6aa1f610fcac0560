//! Batch deployment of migration packages.
//!
//! A bounded worker pool uploads the package to each target and runs the
//! remote install command. Per-target failures land in that target's result
//! and never abort the batch; only coordinator-level validation errors do.

use crate::adapters::{Credentials, RemoteExecutor, RemoteTarget};
use crate::config::EngineConfig;
use crate::error::{BackupError, Result};
use crate::events::{EngineEvent, EngineEvents};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub target_host: String,
    pub success: bool,
    /// Target was never dispatched because the batch was cancelled.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sandbox id reported by the remote installer (its last stdout line).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_sandbox_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<DeploymentResult>,
}

pub struct DeploymentCoordinator {
    remote: Arc<dyn RemoteExecutor>,
    config: EngineConfig,
    events: EngineEvents,
}

impl DeploymentCoordinator {
    pub fn new(remote: Arc<dyn RemoteExecutor>, config: EngineConfig) -> Self {
        Self {
            remote,
            config,
            events: EngineEvents::new(),
        }
    }

    /// Share an existing event bus (e.g. the engine's) instead of a private one.
    pub fn with_events(mut self, events: EngineEvents) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EngineEvents {
        &self.events
    }

    pub async fn deploy_batch(
        &self,
        package_path: &Path,
        targets: &[RemoteTarget],
        credentials: &Credentials,
        max_concurrent: usize,
    ) -> Result<DeploymentReport> {
        self.deploy_batch_with_cancel(
            package_path,
            targets,
            credentials,
            max_concurrent,
            CancellationToken::new(),
        )
        .await
    }

    /// Deploy one package to many hosts under bounded concurrency.
    ///
    /// Cancellation lets in-flight targets finish; targets still waiting for
    /// a worker slot are reported as skipped. The report is assembled only
    /// once every dispatched target has produced a result.
    pub async fn deploy_batch_with_cancel(
        &self,
        package_path: &Path,
        targets: &[RemoteTarget],
        credentials: &Credentials,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Result<DeploymentReport> {
        if targets.is_empty() {
            return Err(BackupError::Validation("deployment target list is empty".into()));
        }
        if max_concurrent == 0 {
            return Err(BackupError::Validation("max_concurrent must be at least 1".into()));
        }
        if !package_path.is_file() {
            return Err(BackupError::Validation(format!(
                "migration package not found: {}",
                package_path.display()
            )));
        }
        let file_name = package_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::Validation("package path has no file name".into()))?;

        let remote_path = format!(
            "{}/{}",
            self.config.remote_staging_dir.trim_end_matches('/'),
            file_name
        );
        let install_command = self
            .config
            .remote_install_command
            .replace("{package}", &remote_path);

        tracing::info!(
            package = %package_path.display(),
            targets = targets.len(),
            max_concurrent,
            "Starting batch deployment"
        );

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let (tx, mut rx) = mpsc::channel::<DeploymentResult>(targets.len());

        for target in targets.iter().cloned() {
            let remote = self.remote.clone();
            let credentials = credentials.clone();
            let package_path = package_path.to_path_buf();
            let remote_path = remote_path.clone();
            let install_command = install_command.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = if cancel.is_cancelled() {
                    skipped_result(&target)
                } else {
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            // Dispatched: run to completion even if the batch
                            // gets cancelled meanwhile.
                            Ok(_permit) => {
                                deploy_one(
                                    remote.as_ref(),
                                    &target,
                                    &credentials,
                                    &package_path,
                                    &remote_path,
                                    &install_command,
                                )
                                .await
                            }
                            Err(_) => skipped_result(&target),
                        },
                        _ = cancel.cancelled() => skipped_result(&target),
                    }
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(targets.len());
        while let Some(result) = rx.recv().await {
            self.events.publish(EngineEvent::DeployTargetFinished {
                host: result.target_host.clone(),
                success: result.success,
                skipped: result.skipped,
            });
            if result.success {
                tracing::info!(host = %result.target_host, "Deployment target succeeded");
            } else if result.skipped {
                tracing::info!(host = %result.target_host, "Deployment target skipped");
            } else {
                tracing::warn!(
                    host = %result.target_host,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Deployment target failed"
                );
            }
            results.push(result);
        }

        // Report in the caller's target order, not completion order.
        results.sort_by_key(|r| targets.iter().position(|t| t.host == r.target_host));

        let succeeded = results.iter().filter(|r| r.success).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.len() - succeeded - skipped;
        let report = DeploymentReport {
            total: results.len(),
            succeeded,
            failed,
            skipped,
            results,
        };

        self.events.publish(EngineEvent::DeployBatchCompleted {
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
        });
        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Batch deployment finished"
        );

        Ok(report)
    }
}

async fn deploy_one(
    remote: &dyn RemoteExecutor,
    target: &RemoteTarget,
    credentials: &Credentials,
    package_path: &Path,
    remote_path: &str,
    install_command: &str,
) -> DeploymentResult {
    if let Err(e) = remote
        .copy_file(target, credentials, package_path, remote_path)
        .await
    {
        let error = BackupError::Network {
            host: target.host.clone(),
            reason: format!("package upload failed: {e:#}"),
        };
        return failed_result(target, error.to_string());
    }

    match remote.run_command(target, credentials, install_command).await {
        Ok(output) if output.success() => {
            let installed_sandbox_id = output
                .stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(String::from);
            DeploymentResult {
                target_host: target.host.clone(),
                success: true,
                skipped: false,
                error: None,
                installed_sandbox_id,
                timestamp: Utc::now(),
            }
        }
        Ok(output) => failed_result(
            target,
            format!(
                "install command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        ),
        Err(e) => {
            let error = BackupError::Network {
                host: target.host.clone(),
                reason: format!("install command failed: {e:#}"),
            };
            failed_result(target, error.to_string())
        }
    }
}

fn failed_result(target: &RemoteTarget, error: String) -> DeploymentResult {
    DeploymentResult {
        target_host: target.host.clone(),
        success: false,
        skipped: false,
        error: Some(error),
        installed_sandbox_id: None,
        timestamp: Utc::now(),
    }
}

fn skipped_result(target: &RemoteTarget) -> DeploymentResult {
    DeploymentResult {
        target_host: target.host.clone(),
        success: false,
        skipped: true,
        error: None,
        installed_sandbox_id: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockRemoteExecutor;
    use crate::testutil::init_tracing;
    use tempfile::TempDir;

    fn coordinator(remote: MockRemoteExecutor, dir: &TempDir) -> DeploymentCoordinator {
        init_tracing();
        let config = EngineConfig::with_data_dir(dir.path().join("data"));
        DeploymentCoordinator::new(Arc::new(remote), config)
    }

    fn package_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("distroA-test.pkg");
        std::fs::write(&path, b"package bytes").unwrap();
        path
    }

    fn creds() -> Credentials {
        Credentials { username: "deploy".into(), password: "secret".into() }
    }

    #[tokio::test]
    async fn test_per_target_failure_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let package = package_file(&dir);
        let coordinator = coordinator(MockRemoteExecutor::failing_for(&["hostA"]), &dir);

        // Scenario 5: one failing and one healthy target, both reported.
        let targets = [RemoteTarget::new("hostA"), RemoteTarget::new("hostB")];
        let report = coordinator
            .deploy_batch(&package, &targets, &creds(), 2)
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);

        let a = &report.results[0];
        assert_eq!(a.target_host, "hostA");
        assert!(!a.success);
        assert!(a.error.as_deref().unwrap().contains("hostA"));

        let b = &report.results[1];
        assert_eq!(b.target_host, "hostB");
        assert!(b.success);
        assert_eq!(b.installed_sandbox_id.as_deref(), Some("deployed-sandbox"));
    }

    #[tokio::test]
    async fn test_upload_and_install_reach_every_healthy_target() {
        let dir = TempDir::new().unwrap();
        let package = package_file(&dir);
        let remote = Arc::new(MockRemoteExecutor::new());
        let config = EngineConfig::with_data_dir(dir.path().join("data"));
        let coordinator = DeploymentCoordinator::new(remote.clone(), config);

        let targets = [
            RemoteTarget::new("host1"),
            RemoteTarget::new("host2"),
            RemoteTarget::new("host3"),
        ];
        let report = coordinator
            .deploy_batch(&package, &targets, &creds(), 1)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 3);

        let copies = remote.copies.lock().unwrap();
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|(_, path)| path == "/tmp/distroA-test.pkg"));

        let commands = remote.commands.lock().unwrap();
        assert!(commands
            .iter()
            .all(|(_, cmd)| cmd == "sandbox-backup install /tmp/distroA-test.pkg"));
    }

    #[tokio::test]
    async fn test_coordinator_level_validation_aborts() {
        let dir = TempDir::new().unwrap();
        let package = package_file(&dir);
        let coordinator = coordinator(MockRemoteExecutor::new(), &dir);

        let err = coordinator
            .deploy_batch(&package, &[], &creds(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));

        let err = coordinator
            .deploy_batch(
                &dir.path().join("missing.pkg"),
                &[RemoteTarget::new("host1")],
                &creds(),
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));

        let err = coordinator
            .deploy_batch(&package, &[RemoteTarget::new("host1")], &creds(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_undispatched_targets_as_skipped() {
        let dir = TempDir::new().unwrap();
        let package = package_file(&dir);
        let coordinator = coordinator(MockRemoteExecutor::new(), &dir);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let targets = [RemoteTarget::new("host1"), RemoteTarget::new("host2")];
        let report = coordinator
            .deploy_batch_with_cancel(&package, &targets, &creds(), 2, cancel)
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 2);
        assert!(report.results.iter().all(|r| r.skipped && !r.success));
    }

    #[tokio::test]
    async fn test_batch_events_are_published() {
        let dir = TempDir::new().unwrap();
        let package = package_file(&dir);
        let coordinator = coordinator(MockRemoteExecutor::new(), &dir);

        let mut rx = coordinator.events().subscribe();
        coordinator
            .deploy_batch(&package, &[RemoteTarget::new("host1")], &creds(), 1)
            .await
            .unwrap();

        let mut saw_target = false;
        let mut saw_batch = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::DeployTargetFinished { host, success, .. } => {
                    assert_eq!(host, "host1");
                    assert!(success);
                    saw_target = true;
                }
                EngineEvent::DeployBatchCompleted { total, succeeded, .. } => {
                    assert_eq!((total, succeeded), (1, 1));
                    saw_batch = true;
                }
                _ => {}
            }
        }
        assert!(saw_target && saw_batch);
    }
}
