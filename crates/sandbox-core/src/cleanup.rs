//! Periodic TTL sweep with bounded concurrency and threshold alerting.
//! Spawned the same way as the orchestrator's health monitor: a
//! `tokio::spawn` task driven by an interval, stoppable via an atomic flag.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CleanupConfig;
use crate::orchestrator::Orchestrator;
use crate::store::Store;

pub struct CleanupEngine {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
    config: CleanupConfig,
    stopped: AtomicBool,
}

impl CleanupEngine {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<dyn Store>, config: CleanupConfig) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            store,
            config,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.stopped.load(Ordering::SeqCst) {
                    return;
                }
                this.sweep().await;
                this.check_usage_alert().await;
            }
        })
    }

    /// Idempotent: calling Stop more than once is a no-op, it just flips
    /// an already-set flag.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn sweep(&self) {
        let expired = match self.store.list_expired(chrono::Utc::now()).await {
            Ok(list) => list,
            Err(err) => {
                error!(error = %err, "cleanup sweep failed to list expired workspaces");
                return;
            }
        };

        if expired.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let tasks = expired.into_iter().map(|workspace| {
            let semaphore = semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let store = self.store.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                metrics::counter!("cleanup_destroy_attempts", 1);
                if let Ok((_, provider)) = orchestrator
                    .select_provider(
                        workspace.container_kind,
                        workspace.deployment_mode,
                        Some(workspace.provider_kind),
                    )
                    .await
                {
                    let fresh_deadline = std::time::Duration::from_secs(30);
                    match tokio::time::timeout(
                        fresh_deadline,
                        provider.destroy(&workspace.provider_local_id),
                    )
                    .await
                    {
                        Ok(Ok(())) => metrics::counter!("cleanup_destroy_success", 1),
                        _ => metrics::counter!("cleanup_destroy_failure", 1),
                    }
                }
                let mut workspace = workspace;
                workspace.status = sandbox_types::WorkspaceStatus::Stopped;
                if let Err(err) = store.update(workspace.clone()).await {
                    warn!(error = %err, workspace = %workspace.id, "cleanup failed to mark workspace stopped");
                }
            }
        });

        futures::future::join_all(tasks).await;
    }

    async fn check_usage_alert(&self) {
        if self.config.max_concurrent == 0 {
            return;
        }
        let active = match self.store.count_active().await {
            Ok(n) => n,
            Err(err) => {
                error!(error = %err, "cleanup failed to count active workspaces");
                return;
            }
        };
        let usage = active as f64 / self.config.max_concurrent as f64;
        metrics::gauge!("workspace_capacity_usage", usage);
        if usage >= 1.0 {
            error!(usage, max_concurrent = self.config.max_concurrent, "workspace capacity exhausted");
        } else if usage >= self.config.alert_threshold {
            warn!(usage, threshold = self.config.alert_threshold, "workspace capacity nearing limit");
        } else {
            info!(usage, "workspace capacity nominal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::store::{InMemoryStore, Store};
    use sandbox_types::{ContainerKind, DeploymentMode, ProviderKind, ResourceLimits};

    #[tokio::test]
    async fn sweep_leaves_persistent_mcp_untouched() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        let store = InMemoryStore::new();

        let mut persistent = sandbox_types::AgentWorkspace::new_creating(
            ContainerKind::McpServer,
            ProviderKind::UserKernel,
            DeploymentMode::SelfHosted,
            ResourceLimits::default(),
            None,
        );
        persistent.status = sandbox_types::WorkspaceStatus::Ready;
        let persistent_id = persistent.id;
        store.create(persistent).await.unwrap();

        let engine = CleanupEngine::new(orch, store.clone(), CleanupConfig {
            interval: std::time::Duration::from_secs(3600),
            max_concurrent: 10,
            alert_threshold: 0.8,
        });
        engine.sweep().await;

        let still_there = store.get(persistent_id).await.unwrap();
        assert_eq!(still_there.status, sandbox_types::WorkspaceStatus::Ready);
    }
}
