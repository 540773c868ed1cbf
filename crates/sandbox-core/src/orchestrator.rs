//! Provider registry, health tracking, and selection policy: one
//! `RwLock`-protected map, a background tick loop spawned with
//! `tokio::spawn`, cancellable via a stop signal.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_types::{ContainerKind, DeploymentMode, ProviderKind};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{CoreError, CoreResult};
use crate::provider::Provider;

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub message: String,
    pub active_count: u64,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            message: "registered".to_string(),
            active_count: 0,
        }
    }
}

struct Registration {
    provider: Arc<dyn Provider>,
    health: ProviderHealth,
}

pub struct Orchestrator {
    providers: RwLock<HashMap<ProviderKind, Registration>>,
    config: OrchestratorConfig,
}

/// Selection chains by (deployment mode, container kind), per the fixed
/// preference order. First registered-and-healthy entry wins.
fn selection_chain(mode: DeploymentMode, kind: ContainerKind) -> [ProviderKind; 3] {
    use ContainerKind::*;
    use DeploymentMode::*;
    use ProviderKind::*;
    match (mode, kind) {
        (Managed, McpServer) => [UserKernel, Managed, MicroVm],
        (Managed, Workspace) => [Managed, MicroVm, UserKernel],
        (SelfHosted, McpServer) => [UserKernel, MicroVm, Managed],
        (SelfHosted, Workspace) => [MicroVm, UserKernel, Managed],
    }
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            providers: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub async fn register(&self, kind: ProviderKind, provider: Arc<dyn Provider>) {
        self.providers.write().await.insert(
            kind,
            Registration {
                provider,
                health: ProviderHealth::default(),
            },
        );
        info!(provider = %kind, "provider registered");
    }

    pub async fn deregister(&self, kind: ProviderKind) {
        self.providers.write().await.remove(&kind);
        info!(provider = %kind, "provider deregistered");
    }

    pub async fn update_health(&self, kind: ProviderKind, health: ProviderHealth) {
        if let Some(reg) = self.providers.write().await.get_mut(&kind) {
            reg.health = health;
        }
    }

    async fn get_if_healthy(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        let guard = self.providers.read().await;
        let reg = guard.get(&kind)?;
        reg.health.healthy.then(|| reg.provider.clone())
    }

    /// Returns the requested provider verbatim (no fallback) when one is
    /// given, otherwise walks the selection chain for this mode/kind pair.
    pub async fn select_provider(
        &self,
        container_kind: ContainerKind,
        deployment_mode: DeploymentMode,
        requested: Option<ProviderKind>,
    ) -> CoreResult<(ProviderKind, Arc<dyn Provider>)> {
        if let Some(kind) = requested {
            return self
                .get_if_healthy(kind)
                .await
                .map(|p| (kind, p))
                .ok_or_else(|| CoreError::ProviderUnhealthy(kind.to_string(), "explicit request".into()));
        }

        for kind in selection_chain(deployment_mode, container_kind) {
            if let Some(provider) = self.get_if_healthy(kind).await {
                return Ok((kind, provider));
            }
        }
        Err(CoreError::ProviderNotRegistered(
            "no healthy provider in selection chain".into(),
        ))
    }

    /// Marks `failing` unhealthy, then retries selection once. Callers
    /// (the Auto-Provisioner) use this to converge on the first retry.
    pub async fn select_provider_with_fallback(
        &self,
        container_kind: ContainerKind,
        deployment_mode: DeploymentMode,
        failing: ProviderKind,
        reason: String,
    ) -> CoreResult<(ProviderKind, Arc<dyn Provider>)> {
        self.update_health(
            failing,
            ProviderHealth {
                healthy: false,
                message: reason,
                active_count: 0,
            },
        )
        .await;
        self.select_provider(container_kind, deployment_mode, None)
            .await
    }

    pub async fn health_snapshot(&self) -> HashMap<ProviderKind, ProviderHealth> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.health.clone()))
            .collect()
    }

    /// Spawns the health monitor loop: pings every registered provider on
    /// a fixed tick with a per-call timeout, updating health under the
    /// write lock. Returns a handle that the caller aborts to stop it.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.tick_health_check().await;
            }
        })
    }

    async fn tick_health_check(&self) {
        let snapshot: Vec<(ProviderKind, Arc<dyn Provider>)> = {
            let guard = self.providers.read().await;
            guard
                .iter()
                .map(|(k, v)| (*k, v.provider.clone()))
                .collect()
        };

        for (kind, provider) in snapshot {
            metrics::counter!("orchestrator_health_check_attempts", 1);
            let health = match tokio::time::timeout(
                self.config.health_check_timeout,
                provider.health(),
            )
            .await
            {
                Ok(status) => {
                    if status.healthy {
                        metrics::counter!("orchestrator_health_check_success", 1);
                    } else {
                        metrics::counter!("orchestrator_health_check_failure", 1);
                    }
                    ProviderHealth {
                        healthy: status.healthy,
                        message: status.message,
                        active_count: status.active_count,
                    }
                }
                Err(_) => {
                    metrics::counter!("orchestrator_health_check_failure", 1);
                    warn!(provider = %kind, "health check timed out");
                    ProviderHealth {
                        healthy: false,
                        message: "health check timed out".to_string(),
                        active_count: 0,
                    }
                }
            };
            self.update_health(kind, health).await;
        }
    }
}

pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox_types::{
        Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
        ListFilesResult, ReadFileRequest, ReadFileResult, WriteFileRequest,
    };

    struct StubProvider {
        kind: ProviderKind,
        healthy: bool,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn create(&self, _req: CreateRequest) -> CoreResult<String> {
            Ok("stub-id".to_string())
        }
        async fn destroy(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn resume(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn exec(&self, _id: &str, _req: ExecRequest) -> CoreResult<ExecResult> {
            unimplemented!()
        }
        async fn read_file(&self, _id: &str, _req: ReadFileRequest) -> CoreResult<ReadFileResult> {
            unimplemented!()
        }
        async fn write_file(&self, _id: &str, _req: WriteFileRequest) -> CoreResult<()> {
            Ok(())
        }
        async fn list_files(&self, _id: &str, _req: ListFilesRequest) -> CoreResult<ListFilesResult> {
            unimplemented!()
        }
        async fn snapshot(&self, _id: &str) -> CoreResult<String> {
            Err(CoreError::SnapshotNotSupported)
        }
        async fn create_from_snapshot(
            &self,
            _snapshot_id: &str,
            _req: CreateRequest,
        ) -> CoreResult<String> {
            Err(CoreError::SnapshotNotSupported)
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus {
                healthy: self.healthy,
                message: "stub".to_string(),
                active_count: 0,
            }
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: "stub",
                supports_persistence: false,
                supports_snapshots: false,
                supports_warm_pool: true,
                requires_kvm: false,
                estimated_startup_ms: 0,
                provider_kind: self.kind,
            }
        }
    }

    #[tokio::test]
    async fn self_hosted_workspace_prefers_microvm() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        orch.register(
            ProviderKind::MicroVm,
            Arc::new(StubProvider { kind: ProviderKind::MicroVm, healthy: true }),
        )
        .await;
        orch.register(
            ProviderKind::UserKernel,
            Arc::new(StubProvider { kind: ProviderKind::UserKernel, healthy: true }),
        )
        .await;

        let (kind, _) = orch
            .select_provider(ContainerKind::Workspace, DeploymentMode::SelfHosted, None)
            .await
            .unwrap();
        assert_eq!(kind, ProviderKind::MicroVm);
    }

    #[tokio::test]
    async fn unhealthy_preferred_provider_falls_back() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        orch.register(
            ProviderKind::MicroVm,
            Arc::new(StubProvider { kind: ProviderKind::MicroVm, healthy: true }),
        )
        .await;
        orch.register(
            ProviderKind::UserKernel,
            Arc::new(StubProvider { kind: ProviderKind::UserKernel, healthy: true }),
        )
        .await;

        let (kind, _) = orch
            .select_provider_with_fallback(
                ContainerKind::Workspace,
                DeploymentMode::SelfHosted,
                ProviderKind::MicroVm,
                "probe failed".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(kind, ProviderKind::UserKernel);
    }

    #[tokio::test]
    async fn explicit_request_never_falls_back() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        orch.register(
            ProviderKind::MicroVm,
            Arc::new(StubProvider { kind: ProviderKind::MicroVm, healthy: false }),
        )
        .await;
        orch.register(
            ProviderKind::UserKernel,
            Arc::new(StubProvider { kind: ProviderKind::UserKernel, healthy: true }),
        )
        .await;

        let err = orch
            .select_provider(
                ContainerKind::Workspace,
                DeploymentMode::SelfHosted,
                Some(ProviderKind::MicroVm),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnhealthy(_, _)));
    }
}
