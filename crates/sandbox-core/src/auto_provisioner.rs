//! Binds sandbox lifecycle to agent-session lifecycle: create, checkout,
//! run setup commands, and best-effort teardown. Failures downgrade to a
//! degraded result rather than failing the session — partial setup
//! progress is preserved rather than unwound.
use std::sync::Arc;
use std::time::Duration;

use sandbox_types::{
    ContainerKind, CreateRequest, DeploymentMode, ExecRequest, ProviderKind, WorkspaceStatus,
};
use tracing::{info, warn};

use crate::checkout::CheckoutCollaborator;
use crate::config::ProvisionerConfig;
use crate::error::CoreResult;
use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Caller-supplied workspace configuration plus task metadata. Repository
/// coordinates are resolved from whichever of
/// `repo_url`/`fixed_repo_url` is present; `enabled = false` causes
/// `provision` to return `Ok(None)` without touching the store.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRequest {
    pub enabled: bool,
    pub session_id: String,
    pub deployment_mode: DeploymentMode,
    pub requested_provider: Option<ProviderKind>,
    pub base_image: Option<String>,
    pub repo_url: Option<String>,
    pub repo_branch: Option<String>,
    pub setup_commands: Vec<String>,
    pub ttl: Option<chrono::Duration>,
}

pub struct ProvisionResult {
    pub workspace_id: uuid::Uuid,
    pub provider_local_id: String,
    pub degraded: bool,
    pub setup_failed_at: Option<usize>,
}

pub struct AutoProvisioner {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
    checkout: Option<Arc<dyn CheckoutCollaborator>>,
    config: ProvisionerConfig,
}

impl AutoProvisioner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn Store>,
        checkout: Option<Arc<dyn CheckoutCollaborator>>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            checkout,
            config,
        }
    }

    pub async fn provision(&self, req: WorkspaceRequest) -> CoreResult<Option<ProvisionResult>> {
        if !req.enabled {
            return Ok(None);
        }

        let container_kind = ContainerKind::Workspace;

        let (kind, provider) = match self
            .orchestrator
            .select_provider(container_kind, req.deployment_mode, req.requested_provider)
            .await
        {
            Ok(pair) => pair,
            Err(first_err) => {
                let failing = req.requested_provider.unwrap_or(ProviderKind::MicroVm);
                match self
                    .orchestrator
                    .select_provider_with_fallback(
                        container_kind,
                        req.deployment_mode,
                        failing,
                        first_err.to_string(),
                    )
                    .await
                {
                    Ok(pair) => pair,
                    Err(_) => {
                        warn!(session = %req.session_id, "auto-provisioner degraded: no healthy provider");
                        return Ok(Some(ProvisionResult {
                            workspace_id: uuid::Uuid::nil(),
                            provider_local_id: String::new(),
                            degraded: true,
                            setup_failed_at: None,
                        }));
                    }
                }
            }
        };

        let mut workspace = sandbox_types::AgentWorkspace::new_creating(
            container_kind,
            kind,
            req.deployment_mode,
            Default::default(),
            req.ttl.or(Some(
                chrono::Duration::from_std(self.config.default_ttl).unwrap_or_default(),
            )),
        );
        workspace.session_id = Some(req.session_id.clone());
        self.store.create(workspace.clone()).await?;

        let create_req = CreateRequest {
            container_kind,
            base_image: req.base_image.clone(),
            ..Default::default()
        };

        let provider_local_id = match provider.create(create_req).await {
            Ok(id) => id,
            Err(err) => {
                workspace.status = WorkspaceStatus::Error;
                self.store.update(workspace).await?;
                return Err(err);
            }
        };
        workspace.provider_local_id = provider_local_id.clone();
        self.store.update(workspace.clone()).await?;

        if let (Some(url), Some(checkout)) = (&req.repo_url, &self.checkout) {
            if let Err(err) = checkout
                .clone_repository(kind, &provider_local_id, url, req.repo_branch.as_deref())
                .await
            {
                warn!(error = %err, session = %req.session_id, "repository checkout failed, continuing");
            }
        }

        let mut setup_failed_at = None;
        for (index, command) in req.setup_commands.iter().enumerate() {
            let exec_req = ExecRequest {
                command: command.clone(),
                workdir: None,
                timeout_ms: Some(self.config.setup_command_timeout.as_millis() as u64),
            };
            match provider.exec(&provider_local_id, exec_req).await {
                Ok(result) if result.exit_code == 0 => {}
                Ok(result) => {
                    warn!(
                        session = %req.session_id,
                        command = %command,
                        exit_code = result.exit_code,
                        "setup command failed, aborting remaining setup"
                    );
                    setup_failed_at = Some(index);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, command = %command, "setup command errored, aborting remaining setup");
                    setup_failed_at = Some(index);
                    break;
                }
            }
        }

        workspace.status = WorkspaceStatus::Ready;
        self.store.update(workspace.clone()).await?;

        info!(session = %req.session_id, workspace = %workspace.id, "workspace provisioned");

        Ok(Some(ProvisionResult {
            workspace_id: workspace.id,
            provider_local_id,
            degraded: false,
            setup_failed_at,
        }))
    }

    /// Best-effort teardown: destroy then mark stopped. Never propagates
    /// errors — by the time a session ends there is no useful caller left
    /// to report to.
    pub async fn teardown(&self, workspace_id: uuid::Uuid) {
        let workspace = match self.store.get(workspace_id).await {
            Ok(w) => w,
            Err(err) => {
                warn!(error = %err, workspace = %workspace_id, "teardown: workspace not found");
                return;
            }
        };

        let fresh_deadline = Duration::from_secs(30);
        if let Ok((_, provider)) = self
            .orchestrator
            .select_provider(
                workspace.container_kind,
                workspace.deployment_mode,
                Some(workspace.provider_kind),
            )
            .await
        {
            let _ = tokio::time::timeout(fresh_deadline, provider.destroy(&workspace.provider_local_id))
                .await;
        }

        let mut workspace = workspace;
        workspace.status = WorkspaceStatus::Stopped;
        let _ = self.store.update(workspace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use sandbox_types::{Capabilities, ExecResult, HealthStatus, ListFilesRequest, ListFilesResult, ReadFileRequest, ReadFileResult, WriteFileRequest};
    use crate::config::OrchestratorConfig;
    use crate::provider::Provider;
    use crate::error::CoreError;

    struct FlakyProvider {
        kind: ProviderKind,
        fails_create: bool,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn create(&self, _req: CreateRequest) -> CoreResult<String> {
            if self.fails_create {
                Err(CoreError::BackendUnreachable("down".into()))
            } else {
                Ok("pid-1".to_string())
            }
        }
        async fn destroy(&self, _id: &str) -> CoreResult<()> { Ok(()) }
        async fn stop(&self, _id: &str) -> CoreResult<()> { Ok(()) }
        async fn resume(&self, _id: &str) -> CoreResult<()> { Ok(()) }
        async fn exec(&self, _id: &str, _req: ExecRequest) -> CoreResult<ExecResult> {
            Ok(ExecResult { stdout: String::new(), stderr: String::new(), exit_code: 0, duration_ms: 1, truncated: false })
        }
        async fn read_file(&self, _id: &str, _req: ReadFileRequest) -> CoreResult<ReadFileResult> { unimplemented!() }
        async fn write_file(&self, _id: &str, _req: WriteFileRequest) -> CoreResult<()> { Ok(()) }
        async fn list_files(&self, _id: &str, _req: ListFilesRequest) -> CoreResult<ListFilesResult> { unimplemented!() }
        async fn snapshot(&self, _id: &str) -> CoreResult<String> { unimplemented!() }
        async fn create_from_snapshot(&self, _s: &str, _r: CreateRequest) -> CoreResult<String> { unimplemented!() }
        async fn health(&self) -> HealthStatus { HealthStatus { healthy: true, message: String::new(), active_count: 0 } }
        fn capabilities(&self) -> Capabilities {
            Capabilities { name: "flaky", supports_persistence: false, supports_snapshots: false, supports_warm_pool: true, requires_kvm: false, estimated_startup_ms: 0, provider_kind: self.kind }
        }
    }

    #[tokio::test]
    async fn disabled_request_provisions_nothing() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        let store = InMemoryStore::new();
        let provisioner = AutoProvisioner::new(orch, store, None, ProvisionerConfig::default());
        let result = provisioner
            .provision(WorkspaceRequest { enabled: false, ..Default::default() })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_healthy_provider_after_unhealthy_preferred() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        orch.register(ProviderKind::MicroVm, Arc::new(FlakyProvider { kind: ProviderKind::MicroVm, fails_create: false })).await;
        orch.update_health(ProviderKind::MicroVm, crate::orchestrator::ProviderHealth { healthy: false, message: "down".into(), active_count: 0 }).await;
        orch.register(ProviderKind::UserKernel, Arc::new(FlakyProvider { kind: ProviderKind::UserKernel, fails_create: false })).await;

        let store = InMemoryStore::new();
        let provisioner = AutoProvisioner::new(orch, store, None, ProvisionerConfig::default());
        let result = provisioner
            .provision(WorkspaceRequest {
                enabled: true,
                session_id: "s1".into(),
                deployment_mode: DeploymentMode::SelfHosted,
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert!(!result.degraded);
        assert_eq!(result.provider_local_id, "pid-1");
    }

    #[tokio::test]
    async fn no_healthy_provider_returns_degraded_result() {
        let orch = Orchestrator::new(OrchestratorConfig::default());
        let store = InMemoryStore::new();
        let provisioner = AutoProvisioner::new(orch, store, None, ProvisionerConfig::default());
        let result = provisioner
            .provision(WorkspaceRequest { enabled: true, session_id: "s2".into(), ..Default::default() })
            .await
            .unwrap()
            .unwrap();
        assert!(result.degraded);
    }
}
