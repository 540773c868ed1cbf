//! Binds a persistent MCP container to a durable workspace record and
//! keeps it alive across crashes: register, call, restart, and a
//! per-server crash monitor with exponential backoff. One spawned task
//! per hosted server, stoppable via a watch channel.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandbox_types::{
    AgentWorkspace, ContainerKind, CreateRequest, DeploymentMode, McpConfig, ProviderKind,
    RestartPolicy, WorkspaceStatus,
};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::McpBackoffConfig;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::Orchestrator;
use crate::provider::Provider;
use crate::stdio_bridge::StdioBridge;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited { exit_code: i32 },
}

/// The subset of backends that can host an MCP server: they must offer
/// stdin/stdout attachment, which restricts Register to the user-kernel
/// provider.
#[async_trait]
pub trait McpContainerProvider: Provider {
    async fn attach_stdio(&self, id: &str) -> CoreResult<Box<dyn crate::stdio_bridge::StdioTransport>>;
    async fn inspect(&self, id: &str) -> CoreResult<ContainerState>;
}

struct MutableState {
    provider_local_id: String,
    bridge: Option<Arc<StdioBridge>>,
    last_crash: Option<DateTime<Utc>>,
    recent_crashes: Vec<DateTime<Utc>>,
    current_backoff: Duration,
}

struct ServerRuntime {
    workspace_id: Uuid,
    restart_policy: RestartPolicy,
    restart_count: AtomicU64,
    started_at: DateTime<Utc>,
    stop_tx: watch::Sender<bool>,
    state: Mutex<MutableState>,
}

pub struct McpHostingService {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
    provider: Arc<dyn McpContainerProvider>,
    config: McpBackoffConfig,
    servers: RwLock<HashMap<Uuid, Arc<ServerRuntime>>>,
}

impl McpHostingService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn Store>,
        provider: Arc<dyn McpContainerProvider>,
        config: McpBackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            store,
            provider,
            config,
            servers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(self: &Arc<Self>, mcp: McpConfig) -> CoreResult<AgentWorkspace> {
        let mut workspace = AgentWorkspace::new_creating(
            ContainerKind::McpServer,
            ProviderKind::UserKernel,
            DeploymentMode::SelfHosted,
            Default::default(),
            None,
        );
        workspace.mcp_config = Some(mcp.clone());
        self.store.create(workspace.clone()).await?;

        // The user-kernel backend is the only one offering stdin attach;
        // this just confirms it is registered and healthy before using the
        // narrower `McpContainerProvider` handle directly.
        self.orchestrator
            .select_provider(
                ContainerKind::McpServer,
                DeploymentMode::SelfHosted,
                Some(ProviderKind::UserKernel),
            )
            .await?;

        let create_req = CreateRequest {
            container_kind: ContainerKind::McpServer,
            base_image: Some(mcp.image.clone()),
            environment: mcp.environment.clone(),
            extra_mounts: mcp.extra_mounts.clone(),
            attach_stdin: mcp.stdio_bridge,
            ..Default::default()
        };

        let provider_local_id = match self.provider.create(create_req).await {
            Ok(id) => id,
            Err(err) => {
                workspace.status = WorkspaceStatus::Error;
                self.store.update(workspace).await?;
                return Err(err);
            }
        };

        workspace.provider_local_id = provider_local_id.clone();
        workspace.status = WorkspaceStatus::Ready;
        self.store.update(workspace.clone()).await?;

        let bridge = if mcp.stdio_bridge {
            match self.provider.attach_stdio(&provider_local_id).await {
                Ok(transport) => Some(Arc::new(StdioBridge::new(transport))),
                Err(err) => {
                    warn!(error = %err, id = %provider_local_id, "failed to attach stdio bridge");
                    None
                }
            }
        } else {
            None
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let runtime = Arc::new(ServerRuntime {
            workspace_id: workspace.id,
            restart_policy: mcp.restart_policy,
            restart_count: AtomicU64::new(0),
            started_at: Utc::now(),
            stop_tx,
            state: Mutex::new(MutableState {
                provider_local_id,
                bridge,
                last_crash: None,
                recent_crashes: Vec::new(),
                current_backoff: Duration::ZERO,
            }),
        });

        self.servers.write().await.insert(workspace.id, runtime.clone());
        self.spawn_crash_monitor(runtime, stop_rx);

        Ok(workspace)
    }

    fn spawn_crash_monitor(self: &Arc<Self>, runtime: Arc<ServerRuntime>, mut stop_rx: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.crash_monitor_tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        if let Err(err) = this.tick_server(&runtime).await {
                            error!(error = %err, server = %runtime.workspace_id, "crash monitor tick failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn tick_server(&self, runtime: &Arc<ServerRuntime>) -> CoreResult<()> {
        let provider_local_id = runtime.state.lock().await.provider_local_id.clone();
        let inspected = self.provider.inspect(&provider_local_id).await?;

        let exit_code = match inspected {
            ContainerState::Running => return Ok(()),
            ContainerState::Exited { exit_code } => exit_code,
        };

        let stop_and_finish = matches!(runtime.restart_policy, RestartPolicy::Never)
            || (matches!(runtime.restart_policy, RestartPolicy::OnFailure) && exit_code == 0);

        if stop_and_finish {
            let mut workspace = self.store.get(runtime.workspace_id).await?;
            workspace.status = WorkspaceStatus::Stopped;
            self.store.update(workspace).await?;
            let _ = runtime.stop_tx.send(true);
            return Ok(());
        }

        let wait = {
            let mut state = runtime.state.lock().await;
            let now = Utc::now();
            state.last_crash = Some(now);
            let window = chrono::Duration::from_std(self.config.crash_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            state.recent_crashes.retain(|t| now - *t <= window);
            state.recent_crashes.push(now);

            if state.recent_crashes.len() < self.config.crash_loop_threshold {
                state.current_backoff = Duration::ZERO;
                self.config.auto_restart_delay
            } else {
                state.current_backoff = if state.current_backoff.is_zero() {
                    self.config.initial_backoff
                } else {
                    std::cmp::min(
                        state.current_backoff.mul_f64(self.config.backoff_multiplier),
                        self.config.max_backoff,
                    )
                };
                state.current_backoff
            }
        };

        tokio::time::sleep(wait).await;

        metrics::counter!("mcp_crash_monitor_restart_attempts", 1);
        if let Err(err) = self.provider.resume(&provider_local_id).await {
            metrics::counter!("mcp_crash_monitor_restart_failure", 1);
            warn!(error = %err, id = %provider_local_id, "crash monitor resume failed");
            return Err(err);
        }
        metrics::counter!("mcp_crash_monitor_restart_success", 1);

        let mut state = runtime.state.lock().await;
        if let Some(old) = state.bridge.take() {
            old.close();
        }
        state.bridge = match self.provider.attach_stdio(&provider_local_id).await {
            Ok(transport) => Some(Arc::new(StdioBridge::new(transport))),
            Err(err) => {
                warn!(error = %err, "crash monitor failed to reattach stdio bridge");
                None
            }
        };
        drop(state);

        runtime.restart_count.fetch_add(1, Ordering::SeqCst);
        info!(server = %runtime.workspace_id, "crash monitor resumed container");
        Ok(())
    }

    pub async fn call(&self, workspace_id: Uuid, method: &str, params: Value) -> CoreResult<Value> {
        let runtime = self
            .servers
            .read()
            .await
            .get(&workspace_id)
            .cloned()
            .ok_or_else(|| CoreError::SandboxNotFound(workspace_id.to_string()))?;

        let bridge = runtime
            .state
            .lock()
            .await
            .bridge
            .clone()
            .ok_or(CoreError::BridgeClosed)?;

        let result = bridge.call(method, params).await;

        let store = self.store.clone();
        tokio::spawn(async move {
            let _ = store.touch_last_used(workspace_id, None).await;
        });

        result
    }

    pub async fn restart(&self, workspace_id: Uuid) -> CoreResult<()> {
        let runtime = self
            .servers
            .read()
            .await
            .get(&workspace_id)
            .cloned()
            .ok_or_else(|| CoreError::SandboxNotFound(workspace_id.to_string()))?;

        let provider_local_id = runtime.state.lock().await.provider_local_id.clone();

        let _ = tokio::time::timeout(
            self.config.manual_restart_timeout,
            self.provider.stop(&provider_local_id),
        )
        .await;

        self.provider.resume(&provider_local_id).await?;

        let mut state = runtime.state.lock().await;
        state.recent_crashes.clear();
        state.current_backoff = Duration::ZERO;
        if let Some(old) = state.bridge.take() {
            old.close();
        }
        state.bridge = self
            .provider
            .attach_stdio(&provider_local_id)
            .await
            .ok()
            .map(StdioBridge::new)
            .map(Arc::new);
        Ok(())
    }

    /// Signals every monitor to stop, then stops all containers
    /// concurrently under one shared deadline, then marks every workspace
    /// stopped.
    pub async fn shutdown(&self) {
        let servers: Vec<Arc<ServerRuntime>> = self.servers.read().await.values().cloned().collect();
        for runtime in &servers {
            let _ = runtime.stop_tx.send(true);
        }

        let deadline = self.config.graceful_stop_timeout;
        let stops = servers.iter().map(|runtime| {
            let provider = self.provider.clone();
            async move {
                let id = runtime.state.lock().await.provider_local_id.clone();
                let _ = tokio::time::timeout(deadline, provider.stop(&id)).await;
            }
        });
        futures::future::join_all(stops).await;

        for runtime in &servers {
            if let Ok(mut workspace) = self.store.get(runtime.workspace_id).await {
                workspace.status = WorkspaceStatus::Stopped;
                let _ = self.store.update(workspace).await;
            }
        }
    }

    /// Boot auto-start: resumes every persistent MCP record from the
    /// store in parallel, re-attaches its bridge, and reinstalls its
    /// crash monitor.
    pub async fn start_all(self: &Arc<Self>) -> CoreResult<()> {
        let records = self.store.list_persistent_mcp_servers().await?;
        let futures = records.into_iter().map(|workspace| {
            let this = self.clone();
            async move { this.resume_one(workspace).await }
        });
        for result in futures::future::join_all(futures).await {
            if let Err(err) = result {
                warn!(error = %err, "failed to resume a persistent mcp server at boot");
            }
        }
        Ok(())
    }

    async fn resume_one(self: &Arc<Self>, workspace: AgentWorkspace) -> CoreResult<()> {
        let mcp = workspace
            .mcp_config
            .clone()
            .ok_or_else(|| CoreError::Precondition("missing mcp config".into()))?;

        self.provider.resume(&workspace.provider_local_id).await?;

        let bridge = if mcp.stdio_bridge {
            self.provider
                .attach_stdio(&workspace.provider_local_id)
                .await
                .ok()
                .map(StdioBridge::new)
                .map(Arc::new)
        } else {
            None
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let runtime = Arc::new(ServerRuntime {
            workspace_id: workspace.id,
            restart_policy: mcp.restart_policy,
            restart_count: AtomicU64::new(0),
            started_at: Utc::now(),
            stop_tx,
            state: Mutex::new(MutableState {
                provider_local_id: workspace.provider_local_id.clone(),
                bridge,
                last_crash: None,
                recent_crashes: Vec::new(),
                current_backoff: Duration::ZERO,
            }),
        });

        self.servers.write().await.insert(workspace.id, runtime.clone());
        self.spawn_crash_monitor(runtime, stop_rx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use sandbox_types::{
        Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
        ListFilesResult, ReadFileRequest, ReadFileResult, WriteFileRequest,
    };
    use std::sync::Mutex as StdMutex;

    struct CrashingProvider {
        exited: StdMutex<bool>,
        resumes: AtomicU64,
    }

    #[async_trait]
    impl Provider for CrashingProvider {
        async fn create(&self, _req: CreateRequest) -> CoreResult<String> {
            Ok("mcp-1".to_string())
        }
        async fn destroy(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn resume(&self, _id: &str) -> CoreResult<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            *self.exited.lock().unwrap() = false;
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
        async fn create_from_snapshot(&self, _s: &str, _r: CreateRequest) -> CoreResult<String> {
            Err(CoreError::SnapshotNotSupported)
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus { healthy: true, message: String::new(), active_count: 0 }
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: "crashing",
                supports_persistence: true,
                supports_snapshots: false,
                supports_warm_pool: false,
                requires_kvm: false,
                estimated_startup_ms: 0,
                provider_kind: ProviderKind::UserKernel,
            }
        }
    }

    #[async_trait]
    impl McpContainerProvider for CrashingProvider {
        async fn attach_stdio(&self, _id: &str) -> CoreResult<Box<dyn crate::stdio_bridge::StdioTransport>> {
            Err(CoreError::BridgeClosed)
        }
        async fn inspect(&self, _id: &str) -> CoreResult<ContainerState> {
            let exited = *self.exited.lock().unwrap();
            Ok(if exited {
                ContainerState::Exited { exit_code: 1 }
            } else {
                ContainerState::Running
            })
        }
    }

    fn test_runtime_with_policy(restart_policy: RestartPolicy) -> Arc<ServerRuntime> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(ServerRuntime {
            workspace_id: Uuid::new_v4(),
            restart_policy,
            restart_count: AtomicU64::new(0),
            started_at: Utc::now(),
            stop_tx,
            state: Mutex::new(MutableState {
                provider_local_id: "mcp-1".to_string(),
                bridge: None,
                last_crash: None,
                recent_crashes: Vec::new(),
                current_backoff: Duration::ZERO,
            }),
        })
    }

    fn test_runtime() -> Arc<ServerRuntime> {
        test_runtime_with_policy(RestartPolicy::Always)
    }

    fn test_service(provider: Arc<CrashingProvider>) -> McpHostingService {
        McpHostingService {
            orchestrator: Orchestrator::new(OrchestratorConfig::default()),
            store: InMemoryStore::new(),
            provider,
            config: McpBackoffConfig {
                crash_window: Duration::from_secs(60),
                crash_loop_threshold: 3,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(300),
                backoff_multiplier: 3.0,
                auto_restart_delay: Duration::from_secs(5),
                graceful_stop_timeout: Duration::from_secs(30),
                manual_restart_timeout: Duration::from_secs(10),
                crash_monitor_tick: Duration::from_secs(5),
            },
            servers: RwLock::new(HashMap::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_progression_matches_crash_loop_thresholds() {
        let provider = Arc::new(CrashingProvider { exited: StdMutex::new(true), resumes: AtomicU64::new(0) });
        let service = test_service(provider.clone());
        let runtime = test_runtime();

        // First two crashes are under the threshold: auto-restart delay, no backoff growth.
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::ZERO);
        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::ZERO);

        // Third crash crosses the threshold: backoff starts at the initial value.
        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(5));

        // Subsequent crashes multiply by the configured factor, capped at the max.
        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(15));

        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(45));

        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(135));

        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(300));

        *provider.exited.lock().unwrap() = true;
        service.tick_server(&runtime).await.unwrap();
        assert_eq!(runtime.state.lock().await.current_backoff, Duration::from_secs(300));

        assert_eq!(provider.resumes.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn restart_policy_never_stops_without_resuming() {
        let provider = Arc::new(CrashingProvider { exited: StdMutex::new(true), resumes: AtomicU64::new(0) });
        let service = test_service(provider.clone());
        let runtime = test_runtime_with_policy(RestartPolicy::Never);

        // No workspace record exists for this runtime's id, so the stop-and-finish
        // path fails at the store lookup rather than silently resuming.
        service.tick_server(&runtime).await.unwrap_err();
        assert_eq!(provider.resumes.load(Ordering::SeqCst), 0);
    }
}
