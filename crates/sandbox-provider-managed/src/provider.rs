//! The managed-sandbox `Provider`: a two-plane REST backend with no
//! snapshot capability and its own usage accounting surfaced through
//! `Health`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use sandbox_types::{
    Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
    ListFilesResult, ProviderKind, ReadFileRequest, ReadFileResult, WriteFileRequest,
};
use sandbox_core::error::{CoreError, CoreResult};
use sandbox_core::provider::Provider;
use tokio::sync::RwLock;
use tracing::info;

use crate::client::{data_plane_url, ControlPlaneClient, CreateSandboxBody, DataPlaneClient};
use crate::config::ManagedConfig;

const NULL_SCAN_WINDOW: usize = 8 * 1024;
const MIN_BILLED_SECS: u64 = 60;

struct SandboxRecord {
    access_token: String,
    port: u16,
    created_at: Instant,
}

#[derive(Default)]
struct UsageCounters {
    total_creates: AtomicU64,
    total_destroys: AtomicU64,
    estimated_compute_seconds: AtomicU64,
}

pub struct ManagedProvider {
    config: ManagedConfig,
    control: ControlPlaneClient,
    sandboxes: RwLock<HashMap<String, SandboxRecord>>,
    usage: UsageCounters,
}

impl ManagedProvider {
    pub fn new(config: ManagedConfig) -> anyhow::Result<Arc<Self>> {
        let control = ControlPlaneClient::new(
            config.control_base_url.clone(),
            config.api_key.clone(),
            config.max_timeout,
        )?;
        Ok(Arc::new(Self {
            config,
            control,
            sandboxes: RwLock::new(HashMap::new()),
            usage: UsageCounters::default(),
        }))
    }

    async fn data_client(&self, id: &str) -> CoreResult<DataPlaneClient> {
        let guard = self.sandboxes.read().await;
        let record = guard.get(id).ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
        let url = data_plane_url(&self.config.domain, id, record.port);
        DataPlaneClient::new(url, record.access_token.clone(), self.config.max_timeout)
            .map_err(CoreError::Other)
    }

    fn clamp_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.config.max_timeout)
    }
}

#[async_trait]
impl Provider for ManagedProvider {
    async fn create(&self, req: CreateRequest) -> CoreResult<String> {
        let body = CreateSandboxBody {
            image: req.base_image.clone(),
            labels: req.labels.clone(),
            environment: req.environment.clone(),
            startup_command: req.startup_command.clone(),
            memory_bytes: req.limits.as_ref().and_then(|l| l.memory_bytes()),
            cpu_cores: req.limits.as_ref().and_then(|l| l.cpu_cores()),
            disk_bytes: req.limits.as_ref().and_then(|l| l.disk_bytes()),
        };

        let response = self
            .control
            .create(&body)
            .await
            .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

        self.sandboxes.write().await.insert(
            response.sandbox_id.clone(),
            SandboxRecord {
                access_token: response.access_token,
                port: response.port,
                created_at: Instant::now(),
            },
        );
        self.usage.total_creates.fetch_add(1, Ordering::Relaxed);
        info!(sandbox = %response.sandbox_id, "managed sandbox created");
        Ok(response.sandbox_id)
    }

    async fn destroy(&self, id: &str) -> CoreResult<()> {
        let record = self.sandboxes.write().await.remove(id);
        if let Some(record) = record {
            let billed = record.created_at.elapsed().as_secs().max(MIN_BILLED_SECS);
            self.usage.estimated_compute_seconds.fetch_add(billed, Ordering::Relaxed);
            self.usage.total_destroys.fetch_add(1, Ordering::Relaxed);
        }
        self.control
            .destroy(id)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> CoreResult<()> {
        {
            let guard = self.sandboxes.read().await;
            guard.get(id).ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
        }
        self.control.stop(id).await.map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn resume(&self, id: &str) -> CoreResult<()> {
        let response = self
            .control
            .resume(id)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.sandboxes.write().await.get_mut(id) {
            record.access_token = response.access_token;
        } else {
            return Err(CoreError::SandboxNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, req: ExecRequest) -> CoreResult<ExecResult> {
        let data = self.data_client(id).await?;
        let timeout = self.clamp_timeout(req.timeout());

        let body = serde_json::json!({
            "command": req.command,
            "workdir": req.workdir,
            "timeout_ms": timeout.as_millis() as u64,
        });

        let response = tokio::time::timeout(timeout + Duration::from_secs(2), data.exec_supported(body))
            .await
            .map_err(|_| CoreError::CallTimedOut)?
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;

        let Some(response) = response else {
            return Err(CoreError::NotSupported(
                "managed backend exposes no synchronous command endpoint".into(),
            ));
        };

        if !response.status().is_success() {
            return Err(CoreError::BackendTransient(format!(
                "data plane exec returned {}",
                response.status()
            )));
        }

        let result: ExecResult = response
            .json()
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        Ok(result.truncate_stdout())
    }

    async fn read_file(&self, id: &str, req: ReadFileRequest) -> CoreResult<ReadFileResult> {
        let data = self.data_client(id).await?;
        let response = data
            .files_read(&req.path)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::BackendTransient(format!("data plane read returned {}", response.status())));
        }

        #[derive(serde::Deserialize)]
        struct RawReadResponse {
            content_base64: String,
            is_dir: bool,
            total_lines: u64,
            file_size: u64,
        }

        let raw: RawReadResponse = response.json().await.map_err(|e| CoreError::Other(e.into()))?;
        if raw.is_dir {
            return Ok(ReadFileResult {
                content: String::from_utf8_lossy(
                    &base64::engine::general_purpose::STANDARD.decode(&raw.content_base64).unwrap_or_default(),
                )
                .to_string(),
                is_dir: true,
                total_lines: raw.total_lines,
                file_size: raw.file_size,
                is_binary: false,
            });
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&raw.content_base64)
            .map_err(|e| CoreError::Other(e.into()))?;
        let scan_window = &decoded[..decoded.len().min(NULL_SCAN_WINDOW)];
        let is_binary = scan_window.contains(&0u8);

        Ok(ReadFileResult {
            content: if is_binary { String::new() } else { String::from_utf8_lossy(&decoded).to_string() },
            is_dir: false,
            total_lines: raw.total_lines,
            file_size: raw.file_size,
            is_binary,
        })
    }

    async fn write_file(&self, id: &str, req: WriteFileRequest) -> CoreResult<()> {
        let data = self.data_client(id).await?;
        data.files_write(&req.path, &req.content)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn list_files(&self, id: &str, req: ListFilesRequest) -> CoreResult<ListFilesResult> {
        let data = self.data_client(id).await?;
        let response = data
            .files_list(&req.base_path, req.glob.as_deref())
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::BackendTransient(format!("data plane list returned {}", response.status())));
        }
        response.json().await.map_err(|e| CoreError::Other(e.into()))
    }

    async fn snapshot(&self, _id: &str) -> CoreResult<String> {
        Err(CoreError::SnapshotNotSupported)
    }

    async fn create_from_snapshot(&self, _snapshot_id: &str, _req: CreateRequest) -> CoreResult<String> {
        Err(CoreError::SnapshotNotSupported)
    }

    async fn health(&self) -> HealthStatus {
        match self.control.ping().await {
            Ok(()) => HealthStatus {
                healthy: true,
                message: format!(
                    "creates={} destroys={} estimated-compute-minutes={}",
                    self.usage.total_creates.load(Ordering::Relaxed),
                    self.usage.total_destroys.load(Ordering::Relaxed),
                    self.usage.estimated_compute_seconds.load(Ordering::Relaxed) / 60,
                ),
                active_count: self.sandboxes.read().await.len() as u64,
            },
            Err(e) => HealthStatus {
                healthy: false,
                message: e.to_string(),
                active_count: 0,
            },
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "managed",
            supports_persistence: true,
            supports_snapshots: false,
            supports_warm_pool: false,
            requires_kvm: false,
            estimated_startup_ms: 3000,
            provider_kind: ProviderKind::Managed,
        }
    }
}
