//! The container `Provider`: one container plus one named volume mounted at
//! `/workspace`, driven through `bollard`. Detects the user-mode kernel
//! runtime once at construction and falls back transparently when absent.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use sandbox_types::{
    Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
    ListFilesResult, ProviderKind, ReadFileRequest, ReadFileResult, WriteFileRequest,
};
use sandbox_core::error::{CoreError, CoreResult};
use sandbox_core::mcp_hosting::{ContainerState, McpContainerProvider};
use sandbox_core::provider::Provider;
use sandbox_core::stdio_bridge::StdioTransport;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::files;
use crate::runtime::detect_runtime;
use crate::shell;
use crate::stdio::ContainerStdioTransport;

const WORKSPACE_MOUNT: &str = "/workspace";
const DEFAULT_IMAGE: &str = "alpine:3.19";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Running,
    Paused,
}

struct ContainerRecord {
    volume_name: String,
    state: RecordState,
}

pub struct ContainerProvider {
    docker: Docker,
    runtime: Option<String>,
    containers: RwLock<HashMap<String, ContainerRecord>>,
}

impl ContainerProvider {
    pub async fn connect() -> anyhow::Result<Arc<Self>> {
        let docker = Docker::connect_with_local_defaults()?;
        let runtime = detect_runtime(&docker).await;
        if runtime.is_none() {
            warn!("container provider operating without user-mode kernel isolation");
        }
        Ok(Arc::new(Self {
            docker,
            runtime,
            containers: RwLock::new(HashMap::new()),
        }))
    }

    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

}

#[async_trait]
impl Provider for ContainerProvider {
    async fn create(&self, req: CreateRequest) -> CoreResult<String> {
        let image = req.base_image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        self.ensure_image(&image)
            .await
            .map_err(|e| CoreError::ImageUnavailable(e.to_string()))?;

        let volume_name = format!("sandbox-ws-{}", Uuid::new_v4());
        self.docker
            .create_volume(CreateVolumeOptions {
                name: volume_name.as_str(),
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;

        let container_name = format!("sandbox-{}", Uuid::new_v4());
        let mut mounts = vec![Mount {
            target: Some(WORKSPACE_MOUNT.to_string()),
            source: Some(volume_name.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            ..Default::default()
        }];
        for extra in &req.extra_mounts {
            mounts.push(Mount {
                target: Some(extra.clone()),
                typ: Some(MountTypeEnum::BIND),
                source: Some(extra.clone()),
                ..Default::default()
            });
        }

        let host_config = HostConfig {
            runtime: self.runtime.clone(),
            mounts: Some(mounts),
            memory: req.limits.as_ref().and_then(|l| l.memory_bytes()).map(|b| b as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(512),
            ..Default::default()
        };

        let cmd = req
            .startup_command
            .clone()
            .map(|c| vec!["/bin/sh".to_string(), "-c".to_string(), c])
            .unwrap_or_else(|| vec!["sleep".to_string(), "infinity".to_string()]);

        let env: Vec<String> = req
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(image),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            cmd: Some(cmd),
            env: Some(env),
            open_stdin: Some(req.attach_stdin),
            attach_stdin: Some(req.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            labels: Some(req.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

        if let Err(e) = self.docker.start_container::<String>(&container_name, None).await {
            let _ = self
                .docker
                .remove_container(&container_name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            let _ = self
                .docker
                .remove_volume(&volume_name, Some(RemoveVolumeOptions { force: true }))
                .await;
            return Err(CoreError::BackendUnreachable(e.to_string()));
        }

        self.containers.write().await.insert(
            container_name.clone(),
            ContainerRecord { volume_name, state: RecordState::Running },
        );
        info!(container = %container_name, "container sandbox ready");
        Ok(container_name)
    }

    async fn destroy(&self, id: &str) -> CoreResult<()> {
        let record = self.containers.write().await.remove(id);
        let Some(record) = record else {
            return Ok(());
        };
        match self
            .docker
            .remove_container(id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(CoreError::BackendTransient(e.to_string())),
        }
        match self.docker.remove_volume(&record.volume_name, Some(RemoveVolumeOptions { force: true })).await {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(CoreError::BackendTransient(e.to_string())),
        }
    }

    async fn stop(&self, id: &str) -> CoreResult<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.containers.write().await.get_mut(id) {
            record.state = RecordState::Paused;
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> CoreResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.containers.write().await.get_mut(id) {
            record.state = RecordState::Running;
        }
        Ok(())
    }

    async fn exec(&self, id: &str, req: ExecRequest) -> CoreResult<ExecResult> {
        let timeout = req.timeout();
        shell::run(&self.docker, id, &req.command, req.workdir.as_deref(), timeout)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn read_file(&self, id: &str, req: ReadFileRequest) -> CoreResult<ReadFileResult> {
        files::read_file(&self.docker, id, &req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn write_file(&self, id: &str, req: WriteFileRequest) -> CoreResult<()> {
        files::write_file(&self.docker, id, &req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn list_files(&self, id: &str, req: ListFilesRequest) -> CoreResult<ListFilesResult> {
        files::list_files(&self.docker, id, &req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn snapshot(&self, id: &str) -> CoreResult<String> {
        let volume_name = {
            let guard = self.containers.read().await;
            guard
                .get(id)
                .ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?
                .volume_name
                .clone()
        };

        let snapshot_volume = format!("sandbox-snap-{}", Uuid::new_v4());
        self.docker
            .create_volume(CreateVolumeOptions { name: snapshot_volume.as_str(), ..Default::default() })
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;

        self.copy_volume(&volume_name, &snapshot_volume)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;

        Ok(snapshot_volume)
    }

    async fn create_from_snapshot(&self, snapshot_id: &str, req: CreateRequest) -> CoreResult<String> {
        if self.docker.inspect_volume(snapshot_id).await.is_err() {
            return Err(CoreError::Precondition(format!("snapshot volume '{snapshot_id}' not found")));
        }

        let container_id = self.create(req).await?;
        let dest_volume = {
            let guard = self.containers.read().await;
            guard.get(&container_id).map(|r| r.volume_name.clone())
        };
        if let Some(dest_volume) = dest_volume {
            if let Err(e) = self.copy_volume(snapshot_id, &dest_volume).await {
                let _ = self.destroy(&container_id).await;
                return Err(CoreError::BackendTransient(e.to_string()));
            }
        }
        Ok(container_id)
    }

    async fn health(&self) -> HealthStatus {
        match self.docker.ping().await {
            Ok(_) => HealthStatus {
                healthy: true,
                message: "ok".to_string(),
                active_count: self.containers.read().await.len() as u64,
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
            name: "container",
            supports_persistence: true,
            supports_snapshots: true,
            supports_warm_pool: true,
            requires_kvm: false,
            estimated_startup_ms: 400,
            provider_kind: ProviderKind::UserKernel,
        }
    }
}

impl ContainerProvider {
    /// Copies one volume's contents into another via a short-lived helper
    /// container: `cp -a /source/. /snapshot/.`.
    async fn copy_volume(&self, source_volume: &str, dest_volume: &str) -> anyhow::Result<()> {
        self.ensure_image(DEFAULT_IMAGE).await?;
        let helper_name = format!("sandbox-copy-{}", Uuid::new_v4());
        let config = Config {
            image: Some(DEFAULT_IMAGE.to_string()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "cp -a /source/. /snapshot/.".to_string(),
            ]),
            host_config: Some(HostConfig {
                mounts: Some(vec![
                    Mount {
                        target: Some("/source".to_string()),
                        source: Some(source_volume.to_string()),
                        typ: Some(MountTypeEnum::VOLUME),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    Mount {
                        target: Some("/snapshot".to_string()),
                        source: Some(dest_volume.to_string()),
                        typ: Some(MountTypeEnum::VOLUME),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(Some(CreateContainerOptions { name: helper_name.as_str(), platform: None }), config)
            .await?;
        self.docker.start_container::<String>(&helper_name, None).await?;

        let mut wait_stream = self.docker.wait_container::<String>(&helper_name, None);
        while let Some(result) = wait_stream.next().await {
            result?;
        }

        self.docker
            .remove_container(&helper_name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl McpContainerProvider for ContainerProvider {
    async fn attach_stdio(&self, id: &str) -> CoreResult<Box<dyn StdioTransport>> {
        let transport = ContainerStdioTransport::attach(&self.docker, id)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        Ok(Box::new(transport))
    }

    async fn inspect(&self, id: &str) -> CoreResult<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(ContainerState::Running)
        } else {
            Ok(ContainerState::Exited { exit_code: state.exit_code.unwrap_or(-1) as i32 })
        }
    }
}
