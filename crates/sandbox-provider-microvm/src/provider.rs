//! The microVM `Provider` implementation: one Firecracker VM per sandbox,
//! a read-write-locked VM table, and a process-local atomic IP allocator.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandbox_types::{
    Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
    ListFilesResult, ProviderKind, ReadFileRequest, ReadFileResult, WriteFileRequest,
};
use sandbox_core::error::{CoreError, CoreResult};
use sandbox_core::provider::Provider;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::agent_client::AgentClient;
use crate::disk::{self, DiskLayout};
use crate::fc_api::FirecrackerClient;
use crate::network::{self, IpAllocator, VmNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmState {
    Starting,
    Ready,
    Paused,
    Destroyed,
}

struct VmRecord {
    state: VmState,
    network: VmNetwork,
    disk_path: PathBuf,
    snapshot_of: Option<String>,
}

pub struct MicroVmConfig {
    pub data_dir: PathBuf,
    pub kernel_image_path: String,
    pub rootfs_image_path: String,
    pub bridge_name: String,
    pub default_vcpu_count: u32,
    pub default_mem_mib: u64,
    pub default_disk_bytes: u64,
    pub startup_timeout: Duration,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sandboxd/microvm"),
            kernel_image_path: "/var/lib/sandboxd/images/vmlinux".to_string(),
            rootfs_image_path: "/var/lib/sandboxd/images/rootfs.ext4".to_string(),
            bridge_name: "fcbr0".to_string(),
            default_vcpu_count: 2,
            default_mem_mib: 1024,
            default_disk_bytes: 4 * 1024 * 1024 * 1024,
            startup_timeout: Duration::from_secs(20),
        }
    }
}

pub struct MicroVmProvider {
    config: MicroVmConfig,
    layout: DiskLayout,
    allocator: IpAllocator,
    vms: RwLock<HashMap<String, VmRecord>>,
}

fn kvm_available() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

impl MicroVmProvider {
    pub fn new(config: MicroVmConfig) -> Arc<Self> {
        let layout = DiskLayout::new(config.data_dir.clone());
        Arc::new(Self {
            config,
            layout,
            allocator: IpAllocator::new(),
            vms: RwLock::new(HashMap::new()),
        })
    }

    async fn require_ready(&self, id: &str) -> CoreResult<VmNetwork> {
        let guard = self.vms.read().await;
        let record = guard
            .get(id)
            .ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
        match record.state {
            VmState::Ready => Ok(record.network.clone()),
            VmState::Paused => Err(CoreError::SandboxPaused(id.to_string())),
            VmState::Starting | VmState::Destroyed => {
                Err(CoreError::Precondition(format!("vm '{id}' is not ready")))
            }
        }
    }

    async fn rollback_create(&self, network: &VmNetwork, disk_path: &PathBuf) {
        let _ = network::delete_tap(&network.tap).await;
        let _ = disk::remove_disk(disk_path).await;
    }
}

#[async_trait]
impl Provider for MicroVmProvider {
    async fn create(&self, req: CreateRequest) -> CoreResult<String> {
        if !kvm_available() {
            return Err(CoreError::CapabilityMissing("KVM is not available on this host".into()));
        }

        self.layout
            .ensure_dirs()
            .await
            .map_err(CoreError::Other)?;

        let vm_id = Uuid::new_v4().to_string();
        let net = self.allocator.allocate();

        network::create_tap(&net.tap, &self.config.bridge_name, &net.gateway)
            .await
            .map_err(CoreError::Other)?;
        network::install_nat_rules(&self.config.bridge_name).await;

        let disk_path = self.layout.vm_disk_path(&vm_id);
        let disk_bytes = req
            .limits
            .as_ref()
            .and_then(|l| l.disk_bytes())
            .unwrap_or(self.config.default_disk_bytes);
        if let Err(e) = disk::create_data_disk(&disk_path, disk_bytes).await {
            self.rollback_create(&net, &disk_path).await;
            return Err(CoreError::Other(e));
        }

        let sock_path = self.layout.vm_socket_path(&vm_id);
        let fc = FirecrackerClient::new(sock_path.to_string_lossy());

        let vcpu_count = req
            .limits
            .as_ref()
            .and_then(|l| l.cpu_cores())
            .map(|c| c.ceil() as u32)
            .unwrap_or(self.config.default_vcpu_count);
        let mem_mib = req
            .limits
            .as_ref()
            .and_then(|l| l.memory_bytes())
            .map(|b| b / (1024 * 1024))
            .unwrap_or(self.config.default_mem_mib);

        let setup = async {
            fc.set_machine_config(vcpu_count, mem_mib).await?;
            fc.set_boot_source(&self.config.kernel_image_path, "console=ttyS0 reboot=k panic=1").await?;
            fc.add_drive("rootfs", &self.config.rootfs_image_path, true).await?;
            fc.add_drive("data", &disk_path.to_string_lossy(), false).await?;
            fc.add_network_interface("eth0", &net.tap, &net.mac).await?;
            fc.start_instance().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = setup {
            self.rollback_create(&net, &disk_path).await;
            return Err(CoreError::BackendUnreachable(e.to_string()));
        }

        self.vms.write().await.insert(
            vm_id.clone(),
            VmRecord {
                state: VmState::Starting,
                network: net.clone(),
                disk_path: disk_path.clone(),
                snapshot_of: None,
            },
        );

        let agent = AgentClient::new(&net.ip);
        if let Err(e) = agent.wait_until_healthy(self.config.startup_timeout).await {
            self.vms.write().await.remove(&vm_id);
            self.rollback_create(&net, &disk_path).await;
            return Err(CoreError::BackendUnreachable(e.to_string()));
        }

        if let Some(record) = self.vms.write().await.get_mut(&vm_id) {
            record.state = VmState::Ready;
        }
        info!(vm_id, ip = %net.ip, "microvm ready");
        Ok(vm_id)
    }

    async fn destroy(&self, id: &str) -> CoreResult<()> {
        let record = self.vms.write().await.remove(id);
        let Some(record) = record else {
            return Ok(());
        };
        let _ = network::delete_tap(&record.network.tap).await;
        disk::remove_disk(&record.disk_path).await.map_err(CoreError::Other)?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> CoreResult<()> {
        let net = {
            let guard = self.vms.read().await;
            let record = guard.get(id).ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
            record.network.clone()
        };
        let sock_path = self.layout.vm_socket_path(id);
        FirecrackerClient::new(sock_path.to_string_lossy())
            .pause()
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        let _ = net;
        if let Some(record) = self.vms.write().await.get_mut(id) {
            record.state = VmState::Paused;
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> CoreResult<()> {
        {
            let guard = self.vms.read().await;
            let record = guard.get(id).ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
            if record.state != VmState::Paused {
                return Err(CoreError::Precondition(format!("vm '{id}' is not paused")));
            }
        }
        let sock_path = self.layout.vm_socket_path(id);
        FirecrackerClient::new(sock_path.to_string_lossy())
            .resume()
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.vms.write().await.get_mut(id) {
            record.state = VmState::Ready;
        }
        Ok(())
    }

    async fn exec(&self, id: &str, req: ExecRequest) -> CoreResult<ExecResult> {
        let net = self.require_ready(id).await?;
        let client = AgentClient::new(&net.ip);
        let start = std::time::Instant::now();
        match tokio::time::timeout(req.timeout() + Duration::from_secs(5), client.exec(&req)).await {
            Ok(Ok(result)) => Ok(result.truncate_stdout()),
            Ok(Err(e)) => Err(CoreError::BackendTransient(e.to_string())),
            Err(_) => Ok(ExecResult::timed_out(
                String::new(),
                String::new(),
                start.elapsed().as_millis() as u64,
            )),
        }
    }

    async fn read_file(&self, id: &str, req: ReadFileRequest) -> CoreResult<ReadFileResult> {
        let net = self.require_ready(id).await?;
        AgentClient::new(&net.ip)
            .read_file(&req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn write_file(&self, id: &str, req: WriteFileRequest) -> CoreResult<()> {
        let net = self.require_ready(id).await?;
        AgentClient::new(&net.ip)
            .write_file(&req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn list_files(&self, id: &str, req: ListFilesRequest) -> CoreResult<ListFilesResult> {
        let net = self.require_ready(id).await?;
        AgentClient::new(&net.ip)
            .list_files(&req)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))
    }

    async fn snapshot(&self, id: &str) -> CoreResult<String> {
        let disk_path = {
            let guard = self.vms.read().await;
            let record = guard.get(id).ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
            record.disk_path.clone()
        };

        let snapshot_id = Uuid::new_v4().to_string();
        let snapshot_dir = self.layout.snapshot_dir(&snapshot_id);
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        let sock_path = self.layout.vm_socket_path(id);
        let fc = FirecrackerClient::new(sock_path.to_string_lossy());
        fc.pause().await.map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.vms.write().await.get_mut(id) {
            record.state = VmState::Paused;
        }

        let mem_path = snapshot_dir.join("mem");
        let vmstate_path = snapshot_dir.join("vmstate");
        let snapshot_result = fc
            .create_snapshot(&mem_path.to_string_lossy(), &vmstate_path.to_string_lossy())
            .await;

        if let Err(e) = snapshot_result {
            let _ = fc.resume().await;
            if let Some(record) = self.vms.write().await.get_mut(id) {
                record.state = VmState::Ready;
            }
            let _ = disk::remove_dir_all(&snapshot_dir).await;
            return Err(CoreError::BackendTransient(e.to_string()));
        }

        let snapshot_disk = snapshot_dir.join("data.ext4");
        if let Err(e) = disk::reflink_or_copy(&disk_path, &snapshot_disk).await {
            let _ = fc.resume().await;
            if let Some(record) = self.vms.write().await.get_mut(id) {
                record.state = VmState::Ready;
            }
            let _ = disk::remove_dir_all(&snapshot_dir).await;
            return Err(CoreError::Other(e));
        }

        fc.resume().await.map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        if let Some(record) = self.vms.write().await.get_mut(id) {
            record.state = VmState::Ready;
        }

        Ok(snapshot_id)
    }

    async fn create_from_snapshot(&self, snapshot_id: &str, req: CreateRequest) -> CoreResult<String> {
        let snapshot_disk = self.layout.snapshot_dir(snapshot_id).join("data.ext4");
        if !snapshot_disk.exists() {
            return Err(CoreError::Precondition(format!("snapshot '{snapshot_id}' not found")));
        }

        let vm_id = self.create(req).await?;
        let dest = self.layout.vm_disk_path(&vm_id);
        if let Err(e) = disk::reflink_or_copy(&snapshot_disk, &dest).await {
            let _ = self.destroy(&vm_id).await;
            return Err(CoreError::Other(e));
        }
        if let Some(record) = self.vms.write().await.get_mut(&vm_id) {
            record.snapshot_of = Some(snapshot_id.to_string());
        }
        Ok(vm_id)
    }

    async fn health(&self) -> HealthStatus {
        if !kvm_available() {
            return HealthStatus {
                healthy: false,
                message: "KVM is not available on this host".to_string(),
                active_count: 0,
            };
        }
        let active = self
            .vms
            .read()
            .await
            .values()
            .filter(|r| r.state != VmState::Destroyed)
            .count() as u64;
        HealthStatus {
            healthy: true,
            message: "ok".to_string(),
            active_count: active,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "microvm",
            supports_persistence: true,
            supports_snapshots: true,
            supports_warm_pool: true,
            requires_kvm: true,
            estimated_startup_ms: 1500,
            provider_kind: ProviderKind::MicroVm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_report_kvm_requirement() {
        let provider = MicroVmProvider::new(MicroVmConfig::default());
        let caps = provider.capabilities();
        assert!(caps.requires_kvm);
        assert!(caps.supports_snapshots);
        assert_eq!(caps.provider_kind, ProviderKind::MicroVm);
    }

    #[tokio::test]
    async fn create_fails_fast_without_kvm_in_test_environment() {
        let provider = MicroVmProvider::new(MicroVmConfig::default());
        if kvm_available() {
            return;
        }
        let err = provider.create(CreateRequest::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::CapabilityMissing(_)));
    }

    #[tokio::test]
    async fn operations_on_unknown_vm_report_not_found() {
        let provider = MicroVmProvider::new(MicroVmConfig::default());
        let err = provider.stop("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::SandboxNotFound(_)));
    }
}
