//! Thin client over Firecracker's Unix-domain-socket HTTP API: machine
//! config, boot source, drives, network interfaces, the logger/metrics
//! endpoints, and the actions used to pause/resume/create a snapshot.
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri};
use serde::Serialize;
use serde_json::json;

pub struct FirecrackerClient {
    sock_path: String,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl FirecrackerClient {
    pub fn new(sock_path: impl Into<String>) -> Self {
        Self {
            sock_path: sock_path.into(),
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    async fn request(&self, method: Method, path: &str, body: impl Serialize) -> Result<()> {
        let payload = serde_json::to_vec(&body).context("serializing firecracker request body")?;
        let uri = Uri::new(&self.sock_path, path);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .context("building firecracker request")?;
        let res = self
            .client
            .request(req)
            .await
            .with_context(|| format!("calling firecracker API {path}"))?;
        let status = res.status();
        let body = res.into_body().collect().await.context("reading firecracker response body")?.to_bytes();
        if !status.is_success() {
            anyhow::bail!(
                "firecracker API {path} returned {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }
        Ok(())
    }

    pub async fn set_machine_config(&self, vcpu_count: u32, mem_size_mib: u64) -> Result<()> {
        self.request(
            Method::PUT,
            "/machine-config",
            json!({
                "vcpu_count": vcpu_count,
                "mem_size_mib": mem_size_mib,
                "track_dirty_pages": true,
            }),
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel_image_path: &str, boot_args: &str) -> Result<()> {
        self.request(
            Method::PUT,
            "/boot-source",
            json!({
                "kernel_image_path": kernel_image_path,
                "boot_args": boot_args,
            }),
        )
        .await
    }

    pub async fn add_drive(&self, drive_id: &str, path_on_host: &str, read_only: bool) -> Result<()> {
        self.request(
            Method::PUT,
            &format!("/drives/{drive_id}"),
            json!({
                "drive_id": drive_id,
                "path_on_host": path_on_host,
                "is_root_device": drive_id == "rootfs",
                "is_read_only": read_only,
            }),
        )
        .await
    }

    pub async fn add_network_interface(&self, iface_id: &str, host_dev_name: &str, mac: &str) -> Result<()> {
        self.request(
            Method::PUT,
            &format!("/network-interfaces/{iface_id}"),
            json!({
                "iface_id": iface_id,
                "host_dev_name": host_dev_name,
                "guest_mac": mac,
            }),
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.request(Method::PUT, "/actions", json!({ "action_type": "InstanceStart" }))
            .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Method::PATCH, "/vm", json!({ "state": "Paused" })).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Method::PATCH, "/vm", json!({ "state": "Resumed" })).await
    }

    /// Snapshots memory + VM state to the given paths. Caller must `pause`
    /// first and `resume` afterward.
    pub async fn create_snapshot(&self, mem_file_path: &str, snapshot_path: &str) -> Result<()> {
        self.request(
            Method::PUT,
            "/snapshot/create",
            json!({
                "mem_file_path": mem_file_path,
                "snapshot_path": snapshot_path,
            }),
        )
        .await
    }
}
