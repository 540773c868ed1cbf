//! REST clients for the two-plane managed-sandbox API: a control plane
//! (API-key authenticated) for lifecycle, and a per-sandbox data plane
//! (short-lived access token, reissued on resume) for exec/file operations.
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxBody {
    pub image: Option<String>,
    pub labels: std::collections::HashMap<String, String>,
    pub environment: std::collections::HashMap<String, String>,
    pub startup_command: Option<String>,
    pub memory_bytes: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResponse {
    pub sandbox_id: String,
    pub access_token: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeResponse {
    pub access_token: String,
}

pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build().context("building control-plane client")?,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    pub async fn create(&self, body: &CreateSandboxBody) -> Result<CreateSandboxResponse> {
        let resp = self
            .http
            .post(format!("{}/v1/sandboxes", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .context("calling control plane create")?;
        if !resp.status().is_success() {
            anyhow::bail!("control plane create returned {}", resp.status());
        }
        resp.json().await.context("decoding create response")
    }

    pub async fn destroy(&self, sandbox_id: &str) -> Result<bool> {
        let resp = self
            .http
            .delete(format!("{}/v1/sandboxes/{sandbox_id}", self.base_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("calling control plane destroy")?;
        Ok(resp.status().is_success() || resp.status().as_u16() == 404)
    }

    pub async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/sandboxes/{sandbox_id}/stop", self.base_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("calling control plane stop")?;
        if !resp.status().is_success() {
            anyhow::bail!("control plane stop returned {}", resp.status());
        }
        Ok(())
    }

    pub async fn resume(&self, sandbox_id: &str) -> Result<ResumeResponse> {
        let resp = self
            .http
            .post(format!("{}/v1/sandboxes/{sandbox_id}/resume", self.base_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("calling control plane resume")?;
        if !resp.status().is_success() {
            anyhow::bail!("control plane resume returned {}", resp.status());
        }
        resp.json().await.context("decoding resume response")
    }

    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/v1/health", self.base_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("calling control plane health")?;
        if !resp.status().is_success() {
            anyhow::bail!("control plane health returned {}", resp.status());
        }
        Ok(())
    }
}

/// Derives the data-plane host for a sandbox: `https://{port}-{sandbox-id}.{domain}`.
pub fn data_plane_url(domain: &str, sandbox_id: &str, port: u16) -> String {
    format!("https://{port}-{sandbox_id}.{domain}")
}

pub struct DataPlaneClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl DataPlaneClient {
    pub fn new(base_url: String, access_token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build().context("building data-plane client")?,
            base_url,
            access_token,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        self.http
            .post(format!("{}{path}", self.base_url))
            .header("X-Access-Token", &self.access_token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("calling data plane {path}"))
    }

    pub async fn exec_supported(&self, body: Value) -> Result<Option<reqwest::Response>> {
        let resp = self.post("/exec", body).await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(resp))
    }

    pub async fn files_write(&self, path: &str, content: &str) -> Result<()> {
        let resp = self.post("/files/write", serde_json::json!({ "path": path, "content": content })).await?;
        if !resp.status().is_success() {
            anyhow::bail!("data plane files/write returned {}", resp.status());
        }
        Ok(())
    }

    pub async fn files_read(&self, path: &str) -> Result<reqwest::Response> {
        self.post("/files/read", serde_json::json!({ "path": path })).await
    }

    pub async fn files_list(&self, base_path: &str, glob: Option<&str>) -> Result<reqwest::Response> {
        self.post("/files/list", serde_json::json!({ "base_path": base_path, "glob": glob })).await
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .header("X-Access-Token", &self.access_token)
            .send()
            .await
            .context("calling data plane health")?;
        if !resp.status().is_success() {
            anyhow::bail!("data plane health returned {}", resp.status());
        }
        Ok(())
    }
}
