//! HTTP client for the in-VM agent: JSON POST `/exec|/read|/write|/list`,
//! GET `/health`. Exec overrides the HTTP timeout to `requested + 5s` so the
//! transport outlasts the in-VM command per spec.md §4.2.
use std::time::Duration;

use anyhow::{Context, Result};
use sandbox_types::{
    ExecRequest, ExecResult, ListFilesRequest, ListFilesResult, ReadFileRequest, ReadFileResult,
    WriteFileRequest,
};

const AGENT_PORT: u16 = 8081;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentClient {
    base_url: String,
}

impl AgentClient {
    pub fn new(vm_ip: &str) -> Self {
        Self {
            base_url: format!("http://{vm_ip}:{AGENT_PORT}"),
        }
    }

    pub async fn wait_until_healthy(&self, startup_timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + startup_timeout;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("building health-check client")?;
        loop {
            if let Ok(resp) = client.get(format!("{}/health", self.base_url)).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("in-VM agent did not become healthy within {startup_timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub async fn exec(&self, req: &ExecRequest) -> Result<ExecResult> {
        let http_timeout = req.timeout() + Duration::from_secs(5);
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .context("building exec client")?;
        let resp = client
            .post(format!("{}/exec", self.base_url))
            .json(req)
            .send()
            .await
            .context("calling in-VM agent /exec")?;
        resp.json::<ExecResult>().await.context("decoding /exec response")
    }

    pub async fn read_file(&self, req: &ReadFileRequest) -> Result<ReadFileResult> {
        let client = self.default_client()?;
        let resp = client
            .post(format!("{}/read", self.base_url))
            .json(req)
            .send()
            .await
            .context("calling in-VM agent /read")?;
        if !resp.status().is_success() {
            anyhow::bail!("in-VM agent /read returned {}", resp.status());
        }
        resp.json::<ReadFileResult>().await.context("decoding /read response")
    }

    pub async fn write_file(&self, req: &WriteFileRequest) -> Result<()> {
        let client = self.default_client()?;
        let resp = client
            .post(format!("{}/write", self.base_url))
            .json(req)
            .send()
            .await
            .context("calling in-VM agent /write")?;
        if !resp.status().is_success() {
            anyhow::bail!("in-VM agent /write returned {}", resp.status());
        }
        Ok(())
    }

    pub async fn list_files(&self, req: &ListFilesRequest) -> Result<ListFilesResult> {
        let client = self.default_client()?;
        let resp = client
            .post(format!("{}/list", self.base_url))
            .json(req)
            .send()
            .await
            .context("calling in-VM agent /list")?;
        if !resp.status().is_success() {
            anyhow::bail!("in-VM agent /list returned {}", resp.status());
        }
        resp.json::<ListFilesResult>().await.context("decoding /list response")
    }

    fn default_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .context("building agent client")
    }
}
