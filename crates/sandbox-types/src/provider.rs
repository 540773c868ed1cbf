use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ContainerKind, ProviderKind, ResourceLimits};

/// Output truncation ceiling for `Exec` (spec default: 50 KiB).
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024;

/// Default per-call `Exec` timeout (spec default: 2 minutes).
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub container_kind: ContainerKind,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub startup_command: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    #[serde(default)]
    pub attach_stdin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExecRequest {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_EXEC_TIMEOUT_MS))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl ExecResult {
    /// Builds a timeout result: partial output preserved, exit code fixed at -1.
    pub fn timed_out(stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: -1,
            duration_ms,
            truncated: false,
        }
    }

    pub fn truncate_stdout(mut self) -> Self {
        if self.stdout.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while cut > 0 && !self.stdout.is_char_boundary(cut) {
                cut -= 1;
            }
            self.stdout.truncate(cut);
            self.truncated = true;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadFileResult {
    pub content: String,
    pub is_dir: bool,
    pub total_lines: u64,
    pub file_size: u64,
    pub is_binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesRequest {
    pub base_path: String,
    #[serde(default)]
    pub glob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilesResult {
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub active_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub name: &'static str,
    pub supports_persistence: bool,
    pub supports_snapshots: bool,
    pub supports_warm_pool: bool,
    pub requires_kvm: bool,
    pub estimated_startup_ms: u64,
    pub provider_kind: ProviderKind,
}
