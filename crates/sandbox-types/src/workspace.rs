use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a sandbox is hosting: a throwaway coding workspace or a long-lived
/// MCP server. Drives the `lifecycle ⇔ container-kind` invariant on
/// [`AgentWorkspace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    Workspace,
    McpServer,
}

impl Default for ContainerKind {
    fn default() -> Self {
        ContainerKind::Workspace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    MicroVm,
    UserKernel,
    Managed,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::MicroVm => "micro-vm",
            ProviderKind::UserKernel => "user-kernel",
            ProviderKind::Managed => "managed",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    SelfHosted,
    Managed,
}

impl Default for DeploymentMode {
    fn default() -> Self {
        DeploymentMode::SelfHosted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    Ephemeral,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceStatus {
    Creating,
    Ready,
    Stopping,
    Stopped,
    Error,
}

/// CPU/memory/disk limits. Memory and disk accept the usual `K`/`M`/`G`
/// byte suffixes; CPU is a decimal core count (e.g. `"0.5"`, `"2"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

impl ResourceLimits {
    /// Parses a `K`/`M`/`G`-suffixed byte string (e.g. `"512M"`) into bytes.
    /// Bare numbers are treated as already-bytes.
    pub fn parse_bytes(value: &str) -> Option<u64> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let (digits, mult) = match value.chars().last().unwrap().to_ascii_uppercase() {
            'K' => (&value[..value.len() - 1], 1024u64),
            'M' => (&value[..value.len() - 1], 1024 * 1024),
            'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
            _ => (value, 1),
        };
        digits.trim().parse::<u64>().ok().map(|n| n * mult)
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory.as_deref().and_then(Self::parse_bytes)
    }

    pub fn disk_bytes(&self) -> Option<u64> {
        self.disk.as_deref().and_then(Self::parse_bytes)
    }

    pub fn cpu_cores(&self) -> Option<f64> {
        self.cpu.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

/// Configuration for a persistent MCP server container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub stdio_bridge: bool,
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
}

/// The persistent record of one sandbox. Owned by the excluded relational
/// store; modeled here so the core and its in-memory reference `Store` can
/// share a single type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkspace {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub container_kind: ContainerKind,
    pub provider_kind: ProviderKind,
    /// Empty while `status == Creating`; assigned by the provider on success.
    #[serde(default)]
    pub provider_local_id: String,
    pub deployment_mode: DeploymentMode,
    pub lifecycle: Lifecycle,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<McpConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentWorkspace {
    /// Builds a new record in `status = Creating`, honoring the
    /// `lifecycle ⇔ container_kind` and `expires_at ⇔ ephemeral` invariants.
    pub fn new_creating(
        container_kind: ContainerKind,
        provider_kind: ProviderKind,
        deployment_mode: DeploymentMode,
        limits: ResourceLimits,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        let lifecycle = match container_kind {
            ContainerKind::McpServer => Lifecycle::Persistent,
            ContainerKind::Workspace => Lifecycle::Ephemeral,
        };
        let now = Utc::now();
        let expires_at = match lifecycle {
            Lifecycle::Ephemeral => Some(now + ttl.unwrap_or_else(|| chrono::Duration::days(30))),
            Lifecycle::Persistent => None,
        };
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            container_kind,
            provider_kind,
            provider_local_id: String::new(),
            deployment_mode,
            lifecycle,
            status: WorkspaceStatus::Creating,
            created_at: now,
            last_used_at: now,
            expires_at,
            limits,
            snapshot_of: None,
            mcp_config: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
            && !matches!(self.status, WorkspaceStatus::Stopped | WorkspaceStatus::Error)
    }
}
