//! The `Store` contract: the relational persistence layer is explicitly out
//! of scope for the core, so it is represented here as a narrow trait plus
//! an in-memory reference implementation, so the rest of the crate can be
//! exercised without a database.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sandbox_types::{AgentWorkspace, WorkspaceStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait Store: Send + Sync {
    async fn create(&self, workspace: AgentWorkspace) -> CoreResult<()>;
    async fn get(&self, id: Uuid) -> CoreResult<AgentWorkspace>;
    async fn update(&self, workspace: AgentWorkspace) -> CoreResult<()>;
    async fn delete(&self, id: Uuid) -> CoreResult<()>;

    async fn list_persistent_mcp_servers(&self) -> CoreResult<Vec<AgentWorkspace>>;
    async fn list_expired(&self, now: chrono::DateTime<Utc>) -> CoreResult<Vec<AgentWorkspace>>;
    async fn touch_last_used(&self, id: Uuid, extend_ttl: Option<chrono::Duration>)
        -> CoreResult<()>;
    async fn count_active(&self) -> CoreResult<u64>;
    async fn get_by_session_id(&self, session_id: &str) -> CoreResult<Option<AgentWorkspace>>;
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<HashMap<Uuid, AgentWorkspace>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, workspace: AgentWorkspace) -> CoreResult<()> {
        self.inner.write().await.insert(workspace.id, workspace);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<AgentWorkspace> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))
    }

    async fn update(&self, workspace: AgentWorkspace) -> CoreResult<()> {
        let mut guard = self.inner.write().await;
        if !guard.contains_key(&workspace.id) {
            return Err(CoreError::SandboxNotFound(workspace.id.to_string()));
        }
        guard.insert(workspace.id, workspace);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> CoreResult<()> {
        // Idempotent: deleting an already-gone record is not an error, as
        // with the provider Destroy contract.
        self.inner.write().await.remove(&id);
        Ok(())
    }

    async fn list_persistent_mcp_servers(&self) -> CoreResult<Vec<AgentWorkspace>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|w| w.expires_at.is_none() && w.mcp_config.is_some())
            .cloned()
            .collect())
    }

    async fn list_expired(&self, now: chrono::DateTime<Utc>) -> CoreResult<Vec<AgentWorkspace>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|w| w.is_expired(now))
            .cloned()
            .collect())
    }

    async fn touch_last_used(
        &self,
        id: Uuid,
        extend_ttl: Option<chrono::Duration>,
    ) -> CoreResult<()> {
        let mut guard = self.inner.write().await;
        let workspace = guard
            .get_mut(&id)
            .ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
        workspace.last_used_at = Utc::now();
        if let Some(extend) = extend_ttl {
            if let Some(expires_at) = workspace.expires_at {
                workspace.expires_at = Some(expires_at.max(Utc::now()) + extend);
            }
        }
        Ok(())
    }

    async fn count_active(&self) -> CoreResult<u64> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|w| !matches!(w.status, WorkspaceStatus::Stopped | WorkspaceStatus::Error))
            .count() as u64)
    }

    async fn get_by_session_id(&self, session_id: &str) -> CoreResult<Option<AgentWorkspace>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .find(|w| w.session_id.as_deref() == Some(session_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::{ContainerKind, DeploymentMode, ProviderKind, ResourceLimits};

    fn ephemeral_workspace() -> AgentWorkspace {
        AgentWorkspace::new_creating(
            ContainerKind::Workspace,
            ProviderKind::UserKernel,
            DeploymentMode::SelfHosted,
            ResourceLimits::default(),
            Some(chrono::Duration::seconds(-1)),
        )
    }

    #[tokio::test]
    async fn expired_ephemeral_workspace_is_listed() {
        let store = InMemoryStore::new();
        let workspace = ephemeral_workspace();
        let id = workspace.id;
        store.create(workspace).await.unwrap();

        let expired = store.list_expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
    }

    #[tokio::test]
    async fn persistent_mcp_workspace_never_listed_as_expired() {
        let store = InMemoryStore::new();
        let mut workspace = AgentWorkspace::new_creating(
            ContainerKind::McpServer,
            ProviderKind::UserKernel,
            DeploymentMode::SelfHosted,
            ResourceLimits::default(),
            None,
        );
        workspace.mcp_config = Some(sandbox_types::McpConfig {
            name: "m".into(),
            image: "img".into(),
            stdio_bridge: true,
            restart_policy: sandbox_types::RestartPolicy::Always,
            environment: Default::default(),
            extra_mounts: vec![],
        });
        assert!(workspace.expires_at.is_none());
        store.create(workspace).await.unwrap();

        let expired = store.list_expired(Utc::now()).await.unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
    }
}
