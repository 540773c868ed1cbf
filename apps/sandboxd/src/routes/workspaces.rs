use axum::extract::{Path, Query, State};
use axum::Json;
use sandbox_core::auto_provisioner::WorkspaceRequest;
use sandbox_types::{
    AgentWorkspace, ContainerKind, DeploymentMode, ExecRequest, ListFilesRequest,
    ListFilesResult, ProviderKind, ReadFileRequest, ReadFileResult, WriteFileRequest,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceBody {
    #[serde(default)]
    pub enabled: Option<bool>,
    pub session_id: String,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub requested_provider: Option<ProviderKind>,
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repo_branch: Option<String>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkspaceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let req = WorkspaceRequest {
        enabled: body.enabled.unwrap_or(true),
        session_id: body.session_id,
        deployment_mode: body.deployment_mode,
        requested_provider: body.requested_provider,
        base_image: body.base_image,
        repo_url: body.repo_url,
        repo_branch: body.repo_branch,
        setup_commands: body.setup_commands,
        ttl: body.ttl_secs.map(chrono::Duration::seconds),
    };
    let result = state.provisioner.provision(req).await.map_err(ApiError)?;
    match result {
        None => Ok(Json(serde_json::json!({ "provisioned": false }))),
        Some(result) => Ok(Json(serde_json::json!({
            "provisioned": true,
            "degraded": result.degraded,
            "workspace_id": result.workspace_id,
            "provider_local_id": result.provider_local_id,
            "setup_failed_at": result.setup_failed_at,
        }))),
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AgentWorkspace>> {
    Ok(Json(state.store.get(id).await.map_err(ApiError)?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.provisioner.teardown(id).await;
    state.store.delete(id).await.map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn stop(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<serde_json::Value>> {
    let mut workspace = state.store.get(id).await.map_err(ApiError)?;
    let (_, provider) = state
        .orchestrator
        .select_provider(
            workspace.container_kind,
            workspace.deployment_mode,
            Some(workspace.provider_kind),
        )
        .await
        .map_err(ApiError)?;
    provider.stop(&workspace.provider_local_id).await.map_err(ApiError)?;
    workspace.status = sandbox_types::WorkspaceStatus::Stopped;
    state.store.update(workspace).await.map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<serde_json::Value>> {
    let mut workspace = state.store.get(id).await.map_err(ApiError)?;
    let (_, provider) = state
        .orchestrator
        .select_provider(
            workspace.container_kind,
            workspace.deployment_mode,
            Some(workspace.provider_kind),
        )
        .await
        .map_err(ApiError)?;
    provider.resume(&workspace.provider_local_id).await.map_err(ApiError)?;
    workspace.status = sandbox_types::WorkspaceStatus::Ready;
    state.store.update(workspace).await.map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn resolve(
    state: &AppState,
    id: Uuid,
) -> ApiResult<(AgentWorkspace, std::sync::Arc<dyn sandbox_core::provider::Provider>)> {
    let workspace = state.store.get(id).await.map_err(ApiError)?;
    let (_, provider) = state
        .orchestrator
        .select_provider(
            workspace.container_kind,
            workspace.deployment_mode,
            Some(workspace.provider_kind),
        )
        .await
        .map_err(ApiError)?;
    Ok((workspace, provider))
}

pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<Json<sandbox_types::ExecResult>> {
    let (workspace, provider) = resolve(&state, id).await?;
    let result = provider
        .exec(&workspace.provider_local_id, req)
        .await
        .map_err(ApiError)?;
    let store = state.store.clone();
    tokio::spawn(async move {
        let _ = store.touch_last_used(id, None).await;
    });
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReadFileQuery>,
) -> ApiResult<Json<ReadFileResult>> {
    let (workspace, provider) = resolve(&state, id).await?;
    let req = ReadFileRequest {
        path: query.path,
        offset: query.offset,
        limit: query.limit,
    };
    Ok(Json(
        provider
            .read_file(&workspace.provider_local_id, req)
            .await
            .map_err(ApiError)?,
    ))
}

pub async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<WriteFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (workspace, provider) = resolve(&state, id).await?;
    provider
        .write_file(&workspace.provider_local_id, req)
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub base_path: String,
    #[serde(default)]
    pub glob: Option<String>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<Json<ListFilesResult>> {
    let (workspace, provider) = resolve(&state, id).await?;
    let req = ListFilesRequest {
        base_path: query.base_path,
        glob: query.glob,
    };
    Ok(Json(
        provider
            .list_files(&workspace.provider_local_id, req)
            .await
            .map_err(ApiError)?,
    ))
}

pub async fn snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let (workspace, provider) = resolve(&state, id).await?;
    let snapshot_id = provider
        .snapshot(&workspace.provider_local_id)
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "snapshot_id": snapshot_id })))
}

#[derive(Debug, Deserialize)]
pub struct CreateFromSnapshotBody {
    pub snapshot_id: String,
    pub provider_kind: ProviderKind,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub base_image: Option<String>,
}

pub async fn create_from_snapshot(
    State(state): State<AppState>,
    Json(body): Json<CreateFromSnapshotBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, provider) = state
        .orchestrator
        .select_provider(
            ContainerKind::Workspace,
            body.deployment_mode,
            Some(body.provider_kind),
        )
        .await
        .map_err(ApiError)?;

    let mut workspace = AgentWorkspace::new_creating(
        ContainerKind::Workspace,
        body.provider_kind,
        body.deployment_mode,
        Default::default(),
        None,
    );
    workspace.snapshot_of = Some(body.snapshot_id.clone());
    state.store.create(workspace.clone()).await.map_err(ApiError)?;

    let create_req = sandbox_types::CreateRequest {
        container_kind: ContainerKind::Workspace,
        base_image: body.base_image,
        ..Default::default()
    };
    let provider_local_id = match provider.create_from_snapshot(&body.snapshot_id, create_req).await {
        Ok(id) => id,
        Err(err) => {
            workspace.status = sandbox_types::WorkspaceStatus::Error;
            let _ = state.store.update(workspace).await;
            return Err(ApiError(err));
        }
    };
    workspace.provider_local_id = provider_local_id;
    workspace.status = sandbox_types::WorkspaceStatus::Ready;
    state.store.update(workspace.clone()).await.map_err(ApiError)?;

    Ok(Json(serde_json::json!({ "workspace_id": workspace.id })))
}
