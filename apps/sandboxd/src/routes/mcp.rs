use axum::extract::{Path, State};
use axum::Json;
use sandbox_types::{AgentWorkspace, McpConfig};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(config): Json<McpConfig>,
) -> ApiResult<Json<AgentWorkspace>> {
    Ok(Json(state.mcp.register(config).await.map_err(ApiError)?))
}

#[derive(Debug, Deserialize)]
pub struct CallBody {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub async fn call(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CallBody>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(
        state
            .mcp
            .call(id, &body.method, body.params)
            .await
            .map_err(ApiError)?,
    ))
}

pub async fn restart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.mcp.restart(id).await.map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
