use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod mcp;
pub mod workspaces;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health::health))
        .route("/v1/workspaces", post(workspaces::create))
        .route("/v1/workspaces/from-snapshot", post(workspaces::create_from_snapshot))
        .route(
            "/v1/workspaces/:id",
            get(workspaces::get).delete(workspaces::delete),
        )
        .route("/v1/workspaces/:id/stop", post(workspaces::stop))
        .route("/v1/workspaces/:id/resume", post(workspaces::resume))
        .route("/v1/workspaces/:id/exec", post(workspaces::exec))
        .route(
            "/v1/workspaces/:id/files",
            get(workspaces::read_file)
                .post(workspaces::write_file)
                .put(workspaces::write_file),
        )
        .route("/v1/workspaces/:id/files/list", get(workspaces::list_files))
        .route("/v1/workspaces/:id/snapshot", post(workspaces::snapshot))
        .route("/v1/mcp", post(mcp::register))
        .route("/v1/mcp/:id/call", post(mcp::call))
        .route("/v1/mcp/:id/restart", post(mcp::restart))
}
