use axum::extract::State;
use axum::Json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let providers = state.orchestrator.health_snapshot().await;
    let providers: serde_json::Map<String, serde_json::Value> = providers
        .into_iter()
        .map(|(kind, health)| {
            (
                kind.to_string(),
                serde_json::json!({
                    "healthy": health.healthy,
                    "message": health.message,
                    "active_count": health.active_count,
                }),
            )
        })
        .collect();

    let warm_pool = match &state.warm_pool {
        Some(pool) => {
            let metrics = pool.metrics().await;
            serde_json::json!({
                "hits": metrics.hits,
                "misses": metrics.misses,
                "current_size": metrics.current_size,
                "target_size": metrics.target_size,
            })
        }
        None => serde_json::Value::Null,
    };

    Json(serde_json::json!({
        "providers": providers,
        "warm_pool": warm_pool,
    }))
}
