mod error;
mod routes;
mod state;

use std::sync::Arc;

use axum::Router;
use sandbox_core::config::{CleanupConfig, McpBackoffConfig, OrchestratorConfig, ProvisionerConfig};
use sandbox_core::{AutoProvisioner, CleanupEngine, InMemoryStore, McpHostingService, Orchestrator, WarmPool};
use sandbox_provider_container::ContainerProvider;
use sandbox_provider_managed::{ManagedConfig, ManagedProvider};
use sandbox_provider_microvm::{MicroVmConfig, MicroVmProvider};
use sandbox_types::ProviderKind;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,sandboxd=info,sandbox_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = InMemoryStore::new();
    let orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let container_provider = ContainerProvider::connect()
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to container runtime: {e}"))?;
    orchestrator
        .register(ProviderKind::UserKernel, container_provider.clone())
        .await;

    let microvm_provider = MicroVmProvider::new(MicroVmConfig::default());
    orchestrator.register(ProviderKind::MicroVm, microvm_provider).await;

    let managed_provider = ManagedProvider::new(ManagedConfig::from_env())?;
    orchestrator.register(ProviderKind::Managed, managed_provider).await;

    orchestrator.spawn_health_monitor();

    let provisioner = Arc::new(AutoProvisioner::new(
        orchestrator.clone(),
        store.clone(),
        None,
        ProvisionerConfig::default(),
    ));

    let mcp = McpHostingService::new(
        orchestrator.clone(),
        store.clone(),
        container_provider.clone(),
        McpBackoffConfig::default(),
    );
    if let Err(err) = mcp.start_all().await {
        warn!(error = %err, "failed to resume persistent mcp servers at boot");
    }

    let cleanup = CleanupEngine::new(orchestrator.clone(), store.clone(), CleanupConfig::default());
    let _cleanup_handle = cleanup.spawn();

    let warm_pool_target = std::env::var("SANDBOX_WARM_POOL_TARGET")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let warm_pool = if warm_pool_target > 0 {
        let pool = WarmPool::new(ProviderKind::UserKernel, container_provider.clone(), warm_pool_target);
        pool.start().await;
        Some(pool)
    } else {
        None
    };

    let state = AppState {
        orchestrator,
        store,
        provisioner,
        mcp,
        warm_pool,
    };

    let app: Router = routes::router()
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        );

    let bind = std::env::var("SANDBOXD_BIND").unwrap_or_else(|_| "127.0.0.1:18080".into());
    info!(%bind, "sandboxd listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
