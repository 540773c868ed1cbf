//! The thin shell's shared state: an `Arc`-wrapped handle per core service,
//! cloned into every request the way the teacher's `AppState` bundles its
//! repositories.
use std::sync::Arc;

use sandbox_core::{AutoProvisioner, McpHostingService, Orchestrator, Store, WarmPool};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    pub provisioner: Arc<AutoProvisioner>,
    pub mcp: Arc<McpHostingService>,
    pub warm_pool: Option<Arc<WarmPool>>,
}
