//! The sandbox control plane core: the Provider contract, the Orchestrator
//! that selects between registered providers, the Warm Pool, the Stdio
//! Bridge, the MCP Hosting Service, the Auto-Provisioner, and the Cleanup
//! Engine. The relational store, HTTP transport, authentication, and
//! repository checkout are external collaborators represented here as
//! narrow traits.
pub mod auth;
pub mod auto_provisioner;
pub mod checkout;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod mcp_hosting;
pub mod orchestrator;
pub mod provider;
pub mod sanitize;
pub mod stdio_bridge;
pub mod store;
pub mod warm_pool;

pub use auth::AuthCollaborator;
pub use auto_provisioner::AutoProvisioner;
pub use checkout::CheckoutCollaborator;
pub use cleanup::CleanupEngine;
pub use error::{CoreError, CoreResult};
pub use mcp_hosting::{McpContainerProvider, McpHostingService};
pub use orchestrator::Orchestrator;
pub use provider::Provider;
pub use stdio_bridge::StdioBridge;
pub use store::{InMemoryStore, Store};
pub use warm_pool::WarmPool;
