//! Authentication/authorization middleware lives outside this crate. The
//! orchestrator only needs to resolve a caller's bearer token to an account
//! id before authorizing an operation on that account's workspaces.
use async_trait::async_trait;

#[async_trait]
pub trait AuthCollaborator: Send + Sync {
    async fn resolve_account(&self, bearer_token: &str) -> Option<String>;
}

/// Treats every token as its own account id. A stand-in for exercising the
/// core without a real identity provider wired up.
pub struct NullAuth;

#[async_trait]
impl AuthCollaborator for NullAuth {
    async fn resolve_account(&self, bearer_token: &str) -> Option<String> {
        if bearer_token.is_empty() {
            None
        } else {
            Some(bearer_token.to_string())
        }
    }
}
