//! Repository checkout and credential injection are external collaborators:
//! the Auto-Provisioner calls them but their implementation (git plumbing,
//! credential vault lookups) lives outside this crate.
use async_trait::async_trait;
use sandbox_types::{ExecResult, ProviderKind};

use crate::error::CoreResult;

#[async_trait]
pub trait CheckoutCollaborator: Send + Sync {
    async fn clone_repository(
        &self,
        provider_kind: ProviderKind,
        provider_local_id: &str,
        url: &str,
        branch: Option<&str>,
    ) -> CoreResult<()>;

    /// Runs a git command with short-lived credentials injected. The
    /// returned output must never contain the credentials themselves —
    /// callers apply [`crate::sanitize`]-style rewriting at the boundary.
    async fn inject_credentials_for_push(
        &self,
        provider_kind: ProviderKind,
        provider_local_id: &str,
        command: &str,
    ) -> CoreResult<ExecResult>;
}

/// No-op stand-in: every clone and push fails fast rather than silently
/// succeeding, so a caller that forgets to wire in a real collaborator
/// notices immediately instead of shipping an agent with no repository.
pub struct NullCheckout;

#[async_trait]
impl CheckoutCollaborator for NullCheckout {
    async fn clone_repository(
        &self,
        _provider_kind: ProviderKind,
        _provider_local_id: &str,
        _url: &str,
        _branch: Option<&str>,
    ) -> CoreResult<()> {
        Err(crate::error::CoreError::NotSupported(
            "no checkout collaborator configured".into(),
        ))
    }

    async fn inject_credentials_for_push(
        &self,
        _provider_kind: ProviderKind,
        _provider_local_id: &str,
        _command: &str,
    ) -> CoreResult<ExecResult> {
        Err(crate::error::CoreError::NotSupported(
            "no checkout collaborator configured".into(),
        ))
    }
}

/// Rewrites `https://TOKEN@host` credentials embedded in git output to
/// `https://***@host` before it leaves the core.
pub fn sanitize_credential_urls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(scheme_pos) = rest.find("https://") {
        out.push_str(&rest[..scheme_pos]);
        let after_scheme = &rest[scheme_pos + "https://".len()..];
        if let Some(at_pos) = after_scheme.find('@') {
            let credential_candidate = &after_scheme[..at_pos];
            if !credential_candidate.is_empty()
                && !credential_candidate.contains('/')
                && !credential_candidate.contains(char::is_whitespace)
            {
                out.push_str("https://***@");
                rest = &after_scheme[at_pos + 1..];
                continue;
            }
        }
        out.push_str("https://");
        rest = after_scheme;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_embedded_token() {
        let input = "Cloning into repo...\nremote: https://ghp_abc123@github.com/org/repo.git\n";
        let output = sanitize_credential_urls(input);
        assert!(output.contains("https://***@github.com"));
        assert!(!output.contains("ghp_abc123"));
    }

    #[test]
    fn leaves_plain_urls_untouched() {
        let input = "fetching https://github.com/org/repo.git";
        assert_eq!(sanitize_credential_urls(input), input);
    }
}
