//! Input sanitization for paths and shell arguments crossing into a
//! provider. Kept as pure functions so they can be unit tested without a
//! running backend.
use crate::error::{CoreError, CoreResult};

/// Rejects absolute escapes and parent-directory traversal. Callers join the
/// result onto a fixed workspace root, so a path like `../../etc/passwd`
/// must never reach that join.
pub fn sanitize_relative_path(path: &str) -> CoreResult<String> {
    if path.is_empty() {
        return Err(CoreError::Precondition("path must not be empty".into()));
    }
    if path.starts_with('/') || path.starts_with('~') {
        return Err(CoreError::Precondition(format!(
            "path must be relative to the workspace root: {path}"
        )));
    }
    if path
        .split('/')
        .any(|segment| segment == ".." || segment.contains('\0'))
    {
        return Err(CoreError::Precondition(format!(
            "path traversal is not allowed: {path}"
        )));
    }
    Ok(path.to_string())
}

/// Rejects a handful of shell metacharacters that have no business in a
/// command string built by the orchestrator itself (as opposed to one an
/// agent supplies verbatim to `exec`, which is passed through untouched —
/// this guards orchestrator-constructed commands such as setup scripts).
pub fn sanitize_shell_fragment(fragment: &str) -> CoreResult<()> {
    const FORBIDDEN: [char; 4] = ['\0', '\n', '\r', '`'];
    if fragment.chars().any(|c| FORBIDDEN.contains(&c)) {
        return Err(CoreError::Precondition(
            "command fragment contains forbidden control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_path() {
        assert!(sanitize_relative_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(sanitize_relative_path("../../etc/passwd").is_err());
        assert!(sanitize_relative_path("a/../../b").is_err());
    }

    #[test]
    fn rejects_home_escape() {
        assert!(sanitize_relative_path("~/secrets").is_err());
    }

    #[test]
    fn accepts_ordinary_relative_path() {
        assert_eq!(
            sanitize_relative_path("src/main.rs").unwrap(),
            "src/main.rs"
        );
    }

    #[test]
    fn rejects_empty_path() {
        assert!(sanitize_relative_path("").is_err());
    }

    #[test]
    fn rejects_null_byte_fragment() {
        assert!(sanitize_shell_fragment("echo hi\0").is_err());
    }

    #[test]
    fn accepts_ordinary_fragment() {
        assert!(sanitize_shell_fragment("npm install --no-audit").is_ok());
    }
}
