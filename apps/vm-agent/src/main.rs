//! In-VM HTTP agent: the microVM provider's only way to reach the guest.
//! Exposes `/health` plus the four Provider-shaped file/exec operations
//! over `/workspace`. No persistence of its own — every request is served
//! straight off the guest's filesystem and process table.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use sandbox_core::sanitize::sanitize_relative_path;
use sandbox_types::{
    ExecRequest, ExecResult, FileEntry, ListFilesRequest, ListFilesResult, ReadFileRequest,
    ReadFileResult, WriteFileRequest,
};
use tokio::process::Command;
use tracing::{error, info};

const AGENT_PORT: u16 = 8081;
const WORKSPACE_ROOT: &str = "/workspace";
const BINARY_SCAN_WINDOW: usize = 8 * 1024;

struct AgentError(StatusCode, String);

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

/// Accepts both a path relative to `/workspace` and one already prefixed
/// with it (the Provider contract's callers pass full `/workspace/...`
/// paths, e.g. spec scenario 1's `WriteFile(id, "/workspace/hello.txt", …)`).
/// Any other absolute path is rejected rather than silently rebased.
fn resolve_path(raw: &str) -> Result<PathBuf, AgentError> {
    let relative = if raw == WORKSPACE_ROOT {
        return Ok(PathBuf::from(WORKSPACE_ROOT));
    } else if let Some(rest) = raw.strip_prefix(&format!("{WORKSPACE_ROOT}/")) {
        rest
    } else if raw.starts_with('/') {
        return Err(AgentError(
            StatusCode::BAD_REQUEST,
            format!("path must be under {WORKSPACE_ROOT}: {raw}"),
        ));
    } else {
        raw
    };
    let relative = sanitize_relative_path(relative)
        .map_err(|e| AgentError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Path::new(WORKSPACE_ROOT).join(relative))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn exec(Json(req): Json<ExecRequest>) -> Json<ExecResult> {
    let start = Instant::now();
    let timeout = req.timeout();
    let workdir = req.workdir.clone().unwrap_or_else(|| WORKSPACE_ROOT.to_string());

    let spawn = Command::new("/bin/sh")
        .arg("-c")
        .arg(&req.command)
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawn {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "failed to spawn exec command");
            return Json(ExecResult {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
                duration_ms: start.elapsed().as_millis() as u64,
                truncated: false,
            });
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Json(
            ExecResult {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                duration_ms: start.elapsed().as_millis() as u64,
                truncated: false,
            }
            .truncate_stdout(),
        ),
        Ok(Err(e)) => Json(ExecResult {
            stdout: String::new(),
            stderr: e.to_string(),
            exit_code: -1,
            duration_ms: start.elapsed().as_millis() as u64,
            truncated: false,
        }),
        Err(_) => {
            let _ = child.start_kill();
            Json(ExecResult::timed_out(String::new(), String::new(), start.elapsed().as_millis() as u64))
        }
    }
}

async fn read_file(Json(req): Json<ReadFileRequest>) -> Result<Json<ReadFileResult>, AgentError> {
    let path = resolve_path(&req.path)?;
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| AgentError(StatusCode::NOT_FOUND, e.to_string()))?;

    if metadata.is_dir() {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))? {
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        let content = entries.join("\n");
        let total_lines = entries.len() as u64;
        return Ok(Json(ReadFileResult {
            content,
            is_dir: true,
            total_lines,
            file_size: 0,
            is_binary: false,
        }));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let scan_window = &bytes[..bytes.len().min(BINARY_SCAN_WINDOW)];
    let is_binary = scan_window.contains(&0u8);

    if is_binary {
        return Ok(Json(ReadFileResult {
            content: String::new(),
            is_dir: false,
            total_lines: 0,
            file_size: bytes.len() as u64,
            is_binary: true,
        }));
    }

    let text = String::from_utf8_lossy(&bytes);
    let all_lines: Vec<&str> = text.lines().collect();
    let total_lines = all_lines.len() as u64;

    let selected: Vec<&str> = match (req.offset, req.limit) {
        (Some(offset), Some(limit)) => {
            let start_idx = offset.saturating_sub(1) as usize;
            all_lines.iter().skip(start_idx).take(limit as usize).copied().collect()
        }
        (Some(offset), None) => {
            let start_idx = offset.saturating_sub(1) as usize;
            all_lines.iter().skip(start_idx).copied().collect()
        }
        (None, Some(limit)) => all_lines.iter().take(limit as usize).copied().collect(),
        (None, None) => all_lines,
    };

    Ok(Json(ReadFileResult {
        content: selected.join("\n"),
        is_dir: false,
        total_lines,
        file_size: bytes.len() as u64,
        is_binary: false,
    }))
}

async fn write_file(Json(req): Json<WriteFileRequest>) -> Result<StatusCode, AgentError> {
    let path = resolve_path(&req.path)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }
    tokio::fs::write(&path, req.content.as_bytes())
        .await
        .map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::OK)
}

async fn list_files(Json(req): Json<ListFilesRequest>) -> Result<Json<ListFilesResult>, AgentError> {
    let base = resolve_path(&req.base_path)?;
    let mut entries = Vec::new();
    collect_entries(&base, req.glob.as_deref(), &mut entries)
        .await
        .map_err(|e| AgentError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    entries.sort_by(|a: &FileEntry, b: &FileEntry| b.modified_unix_ms.cmp(&a.modified_unix_ms));
    Ok(Json(ListFilesResult { entries }))
}

async fn collect_entries(dir: &Path, glob: Option<&str>, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(pattern) = glob {
            if !glob_match(pattern, &name) {
                continue;
            }
        }
        let modified_unix_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        out.push(FileEntry {
            path: entry.path().to_string_lossy().to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified_unix_ms,
        });
    }
    Ok(())
}

/// Minimal shell-style glob: `*` matches any run of characters, `?` matches
/// exactly one. No brace expansion or character classes.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn do_match(pattern: &[char], name: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], name) || (!name.is_empty() && do_match(pattern, &name[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => do_match(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    do_match(&pattern, &name)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let app = Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec))
        .route("/read", post(read_file))
        .route("/write", post(write_file))
        .route("/list", post(list_files));

    let addr = format!("0.0.0.0:{AGENT_PORT}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "failed to bind in-VM agent");
            std::process::exit(1);
        }
    };
    info!(addr, "in-VM agent listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "in-VM agent server error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_basic_wildcards() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(!glob_match("*.rs", "main.toml"));
        assert!(glob_match("file?.txt", "file1.txt"));
        assert!(!glob_match("file?.txt", "file10.txt"));
    }

    #[test]
    fn resolve_path_rejects_traversal() {
        assert!(resolve_path("../etc/passwd").is_err());
        assert!(resolve_path("/etc/passwd").is_err());
        assert!(resolve_path("src/main.rs").is_ok());
    }

    #[test]
    fn resolve_path_accepts_workspace_prefixed_paths() {
        assert_eq!(
            resolve_path("/workspace/hello.txt").unwrap(),
            PathBuf::from("/workspace/hello.txt")
        );
        assert_eq!(resolve_path("/workspace").unwrap(), PathBuf::from("/workspace"));
        assert!(resolve_path("/workspace/../etc/passwd").is_err());
    }
}
