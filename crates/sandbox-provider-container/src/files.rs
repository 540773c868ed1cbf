//! Semantic file operations layered on top of `/bin/sh -c` execs: write via
//! base64 piping to dodge shell-escaping hazards, list via `find …
//! -printf` piped through `sort -rn`, binary detection via `file --mime-type`.
use std::time::Duration;

use base64::Engine;
use bollard::Docker;
use sandbox_types::{FileEntry, ListFilesRequest, ListFilesResult, ReadFileRequest, ReadFileResult, WriteFileRequest};

use crate::shell::{run, shell_quote};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn write_file(docker: &Docker, container_id: &str, req: &WriteFileRequest) -> anyhow::Result<()> {
    let path = shell_quote(&req.path);
    let encoded = base64::engine::general_purpose::STANDARD.encode(req.content.as_bytes());
    let command = format!(
        "mkdir -p $(dirname {path}) && printf '%s' {encoded} | base64 -d > {path}",
        path = path,
        encoded = shell_quote(&encoded),
    );
    let result = run(docker, container_id, &command, None, DEFAULT_TIMEOUT).await?;
    if result.exit_code != 0 {
        anyhow::bail!("write_file failed: {}", result.stderr);
    }
    Ok(())
}

pub async fn read_file(docker: &Docker, container_id: &str, req: &ReadFileRequest) -> anyhow::Result<ReadFileResult> {
    let path = shell_quote(&req.path);

    let is_dir = run(docker, container_id, &format!("test -d {path}"), None, DEFAULT_TIMEOUT)
        .await?
        .exit_code
        == 0;

    if is_dir {
        let listing = run(docker, container_id, &format!("ls -la {path}"), None, DEFAULT_TIMEOUT).await?;
        let total_lines = listing.stdout.lines().count() as u64;
        return Ok(ReadFileResult {
            content: listing.stdout,
            is_dir: true,
            total_lines,
            file_size: 0,
            is_binary: false,
        });
    }

    let size_result = run(docker, container_id, &format!("stat -c%s {path}"), None, DEFAULT_TIMEOUT).await?;
    let file_size: u64 = size_result.stdout.trim().parse().unwrap_or(0);

    let mime_result = run(
        docker,
        container_id,
        &format!("file --mime-type -b {path}"),
        None,
        DEFAULT_TIMEOUT,
    )
    .await?;
    let is_binary = !mime_result.stdout.trim().starts_with("text/");

    if is_binary {
        return Ok(ReadFileResult {
            content: String::new(),
            is_dir: false,
            total_lines: 0,
            file_size,
            is_binary: true,
        });
    }

    let total_lines_result = run(docker, container_id, &format!("wc -l < {path}"), None, DEFAULT_TIMEOUT).await?;
    let total_lines: u64 = total_lines_result.stdout.trim().parse().unwrap_or(0);

    let read_command = match (req.offset, req.limit) {
        (Some(offset), Some(limit)) => format!("tail -n +{offset} {path} | head -n {limit}"),
        (Some(offset), None) => format!("tail -n +{offset} {path}"),
        (None, Some(limit)) => format!("head -n {limit} {path}"),
        (None, None) => format!("cat {path}"),
    };
    let content_result = run(docker, container_id, &read_command, None, DEFAULT_TIMEOUT).await?;

    Ok(ReadFileResult {
        content: content_result.stdout,
        is_dir: false,
        total_lines,
        file_size,
        is_binary: false,
    })
}

pub async fn list_files(docker: &Docker, container_id: &str, req: &ListFilesRequest) -> anyhow::Result<ListFilesResult> {
    let base_path = shell_quote(&req.base_path);
    let name_filter = match &req.glob {
        Some(glob) => format!(" -name {}", shell_quote(glob)),
        None => String::new(),
    };
    let command = format!(
        "find {base_path}{name_filter} -printf '%T@ %y %s %p\\n' | sort -rn"
    );
    let result = run(docker, container_id, &command, None, DEFAULT_TIMEOUT).await?;

    let mut entries = Vec::new();
    for line in result.stdout.lines() {
        let mut parts = line.splitn(4, ' ');
        let (Some(modified), Some(kind), Some(size), Some(path)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let modified_unix_ms = modified
            .parse::<f64>()
            .map(|secs| (secs * 1000.0) as i64)
            .unwrap_or(0);
        entries.push(FileEntry {
            path: path.to_string(),
            is_dir: kind == "d",
            size: size.parse().unwrap_or(0),
            modified_unix_ms,
        });
    }
    Ok(ListFilesResult { entries })
}
