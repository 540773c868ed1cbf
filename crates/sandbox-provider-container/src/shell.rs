//! Runs `/bin/sh -c <command>` inside a container via `docker exec` and
//! collects stdout/stderr/exit-code, honoring a timeout the way the core's
//! `Exec` contract requires.
use std::time::{Duration, Instant};

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use sandbox_types::ExecResult;

pub async fn run(
    docker: &Docker,
    container_id: &str,
    command: &str,
    workdir: Option<&str>,
    timeout: Duration,
) -> anyhow::Result<ExecResult> {
    let start = Instant::now();
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh", "-c", command]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                working_dir: workdir,
                ..Default::default()
            },
        )
        .await?;

    let start_result = docker.start_exec(&exec.id, None).await?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    if let StartExecResults::Attached { mut output, .. } = start_result {
        let collect = async {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        stderr.push_str(&format!("\n[exec stream error: {e}]"));
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, collect).await.is_err() {
            return Ok(ExecResult::timed_out(
                stdout,
                stderr,
                start.elapsed().as_millis() as u64,
            ));
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    let exit_code = inspect.exit_code.unwrap_or(-1) as i32;

    Ok(ExecResult {
        stdout,
        stderr,
        exit_code,
        duration_ms: start.elapsed().as_millis() as u64,
        truncated: false,
    }
    .truncate_stdout())
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
