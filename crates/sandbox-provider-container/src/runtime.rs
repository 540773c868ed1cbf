//! One-time detection of the host's user-mode kernel runtime (gVisor's
//! `runsc`). Falls back to Docker's default runtime with a degraded-isolation
//! warning rather than failing outright — capability descriptors still
//! report as if the sandboxed runtime were present.
use bollard::Docker;
use tracing::warn;

const USER_KERNEL_RUNTIME: &str = "runsc";

pub async fn detect_runtime(docker: &Docker) -> Option<String> {
    match docker.info().await {
        Ok(info) => {
            let has_runtime = info
                .runtimes
                .as_ref()
                .map(|runtimes| runtimes.contains_key(USER_KERNEL_RUNTIME))
                .unwrap_or(false);
            if has_runtime {
                Some(USER_KERNEL_RUNTIME.to_string())
            } else {
                warn!("runsc runtime not registered with the Docker daemon, falling back to the default runtime (degraded isolation)");
                None
            }
        }
        Err(e) => {
            warn!(error = %e, "could not query Docker daemon for runtimes, falling back to the default runtime (degraded isolation)");
            None
        }
    }
}
