//! Capacity knobs, each overridable via an environment variable. Read once
//! at startup the way the original manager's `main.rs` reads
//! `MANAGER_BIND`/`MANAGER_IMAGE_ROOT` — a plain `std::env::var` lookup with
//! a literal default, not a config-file layer.
use std::time::Duration;

fn env_duration_secs(var: &str, default_secs: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_usize(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub max_concurrent: usize,
    pub alert_threshold: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: env_duration_secs("SANDBOX_CLEANUP_INTERVAL_SECS", 3600),
            max_concurrent: env_usize("SANDBOX_MAX_CONCURRENT_CLEANUPS", 10),
            alert_threshold: env_f64("SANDBOX_CLEANUP_ALERT_THRESHOLD", 0.8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpBackoffConfig {
    pub crash_window: Duration,
    pub crash_loop_threshold: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub auto_restart_delay: Duration,
    pub graceful_stop_timeout: Duration,
    pub manual_restart_timeout: Duration,
    pub crash_monitor_tick: Duration,
}

impl Default for McpBackoffConfig {
    fn default() -> Self {
        Self {
            crash_window: env_duration_secs("SANDBOX_MCP_CRASH_WINDOW_SECS", 60),
            crash_loop_threshold: env_usize("SANDBOX_MCP_CRASH_LOOP_THRESHOLD", 3),
            initial_backoff: env_duration_secs("SANDBOX_MCP_INITIAL_BACKOFF_SECS", 5),
            max_backoff: env_duration_secs("SANDBOX_MCP_MAX_BACKOFF_SECS", 300),
            backoff_multiplier: env_f64("SANDBOX_MCP_BACKOFF_MULTIPLIER", 3.0),
            auto_restart_delay: env_duration_secs("SANDBOX_MCP_AUTO_RESTART_DELAY_SECS", 5),
            graceful_stop_timeout: env_duration_secs("SANDBOX_MCP_GRACEFUL_STOP_SECS", 30),
            manual_restart_timeout: env_duration_secs("SANDBOX_MCP_MANUAL_RESTART_SECS", 10),
            crash_monitor_tick: env_duration_secs("SANDBOX_MCP_CRASH_MONITOR_TICK_SECS", 5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: env_duration_secs("SANDBOX_HEALTH_CHECK_INTERVAL_SECS", 30),
            health_check_timeout: env_duration_secs("SANDBOX_HEALTH_CHECK_TIMEOUT_SECS", 5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub setup_command_timeout: Duration,
    pub default_ttl: Duration,
    pub max_concurrent_workspaces: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            setup_command_timeout: env_duration_secs("SANDBOX_SETUP_COMMAND_TIMEOUT_SECS", 300),
            default_ttl: env_duration_secs("SANDBOX_DEFAULT_TTL_SECS", 30 * 24 * 3600),
            max_concurrent_workspaces: env_usize("SANDBOX_MAX_CONCURRENT_WORKSPACES", 10),
        }
    }
}
