//! Managed-provider connection settings, read once at construction the
//! same way the core's capacity knobs read their environment variables.
use std::time::Duration;

fn env_duration_secs(var: &str, default_secs: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

#[derive(Debug, Clone)]
pub struct ManagedConfig {
    pub control_base_url: String,
    pub api_key: String,
    pub domain: String,
    pub max_timeout: Duration,
}

impl ManagedConfig {
    pub fn from_env() -> Self {
        Self {
            control_base_url: std::env::var("SANDBOX_MANAGED_BASE_URL")
                .unwrap_or_else(|_| "https://api.managed-sandbox.invalid".to_string()),
            api_key: std::env::var("SANDBOX_MANAGED_API_KEY").unwrap_or_default(),
            domain: std::env::var("SANDBOX_MANAGED_DOMAIN")
                .unwrap_or_else(|_| "sandbox.invalid".to_string()),
            max_timeout: env_duration_secs("SANDBOX_MANAGED_MAX_TIMEOUT_SECS", 120),
        }
    }
}
