//! REST-backed managed-sandbox `Provider`: two-plane auth, no snapshot
//! capability, and its own usage accounting.
pub mod client;
pub mod config;
pub mod provider;

pub use config::ManagedConfig;
pub use provider::ManagedProvider;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use sandbox_core::provider::Provider;
    use sandbox_types::CreateRequest;

    #[tokio::test]
    async fn create_reads_sandbox_id_and_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sandbox_id": "sbx-1",
                "access_token": "tok-1",
                "port": 8080,
            })))
            .mount(&server)
            .await;

        let config = ManagedConfig {
            control_base_url: server.uri(),
            api_key: "test-key".to_string(),
            domain: "example.invalid".to_string(),
            max_timeout: Duration::from_secs(5),
        };
        let provider = ManagedProvider::new(config).unwrap();
        let id = provider.create(CreateRequest::default()).await.unwrap();
        assert_eq!(id, "sbx-1");
    }

    #[tokio::test]
    async fn snapshot_is_never_supported() {
        let server = MockServer::start().await;
        let config = ManagedConfig {
            control_base_url: server.uri(),
            api_key: "test-key".to_string(),
            domain: "example.invalid".to_string(),
            max_timeout: Duration::from_secs(5),
        };
        let provider = ManagedProvider::new(config).unwrap();
        let err = provider.snapshot("anything").await.unwrap_err();
        assert!(matches!(err, sandbox_core::error::CoreError::SnapshotNotSupported));
    }

    #[tokio::test]
    async fn destroy_of_unknown_sandbox_still_calls_control_plane() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = ManagedConfig {
            control_base_url: server.uri(),
            api_key: "test-key".to_string(),
            domain: "example.invalid".to_string(),
            max_timeout: Duration::from_secs(5),
        };
        let provider = ManagedProvider::new(config).unwrap();
        provider.destroy("ghost").await.unwrap();
    }
}
