//! Maps [`CoreError`]'s semantic categories (spec §7) onto HTTP status
//! codes at the transport boundary. The core itself never thinks in
//! status codes; this is the thin shell's job alone.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sandbox_core::error::CoreError;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::SandboxNotFound(_) | CoreError::ProviderNotRegistered(_) => {
                StatusCode::NOT_FOUND
            }
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Precondition(_)
            | CoreError::SandboxPaused(_)
            | CoreError::CapabilityMissing(_)
            | CoreError::SnapshotNotSupported
            | CoreError::KvmUnavailable
            | CoreError::NotSupported(_)
            | CoreError::BridgeClosed => StatusCode::BAD_REQUEST,
            CoreError::ProviderUnhealthy(_, _)
            | CoreError::BackendUnreachable(_)
            | CoreError::BackendTransient(_)
            | CoreError::ImageUnavailable(_)
            | CoreError::PeerDisconnected => StatusCode::BAD_GATEWAY,
            CoreError::CallTimedOut => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
