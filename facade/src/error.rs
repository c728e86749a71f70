use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use sandbox::SandboxError;

/// Wraps `sandbox::SandboxError` so it can implement `IntoResponse` here
/// without an orphan-rule violation. The mapping follows spec.md §7.
pub struct ApiError(pub SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::WrongState { .. } => StatusCode::CONFLICT,
            SandboxError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            SandboxError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SandboxError::ArtifactMissing(_)
            | SandboxError::VmmSpawn(_)
            | SandboxError::VmmProtocol(_)
            | SandboxError::VmmUnresponsive
            | SandboxError::Transport(_)
            | SandboxError::Protocol(_)
            | SandboxError::MessageTooLarge
            | SandboxError::GuestError(_)
            | SandboxError::DiskFull
            | SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
