// ABOUTME: HTTP error mapping for sandbox engine failures
// ABOUTME: Every failure becomes a JSON body with a stable kind and a status chosen by that kind

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use shellbox_sandbox::SandboxError;
use tracing::error;

#[derive(Debug)]
pub struct ApiError(pub SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SandboxError::MalformedEnvironmentFile { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SandboxError::ContainerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SandboxError::BuildFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SandboxError::UnknownTask(_) => StatusCode::NOT_FOUND,
            SandboxError::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SandboxError::KillFailed { .. } => StatusCode::CONFLICT,
            SandboxError::InvalidPath(_)
            | SandboxError::InvalidRequest(_)
            | SandboxError::Json(_) => StatusCode::BAD_REQUEST,
            SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "Tool call failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
