use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kiln_core::KeepAliveError;
use kiln_runtime_api::RuntimeError;
use serde::Serialize;

/// Request failures, rendered in the OpenAI error shape by default.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("'{0}' not implemented")]
    NotImplemented(String),

    /// Output that should have matched the offered schema did not.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    #[error("client disconnected")]
    GenerationAborted,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::GenerationAborted => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ApiError::StructuralMismatch(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::ModelNotFound(_) => "model_not_found",
            ApiError::InvalidConfiguration(_) => "invalid_request_error",
            ApiError::NotImplemented(_) => "not_implemented",
            ApiError::StructuralMismatch(_) => "structural_mismatch",
            ApiError::GenerationAborted => "generation_aborted",
            ApiError::Internal(_) => "server_error",
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ModelNotFound(id) => ApiError::ModelNotFound(id),
            RuntimeError::InvalidConfiguration(msg) => ApiError::InvalidConfiguration(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<KeepAliveError> for ApiError {
    fn from(err: KeepAliveError) -> Self {
        ApiError::InvalidConfiguration(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

/// The same failures, rendered as Ollama's `{"error": "..."}`.
#[derive(Debug)]
pub struct OllamaError(pub ApiError);

impl<E> From<E> for OllamaError
where
    E: Into<ApiError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for OllamaError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.status().is_server_error() {
            tracing::error!("Request failed: {}", err);
        }
        (
            err.status(),
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response()
    }
}
