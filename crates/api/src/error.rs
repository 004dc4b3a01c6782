//! Mapping of engine errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Malformed query string or path parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A request body that is present but does not decode.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Engine(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Engine(EngineError::InvalidState(_)) => StatusCode::CONFLICT,
            Self::Engine(EngineError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Engine(EngineError::Database(_) | EngineError::Corrupt(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
