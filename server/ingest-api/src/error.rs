//! API error type and its HTTP mapping.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use grouping_engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Engine(#[from] EngineError),
  #[error("invalid or missing API key")]
  Unauthorized,
  #[error("rate limit exceeded")]
  RateLimited,
  #[error("{0}")]
  BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
  error: &'static str,
  message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  field: Option<String>,
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self {
    Self::BadRequest(rejection.body_text())
  }
}

impl From<QueryRejection> for ApiError {
  fn from(rejection: QueryRejection) -> Self {
    Self::BadRequest(rejection.body_text())
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, error, field) = match &self {
      ApiError::Engine(EngineError::Validation { field, .. }) => {
        (StatusCode::BAD_REQUEST, "validation", Some(field.clone()))
      }
      ApiError::Engine(EngineError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found", None),
      ApiError::Engine(EngineError::InvalidStateTransition { .. }) => {
        (StatusCode::CONFLICT, "invalid_transition", None)
      }
      ApiError::Engine(EngineError::Conflict(_)) => (StatusCode::CONFLICT, "conflict", None),
      ApiError::Engine(EngineError::Storage(_)) => (StatusCode::SERVICE_UNAVAILABLE, "storage", None),
      ApiError::Engine(EngineError::Json(_)) | ApiError::BadRequest(_) => {
        (StatusCode::BAD_REQUEST, "bad_request", None)
      }
      ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
      ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", None),
    };

    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }

    let message = match &self {
      ApiError::Engine(EngineError::Validation { reason, .. }) => reason.clone(),
      other => other.to_string(),
    };
    (status, Json(ErrorBody { error, message, field })).into_response()
  }
}
