//! Structured error types for the grouping engine.

use thiserror::Error;

use crate::types::GroupStatus;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("invalid status transition: {from} -> {to}")]
  InvalidStateTransition { from: GroupStatus, to: GroupStatus },

  #[error("{entity} {id} not found")]
  NotFound { entity: &'static str, id: i64 },

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("storage: {0}")]
  Storage(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn not_found(entity: &'static str, id: i64) -> Self {
    Self::NotFound { entity, id }
  }

  pub fn conflict(msg: impl Into<String>) -> Self {
    Self::Conflict(msg.into())
  }

  pub fn storage(msg: impl Into<String>) -> Self {
    Self::Storage(msg.into())
  }
}

/// Lock poisoning means a writer panicked mid-update; treat the slot as unavailable.
impl<T> From<std::sync::PoisonError<T>> for EngineError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    Self::Storage("lock poisoned".into())
  }
}
