//! Error taxonomy.
//!
//! Mirrors the propagation policy of the turn algorithm: validation and
//! tool-runtime errors are recovered locally into a tool-result message
//! and never reach here; LLM, storage, and cancellation errors end a
//! turn; config errors are fatal at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("navigation to port 80 is not permitted")]
    Port80,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ToolRuntimeError {
    #[error("command exited with status {0}")]
    NonZeroExit(i32),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("cancelled")]
pub struct CancellationError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("slug '{0}' is already in use among these siblings")]
    SlugConflict(String),
    #[error("not found")]
    NotFound,
    #[error("sequence id conflict for conversation {0}")]
    SequenceConflict(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("two migrations both declare version {0}")]
    DuplicateMigrationVersion(i64),
    #[error("invalid database path: {0}")]
    InvalidDsn(String),
    #[error("{0}")]
    Other(String),
}

/// Unifies the taxonomy for call sites (e.g. HTTP handlers) that need a
/// single error type.
#[derive(Debug, Error)]
pub enum ShelleyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    ToolRuntime(#[from] ToolRuntimeError),
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ShelleyError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ShelleyError::Validation(_) => StatusCode::BAD_REQUEST,
            ShelleyError::Storage(StorageError::NotFound) => StatusCode::NOT_FOUND,
            ShelleyError::Storage(StorageError::SlugConflict(_)) => StatusCode::CONFLICT,
            ShelleyError::ToolRuntime(_)
            | ShelleyError::Llm(_)
            | ShelleyError::Cancellation(_)
            | ShelleyError::Storage(_)
            | ShelleyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for ShelleyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(crate::api::types::ErrorResponse::new(self.to_string()));
        (status, body).into_response()
    }
}
