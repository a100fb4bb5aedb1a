use serde_json::{json, Value};
use thiserror::Error;

use crate::types::HitId;

/// Failures of the hit store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored hit could not be decoded: {0}")]
    Serialization(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors returned when dispatching work fails *before* execution begins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    #[error("webhook hit not found: {0}")]
    HitNotFound(HitId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure raised by a webhook handler.
///
/// `kind` plays the role of the error class and is persisted as
/// `job_response.class`; `code` carries a backend code such as a SQLSTATE.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub kind: String,
    pub code: Option<String>,
}

impl HandlerError {
    pub const ALREADY_APPLIED: &'static str = "AlreadyApplied";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Typed signal that the handler's side effect already happened on an
    /// earlier delivery.
    pub fn already_applied(message: impl Into<String>) -> Self {
        Self::new(Self::ALREADY_APPLIED, message)
    }

    pub fn is_already_applied(&self) -> bool {
        self.kind == Self::ALREADY_APPLIED
    }

    /// Shape persisted in `job_response` for a failed attempt.
    pub fn to_response(&self) -> Value {
        json!({
            "error": self.message,
            "class": self.kind,
            "code": self.code,
        })
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for HandlerError {
    fn from(err: tokio_postgres::Error) -> Self {
        let code = err.code().map(|state| state.code().to_string());
        let message = match err.as_db_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };
        Self {
            message,
            kind: "tokio_postgres::Error".to_string(),
            code,
        }
    }
}

/// Invalid startup configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("event '{event}' is bound to unknown handler '{handler}'")]
    UnknownHandler { event: String, handler: String },
}
