//! Engine error taxonomy
//!
//! Every fallible operation in the pipeline returns `EngineResult<T>`.
//! The error classes mirror how the caller is expected to react:
//! validation and policy errors are returned as-is, capacity errors carry
//! a retry hint, transient backend errors are retried with backoff, fatal
//! backend errors mark the subsystem unhealthy, and internal errors are
//! sanitized behind a correlation id.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the ingestion, correlation, and query engines
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad LQL, bad rule condition, unknown column.
    /// Recovered locally and returned to the caller with field detail.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        suggestions: Vec<String>,
    },

    /// Rate-limited, admission-denied, or buffer full.
    #[error("capacity error: {message}")]
    Capacity {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// A backend is unavailable or timing out. Retryable.
    #[error("{backend} backend unavailable: {message}")]
    BackendTransient {
        backend: &'static str,
        message: String,
    },

    /// Schema mismatch, auth failure. Not retried.
    #[error("{backend} backend failure: {message}")]
    BackendFatal {
        backend: &'static str,
        message: String,
    },

    /// Complexity or privacy violation. Never retried.
    #[error("policy violation: {message}")]
    Policy {
        message: String,
        violations: Vec<String>,
    },

    /// The query was cancelled cooperatively (deadline or explicit).
    #[error("query {query_id} cancelled")]
    Cancelled { query_id: Uuid },

    /// Invariant violation. The operation fails, the process continues.
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        message: String,
        correlation_id: Uuid,
    },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: None, suggestions: Vec::new() }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(self, suggestions: Vec<String>) -> Self {
        match self {
            Self::Validation { message, field, .. } => Self::Validation { message, field, suggestions },
            other => other,
        }
    }

    pub fn capacity(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::Capacity { message: message.into(), retry_after_secs }
    }

    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        Self::BackendTransient { backend, message: message.into() }
    }

    pub fn fatal(backend: &'static str, message: impl Into<String>) -> Self {
        Self::BackendFatal { backend, message: message.into() }
    }

    pub fn policy(message: impl Into<String>, violations: Vec<String>) -> Self {
        Self::Policy { message: message.into(), violations }
    }

    /// Internal errors get a correlation id so the sanitized message can be
    /// matched against the full log entry.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, "internal error: {}", message);
        Self::Internal { message, correlation_id }
    }

    /// Stable class name, surfaced to callers alongside the message
    pub fn class(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::Capacity { .. } => "CAPACITY",
            Self::BackendTransient { .. } => "BACKEND_TRANSIENT",
            Self::BackendFatal { .. } => "BACKEND_FATAL",
            Self::Policy { .. } => "POLICY",
            Self::Cancelled { .. } => "QUERY_CANCELLED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether a retry with backoff is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendTransient { .. })
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Capacity { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().is_some_and(|c| c.starts_with("28")) => {
                // 28xxx: invalid authorization
                Self::fatal("relational", err.to_string())
            }
            sqlx::Error::Database(db) if db.code().is_some_and(|c| c.starts_with("42")) => {
                // 42xxx: syntax error or access rule violation (schema mismatch)
                Self::fatal("relational", err.to_string())
            }
            sqlx::Error::RowNotFound => Self::validation("row not found"),
            _ => Self::transient("relational", err.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403) {
            Self::fatal("search", err.to_string())
        } else {
            Self::transient("search", err.to_string())
        }
    }
}

/// Result type alias used across the engines
pub type EngineResult<T> = Result<T, EngineError>;
