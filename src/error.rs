use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the versioning engine and its storage backends.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("parameter '{0}' must not be null or empty")]
    NullOrEmptyParameter(String),

    #[error("invalid {field}: {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("dependency violation: {0}")]
    Dependency(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VcsResult<T> = Result<T, VcsError>;

impl VcsError {
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        VcsError::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &str, name: impl Into<String>) -> Self {
        VcsError::AlreadyExists {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        VcsError::InvalidFormat {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VcsError::NotFound { .. })
    }
}

/// Reject empty or whitespace-only parameters.
pub fn require_non_empty(field: &str, value: &str) -> VcsResult<()> {
    if value.trim().is_empty() {
        return Err(VcsError::NullOrEmptyParameter(field.to_string()));
    }
    Ok(())
}

/// A primary result paired with the failures of best-effort side effects
/// that ran alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithWarnings<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> WithWarnings<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<String>) -> Self {
        Self { value, warnings }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WithWarnings<U> {
        WithWarnings {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}
