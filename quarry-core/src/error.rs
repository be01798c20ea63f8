//! Error types for Quarry operations
//!
//! Every failure surfaced by the access layer is one [`QuarryError`] variant.
//! Callers dispatch on the variant (or on [`QuarryError::kind`]) instead of
//! downcasting. Each variant carries a human-readable message and, when the
//! failure originated in a client library, the underlying cause.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Underlying cause attached to a [`QuarryError`].
///
/// Shared so that errors stay `Clone` when they are fanned out to several
/// waiters (e.g. a failed warm-up reported per key).
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Discriminant of [`QuarryError`], useful for metrics labels and matching
/// without binding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Validation,
    Security,
    Cache,
    Replication,
    Config,
}

impl ErrorKind {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Security => "security",
            ErrorKind::Cache => "cache",
            ErrorKind::Replication => "replication",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Master error type for the access layer.
#[derive(Debug, Clone, Error)]
pub enum QuarryError {
    /// Establishing or using a database connection failed.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// A raw query exceeded its allotted time. The statement itself may still
    /// be running on the server.
    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Disallowed request shape (non-read raw statement, unknown entity,
    /// bad sort direction, ...).
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Input that looks like an injection attempt. The request is aborted
    /// before anything reaches the database.
    #[error("Security error: {message}")]
    Security {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Key-value store read or write failure.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Replica topology problem.
    #[error("Replication error: {message}")]
    Replication {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Configuration rejected at construction time.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },
}

impl QuarryError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
            source: None,
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    pub fn replication(message: impl Into<String>) -> Self {
        Self::Replication {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause, replacing any existing one.
    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let cause: ErrorCause = Arc::new(cause);
        match &mut self {
            QuarryError::Connection { source, .. }
            | QuarryError::Timeout { source, .. }
            | QuarryError::Validation { source, .. }
            | QuarryError::Security { source, .. }
            | QuarryError::Cache { source, .. }
            | QuarryError::Replication { source, .. }
            | QuarryError::Config { source, .. } => *source = Some(cause),
        }
        self
    }

    /// The variant discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuarryError::Connection { .. } => ErrorKind::Connection,
            QuarryError::Timeout { .. } => ErrorKind::Timeout,
            QuarryError::Validation { .. } => ErrorKind::Validation,
            QuarryError::Security { .. } => ErrorKind::Security,
            QuarryError::Cache { .. } => ErrorKind::Cache,
            QuarryError::Replication { .. } => ErrorKind::Replication,
            QuarryError::Config { .. } => ErrorKind::Config,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            QuarryError::Connection { message, .. }
            | QuarryError::Timeout { message, .. }
            | QuarryError::Validation { message, .. }
            | QuarryError::Security { message, .. }
            | QuarryError::Cache { message, .. }
            | QuarryError::Replication { message, .. }
            | QuarryError::Config { message, .. } => message,
        }
    }

    /// The attached cause, if any.
    pub fn cause(&self) -> Option<&ErrorCause> {
        match self {
            QuarryError::Connection { source, .. }
            | QuarryError::Timeout { source, .. }
            | QuarryError::Validation { source, .. }
            | QuarryError::Security { source, .. }
            | QuarryError::Cache { source, .. }
            | QuarryError::Replication { source, .. }
            | QuarryError::Config { source, .. } => source.as_ref(),
        }
    }
}

/// Result type alias for Quarry operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================
