//! Error types for RevStore
//!
//! Every public operation resolves to a value or exactly one classified
//! [`Error`]. Per-document failures inside a bulk write are reported through
//! [`ErrorKind`] in the result slot instead.

use serde::{Deserialize, Serialize};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classified name given to uniqueness / constraint failures of the backing store.
pub const CONSTRAINT_VIOLATION: &str = "ConstraintViolation";

/// Errors that can occur in store operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing: {0}")]
    MissingDocument(String),

    #[error("deleted: {0}")]
    DocumentDeleted(String),

    #[error("Document update conflict: {0}")]
    RevisionConflict(String),

    #[error("unknown stub attachment with digest {0}")]
    MissingStub(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Backing store error ({name}): {message}")]
    BackingStore { name: String, message: String },

    #[error("Change feed stopped by filter: {0}")]
    FeedStopped(String),
}

/// Error discriminator reported in bulk-write result slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingDocument,
    DocumentDeleted,
    RevisionConflict,
    MissingAttachmentStub,
    MalformedDocument,
    BackingStoreError,
    FeedStopped,
}

impl Error {
    /// Build a backing-store error with an explicit classified name.
    pub fn backing_store(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BackingStore {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingDocument(_) => ErrorKind::MissingDocument,
            Error::DocumentDeleted(_) => ErrorKind::DocumentDeleted,
            Error::RevisionConflict(_) => ErrorKind::RevisionConflict,
            Error::MissingStub(_) => ErrorKind::MissingAttachmentStub,
            Error::MalformedDocument(_) => ErrorKind::MalformedDocument,
            Error::BackingStore { .. } => ErrorKind::BackingStoreError,
            Error::FeedStopped(_) => ErrorKind::FeedStopped,
        }
    }

    /// True when the backing store rejected a statement because of a
    /// uniqueness or other constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::BackingStore { name, .. } if name == CONSTRAINT_VIOLATION)
    }

    /// Human readable reason without the kind prefix.
    pub fn reason(&self) -> String {
        match self {
            Error::MissingDocument(r)
            | Error::DocumentDeleted(r)
            | Error::RevisionConflict(r)
            | Error::MissingStub(r)
            | Error::MalformedDocument(r)
            | Error::FeedStopped(r) => r.clone(),
            Error::BackingStore { message, .. } => message.clone(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        let name = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                rusqlite::ErrorCode::ConstraintViolation => CONSTRAINT_VIOLATION.to_string(),
                code => format!("{:?}", code),
            },
            rusqlite::Error::QueryReturnedNoRows => "QueryReturnedNoRows".to_string(),
            rusqlite::Error::InvalidColumnType(..) => "InvalidColumnType".to_string(),
            rusqlite::Error::InvalidParameterCount(..) => "InvalidParameterCount".to_string(),
            _ => "SqliteError".to_string(),
        };
        tracing::error!("SQLite threw an error ({}): {}", name, err);
        Error::BackingStore {
            name,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BackingStore {
            name: "SerializationError".to_string(),
            message: err.to_string(),
        }
    }
}
