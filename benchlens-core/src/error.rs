//! Error types for benchlens-core

use thiserror::Error;

/// Main error type for the benchlens-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (unknown entity type, bad column mapping, unreadable config)
    #[error("configuration error: {0}")]
    Config(String),

    /// No baseline or aggregate exists for the requested entity/type
    #[error("{what} not found: {key}")]
    DataNotFound { what: &'static str, key: String },

    /// Insight candidate failed validation
    #[error("invalid insight {title:?}: {reason}")]
    Validation { title: String, reason: String },

    /// Insight text collaborator failed or returned unusable output
    #[error("LLM error: {0}")]
    Llm(String),

    /// Store-level failure that is not a plain SQL error
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An output record would violate its own bookkeeping
    #[error("record invariant violated: {0}")]
    Invariant(String),
}

/// Coarse classification of an [`Error`], used in batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DataNotFound,
    Validation,
    ExternalCollaborator,
    Persistence,
    /// A bug in record assembly, never skipped over
    Invariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DataNotFound => "data_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::ExternalCollaborator => "external_collaborator",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Invariant => "invariant",
        }
    }
}

impl Error {
    /// Map this error onto the pipeline's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::DataNotFound { .. } => ErrorKind::DataNotFound,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Invariant(_) => ErrorKind::Invariant,
            Error::Llm(_) => ErrorKind::ExternalCollaborator,
            Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Persistence(_) => {
                ErrorKind::Persistence
            }
        }
    }

    /// Whether the pipeline may continue past this error for the current entity.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DataNotFound | ErrorKind::Validation | ErrorKind::ExternalCollaborator
        )
    }
}

/// Result type alias for benchlens-core
pub type Result<T> = std::result::Result<T, Error>;
