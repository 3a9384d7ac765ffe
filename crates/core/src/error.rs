//! Error types for dvu-core
//!
//! A single error enum is shared by every crate in the workspace. Variants are
//! split between fatal conditions (bad configuration, bad credentials, a
//! dataset that stays locked) and per-resource failures that only affect one
//! file.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while uploading to a repository
#[derive(Debug, Error)]
pub enum Error {
    /// Credential rejected by the server (HTTP 401)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection-level or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-success status code
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// Local filesystem problem with a single resource
    #[error("Resource error: {0}")]
    Resource(String),

    /// Repository rejected or could not process an upload
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Server does not support the requested operation
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Target dataset stayed locked beyond the wait ceiling
    #[error("Dataset locked: {0}")]
    DatasetLocked(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Run interrupted by the operator
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    /// Whether this error must abort the whole run.
    ///
    /// Everything else is scoped to the resource being processed and is
    /// recorded as a failed outcome for that resource.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_)
                | Error::DatasetLocked(_)
                | Error::Validation(_)
                | Error::Config(_)
                | Error::Cancelled
        )
    }

    /// Process exit code reported when this error ends a run
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::Config(_) => 2,
            Error::Network(_) => 3,
            Error::Auth(_) => 4,
            Error::NotFound(_) => 5,
            Error::DatasetLocked(_) => 6,
            Error::Cancelled => 130,
            _ => 1,
        }
    }

    /// HTTP status code carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Auth(_) => Some(401),
            _ => None,
        }
    }
}
