//! Error taxonomy for the session, ingestion and execution layers.
//!
//! Every fallible library operation returns [`Result`]. The HTTP layer maps
//! [`Error::kind`] onto its JSON error contract; the CLI wraps these in
//! `anyhow` like every other binary-level error.

use thiserror::Error;

/// Library error.
#[derive(Debug, Error)]
pub enum Error {
    /// A session identity does not resolve in durable storage.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// The session exists but holds no table with raw data.
    #[error("no data uploaded for this session, upload a spreadsheet first")]
    NoDataUploaded,

    #[error("{file}: unsupported file format '{extension}' (allowed: {allowed})")]
    UnsupportedFileFormat {
        file: String,
        extension: String,
        allowed: String,
    },

    #[error("{file}: file size {size} bytes exceeds the limit of {limit} bytes")]
    FileTooLarge { file: String, size: u64, limit: u64 },

    #[error("{file}: failed to parse spreadsheet: {reason}")]
    ParseFailure { file: String, reason: String },

    /// A table was handed to the namespace without an originating file name.
    #[error("table '{0}' has no originating file name")]
    MissingFileContext(String),

    /// The code generation oracle failed (transport, quota, bad response).
    #[error("code generation failed: {0}")]
    CodeGeneration(String),

    /// A generated fragment failed to run or did not bind its output.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_) => "session_not_found",
            Error::NoDataUploaded => "no_data_uploaded",
            Error::UnsupportedFileFormat { .. } => "unsupported_file_format",
            Error::FileTooLarge { .. } => "file_too_large",
            Error::ParseFailure { .. } => "parse_failure",
            Error::MissingFileContext(_) => "missing_file_context",
            Error::CodeGeneration(_) => "code_generation_failed",
            Error::Execution(_) => "execution_failed",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// Whether the error belongs to a single file of an upload batch.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFileFormat { .. }
                | Error::FileTooLarge { .. }
                | Error::ParseFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
