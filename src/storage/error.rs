//! Storage error types.

use miette::Diagnostic;
use thiserror::Error;

/// Object storage errors.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    #[error("Object not found: {path}")]
    #[diagnostic(code(drive::storage::not_found))]
    NotFound { path: String },

    #[error("Invalid object path: {path}")]
    #[diagnostic(
        code(drive::storage::invalid_path),
        help("paths are relative and may not contain '..' segments")
    )]
    InvalidPath { path: String },

    #[error("I/O error on {path}: {source}")]
    #[diagnostic(code(drive::storage::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{backend} backend error: {message}")]
    #[diagnostic(code(drive::storage::backend))]
    Backend { backend: String, message: String },

    #[error("{operation} failed on every backend for {path}: {}", errors.join("; "))]
    #[diagnostic(code(drive::storage::all_backends_failed))]
    AllBackendsFailed {
        operation: String,
        path: String,
        errors: Vec<String>,
    },

    #[error("Encryption error: {message}")]
    #[diagnostic(code(drive::storage::encryption))]
    Encryption { message: String },

    #[error("Storage configuration error: {message}")]
    #[diagnostic(code(drive::storage::configuration))]
    Configuration { message: String },
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return StorageError::NotFound { path: path.into() };
        }
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
