//! Database error types.
//!
//! Backend failures are logged once, where they happen, with the statement,
//! its values and a log id; the returned [`DbError::Database`] carries the
//! same log id so callers can correlate.

use miette::Diagnostic;
use thiserror::Error;

/// Database operation errors.
#[derive(Error, Diagnostic, Debug)]
pub enum DbError {
    #[error("Entity not found: {entity_type} with key '{key}'")]
    #[diagnostic(code(drive::db::not_found))]
    NotFound { entity_type: String, key: String },

    #[error("Not an entity: {message}")]
    #[diagnostic(
        code(drive::db::invalid_entity),
        help("entities must serialize to a JSON object matching their definition")
    )]
    InvalidEntity { message: String },

    #[error("Invalid data: {message}")]
    #[diagnostic(code(drive::db::invalid_data))]
    InvalidData { message: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(code(drive::db::configuration))]
    Configuration { message: String },

    #[error("Database error: {message} (log id: {log_id})")]
    #[diagnostic(code(drive::db::database_error))]
    Database { message: String, log_id: String },

    #[error("Connection error: {message}")]
    #[diagnostic(code(drive::db::connection_error))]
    Connection { message: String },

    #[error("Connector is not connected")]
    #[diagnostic(code(drive::db::not_connected), help("call init() or connect() first"))]
    NotConnected,

    #[error("Query timed out after {millis}ms")]
    #[diagnostic(code(drive::db::timeout))]
    Timeout { millis: u64 },

    #[error("Constraint violation: {message}")]
    #[diagnostic(code(drive::db::constraint))]
    Constraint { message: String },

    #[error("Invariant violated on {table}: {message}")]
    #[diagnostic(code(drive::db::invariant))]
    Invariant { table: String, message: String },

    #[error("Cannot initialize repository for {table}: {message}")]
    #[diagnostic(code(drive::db::repository_init))]
    RepositoryInit { table: String, message: String },
}

impl DbError {
    /// Shorthand for configuration/programmer errors.
    pub fn configuration(message: impl Into<String>) -> Self {
        DbError::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for malformed values flowing to or from the backend.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        DbError::InvalidData {
            message: message.into(),
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
