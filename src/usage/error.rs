//! Error types for the usage store
//!
//! Structured errors for the durable quota-counter database, kept separate
//! from the crate error so storage call sites stay precise, with a
//! conversion into the crate error for propagation out of the tracker.

use crate::error::Error as CrateError;
use thiserror::Error;

/// Error type for usage-store operations
#[derive(Debug, Error)]
pub enum DbError {
    /// LibSQL error
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// SQL query error
    #[error("SQL query error: {0}")]
    Query(String),

    /// Schema error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Data error
    #[error("Data error: {0}")]
    Data(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<DbError> for CrateError {
    fn from(err: DbError) -> Self {
        CrateError::Database(err.to_string())
    }
}
