//! Error types for bodega-core

use thiserror::Error;

/// Result type alias using bodega-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in bodega-core operations
///
/// Remote transport failures are deliberately not represented here; they are
/// carried by [`crate::remote::RemoteError`] so the sync layer can retry them
/// without surfacing a hard failure to callers.
#[derive(Error, Debug)]
pub enum Error {
    /// Invariant violated before any write; rejected synchronously, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local durable-store failure; surfaced to the caller, not auto-retried
    #[error("Storage error: {0}")]
    Storage(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
