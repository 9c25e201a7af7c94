//! Error types for mnemo-core

use thiserror::Error;

/// Result type alias using mnemo-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mnemo-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Zip archive error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Tenant name failed the allow-listed identifier syntax
    #[error("Invalid tenant name: {0:?}")]
    InvalidTenantName(String),

    /// Namespace already exists or is missing
    #[error("Namespace error: {0}")]
    Namespace(String),

    /// A malformed wire row or document
    #[error("Invalid sync payload: {0}")]
    InvalidPayload(String),

    /// Client requested the experimental scheduler, which is not supported
    #[error("The experimental scheduler is not supported by this server")]
    UnsupportedScheduler,

    /// A single write violated a data invariant and was rejected
    #[error("Invalid card state: {0}")]
    InvalidCard(String),

    /// Uploaded snapshot or media archive failed its integrity verification
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}
