//! Store errors.

use std::path::PathBuf;

use smartheat_types::RecordStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a queue operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SQLite: {0}")]
    Database(#[from] rusqlite::Error),

    /// The directory holding the database file could not be created.
    #[error("Cannot create {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A record with the same `(mac, timestamp, kind)` already exists.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// No record matches the key.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The record already left the `New` state.
    #[error("Record {key} is already {status}")]
    NotPending { key: String, status: RecordStatus },

    /// Timestamp outside the representable range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl Error {
    /// Whether the error is a unique-key violation.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate(_))
    }
}
