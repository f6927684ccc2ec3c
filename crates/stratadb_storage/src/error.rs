//! Error types for the storage engines.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage engine operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The commit log is corrupted or invalid.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Byte offset of the corrupt record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },
}

impl StorageError {
    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }
}
