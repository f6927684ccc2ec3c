//! Error types for StrataDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
///
/// Transaction conflicts are deliberately **not** represented here: a
/// conflicting commit is an expected outcome and reports as `Ok(false)`
/// from `commit`, with the transaction left in the conflicted state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] stratadb_storage::StorageError),

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] stratadb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted in a state that does not permit it.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the state violation.
        message: String,
    },

    /// An argument is not acceptable for the operation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// Index creation was attempted through a transaction.
    #[error("schema changes are not allowed on a transaction")]
    SchemaChangeInTransaction,

    /// A schema change was attempted after the database connected.
    #[error("schema change after connect: {message}")]
    SchemaChangeWhileConnected {
        /// Description of the rejected change.
        message: String,
    },

    /// The transaction watchdog fired and the transaction was aborted.
    #[error("transaction {id} exceeded its deadline and was aborted")]
    WatchdogTimeout {
        /// Id of the aborted transaction.
        id: u64,
    },

    /// Another handle holds the database directory lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// The database handle has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Object store not found.
    #[error("object store not found: {name}")]
    StoreNotFound {
        /// Name of the missing store.
        name: String,
    },

    /// Index not found.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name of the missing index.
        name: String,
    },

    /// A staged write violates a unique index.
    #[error("unique constraint violated on index {index} for key {key:?}")]
    UniqueConstraint {
        /// Name of the violated index.
        index: String,
        /// The index key that is already mapped to another primary key.
        key: String,
    },
}

impl CoreError {
    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a schema-change-while-connected error.
    pub fn schema_change_while_connected(message: impl Into<String>) -> Self {
        Self::SchemaChangeWhileConnected {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a store-not-found error.
    pub fn store_not_found(name: impl Into<String>) -> Self {
        Self::StoreNotFound { name: name.into() }
    }

    /// Creates an index-not-found error.
    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::IndexNotFound { name: name.into() }
    }

    /// Creates a unique constraint error.
    pub fn unique_constraint(index: impl Into<String>, key: impl Into<String>) -> Self {
        Self::UniqueConstraint {
            index: index.into(),
            key: key.into(),
        }
    }
}
