//! # StrataDB Core
//!
//! A transactional object-store layer over ordered key/value engines.
//!
//! This crate provides:
//! - Named tables ([`ObjectStore`]) sharing one root engine per database
//! - Snapshot-overlay [`Transaction`]s with ordered range queries
//! - Secondary indices maintained transactionally ([`IndexView`])
//! - Atomic cross-store commits ([`Database::commit_combined`])
//! - A schema-versioned [`Database`] façade with an upgrade protocol
//!
//! ## Reading through an overlay
//!
//! A transaction answers reads by consulting its staged removals, then its
//! staged writes, then its truncation flag, and only then the backend.
//! Range queries (`keys`, `values`, `min_key`, `max_key`, `count`) merge
//! the overlay with the backend under unsigned lexicographic key order.
//!
//! ## Commit model
//!
//! Writes stage in the overlay only; the backend changes at commit, when
//! the whole overlay (primary and index state together) flattens into one
//! atomic apply. A commit conflicts - returning `false`, not an error -
//! when a captured old value no longer matches backend state. Commits are
//! serialised per store; combined commits batch several sibling
//! transactions into one root engine write with an all-or-nothing outcome.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod database;
mod dir;
mod error;
mod index;
mod key_range;
mod object_store;
mod transaction;
mod watchdog;

pub use backend::{
    Backend, BackendHandle, BatchFragment, CachedStore, DeferredCommit, KvStore, MemoryStore,
};
pub use database::{Database, DatabaseConfig, DeleteStoreOptions};
pub use error::{CoreError, CoreResult};
pub use index::{IndexDef, IndexOptions, IndexView};
pub use key_range::KeyRange;
pub use object_store::{KeyEncoding, ObjectStore, StoreOptions, UpgradeCondition};
pub use transaction::{Transaction, TransactionState};
pub use watchdog::DEFAULT_TRANSACTION_TIMEOUT;

pub use stratadb_codec::{BinaryCodec, Codec, CodecError, KeyPath, Value};
pub use stratadb_storage::{
    BatchOp, KvEngine, LogEngine, LogEngineConfig, MemoryEngine, StorageError,
};
