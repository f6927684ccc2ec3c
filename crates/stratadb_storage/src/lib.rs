//! # StrataDB Storage
//!
//! Ordered key/value engines for StrataDB.
//!
//! This crate provides the lowest-level storage abstraction: an **ordered
//! byte-keyed map** with atomic batch application. Engines do not interpret
//! keys or values - table namespacing, codecs, and transactions all live in
//! `stratadb_core`.
//!
//! ## Design Principles
//!
//! - Engines are ordered maps (get, scan, first/last, count, batch apply)
//! - Ordering is unsigned lexicographic comparison of key bytes
//! - A batch applies atomically: all of its operations or none
//! - Engines must be `Send + Sync` for concurrent access
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - Volatile, for testing and ephemeral tables
//! - [`LogEngine`] - Persistent, backed by an append-only commit log
//!
//! ## Example
//!
//! ```rust
//! use stratadb_storage::{BatchOp, KvEngine, MemoryEngine};
//! use std::ops::Bound;
//!
//! let engine = MemoryEngine::new();
//! engine
//!     .apply(&[BatchOp::put(b"a".to_vec(), b"1".to_vec())])
//!     .unwrap();
//! assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
//! assert_eq!(
//!     engine.scan_keys(Bound::Unbounded, Bound::Unbounded).unwrap(),
//!     vec![b"a".to_vec()]
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod log;
mod memory;

pub use engine::{prefix_upper_bound, BatchOp, KvEngine};
pub use error::{StorageError, StorageResult};
pub use log::{LogEngine, LogEngineConfig};
pub use memory::MemoryEngine;
