//! Store backends: the contract transactions read from and commit into.

mod cached;
mod kv;
mod memory;

pub use cached::CachedStore;
pub use kv::KvStore;
pub use memory::MemoryStore;

pub(crate) use kv::{index_table_prefix, table_prefix};

use crate::error::{CoreError, CoreResult};
use crate::index::IndexDef;
use crate::key_range::KeyRange;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use stratadb_codec::Value;
use stratadb_storage::{BatchOp, KvEngine};
use tracing::warn;

/// Shared handle to a store backend.
pub type BackendHandle = Arc<dyn Backend>;

/// A deferred commit step, run after the root batch has been written.
///
/// Volatile backends commit through these (they have no batch entries for
/// the root engine), and cache wrappers use them for invalidation.
pub struct DeferredCommit(Box<dyn FnOnce() -> CoreResult<()> + Send>);

impl DeferredCommit {
    /// Wraps a closure as a deferred commit step.
    pub fn new(step: impl FnOnce() -> CoreResult<()> + Send + 'static) -> Self {
        Self(Box::new(step))
    }

    /// Consumes and runs the step.
    pub fn run(self) -> CoreResult<()> {
        (self.0)()
    }
}

impl std::fmt::Debug for DeferredCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeferredCommit")
    }
}

/// One backend's contribution to an atomic commit.
#[derive(Debug)]
pub enum BatchFragment {
    /// Opaque operations to write atomically against the root engine.
    Entries(Vec<BatchOp>),
    /// A step to execute after the batch has been durably written.
    Deferred(DeferredCommit),
}

/// The store contract consumed by transactions.
///
/// Backends expose ordered reads in the [`Value`] domain plus the commit
/// surface. All range results are ordered by unsigned lexicographic key
/// comparison, and `keys(range)` returns exactly those keys `k` where
/// `range` is absent or includes `k`.
///
/// # Implementors
///
/// - [`KvStore`] - persistent table over a shared root engine
/// - [`MemoryStore`] - volatile table
/// - [`CachedStore`] - LRU read-through wrapper over a [`KvStore`]
/// - [`Transaction`] - overlay, so transactions can nest
pub trait Backend: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> CoreResult<Option<Value>>;

    /// Returns the keys within `range`, ordered.
    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>>;

    /// Returns the values within `range`, in key order.
    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>>;

    /// Returns the smallest key within `range`.
    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>>;

    /// Returns the largest key within `range`.
    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>>;

    /// Returns the number of keys within `range`.
    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize>;

    /// Atomically applies a transaction's overlay.
    ///
    /// Returns `false` on conflict, in which case the backend is unchanged.
    fn commit(&self, tx: &Transaction) -> CoreResult<bool>;

    /// Discards a transaction's overlay and bookkeeping.
    fn abort(&self, tx: &Transaction) -> CoreResult<()>;

    /// Stages a transaction's overlay for a combined commit.
    ///
    /// Returns `None` when the transaction's captured old values no longer
    /// match backend state (a conflict). The caller is responsible for
    /// commit-lock serialisation and for applying the returned fragments.
    fn apply_combined(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>>;

    /// Clears the table and its index tables.
    fn truncate_store(&self) -> CoreResult<()>;

    /// Returns the index definitions on this store.
    fn index_defs(&self) -> Vec<IndexDef>;

    /// Returns a read view of the named index table.
    fn index_store(&self, name: &str) -> CoreResult<BackendHandle>;

    /// Id of the owning database instance; fences combined commits to
    /// sibling stores.
    fn database_id(&self) -> u64;

    /// The per-store commit serialisation lock, when this backend is a
    /// valid combined-commit target. `None` for overlays and read views.
    fn commit_mutex(&self) -> Option<&Mutex<()>>;
}

/// Applies staged fragments: batch entries first, in one atomic engine
/// write, then deferred steps in insertion order.
///
/// Returns `false` when a deferred step fails (the volatile backends'
/// steps are infallible in practice; a failure is logged and reported as
/// an unsuccessful commit rather than a panic or a mixed outcome).
pub(crate) fn run_fragments(
    engine: Option<&Arc<dyn KvEngine>>,
    fragments: Vec<BatchFragment>,
) -> CoreResult<bool> {
    let mut entries = Vec::new();
    let mut deferred = Vec::new();
    for fragment in fragments {
        match fragment {
            BatchFragment::Entries(ops) => entries.extend(ops),
            BatchFragment::Deferred(step) => deferred.push(step),
        }
    }

    if !entries.is_empty() {
        let engine = engine.ok_or_else(|| {
            CoreError::invalid_state("batch entries staged without a root engine")
        })?;
        engine.apply(&entries)?;
    }

    for step in deferred {
        if let Err(error) = step.run() {
            warn!(%error, "deferred commit step failed");
            return Ok(false);
        }
    }
    Ok(true)
}
