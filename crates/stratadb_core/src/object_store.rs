//! Per-table façade: transaction issuance and commit serialisation.

use crate::backend::{Backend, BackendHandle, CachedStore, KvStore, MemoryStore};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDef, IndexOptions};
use crate::key_range::KeyRange;
use crate::transaction::{Transaction, TransactionInner};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stratadb_codec::{BinaryCodec, Codec, KeyPath, Value};
use stratadb_storage::KvEngine;

/// How keys are validated on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyEncoding {
    /// Keys must be ASCII (the default; matches the persisted layout).
    #[default]
    Ascii,
    /// Any UTF-8 string is accepted.
    Utf8,
}

/// Condition deciding whether a store's data is dropped during an
/// upgrade, given the previously stored schema version.
pub type UpgradeCondition = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Options accepted when creating an object store.
#[derive(Clone)]
pub struct StoreOptions {
    codec: Arc<dyn Codec>,
    persistent: bool,
    key_encoding: KeyEncoding,
    enable_lru_cache: bool,
    lru_cache_size: usize,
    raw_lru_cache_size: usize,
    upgrade_condition: Option<UpgradeCondition>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(BinaryCodec),
            persistent: true,
            key_encoding: KeyEncoding::Ascii,
            enable_lru_cache: false,
            lru_cache_size: 512,
            raw_lru_cache_size: 1024,
            upgrade_condition: None,
        }
    }
}

impl StoreOptions {
    /// Creates options with defaults: persistent, binary codec, ASCII
    /// keys, no cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets whether the table lives on the root engine (true) or in
    /// memory (false).
    #[must_use]
    pub const fn persistent(mut self, value: bool) -> Self {
        self.persistent = value;
        self
    }

    /// Sets the key validation mode.
    #[must_use]
    pub const fn key_encoding(mut self, encoding: KeyEncoding) -> Self {
        self.key_encoding = encoding;
        self
    }

    /// Enables the LRU read cache (persistent stores only).
    #[must_use]
    pub const fn enable_lru_cache(mut self, value: bool) -> Self {
        self.enable_lru_cache = value;
        self
    }

    /// Sets the decoded-value cache capacity.
    #[must_use]
    pub const fn lru_cache_size(mut self, capacity: usize) -> Self {
        self.lru_cache_size = capacity;
        self
    }

    /// Sets the raw-bytes cache capacity.
    #[must_use]
    pub const fn raw_lru_cache_size(mut self, capacity: usize) -> Self {
        self.raw_lru_cache_size = capacity;
        self
    }

    /// Drops the store's existing data during an upgrade when the
    /// condition holds for the old version.
    #[must_use]
    pub fn upgrade_condition(mut self, condition: impl Fn(u32) -> bool + Send + Sync + 'static) -> Self {
        self.upgrade_condition = Some(Arc::new(condition));
        self
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("persistent", &self.persistent)
            .field("key_encoding", &self.key_encoding)
            .field("enable_lru_cache", &self.enable_lru_cache)
            .field("lru_cache_size", &self.lru_cache_size)
            .field("raw_lru_cache_size", &self.raw_lru_cache_size)
            .field("has_upgrade_condition", &self.upgrade_condition.is_some())
            .finish_non_exhaustive()
    }
}

/// A named table: spawns transactions, serialises their commits, and
/// exposes the read API directly against the backend.
///
/// Schema (index declarations) is fixed once the owning database
/// connects. The store tracks its open transactions weakly, purely for
/// bookkeeping - dropping a transaction handle abandons its overlay.
pub struct ObjectStore {
    name: String,
    options: StoreOptions,
    indices: RwLock<Vec<IndexDef>>,
    backend: RwLock<Option<BackendHandle>>,
    open_txns: Mutex<Vec<Weak<TransactionInner>>>,
    ids: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl ObjectStore {
    pub(crate) fn new(
        name: String,
        options: StoreOptions,
        ids: Arc<AtomicU64>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name,
            options,
            indices: RwLock::new(Vec::new()),
            backend: RwLock::new(None),
            open_txns: Mutex::new(Vec::new()),
            ids,
            timeout,
        }
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a secondary index. Only valid before the database
    /// connects.
    pub fn create_index(
        &self,
        name: &str,
        key_path: KeyPath,
        options: IndexOptions,
    ) -> CoreResult<()> {
        if self.backend.read().is_some() {
            return Err(CoreError::schema_change_while_connected(format!(
                "cannot create index {name:?} on connected store {:?}",
                self.name
            )));
        }
        validate_schema_name(name, "index")?;
        let mut indices = self.indices.write();
        if indices.iter().any(|def| def.name == name) {
            return Err(CoreError::invalid_argument(format!(
                "index {name:?} already exists on store {:?}",
                self.name
            )));
        }
        indices.push(options.into_def(name.to_string(), key_path));
        Ok(())
    }

    /// Names of the declared indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indices.read().iter().map(|def| def.name.clone()).collect()
    }

    /// Opens a transaction with the configured watchdog deadline.
    pub fn transaction(&self) -> CoreResult<Transaction> {
        self.spawn(self.timeout)
    }

    /// Opens a transaction with the watchdog disarmed, for short-lived
    /// work consumed synchronously by its caller.
    pub fn synchronous_transaction(&self) -> CoreResult<Transaction> {
        self.spawn(None)
    }

    fn spawn(&self, timeout: Option<Duration>) -> CoreResult<Transaction> {
        let backend = self.backend_handle()?;
        let id = self.ids.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction::new(
            id,
            Arc::clone(&backend),
            backend,
            timeout,
            Arc::clone(&self.ids),
            self.options.key_encoding,
        );

        let mut open = self.open_txns.lock();
        open.retain(|weak| weak.strong_count() > 0);
        open.push(tx.downgrade());
        Ok(tx)
    }

    /// Number of open transactions still referenced by callers.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        let mut open = self.open_txns.lock();
        open.retain(|weak| weak.strong_count() > 0);
        open.len()
    }

    // === Read API (reads the backend directly) ===

    /// Reads the committed value under `key`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.backend_handle()?.get(key)
    }

    /// Returns the committed keys within `range`, ordered.
    pub fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        self.backend_handle()?.keys(range)
    }

    /// Returns the committed values within `range`, in key order.
    pub fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        self.backend_handle()?.values(range)
    }

    /// Returns the smallest committed key within `range`.
    pub fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.backend_handle()?.min_key(range)
    }

    /// Returns the largest committed key within `range`.
    pub fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.backend_handle()?.max_key(range)
    }

    /// Returns the number of committed keys within `range`.
    pub fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        self.backend_handle()?.count(range)
    }

    /// Returns a read view of the named index's committed state.
    pub fn index(&self, name: &str) -> CoreResult<BackendHandle> {
        self.backend_handle()?.index_store(name)
    }

    /// Clears the table and its index tables.
    pub fn truncate(&self) -> CoreResult<()> {
        self.backend_handle()?.truncate_store()
    }

    // === Wiring ===

    pub(crate) fn backend_handle(&self) -> CoreResult<BackendHandle> {
        self.backend
            .read()
            .clone()
            .ok_or_else(|| CoreError::invalid_state(format!("store {:?} is not connected", self.name)))
    }

    /// Builds the backend against the root engine. Called once by the
    /// owning database during connect.
    pub(crate) fn connect(&self, engine: &Arc<dyn KvEngine>, database_id: u64) -> CoreResult<()> {
        let indices = self.indices.read().clone();
        let backend: BackendHandle = if self.options.persistent {
            let kv = Arc::new(KvStore::new(
                self.name.clone(),
                Arc::clone(engine),
                Arc::clone(&self.options.codec),
                indices,
                database_id,
            ));
            if self.options.enable_lru_cache {
                Arc::new(CachedStore::new(
                    kv,
                    self.options.lru_cache_size,
                    self.options.raw_lru_cache_size,
                )?)
            } else {
                kv
            }
        } else {
            Arc::new(MemoryStore::new(self.name.clone(), indices, database_id))
        };
        *self.backend.write() = Some(backend);
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        *self.backend.write() = None;
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.options.persistent
    }

    pub(crate) fn upgrade_condition_holds(&self, old_version: u32) -> bool {
        self.options
            .upgrade_condition
            .as_ref()
            .map_or(false, |condition| condition(old_version))
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("connected", &self.backend.read().is_some())
            .field("indices", &self.indices.read().len())
            .finish_non_exhaustive()
    }
}

/// Table and index names end up in the persisted key layout, so they are
/// restricted to ASCII alphanumerics plus `-` and `_`.
pub(crate) fn validate_schema_name(name: &str, kind: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_argument(format!("{kind} name is empty")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::invalid_argument(format!(
            "{kind} name {name:?} may only contain ASCII alphanumerics, '-' and '_'"
        )));
    }
    Ok(())
}
