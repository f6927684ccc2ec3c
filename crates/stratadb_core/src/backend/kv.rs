//! Persistent table backend over a shared root engine.
//!
//! Each table `T` occupies the root key namespace `!T!`; each index `I` on
//! `T` occupies `!_T-I!`. The reserved root key `_dbVersion` (outside every
//! table namespace, since table prefixes always start with `!`) holds the
//! schema version. Keys are stored as UTF-8 bytes behind the prefix; values
//! go through the store's codec.

use crate::backend::{run_fragments, Backend, BackendHandle, BatchFragment};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDef;
use crate::key_range::KeyRange;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::Arc;
use stratadb_codec::{Codec, Value};
use stratadb_storage::{prefix_upper_bound, BatchOp, KvEngine};
use tracing::debug;

/// Root namespace prefix for table `table`.
pub(crate) fn table_prefix(table: &str) -> String {
    format!("!{table}!")
}

/// Root namespace prefix for index `index` on table `table`.
pub(crate) fn index_table_prefix(table: &str, index: &str) -> String {
    format!("!_{table}-{index}!")
}

/// A persistent table over a shared root [`KvEngine`].
pub struct KvStore {
    table: String,
    engine: Arc<dyn KvEngine>,
    codec: Arc<dyn Codec>,
    indices: Vec<IndexDef>,
    commit_lock: Mutex<()>,
    database_id: u64,
}

impl KvStore {
    pub(crate) fn new(
        table: String,
        engine: Arc<dyn KvEngine>,
        codec: Arc<dyn Codec>,
        indices: Vec<IndexDef>,
        database_id: u64,
    ) -> Self {
        Self {
            table,
            engine,
            codec,
            indices,
            commit_lock: Mutex::new(()),
            database_id,
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    pub(crate) fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    /// Reads the raw encoded bytes stored under `key`.
    pub(crate) fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let mut root_key = table_prefix(&self.table).into_bytes();
        root_key.extend_from_slice(key.as_bytes());
        Ok(self.engine.get(&root_key)?)
    }

    /// Stages a transaction's overlay as one engine batch.
    ///
    /// Prefix deletions come first so a truncate-then-put overlay leaves
    /// the re-inserted keys visible.
    fn stage(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        for (key, old) in tx.old_values_snapshot() {
            if self.get(&key)? != old {
                debug!(table = %self.table, %key, "commit conflict on stale old value");
                return Ok(None);
            }
        }

        let overlay = tx.overlay_snapshot();
        let prefix = table_prefix(&self.table);
        let mut entries = Vec::new();

        if overlay.truncated {
            entries.push(BatchOp::delete_prefix(prefix.clone().into_bytes()));
        }
        for index in &overlay.indices {
            if index.truncated {
                entries.push(BatchOp::delete_prefix(
                    index_table_prefix(&self.table, &index.name).into_bytes(),
                ));
            }
        }

        for (key, value) in &overlay.modified {
            entries.push(BatchOp::put(
                format!("{prefix}{key}").into_bytes(),
                self.codec.encode(value)?,
            ));
        }
        for key in &overlay.removed {
            entries.push(BatchOp::delete(format!("{prefix}{key}").into_bytes()));
        }

        for index in &overlay.indices {
            let index_prefix = index_table_prefix(&self.table, &index.name);
            for (entry, primary) in &index.modified {
                entries.push(BatchOp::put(
                    format!("{index_prefix}{entry}").into_bytes(),
                    primary.clone().into_bytes(),
                ));
            }
            for entry in &index.removed {
                entries.push(BatchOp::delete(format!("{index_prefix}{entry}").into_bytes()));
            }
        }

        Ok(Some(vec![BatchFragment::Entries(entries)]))
    }
}

/// Translates a key range into engine byte bounds under `prefix`.
fn namespace_bounds(prefix: &str, range: Option<&KeyRange>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = match range.and_then(KeyRange::lower) {
        Some((key, true)) => Bound::Excluded(format!("{prefix}{key}").into_bytes()),
        Some((key, false)) => Bound::Included(format!("{prefix}{key}").into_bytes()),
        None => Bound::Included(prefix.as_bytes().to_vec()),
    };
    let upper = match range.and_then(KeyRange::upper) {
        Some((key, true)) => Bound::Excluded(format!("{prefix}{key}").into_bytes()),
        Some((key, false)) => Bound::Included(format!("{prefix}{key}").into_bytes()),
        None => match prefix_upper_bound(prefix.as_bytes()) {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        },
    };
    (lower, upper)
}

/// Strips the namespace prefix from an engine key.
fn strip_prefix(prefix: &str, root_key: Vec<u8>) -> CoreResult<String> {
    let stripped = root_key
        .get(prefix.len()..)
        .ok_or_else(|| CoreError::invalid_format("engine key shorter than its namespace"))?;
    String::from_utf8(stripped.to_vec())
        .map_err(|_| CoreError::invalid_format("engine key is not valid UTF-8"))
}

impl Backend for KvStore {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        let prefix = table_prefix(&self.table);
        let (lower, upper) = namespace_bounds(&prefix, range);
        self.engine
            .scan_keys(lower, upper)?
            .into_iter()
            .map(|key| strip_prefix(&prefix, key))
            .collect()
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let prefix = table_prefix(&self.table);
        let (lower, upper) = namespace_bounds(&prefix, range);
        self.engine
            .scan(lower, upper)?
            .into_iter()
            .map(|(_, bytes)| Ok(self.codec.decode(&bytes)?))
            .collect()
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let prefix = table_prefix(&self.table);
        let (lower, upper) = namespace_bounds(&prefix, range);
        self.engine
            .first_key(lower, upper)?
            .map(|key| strip_prefix(&prefix, key))
            .transpose()
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let prefix = table_prefix(&self.table);
        let (lower, upper) = namespace_bounds(&prefix, range);
        self.engine
            .last_key(lower, upper)?
            .map(|key| strip_prefix(&prefix, key))
            .transpose()
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        let prefix = table_prefix(&self.table);
        let (lower, upper) = namespace_bounds(&prefix, range);
        Ok(self.engine.count(lower, upper)?)
    }

    fn commit(&self, tx: &Transaction) -> CoreResult<bool> {
        let _guard = self.commit_lock.lock();
        match self.stage(tx)? {
            None => Ok(false),
            Some(fragments) => run_fragments(Some(&self.engine), fragments),
        }
    }

    fn abort(&self, _tx: &Transaction) -> CoreResult<()> {
        // The overlay lives in the transaction; nothing staged here yet.
        Ok(())
    }

    fn apply_combined(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        self.stage(tx)
    }

    fn truncate_store(&self) -> CoreResult<()> {
        let mut batch = vec![BatchOp::delete_prefix(table_prefix(&self.table).into_bytes())];
        for index in &self.indices {
            batch.push(BatchOp::delete_prefix(
                index_table_prefix(&self.table, &index.name).into_bytes(),
            ));
        }
        Ok(self.engine.apply(&batch)?)
    }

    fn index_defs(&self) -> Vec<IndexDef> {
        self.indices.clone()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        if !self.indices.iter().any(|def| def.name == name) {
            return Err(CoreError::index_not_found(name));
        }
        Ok(Arc::new(KvIndexTable {
            prefix: index_table_prefix(&self.table, name),
            engine: Arc::clone(&self.engine),
            database_id: self.database_id,
        }))
    }

    fn database_id(&self) -> u64 {
        self.database_id
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.commit_lock)
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("table", &self.table)
            .field("indices", &self.indices.len())
            .finish_non_exhaustive()
    }
}

/// Read view over one index's namespace. Values are the primary keys,
/// surfaced as text.
struct KvIndexTable {
    prefix: String,
    engine: Arc<dyn KvEngine>,
    database_id: u64,
}

impl KvIndexTable {
    fn read_only_error() -> CoreError {
        CoreError::invalid_state("index tables are read-only views")
    }
}

impl Backend for KvIndexTable {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let mut root_key = self.prefix.clone().into_bytes();
        root_key.extend_from_slice(key.as_bytes());
        match self.engine.get(&root_key)? {
            Some(bytes) => {
                let primary = String::from_utf8(bytes)
                    .map_err(|_| CoreError::invalid_format("index value is not valid UTF-8"))?;
                Ok(Some(Value::Text(primary)))
            }
            None => Ok(None),
        }
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        let (lower, upper) = namespace_bounds(&self.prefix, range);
        self.engine
            .scan_keys(lower, upper)?
            .into_iter()
            .map(|key| strip_prefix(&self.prefix, key))
            .collect()
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let (lower, upper) = namespace_bounds(&self.prefix, range);
        self.engine
            .scan(lower, upper)?
            .into_iter()
            .map(|(_, bytes)| {
                let primary = String::from_utf8(bytes)
                    .map_err(|_| CoreError::invalid_format("index value is not valid UTF-8"))?;
                Ok(Value::Text(primary))
            })
            .collect()
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let (lower, upper) = namespace_bounds(&self.prefix, range);
        self.engine
            .first_key(lower, upper)?
            .map(|key| strip_prefix(&self.prefix, key))
            .transpose()
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let (lower, upper) = namespace_bounds(&self.prefix, range);
        self.engine
            .last_key(lower, upper)?
            .map(|key| strip_prefix(&self.prefix, key))
            .transpose()
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        let (lower, upper) = namespace_bounds(&self.prefix, range);
        Ok(self.engine.count(lower, upper)?)
    }

    fn commit(&self, _tx: &Transaction) -> CoreResult<bool> {
        Err(Self::read_only_error())
    }

    fn abort(&self, _tx: &Transaction) -> CoreResult<()> {
        Err(Self::read_only_error())
    }

    fn apply_combined(&self, _tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        Err(Self::read_only_error())
    }

    fn truncate_store(&self) -> CoreResult<()> {
        Err(Self::read_only_error())
    }

    fn index_defs(&self) -> Vec<IndexDef> {
        Vec::new()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        Err(CoreError::index_not_found(name))
    }

    fn database_id(&self) -> u64 {
        self.database_id
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        None
    }
}
