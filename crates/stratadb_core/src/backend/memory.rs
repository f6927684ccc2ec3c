//! Volatile table backend.

use crate::backend::{run_fragments, Backend, BackendHandle, BatchFragment, DeferredCommit};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDef;
use crate::key_range::{string_bounds, KeyRange};
use crate::transaction::Transaction;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use stratadb_codec::Value;
use tracing::debug;

/// A volatile table: an ordered in-memory map plus one ordered map per
/// index. No codec is involved - values are held decoded.
///
/// Memory stores participate in combined commits through deferred steps:
/// they contribute no batch entries to the root engine and mutate their
/// maps only after the root batch has landed.
pub struct MemoryStore {
    name: String,
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    indices: Vec<IndexDef>,
    index_tables: BTreeMap<String, Arc<MemoryIndexTable>>,
    commit_lock: Mutex<()>,
    database_id: u64,
}

impl MemoryStore {
    pub(crate) fn new(name: String, indices: Vec<IndexDef>, database_id: u64) -> Self {
        let index_tables = indices
            .iter()
            .map(|def| {
                (
                    def.name.clone(),
                    Arc::new(MemoryIndexTable {
                        data: Arc::new(RwLock::new(BTreeMap::new())),
                        database_id,
                    }),
                )
            })
            .collect();
        Self {
            name,
            data: Arc::new(RwLock::new(BTreeMap::new())),
            indices,
            index_tables,
            commit_lock: Mutex::new(()),
            database_id,
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        for (key, old) in tx.old_values_snapshot() {
            if self.data.read().get(&key) != old.as_ref() {
                debug!(table = %self.name, %key, "commit conflict on stale old value");
                return Ok(None);
            }
        }

        let overlay = tx.overlay_snapshot();
        let data = Arc::clone(&self.data);
        let mut index_work = Vec::new();
        for index in overlay.indices {
            if let Some(table) = self.index_tables.get(&index.name) {
                index_work.push((Arc::clone(&table.data), index));
            }
        }

        let step = DeferredCommit::new(move || {
            {
                let mut map = data.write();
                if overlay.truncated {
                    map.clear();
                }
                for (key, value) in overlay.modified {
                    map.insert(key, value);
                }
                for key in overlay.removed {
                    map.remove(&key);
                }
            }
            for (table, index) in index_work {
                let mut map = table.write();
                if index.truncated {
                    map.clear();
                }
                for (entry, primary) in index.modified {
                    map.insert(entry, primary);
                }
                for entry in index.removed {
                    map.remove(&entry);
                }
            }
            Ok(())
        });

        Ok(Some(vec![BatchFragment::Deferred(step)]))
    }
}

impl Backend for MemoryStore {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(Vec::new());
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(Vec::new());
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .map(|(_, value)| value.clone())
            .collect())
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(None);
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .next()
            .map(|(key, _)| key.clone()))
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(None);
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .next_back()
            .map(|(key, _)| key.clone()))
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(0);
        };
        Ok(self.data.read().range::<String, _>(bounds).count())
    }

    fn commit(&self, tx: &Transaction) -> CoreResult<bool> {
        let _guard = self.commit_lock.lock();
        match self.stage(tx)? {
            None => Ok(false),
            Some(fragments) => run_fragments(None, fragments),
        }
    }

    fn abort(&self, _tx: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    fn apply_combined(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        self.stage(tx)
    }

    fn truncate_store(&self) -> CoreResult<()> {
        self.data.write().clear();
        for table in self.index_tables.values() {
            table.data.write().clear();
        }
        Ok(())
    }

    fn index_defs(&self) -> Vec<IndexDef> {
        self.indices.clone()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        match self.index_tables.get(name) {
            Some(table) => Ok(Arc::clone(table) as BackendHandle),
            None => Err(CoreError::index_not_found(name)),
        }
    }

    fn database_id(&self) -> u64 {
        self.database_id
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.commit_lock)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("len", &self.data.read().len())
            .finish_non_exhaustive()
    }
}

/// Read view over a memory store's index map. Values are the primary
/// keys, surfaced as text.
pub(crate) struct MemoryIndexTable {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    database_id: u64,
}

impl MemoryIndexTable {
    fn read_only_error() -> CoreError {
        CoreError::invalid_state("index tables are read-only views")
    }
}

impl Backend for MemoryIndexTable {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.data.read().get(key).cloned().map(Value::Text))
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(Vec::new());
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(Vec::new());
        };
        Ok(self
            .data
            .read()
            .range::<String, _>(bounds)
            .map(|(_, primary)| Value::Text(primary.clone()))
            .collect())
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Ok(self.keys(range)?.into_iter().next())
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Ok(self.keys(range)?.into_iter().next_back())
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        let Some(bounds) = string_bounds(range) else {
            return Ok(0);
        };
        Ok(self.data.read().range::<String, _>(bounds).count())
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
