//! LRU read-through wrapper over a persistent table.

use crate::backend::{run_fragments, Backend, BackendHandle, BatchFragment, DeferredCommit};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDef;
use crate::key_range::KeyRange;
use crate::transaction::Transaction;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use stratadb_codec::Value;

use super::kv::KvStore;

/// LRU wrapper over a [`KvStore`].
///
/// Two caches sit in front of the engine: a decoded-value cache (which
/// also caches misses) and a raw encoded-bytes cache (hits skip engine
/// reads but still pay the decode). Commits invalidate exactly the keys
/// the committed overlay touched; truncation clears both caches.
pub struct CachedStore {
    inner: Arc<KvStore>,
    values: Arc<Mutex<LruCache<String, Option<Value>>>>,
    raw: Arc<Mutex<LruCache<String, Vec<u8>>>>,
}

impl CachedStore {
    pub(crate) fn new(
        inner: Arc<KvStore>,
        value_capacity: usize,
        raw_capacity: usize,
    ) -> CoreResult<Self> {
        let value_capacity = NonZeroUsize::new(value_capacity)
            .ok_or_else(|| CoreError::invalid_argument("value cache capacity must be non-zero"))?;
        let raw_capacity = NonZeroUsize::new(raw_capacity)
            .ok_or_else(|| CoreError::invalid_argument("raw cache capacity must be non-zero"))?;
        Ok(Self {
            inner,
            values: Arc::new(Mutex::new(LruCache::new(value_capacity))),
            raw: Arc::new(Mutex::new(LruCache::new(raw_capacity))),
        })
    }

    /// Number of decoded values currently cached. Test and debug hook.
    #[must_use]
    pub fn cached_value_count(&self) -> usize {
        self.values.lock().len()
    }
}

impl Backend for CachedStore {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        if let Some(hit) = self.values.lock().get(key) {
            return Ok(hit.clone());
        }

        let raw_hit = self.raw.lock().get(key).cloned();
        if let Some(bytes) = raw_hit {
            let value = self.inner.codec().decode(&bytes)?;
            self.values
                .lock()
                .put(key.to_string(), Some(value.clone()));
            return Ok(Some(value));
        }

        match self.inner.get_raw(key)? {
            Some(bytes) => {
                let value = self.inner.codec().decode(&bytes)?;
                self.raw.lock().put(key.to_string(), bytes);
                self.values
                    .lock()
                    .put(key.to_string(), Some(value.clone()));
                Ok(Some(value))
            }
            None => {
                self.values.lock().put(key.to_string(), None);
                Ok(None)
            }
        }
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        self.inner.keys(range)
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        // Reading per key keeps the caches warm for point lookups.
        let mut values = Vec::new();
        for key in self.inner.keys(range)? {
            if let Some(value) = self.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.inner.min_key(range)
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.inner.max_key(range)
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        self.inner.count(range)
    }

    fn commit(&self, tx: &Transaction) -> CoreResult<bool> {
        let _guard = self.inner.commit_lock().lock();
        match self.apply_combined(tx)? {
            None => Ok(false),
            Some(fragments) => run_fragments(Some(self.inner.engine()), fragments),
        }
    }

    fn abort(&self, tx: &Transaction) -> CoreResult<()> {
        self.inner.abort(tx)
    }

    fn apply_combined(&self, tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        let Some(mut fragments) = self.inner.apply_combined(tx)? else {
            return Ok(None);
        };

        let overlay = tx.overlay_snapshot();
        let mut touched: Vec<String> = overlay.modified.into_iter().map(|(key, _)| key).collect();
        touched.extend(overlay.removed);
        let truncated = overlay.truncated;

        let values = Arc::clone(&self.values);
        let raw = Arc::clone(&self.raw);
        fragments.push(BatchFragment::Deferred(DeferredCommit::new(move || {
            let mut values = values.lock();
            let mut raw = raw.lock();
            if truncated {
                values.clear();
                raw.clear();
            } else {
                for key in &touched {
                    values.pop(key);
                    raw.pop(key);
                }
            }
            Ok(())
        })));
        Ok(Some(fragments))
    }

    fn truncate_store(&self) -> CoreResult<()> {
        self.inner.truncate_store()?;
        self.values.lock().clear();
        self.raw.lock().clear();
        Ok(())
    }

    fn index_defs(&self) -> Vec<IndexDef> {
        self.inner.index_defs()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        self.inner.index_store(name)
    }

    fn database_id(&self) -> u64 {
        self.inner.database_id()
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        self.inner.commit_mutex()
    }
}

impl std::fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("table", &self.inner.table())
            .field("cached_values", &self.cached_value_count())
            .finish_non_exhaustive()
    }
}
