//! Snapshot-overlay transactions.
//!
//! A transaction stages mutations in an overlay (`modified`, `removed`,
//! `truncated`) on top of a read backend, answering ordered-range queries
//! through the merge of both. The backend is untouched until commit, when
//! the commit backend flattens the overlay - primary and index state
//! together - into one atomic apply.
//!
//! Transactions themselves implement [`Backend`], so a transaction can act
//! as the read source and commit target of another: committing the child
//! merges its overlay into the parent through the internal write paths,
//! which skip the open-state check so a child can land on a parent whose
//! own commit has already been finalized.

use crate::backend::{Backend, BackendHandle, BatchFragment};
use crate::error::{CoreError, CoreResult};
use crate::index::{entry_keys, IndexView, TransactionIndex};
use crate::key_range::KeyRange;
use crate::object_store::KeyEncoding;
use crate::watchdog::Watchdog;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stratadb_codec::{KeyPath, Value};
use tracing::{debug, warn};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting reads and staged writes.
    Open,
    /// Commit applied to the backend.
    Committed,
    /// Discarded by `abort` or the watchdog.
    Aborted,
    /// Commit rejected: captured old values went stale.
    Conflicted,
}

/// Overlay state guarded by the transaction mutex.
struct TxnCore {
    state: TransactionState,
    modified: BTreeMap<String, Value>,
    removed: BTreeSet<String>,
    old_values: BTreeMap<String, Option<Value>>,
    truncated: bool,
    indices: BTreeMap<String, TransactionIndex>,
}

pub(crate) struct TransactionInner {
    id: u64,
    backend: BackendHandle,
    commit_backend: BackendHandle,
    ids: Arc<AtomicU64>,
    timeout: Option<Duration>,
    key_encoding: KeyEncoding,
    core: Mutex<TxnCore>,
    watchdog: Watchdog,
}

/// A snapshot-overlay transaction over an object store (or another
/// transaction, in the nested case).
///
/// Cloning the handle clones a reference to the same transaction.
///
/// # Example
///
/// ```rust,ignore
/// let tx = store.transaction()?;
/// tx.put("a", Value::int(1))?;
/// assert_eq!(tx.get("a")?, Some(Value::int(1)));
/// assert!(tx.commit()?);
/// ```
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

/// Snapshot of an overlay taken for commit flattening.
pub(crate) struct OverlaySnapshot {
    pub(crate) truncated: bool,
    pub(crate) modified: Vec<(String, Value)>,
    pub(crate) removed: Vec<String>,
    pub(crate) indices: Vec<IndexOverlaySnapshot>,
}

/// Snapshot of one index overlay.
pub(crate) struct IndexOverlaySnapshot {
    pub(crate) name: String,
    pub(crate) truncated: bool,
    pub(crate) modified: Vec<(String, String)>,
    pub(crate) removed: Vec<String>,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        backend: BackendHandle,
        commit_backend: BackendHandle,
        timeout: Option<Duration>,
        ids: Arc<AtomicU64>,
        key_encoding: KeyEncoding,
    ) -> Self {
        let indices = backend
            .index_defs()
            .into_iter()
            .map(|def| (def.name.clone(), TransactionIndex::new(def)))
            .collect();
        Self {
            inner: Arc::new(TransactionInner {
                id,
                backend,
                commit_backend,
                ids,
                timeout,
                key_encoding,
                core: Mutex::new(TxnCore {
                    state: TransactionState::Open,
                    modified: BTreeMap::new(),
                    removed: BTreeSet::new(),
                    old_values: BTreeMap::new(),
                    truncated: false,
                    indices,
                }),
                watchdog: Watchdog::new(timeout),
            }),
        }
    }

    /// Returns the transaction id, unique within its database instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.core.lock().state
    }

    /// Whether the transaction still accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Opens a nested transaction reading from and committing into this
    /// one.
    ///
    /// The child sees this transaction's merged view (backend plus
    /// overlay); committing the child merges its overlay here without
    /// touching the underlying store.
    #[must_use]
    pub fn nested(&self) -> Transaction {
        let id = self.inner.ids.fetch_add(1, Ordering::SeqCst);
        let handle: BackendHandle = Arc::new(self.clone());
        Transaction::new(
            id,
            Arc::clone(&handle),
            handle,
            self.inner.timeout,
            Arc::clone(&self.inner.ids),
            self.inner.key_encoding,
        )
    }

    // === Reads ===

    /// Reads the value visible to this transaction for `key`.
    ///
    /// Resolution order: staged removal, staged write, truncation flag,
    /// then the backend.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.check_watchdog()?;
        self.visible(key)
    }

    /// Returns the keys visible in `range`, ordered.
    pub fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        self.check_watchdog()?;
        let (truncated, removed, staged) = {
            let core = self.inner.core.lock();
            (
                core.truncated,
                core.removed.clone(),
                core.modified.keys().cloned().collect::<Vec<_>>(),
            )
        };

        let mut merged: BTreeSet<String> = if truncated {
            BTreeSet::new()
        } else {
            self.inner.backend.keys(range)?.into_iter().collect()
        };
        for key in &removed {
            merged.remove(key);
        }
        for key in staged {
            if range.map_or(true, |r| r.includes(&key)) {
                merged.insert(key);
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Returns the values visible in `range`, in key order.
    pub fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let mut values = Vec::new();
        for key in self.keys(range)? {
            if let Some(value) = self.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Returns the largest visible key within `range`.
    ///
    /// When the backend's candidate has been staged for removal, the
    /// backend search restarts below the dead candidate until a surviving
    /// key (or nothing) is found; staged writes then compete against it.
    pub fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.check_watchdog()?;
        let (truncated, removed, staged) = {
            let core = self.inner.core.lock();
            (
                core.truncated,
                core.removed.clone(),
                core.modified.keys().cloned().collect::<Vec<_>>(),
            )
        };

        let mut candidate = if truncated {
            None
        } else {
            self.inner.backend.max_key(range)?
        };
        while let Some(dead) = candidate.as_ref().filter(|c| removed.contains(*c)) {
            // Keep the query's lower bound, cap strictly below the dead key.
            let narrowed = match range.and_then(KeyRange::lower) {
                Some((lower, exclusive)) => KeyRange::bound(lower, dead.clone(), exclusive, true),
                None => KeyRange::upper_bound(dead.clone(), true),
            };
            candidate = self.inner.backend.max_key(Some(&narrowed))?;
        }

        for key in staged {
            if range.map_or(true, |r| r.includes(&key))
                && candidate.as_ref().map_or(true, |c| key > *c)
            {
                candidate = Some(key);
            }
        }
        Ok(candidate)
    }

    /// Returns the smallest visible key within `range`. Symmetric to
    /// [`Transaction::max_key`].
    pub fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        self.check_watchdog()?;
        let (truncated, removed, staged) = {
            let core = self.inner.core.lock();
            (
                core.truncated,
                core.removed.clone(),
                core.modified.keys().cloned().collect::<Vec<_>>(),
            )
        };

        let mut candidate = if truncated {
            None
        } else {
            self.inner.backend.min_key(range)?
        };
        while let Some(dead) = candidate.as_ref().filter(|c| removed.contains(*c)) {
            let narrowed = match range.and_then(KeyRange::upper) {
                Some((upper, exclusive)) => {
                    KeyRange::bound(dead.clone(), upper, true, exclusive)
                }
                None => KeyRange::lower_bound(dead.clone(), true),
            };
            candidate = self.inner.backend.min_key(Some(&narrowed))?;
        }

        for key in staged {
            if range.map_or(true, |r| r.includes(&key))
                && candidate.as_ref().map_or(true, |c| key < *c)
            {
                candidate = Some(key);
            }
        }
        Ok(candidate)
    }

    /// Returns the number of visible keys within `range`.
    ///
    /// Derived from `keys`; no backend shortcut is sound once an overlay
    /// exists.
    pub fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        Ok(self.keys(range)?.len())
    }

    // === Writes ===

    /// Stages a write of `value` under `key`.
    pub fn put(&self, key: &str, value: Value) -> CoreResult<()> {
        self.check_watchdog()?;
        self.validate_key(key)?;
        self.stage_put(key, value, false)
    }

    /// Stages a removal of `key`.
    pub fn remove(&self, key: &str) -> CoreResult<()> {
        self.check_watchdog()?;
        self.validate_key(key)?;
        self.stage_remove(key, false)
    }

    /// Logically empties the store from this transaction's view.
    ///
    /// Clears the overlay and shadows the backend; later `put`s
    /// re-introduce their keys on top of the empty view.
    pub fn truncate(&self) -> CoreResult<()> {
        self.check_watchdog()?;
        let mut core = self.inner.core.lock();
        ensure_open(&core)?;
        truncate_core(&mut core);
        Ok(())
    }

    /// Commits the overlay through the commit backend.
    ///
    /// Returns `true` on success and `false` on conflict (captured old
    /// values no longer match backend state); the transaction ends in the
    /// corresponding terminal state either way. The backend guarantees no
    /// partial effects on conflict.
    pub fn commit(&self) -> CoreResult<bool> {
        self.check_watchdog()?;
        {
            let core = self.inner.core.lock();
            ensure_open(&core)?;
        }
        self.inner.watchdog.cancel();

        match self.inner.commit_backend.commit(self) {
            Ok(true) => {
                self.set_terminal(TransactionState::Committed);
                debug!(id = self.inner.id, "transaction committed");
                Ok(true)
            }
            Ok(false) => {
                self.set_terminal(TransactionState::Conflicted);
                debug!(id = self.inner.id, "transaction conflicted");
                Ok(false)
            }
            Err(error) => {
                self.set_terminal(TransactionState::Conflicted);
                Err(error)
            }
        }
    }

    /// Discards the overlay.
    pub fn abort(&self) -> CoreResult<()> {
        self.check_watchdog()?;
        {
            let core = self.inner.core.lock();
            ensure_open(&core)?;
        }
        self.inner.watchdog.cancel();

        match self.inner.commit_backend.abort(self) {
            Ok(()) => {
                self.set_terminal(TransactionState::Aborted);
                Ok(())
            }
            Err(error) => {
                warn!(id = self.inner.id, %error, "backend rejected abort");
                self.set_terminal(TransactionState::Aborted);
                Err(error)
            }
        }
    }

    // === Indices ===

    /// Returns a merged read view over the named index.
    pub fn index(&self, name: &str) -> CoreResult<IndexView> {
        let def = {
            let core = self.inner.core.lock();
            core.indices
                .get(name)
                .map(|overlay| overlay.def.clone())
                .ok_or_else(|| CoreError::index_not_found(name))?
        };
        let backend_index = self.inner.backend.index_store(name)?;
        Ok(IndexView::new(def, self.clone(), backend_index))
    }

    /// Index creation is a schema change and is rejected on transactions.
    pub fn create_index(&self, _name: &str, _key_path: KeyPath) -> CoreResult<()> {
        Err(CoreError::SchemaChangeInTransaction)
    }

    // === Internal machinery ===

    fn validate_key(&self, key: &str) -> CoreResult<()> {
        match self.inner.key_encoding {
            KeyEncoding::Ascii if !key.is_ascii() => Err(CoreError::invalid_argument(format!(
                "key {key:?} is not ASCII (store uses ASCII key encoding)"
            ))),
            _ => Ok(()),
        }
    }

    /// The value visible for `key` without a watchdog check.
    fn visible(&self, key: &str) -> CoreResult<Option<Value>> {
        {
            let core = self.inner.core.lock();
            if core.removed.contains(key) {
                return Ok(None);
            }
            if let Some(value) = core.modified.get(key) {
                return Ok(Some(value.clone()));
            }
            if core.truncated {
                return Ok(None);
            }
        }
        self.inner.backend.get(key)
    }

    /// Shared write path. `internal` skips the open-state check and unique
    /// enforcement; it is how a child's overlay merges into a finalized
    /// parent.
    fn stage_put(&self, key: &str, value: Value, internal: bool) -> CoreResult<()> {
        let prev = self.visible(key)?;
        let mut core = self.inner.core.lock();
        if !internal {
            ensure_open(&core)?;
            check_unique(&self.inner.backend, &core, key, &value)?;
        }
        if !core.old_values.contains_key(key) {
            core.old_values.insert(key.to_string(), prev.clone());
        }
        core.removed.remove(key);
        core.modified.insert(key.to_string(), value.clone());
        for overlay in core.indices.values_mut() {
            overlay.stage_put(key, prev.as_ref(), &value);
        }
        Ok(())
    }

    /// Shared removal path; see [`Transaction::stage_put`].
    fn stage_remove(&self, key: &str, internal: bool) -> CoreResult<()> {
        let prev = self.visible(key)?;
        let mut core = self.inner.core.lock();
        if !internal {
            ensure_open(&core)?;
        }
        if !core.old_values.contains_key(key) {
            core.old_values.insert(key.to_string(), prev.clone());
        }
        core.modified.remove(key);
        core.removed.insert(key.to_string());
        for overlay in core.indices.values_mut() {
            overlay.stage_remove(key, prev.as_ref());
        }
        Ok(())
    }

    /// Merges a child overlay into this transaction: truncation first,
    /// then staged writes, then staged removals, all through the
    /// check-free internal paths so a finalized parent still accepts the
    /// merge.
    fn apply_child(&self, child: &Transaction) -> CoreResult<()> {
        let snapshot = child.overlay_snapshot();
        if snapshot.truncated {
            let mut core = self.inner.core.lock();
            truncate_core(&mut core);
        }
        for (key, value) in snapshot.modified {
            self.stage_put(&key, value, true)?;
        }
        for key in snapshot.removed {
            self.stage_remove(&key, true)?;
        }
        Ok(())
    }

    fn check_watchdog(&self) -> CoreResult<()> {
        if !self.inner.watchdog.expired() {
            return Ok(());
        }
        if self.inner.watchdog.mark_fired() {
            let was_open = {
                let mut core = self.inner.core.lock();
                if core.state == TransactionState::Open {
                    core.state = TransactionState::Aborted;
                    true
                } else {
                    false
                }
            };
            self.inner.watchdog.cancel();
            if was_open {
                warn!(id = self.inner.id, "watchdog fired; transaction aborted");
                let _ = self.inner.commit_backend.abort(self);
                return Err(CoreError::WatchdogTimeout { id: self.inner.id });
            }
        }
        Ok(())
    }

    pub(crate) fn set_terminal(&self, state: TransactionState) {
        self.inner.watchdog.cancel();
        let mut core = self.inner.core.lock();
        if core.state == TransactionState::Open {
            core.state = state;
        }
    }

    pub(crate) fn ensure_open_for_commit(&self) -> CoreResult<()> {
        ensure_open(&self.inner.core.lock())
    }

    pub(crate) fn cancel_watchdog(&self) {
        self.inner.watchdog.cancel();
    }

    pub(crate) fn commit_backend(&self) -> &BackendHandle {
        &self.inner.commit_backend
    }

    pub(crate) fn downgrade(&self) -> Weak<TransactionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Snapshot of the captured old values, for conflict checks.
    pub(crate) fn old_values_snapshot(&self) -> Vec<(String, Option<Value>)> {
        self.inner
            .core
            .lock()
            .old_values
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Snapshot of the full overlay, for commit flattening.
    pub(crate) fn overlay_snapshot(&self) -> OverlaySnapshot {
        let core = self.inner.core.lock();
        OverlaySnapshot {
            truncated: core.truncated,
            modified: core
                .modified
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            removed: core.removed.iter().cloned().collect(),
            indices: core
                .indices
                .values()
                .map(|overlay| IndexOverlaySnapshot {
                    name: overlay.def.name.clone(),
                    truncated: overlay.truncated,
                    modified: overlay
                        .modified
                        .iter()
                        .map(|(entry, primary)| (entry.clone(), primary.clone()))
                        .collect(),
                    removed: overlay.removed.iter().cloned().collect(),
                })
                .collect(),
        }
    }

    /// Clones the named index overlay's parts for merged reads.
    pub(crate) fn index_overlay_parts(
        &self,
        name: &str,
    ) -> (bool, BTreeMap<String, String>, BTreeSet<String>) {
        let core = self.inner.core.lock();
        match core.indices.get(name) {
            Some(overlay) => (
                overlay.truncated,
                overlay.modified.clone(),
                overlay.removed.clone(),
            ),
            None => (false, BTreeMap::new(), BTreeSet::new()),
        }
    }
}

fn ensure_open(core: &TxnCore) -> CoreResult<()> {
    match core.state {
        TransactionState::Open => Ok(()),
        TransactionState::Committed => {
            Err(CoreError::invalid_state("transaction already committed"))
        }
        TransactionState::Aborted => Err(CoreError::invalid_state("transaction already aborted")),
        TransactionState::Conflicted => Err(CoreError::invalid_state("transaction conflicted")),
    }
}

fn truncate_core(core: &mut TxnCore) {
    core.truncated = true;
    core.modified.clear();
    core.removed.clear();
    core.old_values.clear();
    for overlay in core.indices.values_mut() {
        overlay.truncate();
    }
}

/// Rejects a staged write that would map a unique index key to a second
/// primary key, checking staged index state first and falling back to the
/// backend index table.
fn check_unique(
    backend: &BackendHandle,
    core: &TxnCore,
    primary: &str,
    value: &Value,
) -> CoreResult<()> {
    for overlay in core.indices.values() {
        if !overlay.def.unique {
            continue;
        }
        for entry in entry_keys(&overlay.def, Some(value), primary) {
            if let Some(owner) = overlay.modified.get(&entry) {
                if owner != primary {
                    return Err(CoreError::unique_constraint(&overlay.def.name, entry));
                }
                continue;
            }
            if overlay.removed.contains(&entry) || overlay.truncated {
                continue;
            }
            let index_table = backend.index_store(&overlay.def.name)?;
            if let Some(owner) = index_table.get(&entry)? {
                if owner.as_text() != Some(primary) {
                    return Err(CoreError::unique_constraint(&overlay.def.name, entry));
                }
            }
        }
    }
    Ok(())
}

impl Backend for Transaction {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Transaction::get(self, key)
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        Transaction::keys(self, range)
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        Transaction::values(self, range)
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Transaction::min_key(self, range)
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Transaction::max_key(self, range)
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        Transaction::count(self, range)
    }

    /// Nested commit: merges the child overlay into this transaction.
    ///
    /// Accepted while this transaction is open (building up an outer
    /// commit) or already committed (merging into its finalized snapshot
    /// view); aborted and conflicted parents reject the merge.
    fn commit(&self, child: &Transaction) -> CoreResult<bool> {
        {
            let core = self.inner.core.lock();
            match core.state {
                TransactionState::Open | TransactionState::Committed => {}
                TransactionState::Aborted => {
                    return Err(CoreError::invalid_state(
                        "cannot commit into an aborted transaction",
                    ));
                }
                TransactionState::Conflicted => {
                    return Err(CoreError::invalid_state(
                        "cannot commit into a conflicted transaction",
                    ));
                }
            }
        }
        self.apply_child(child)?;
        Ok(true)
    }

    fn abort(&self, _child: &Transaction) -> CoreResult<()> {
        // The child's overlay dies with the child.
        Ok(())
    }

    fn apply_combined(&self, _tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        Err(CoreError::invalid_argument(
            "nested transactions cannot join a combined commit",
        ))
    }

    fn truncate_store(&self) -> CoreResult<()> {
        let mut core = self.inner.core.lock();
        truncate_core(&mut core);
        Ok(())
    }

    fn index_defs(&self) -> Vec<crate::index::IndexDef> {
        self.inner.backend.index_defs()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        Ok(Arc::new(self.index(name)?))
    }

    fn database_id(&self) -> u64 {
        self.inner.commit_backend.database_id()
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        None
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("staged_writes", &core.modified.len())
            .field("staged_removals", &core.removed.len())
            .field("truncated", &core.truncated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::index::IndexOptions;

    fn empty_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new("t".to_string(), Vec::new(), 1))
    }

    fn indexed_store(options: IndexOptions) -> Arc<MemoryStore> {
        let def = options.into_def("by_tag".to_string(), KeyPath::new("tag"));
        Arc::new(MemoryStore::new("t".to_string(), vec![def], 1))
    }

    fn txn_on(store: &Arc<MemoryStore>) -> Transaction {
        let handle: BackendHandle = Arc::clone(store) as BackendHandle;
        Transaction::new(
            1,
            Arc::clone(&handle),
            handle,
            None,
            Arc::new(AtomicU64::new(2)),
            KeyEncoding::Ascii,
        )
    }

    fn seed(store: &Arc<MemoryStore>, pairs: &[(&str, i64)]) {
        let tx = txn_on(store);
        for (key, value) in pairs {
            tx.put(key, Value::int(*value)).unwrap();
        }
        assert!(tx.commit().unwrap());
    }

    fn tagged(tag: &str) -> Value {
        Value::map(vec![("tag".to_string(), Value::text(tag))])
    }

    // === Overlay reads ===

    #[test]
    fn get_prefers_staged_write() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let tx = txn_on(&store);
        tx.put("a", Value::int(2)).unwrap();

        assert_eq!(tx.get("a").unwrap(), Some(Value::int(2)));
        // Backend unchanged until commit
        assert_eq!(store.get("a").unwrap(), Some(Value::int(1)));
    }

    #[test]
    fn get_sees_staged_removal() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let tx = txn_on(&store);
        tx.remove("a").unwrap();

        assert_eq!(tx.get("a").unwrap(), None);
        assert_eq!(store.get("a").unwrap(), Some(Value::int(1)));
    }

    #[test]
    fn put_after_remove_re_adds() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let tx = txn_on(&store);
        tx.remove("a").unwrap();
        tx.put("a", Value::int(2)).unwrap();
        assert_eq!(tx.get("a").unwrap(), Some(Value::int(2)));
        assert_eq!(tx.keys(None).unwrap(), vec!["a".to_string()]);

        tx.remove("a").unwrap();
        assert_eq!(tx.get("a").unwrap(), None);
        assert!(tx.keys(None).unwrap().is_empty());
    }

    #[test]
    fn keys_merge_overlay_and_backend() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2), ("c", 3)]);

        let tx = txn_on(&store);
        tx.remove("b").unwrap();
        tx.put("d", Value::int(4)).unwrap();

        assert_eq!(
            tx.keys(None).unwrap(),
            vec!["a".to_string(), "c".to_string(), "d".to_string()]
        );
        let range = KeyRange::bound("b", "d", false, false);
        assert_eq!(
            tx.keys(Some(&range)).unwrap(),
            vec!["c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn values_follow_key_order() {
        let store = empty_store();
        seed(&store, &[("b", 2)]);

        let tx = txn_on(&store);
        tx.put("a", Value::int(1)).unwrap();
        tx.put("c", Value::int(3)).unwrap();

        assert_eq!(
            tx.values(None).unwrap(),
            vec![Value::int(1), Value::int(2), Value::int(3)]
        );
    }

    #[test]
    fn count_reflects_overlay() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2)]);

        let tx = txn_on(&store);
        tx.remove("a").unwrap();
        tx.put("c", Value::int(3)).unwrap();

        assert_eq!(tx.count(None).unwrap(), 2);
    }

    // === min/max with removed candidates ===

    #[test]
    fn max_key_skips_removed_candidates() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2), ("c", 3)]);

        let tx = txn_on(&store);
        tx.remove("c").unwrap();
        assert_eq!(tx.max_key(None).unwrap(), Some("b".to_string()));

        tx.remove("b").unwrap();
        assert_eq!(tx.max_key(None).unwrap(), Some("a".to_string()));

        tx.remove("a").unwrap();
        assert_eq!(tx.max_key(None).unwrap(), None);
    }

    #[test]
    fn min_key_skips_removed_candidates() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2), ("c", 3)]);

        let tx = txn_on(&store);
        tx.remove("a").unwrap();
        tx.remove("b").unwrap();
        assert_eq!(tx.min_key(None).unwrap(), Some("c".to_string()));
    }

    #[test]
    fn max_key_considers_staged_writes() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let tx = txn_on(&store);
        tx.put("z", Value::int(26)).unwrap();
        assert_eq!(tx.max_key(None).unwrap(), Some("z".to_string()));
    }

    #[test]
    fn min_key_prefers_smaller_staged_key() {
        let store = empty_store();
        seed(&store, &[("m", 13)]);

        let tx = txn_on(&store);
        tx.put("a", Value::int(1)).unwrap();
        assert_eq!(tx.min_key(None).unwrap(), Some("a".to_string()));
    }

    #[test]
    fn min_max_respect_ranges() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);

        let tx = txn_on(&store);
        tx.remove("c").unwrap();

        let range = KeyRange::bound("b", "d", false, true);
        assert_eq!(tx.max_key(Some(&range)).unwrap(), Some("b".to_string()));
        let range = KeyRange::lower_bound("b", true);
        assert_eq!(tx.min_key(Some(&range)).unwrap(), Some("d".to_string()));
    }

    // === Truncation ===

    #[test]
    fn truncate_empties_view() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2)]);

        let tx = txn_on(&store);
        tx.truncate().unwrap();

        assert!(tx.keys(None).unwrap().is_empty());
        assert_eq!(tx.get("a").unwrap(), None);
        assert_eq!(tx.max_key(None).unwrap(), None);
        assert_eq!(tx.count(None).unwrap(), 0);
    }

    #[test]
    fn put_after_truncate_reintroduces_key() {
        let store = empty_store();
        seed(&store, &[("a", 1), ("b", 2)]);

        let tx = txn_on(&store);
        tx.truncate().unwrap();
        tx.put("b", Value::text("X")).unwrap();

        assert_eq!(tx.get("b").unwrap(), Some(Value::text("X")));
        assert_eq!(tx.get("a").unwrap(), None);
        assert_eq!(tx.keys(None).unwrap(), vec!["b".to_string()]);
    }

    // === Commit and abort ===

    #[test]
    fn commit_applies_overlay() {
        let store = empty_store();
        let tx = txn_on(&store);
        tx.put("a", Value::int(1)).unwrap();
        tx.put("b", Value::int(2)).unwrap();

        assert!(tx.commit().unwrap());
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(
            store.keys(None).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn abort_discards_overlay() {
        let store = empty_store();
        let tx = txn_on(&store);
        tx.put("a", Value::int(1)).unwrap();

        tx.abort().unwrap();
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert!(store.keys(None).unwrap().is_empty());
    }

    #[test]
    fn operations_rejected_after_commit() {
        let store = empty_store();
        let tx = txn_on(&store);
        assert!(tx.commit().unwrap());

        assert!(matches!(
            tx.put("a", Value::int(1)),
            Err(CoreError::InvalidState { .. })
        ));
        assert!(matches!(tx.commit(), Err(CoreError::InvalidState { .. })));
        assert!(matches!(tx.abort(), Err(CoreError::InvalidState { .. })));
        assert!(matches!(tx.truncate(), Err(CoreError::InvalidState { .. })));
    }

    #[test]
    fn conflicting_commit_returns_false() {
        let store = empty_store();
        seed(&store, &[("k", 1)]);

        let tx1 = txn_on(&store);
        let tx2 = txn_on(&store);
        tx1.put("k", Value::int(2)).unwrap();
        tx2.put("k", Value::int(3)).unwrap();

        assert!(tx1.commit().unwrap());
        assert!(!tx2.commit().unwrap());
        assert_eq!(tx2.state(), TransactionState::Conflicted);
        // The first writer's value stands
        assert_eq!(store.get("k").unwrap(), Some(Value::int(2)));
    }

    #[test]
    fn disjoint_writers_do_not_conflict() {
        let store = empty_store();
        let tx1 = txn_on(&store);
        let tx2 = txn_on(&store);
        tx1.put("a", Value::int(1)).unwrap();
        tx2.put("b", Value::int(2)).unwrap();

        assert!(tx1.commit().unwrap());
        assert!(tx2.commit().unwrap());
        assert_eq!(store.count(None).unwrap(), 2);
    }

    #[test]
    fn create_index_is_rejected() {
        let store = empty_store();
        let tx = txn_on(&store);
        assert!(matches!(
            tx.create_index("idx", KeyPath::new("field")),
            Err(CoreError::SchemaChangeInTransaction)
        ));
    }

    #[test]
    fn non_ascii_key_rejected_under_ascii_encoding() {
        let store = empty_store();
        let tx = txn_on(&store);
        assert!(matches!(
            tx.put("k\u{e9}", Value::int(1)),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    // === Watchdog ===

    #[test]
    fn watchdog_aborts_expired_transaction() {
        let store = empty_store();
        let handle: BackendHandle = Arc::clone(&store) as BackendHandle;
        let tx = Transaction::new(
            7,
            Arc::clone(&handle),
            handle,
            Some(Duration::ZERO),
            Arc::new(AtomicU64::new(8)),
            KeyEncoding::Ascii,
        );

        let result = tx.put("a", Value::int(1));
        assert!(matches!(result, Err(CoreError::WatchdogTimeout { id: 7 })));
        assert_eq!(tx.state(), TransactionState::Aborted);

        // Fires exactly once; later operations fail on state instead
        assert!(matches!(
            tx.put("a", Value::int(1)),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn disarmed_watchdog_never_fires() {
        let store = empty_store();
        let tx = txn_on(&store);
        tx.put("a", Value::int(1)).unwrap();
        assert!(tx.commit().unwrap());
    }

    // === Nested transactions ===

    #[test]
    fn nested_commit_lands_in_parent_only() {
        let store = empty_store();
        let parent = txn_on(&store);

        let child = parent.nested();
        child.put("x", Value::int(1)).unwrap();
        assert!(child.commit().unwrap());

        assert_eq!(parent.get("x").unwrap(), Some(Value::int(1)));
        assert_eq!(store.get("x").unwrap(), None);

        assert!(parent.commit().unwrap());
        assert_eq!(store.get("x").unwrap(), Some(Value::int(1)));
    }

    #[test]
    fn nested_sees_parent_overlay() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let parent = txn_on(&store);
        parent.put("b", Value::int(2)).unwrap();
        parent.remove("a").unwrap();

        let child = parent.nested();
        assert_eq!(child.get("b").unwrap(), Some(Value::int(2)));
        assert_eq!(child.get("a").unwrap(), None);
        assert_eq!(child.keys(None).unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn nested_truncate_propagates_on_commit() {
        let store = empty_store();
        seed(&store, &[("a", 1)]);

        let parent = txn_on(&store);
        let child = parent.nested();
        child.truncate().unwrap();
        child.put("b", Value::int(2)).unwrap();
        assert!(child.commit().unwrap());

        assert_eq!(parent.keys(None).unwrap(), vec!["b".to_string()]);
        assert_eq!(parent.get("a").unwrap(), None);
    }

    #[test]
    fn nested_commit_into_committed_parent() {
        let store = empty_store();
        let parent = txn_on(&store);
        let child = parent.nested();
        assert!(parent.commit().unwrap());

        child.put("x", Value::int(1)).unwrap();
        assert!(child.commit().unwrap());
        // Merged into the parent's finalized view, not the store
        assert_eq!(parent.get("x").unwrap(), Some(Value::int(1)));
        assert_eq!(store.get("x").unwrap(), None);
    }

    #[test]
    fn nested_commit_into_aborted_parent_fails() {
        let store = empty_store();
        let parent = txn_on(&store);
        let child = parent.nested();
        parent.abort().unwrap();

        child.put("x", Value::int(1)).unwrap();
        let result = child.commit();
        assert!(matches!(result, Err(CoreError::InvalidState { .. })));
    }

    // === Index maintenance ===

    #[test]
    fn index_entries_follow_staged_writes() {
        let store = indexed_store(IndexOptions::new());
        let tx = txn_on(&store);
        tx.put("k1", tagged("red")).unwrap();
        tx.put("k2", tagged("red")).unwrap();

        let view = tx.index("by_tag").unwrap();
        assert_eq!(
            view.primary_keys(&Value::text("red")).unwrap(),
            vec!["k1".to_string(), "k2".to_string()]
        );
    }

    #[test]
    fn index_entry_updates_on_rewrite() {
        let store = indexed_store(IndexOptions::new());
        seed_tagged(&store, "k1", "red");

        let tx = txn_on(&store);
        tx.put("k1", tagged("blue")).unwrap();

        let view = tx.index("by_tag").unwrap();
        assert!(view.primary_keys(&Value::text("red")).unwrap().is_empty());
        assert_eq!(
            view.primary_keys(&Value::text("blue")).unwrap(),
            vec!["k1".to_string()]
        );
    }

    #[test]
    fn double_staged_write_leaves_no_stale_entries() {
        let store = indexed_store(IndexOptions::new());
        let tx = txn_on(&store);
        tx.put("k1", tagged("red")).unwrap();
        tx.put("k1", tagged("green")).unwrap();
        tx.put("k1", tagged("blue")).unwrap();

        let view = tx.index("by_tag").unwrap();
        assert!(view.primary_keys(&Value::text("red")).unwrap().is_empty());
        assert!(view.primary_keys(&Value::text("green")).unwrap().is_empty());
        assert_eq!(
            view.primary_keys(&Value::text("blue")).unwrap(),
            vec!["k1".to_string()]
        );
    }

    #[test]
    fn index_remove_clears_entry() {
        let store = indexed_store(IndexOptions::new());
        seed_tagged(&store, "k1", "red");

        let tx = txn_on(&store);
        tx.remove("k1").unwrap();

        let view = tx.index("by_tag").unwrap();
        assert!(view.primary_keys(&Value::text("red")).unwrap().is_empty());
    }

    #[test]
    fn index_merges_backend_and_overlay() {
        let store = indexed_store(IndexOptions::new());
        seed_tagged(&store, "k1", "red");

        let tx = txn_on(&store);
        tx.put("k2", tagged("red")).unwrap();

        let view = tx.index("by_tag").unwrap();
        assert_eq!(
            view.primary_keys(&Value::text("red")).unwrap(),
            vec!["k1".to_string(), "k2".to_string()]
        );
    }

    #[test]
    fn unique_index_rejects_second_primary() {
        let store = indexed_store(IndexOptions::new().unique());
        seed_tagged(&store, "k1", "red");

        let tx = txn_on(&store);
        let result = tx.put("k2", tagged("red"));
        assert!(matches!(result, Err(CoreError::UniqueConstraint { .. })));

        // The same primary may rewrite its own entry
        tx.put("k1", tagged("red")).unwrap();
    }

    #[test]
    fn unique_index_accepts_key_after_staged_removal() {
        let store = indexed_store(IndexOptions::new().unique());
        seed_tagged(&store, "k1", "red");

        let tx = txn_on(&store);
        tx.remove("k1").unwrap();
        tx.put("k2", tagged("red")).unwrap();

        let view = tx.index("by_tag").unwrap();
        assert_eq!(
            view.get_primary(&Value::text("red")).unwrap(),
            Some("k2".to_string())
        );
    }

    #[test]
    fn unknown_index_is_an_error() {
        let store = empty_store();
        let tx = txn_on(&store);
        assert!(matches!(
            tx.index("missing"),
            Err(CoreError::IndexNotFound { .. })
        ));
    }

    fn seed_tagged(store: &Arc<MemoryStore>, key: &str, tag: &str) {
        let tx = txn_on(store);
        tx.put(key, tagged(tag)).unwrap();
        assert!(tx.commit().unwrap());
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use crate::backend::MemoryStore;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Put(usize, i64),
        Remove(usize),
        Truncate,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            8 => (0..6usize, any::<i64>()).prop_map(|(k, v)| Op::Put(k, v)),
            4 => (0..6usize).prop_map(Op::Remove),
            1 => Just(Op::Truncate),
        ]
    }

    fn key_name(k: usize) -> String {
        format!("k{k}")
    }

    proptest! {
        /// The overlay's merged reads agree with a naive map model under
        /// arbitrary put/remove/truncate sequences.
        #[test]
        fn overlay_reads_match_model(ops in proptest::collection::vec(op_strategy(), 0..48)) {
            let store = Arc::new(MemoryStore::new("t".to_string(), Vec::new(), 1));
            let handle: BackendHandle = Arc::clone(&store) as BackendHandle;

            // Seed half the key space
            let seeder = Transaction::new(
                1,
                Arc::clone(&handle),
                Arc::clone(&handle),
                None,
                Arc::new(AtomicU64::new(2)),
                KeyEncoding::Ascii,
            );
            let mut model: BTreeMap<String, Value> = BTreeMap::new();
            for k in (0..6).step_by(2) {
                seeder.put(&key_name(k), Value::int(-1)).unwrap();
                model.insert(key_name(k), Value::int(-1));
            }
            prop_assert!(seeder.commit().unwrap());

            let tx = Transaction::new(
                2,
                Arc::clone(&handle),
                handle,
                None,
                Arc::new(AtomicU64::new(3)),
                KeyEncoding::Ascii,
            );
            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        tx.put(&key_name(k), Value::int(v)).unwrap();
                        model.insert(key_name(k), Value::int(v));
                    }
                    Op::Remove(k) => {
                        tx.remove(&key_name(k)).unwrap();
                        model.remove(&key_name(k));
                    }
                    Op::Truncate => {
                        tx.truncate().unwrap();
                        model.clear();
                    }
                }
            }

            let expected_keys: Vec<String> = model.keys().cloned().collect();
            prop_assert_eq!(tx.keys(None).unwrap(), expected_keys);
            prop_assert_eq!(tx.count(None).unwrap(), model.len());
            prop_assert_eq!(tx.min_key(None).unwrap(), model.keys().next().cloned());
            prop_assert_eq!(tx.max_key(None).unwrap(), model.keys().next_back().cloned());
            for k in 0..6 {
                let key = key_name(k);
                prop_assert_eq!(tx.get(&key).unwrap(), model.get(&key).cloned());
            }
        }
    }
}
