//! Secondary index definitions, overlays, and merged views.
//!
//! Index tables map **index entry keys** to primary keys. A unique index
//! stores the bare index key; a non-unique index appends the primary key
//! behind an ASCII unit separator (0x1F), which sorts below every printable
//! key byte - one prefix range then enumerates an index key's entries in
//! primary-key order. Multi-entry indices expand array values element-wise.
//!
//! Per-transaction index state lives in [`TransactionIndex`], a diff of
//! entry keys kept in lockstep with the primary overlay and flattened into
//! the same commit batch. [`IndexView`] merges a backend index table with
//! that diff under the same ordering rules as primary-key range queries.

use crate::backend::{Backend, BackendHandle, BatchFragment};
use crate::error::{CoreError, CoreResult};
use crate::key_range::KeyRange;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use stratadb_codec::{KeyPath, Value};

/// Separator between index key and primary key in non-unique entries.
pub(crate) const ENTRY_SEPARATOR: char = '\u{1f}';

/// First character strictly above [`ENTRY_SEPARATOR`]; closes the prefix
/// range over one index key's entries.
const ENTRY_SEPARATOR_END: char = '\u{20}';

/// Definition of a secondary index on an object store.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Index name, unique within its store.
    pub name: String,
    /// Field path extracting the index key from a value.
    pub key_path: KeyPath,
    /// Whether an index key may map to at most one primary key.
    pub unique: bool,
    /// Whether array values expand to one entry per element.
    pub multi_entry: bool,
}

/// Options accepted when creating an index.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    unique: bool,
    multi_entry: bool,
}

impl IndexOptions {
    /// Creates options with defaults (non-unique, single entry).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the index unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Makes the index multi-entry.
    #[must_use]
    pub const fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    pub(crate) fn into_def(self, name: String, key_path: KeyPath) -> IndexDef {
        IndexDef {
            name,
            key_path,
            unique: self.unique,
            multi_entry: self.multi_entry,
        }
    }
}

/// Computes the index entry keys a value contributes for a primary key.
///
/// `None` or a value the key path does not resolve in contributes nothing.
/// Duplicate multi-entry elements collapse to one entry.
pub(crate) fn entry_keys(def: &IndexDef, value: Option<&Value>, primary: &str) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let Some(extracted) = def.key_path.extract(value) else {
        return Vec::new();
    };

    let members: Vec<&Value> = match extracted {
        Value::Array(items) if def.multi_entry => items.iter().collect(),
        other => vec![other],
    };

    let mut entries = BTreeSet::new();
    for member in members {
        if let Some(index_key) = member.index_key() {
            if def.unique {
                entries.insert(index_key);
            } else {
                entries.insert(format!("{index_key}{ENTRY_SEPARATOR}{primary}"));
            }
        }
    }
    entries.into_iter().collect()
}

/// Per-transaction overlay over one index table.
///
/// Mirrors the primary overlay shape: staged entry insertions, staged
/// entry deletions, and a truncation flag that shadows the backend index.
#[derive(Debug)]
pub(crate) struct TransactionIndex {
    pub(crate) def: IndexDef,
    pub(crate) modified: BTreeMap<String, String>,
    pub(crate) removed: BTreeSet<String>,
    pub(crate) truncated: bool,
}

impl TransactionIndex {
    pub(crate) fn new(def: IndexDef) -> Self {
        Self {
            def,
            modified: BTreeMap::new(),
            removed: BTreeSet::new(),
            truncated: false,
        }
    }

    /// Stages the index effect of writing `new` under `primary`.
    ///
    /// `prev` is the value currently visible to the transaction for the
    /// primary key, so repeated staged writes retract their predecessors'
    /// entries rather than the original committed ones.
    pub(crate) fn stage_put(&mut self, primary: &str, prev: Option<&Value>, new: &Value) {
        for entry in entry_keys(&self.def, prev, primary) {
            self.modified.remove(&entry);
            self.removed.insert(entry);
        }
        for entry in entry_keys(&self.def, Some(new), primary) {
            self.removed.remove(&entry);
            self.modified.insert(entry, primary.to_string());
        }
    }

    /// Stages the index effect of removing `primary`.
    pub(crate) fn stage_remove(&mut self, primary: &str, prev: Option<&Value>) {
        for entry in entry_keys(&self.def, prev, primary) {
            self.modified.remove(&entry);
            self.removed.insert(entry);
        }
    }

    /// Marks the overlay empty, shadowing the backend index.
    pub(crate) fn truncate(&mut self) {
        self.modified.clear();
        self.removed.clear();
        self.truncated = true;
    }
}

/// A read view over one index, merging backend state with a transaction's
/// pending index mutations.
///
/// Obtained from [`Transaction::index`]. The entry-key read API mirrors the
/// primary read API; [`IndexView::primary_keys`] and
/// [`IndexView::get_primary`] resolve index values to primary keys.
pub struct IndexView {
    def: IndexDef,
    tx: Transaction,
    backend: BackendHandle,
}

impl IndexView {
    pub(crate) fn new(def: IndexDef, tx: Transaction, backend: BackendHandle) -> Self {
        Self { def, tx, backend }
    }

    /// Returns the index definition.
    #[must_use]
    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Resolves an entry key through overlay then backend.
    fn entry_get(&self, entry: &str) -> CoreResult<Option<String>> {
        let (truncated, modified, removed) = self.tx.index_overlay_parts(&self.def.name);
        if removed.contains(entry) {
            return Ok(None);
        }
        if let Some(primary) = modified.get(entry) {
            return Ok(Some(primary.clone()));
        }
        if truncated {
            return Ok(None);
        }
        match self.backend.get(entry)? {
            Some(value) => Ok(value.as_text().map(str::to_string)),
            None => Ok(None),
        }
    }

    /// Returns all entry keys in `range`, merged and ordered.
    pub fn entry_keys_in(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        let (truncated, modified, removed) = self.tx.index_overlay_parts(&self.def.name);
        let mut merged: BTreeSet<String> = if truncated {
            BTreeSet::new()
        } else {
            self.backend.keys(range)?.into_iter().collect()
        };
        for entry in &removed {
            merged.remove(entry);
        }
        for entry in modified.keys() {
            if range.map_or(true, |r| r.includes(entry)) {
                merged.insert(entry.clone());
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Returns the primary keys mapped under `value`, in primary-key order.
    pub fn primary_keys(&self, value: &Value) -> CoreResult<Vec<String>> {
        let Some(index_key) = value.index_key() else {
            return Ok(Vec::new());
        };
        if self.def.unique {
            Ok(self.entry_get(&index_key)?.into_iter().collect())
        } else {
            let lower = format!("{index_key}{ENTRY_SEPARATOR}");
            let upper = format!("{index_key}{ENTRY_SEPARATOR_END}");
            let range = KeyRange::bound(lower.clone(), upper, false, true);
            let entries = self.entry_keys_in(Some(&range))?;
            Ok(entries
                .into_iter()
                .map(|entry| entry[lower.len()..].to_string())
                .collect())
        }
    }

    /// Returns the first primary key mapped under `value`, if any.
    pub fn get_primary(&self, value: &Value) -> CoreResult<Option<String>> {
        Ok(self.primary_keys(value)?.into_iter().next())
    }

    /// Returns the number of entries whose primary key is `value`-mapped.
    pub fn count_for(&self, value: &Value) -> CoreResult<usize> {
        Ok(self.primary_keys(value)?.len())
    }
}

impl Backend for IndexView {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.entry_get(key)?.map(Value::Text))
    }

    fn keys(&self, range: Option<&KeyRange>) -> CoreResult<Vec<String>> {
        self.entry_keys_in(range)
    }

    fn values(&self, range: Option<&KeyRange>) -> CoreResult<Vec<Value>> {
        let mut values = Vec::new();
        for entry in self.entry_keys_in(range)? {
            if let Some(primary) = self.entry_get(&entry)? {
                values.push(Value::Text(primary));
            }
        }
        Ok(values)
    }

    fn min_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Ok(self.entry_keys_in(range)?.into_iter().next())
    }

    fn max_key(&self, range: Option<&KeyRange>) -> CoreResult<Option<String>> {
        Ok(self.entry_keys_in(range)?.into_iter().next_back())
    }

    fn count(&self, range: Option<&KeyRange>) -> CoreResult<usize> {
        Ok(self.entry_keys_in(range)?.len())
    }

    fn commit(&self, _tx: &Transaction) -> CoreResult<bool> {
        Err(CoreError::invalid_state("index views are read-only"))
    }

    fn abort(&self, _tx: &Transaction) -> CoreResult<()> {
        Err(CoreError::invalid_state("index views are read-only"))
    }

    fn apply_combined(&self, _tx: &Transaction) -> CoreResult<Option<Vec<BatchFragment>>> {
        Err(CoreError::invalid_state("index views are read-only"))
    }

    fn truncate_store(&self) -> CoreResult<()> {
        Err(CoreError::invalid_state("index views are read-only"))
    }

    fn index_defs(&self) -> Vec<IndexDef> {
        Vec::new()
    }

    fn index_store(&self, name: &str) -> CoreResult<BackendHandle> {
        Err(CoreError::index_not_found(name))
    }

    fn database_id(&self) -> u64 {
        self.backend.database_id()
    }

    fn commit_mutex(&self) -> Option<&Mutex<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(unique: bool, multi_entry: bool) -> IndexDef {
        IndexDef {
            name: "by_tag".to_string(),
            key_path: KeyPath::new("tag"),
            unique,
            multi_entry,
        }
    }

    fn doc(tag: Value) -> Value {
        Value::map(vec![("tag".to_string(), tag)])
    }

    #[test]
    fn entry_keys_unique_is_bare_index_key() {
        let entries = entry_keys(&def(true, false), Some(&doc(Value::text("red"))), "k1");
        assert_eq!(entries, vec!["sred".to_string()]);
    }

    #[test]
    fn entry_keys_non_unique_appends_primary() {
        let entries = entry_keys(&def(false, false), Some(&doc(Value::text("red"))), "k1");
        assert_eq!(entries, vec![format!("sred{ENTRY_SEPARATOR}k1")]);
    }

    #[test]
    fn entry_keys_missing_value_is_empty() {
        assert!(entry_keys(&def(false, false), None, "k1").is_empty());
        // Key path does not resolve
        let other = Value::map(vec![("other".to_string(), Value::int(1))]);
        assert!(entry_keys(&def(false, false), Some(&other), "k1").is_empty());
        // Unindexable extract
        assert!(entry_keys(&def(false, false), Some(&doc(Value::Null)), "k1").is_empty());
    }

    #[test]
    fn entry_keys_multi_entry_expands_arrays() {
        let tags = Value::Array(vec![Value::text("a"), Value::text("b"), Value::text("a")]);
        let entries = entry_keys(&def(false, true), Some(&doc(tags)), "k1");
        assert_eq!(
            entries,
            vec![
                format!("sa{ENTRY_SEPARATOR}k1"),
                format!("sb{ENTRY_SEPARATOR}k1"),
            ]
        );
    }

    #[test]
    fn entry_keys_single_entry_ignores_arrays() {
        let tags = Value::Array(vec![Value::text("a")]);
        assert!(entry_keys(&def(false, false), Some(&doc(tags)), "k1").is_empty());
    }

    // === Overlay staging ===

    #[test]
    fn stage_put_retracts_previous_entries() {
        let mut overlay = TransactionIndex::new(def(false, false));
        overlay.stage_put("k1", None, &doc(Value::text("red")));
        overlay.stage_put("k1", Some(&doc(Value::text("red"))), &doc(Value::text("blue")));

        let red = format!("sred{ENTRY_SEPARATOR}k1");
        let blue = format!("sblue{ENTRY_SEPARATOR}k1");
        assert!(overlay.removed.contains(&red));
        assert!(!overlay.modified.contains_key(&red));
        assert_eq!(overlay.modified.get(&blue), Some(&"k1".to_string()));
    }

    #[test]
    fn stage_put_same_value_keeps_entry() {
        let mut overlay = TransactionIndex::new(def(false, false));
        let value = doc(Value::text("red"));
        overlay.stage_put("k1", None, &value);
        overlay.stage_put("k1", Some(&value), &value);

        let red = format!("sred{ENTRY_SEPARATOR}k1");
        assert_eq!(overlay.modified.get(&red), Some(&"k1".to_string()));
        assert!(!overlay.removed.contains(&red));
    }

    #[test]
    fn stage_remove_retracts_entries() {
        let mut overlay = TransactionIndex::new(def(false, false));
        let value = doc(Value::text("red"));
        overlay.stage_put("k1", None, &value);
        overlay.stage_remove("k1", Some(&value));

        let red = format!("sred{ENTRY_SEPARATOR}k1");
        assert!(overlay.modified.is_empty());
        assert!(overlay.removed.contains(&red));
    }

    #[test]
    fn truncate_clears_and_shadows() {
        let mut overlay = TransactionIndex::new(def(false, false));
        overlay.stage_put("k1", None, &doc(Value::text("red")));
        overlay.truncate();

        assert!(overlay.truncated);
        assert!(overlay.modified.is_empty());
        assert!(overlay.removed.is_empty());
    }
}
