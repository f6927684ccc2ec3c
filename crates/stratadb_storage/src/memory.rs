//! In-memory ordered engine.

use crate::engine::{bounds_overlap, prefix_upper_bound, BatchOp, KvEngine};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A volatile ordered engine backed by a `BTreeMap`.
///
/// Suitable for unit tests, ephemeral tables, and in-memory databases.
/// All data is lost when the engine is dropped.
///
/// # Thread Safety
///
/// The engine is thread-safe; batches apply under a single write-lock
/// acquisition, so readers never observe a half-applied batch.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    /// Creates a new empty in-memory engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn apply_to(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: &[BatchOp]) {
    for op in batch {
        match op {
            BatchOp::Put { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            BatchOp::Delete { key } => {
                map.remove(key);
            }
            BatchOp::DeletePrefix { prefix } => {
                if prefix.is_empty() {
                    map.clear();
                } else {
                    let doomed: Vec<Vec<u8>> = match prefix_upper_bound(prefix) {
                        Some(upper) => map
                            .range::<Vec<u8>, _>((
                                Bound::Included(prefix.clone()),
                                Bound::Excluded(upper),
                            ))
                            .map(|(k, _)| k.clone())
                            .collect(),
                        None => map
                            .range::<Vec<u8>, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
                            .map(|(k, _)| k.clone())
                            .collect(),
                    };
                    for key in doomed {
                        map.remove(&key);
                    }
                }
            }
        }
    }
}

pub(crate) use apply_to as apply_batch_to_map;

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(Vec::new());
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_keys(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Vec<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(Vec::new());
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn first_key(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Option<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(None);
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn last_key(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Option<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(None);
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    fn count(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> StorageResult<usize> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(0);
        }
        Ok(self.data.read().range::<Vec<u8>, _>((lower, upper)).count())
    }

    fn apply(&self, batch: &[BatchOp]) -> StorageResult<()> {
        let mut map = self.data.write();
        apply_to(&mut map, batch);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing to make durable
        Ok(())
    }

    fn len(&self) -> StorageResult<usize> {
        Ok(self.data.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(k: &[u8], v: &[u8]) -> BatchOp {
        BatchOp::put(k.to_vec(), v.to_vec())
    }

    #[test]
    fn memory_new_is_empty() {
        let engine = MemoryEngine::new();
        assert!(engine.is_empty().unwrap());
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn memory_put_and_get() {
        let engine = MemoryEngine::new();
        engine.apply(&[put(b"a", b"1"), put(b"b", b"2")]).unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.len().unwrap(), 2);
    }

    #[test]
    fn memory_scan_is_ordered() {
        let engine = MemoryEngine::new();
        engine
            .apply(&[put(b"c", b"3"), put(b"a", b"1"), put(b"b", b"2")])
            .unwrap();

        let keys = engine
            .scan_keys(Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn memory_scan_respects_bounds() {
        let engine = MemoryEngine::new();
        engine
            .apply(&[put(b"a", b"1"), put(b"b", b"2"), put(b"c", b"3")])
            .unwrap();

        let keys = engine
            .scan_keys(
                Bound::Excluded(b"a".to_vec()),
                Bound::Included(b"c".to_vec()),
            )
            .unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn memory_inverted_bounds_are_empty() {
        let engine = MemoryEngine::new();
        engine.apply(&[put(b"a", b"1")]).unwrap();

        let keys = engine
            .scan_keys(
                Bound::Included(b"z".to_vec()),
                Bound::Excluded(b"a".to_vec()),
            )
            .unwrap();
        assert!(keys.is_empty());
        assert_eq!(
            engine
                .count(
                    Bound::Excluded(b"a".to_vec()),
                    Bound::Excluded(b"a".to_vec())
                )
                .unwrap(),
            0
        );
    }

    #[test]
    fn memory_first_and_last_key() {
        let engine = MemoryEngine::new();
        engine
            .apply(&[put(b"a", b"1"), put(b"b", b"2"), put(b"c", b"3")])
            .unwrap();

        assert_eq!(
            engine.first_key(Bound::Unbounded, Bound::Unbounded).unwrap(),
            Some(b"a".to_vec())
        );
        assert_eq!(
            engine.last_key(Bound::Unbounded, Bound::Unbounded).unwrap(),
            Some(b"c".to_vec())
        );
        assert_eq!(
            engine
                .last_key(Bound::Unbounded, Bound::Excluded(b"c".to_vec()))
                .unwrap(),
            Some(b"b".to_vec())
        );
    }

    #[test]
    fn memory_delete() {
        let engine = MemoryEngine::new();
        engine.apply(&[put(b"a", b"1")]).unwrap();
        engine.apply(&[BatchOp::delete(b"a".to_vec())]).unwrap();

        assert_eq!(engine.get(b"a").unwrap(), None);
        // Deleting again is a no-op
        engine.apply(&[BatchOp::delete(b"a".to_vec())]).unwrap();
    }

    #[test]
    fn memory_delete_prefix() {
        let engine = MemoryEngine::new();
        engine
            .apply(&[put(b"!t!a", b"1"), put(b"!t!b", b"2"), put(b"!u!a", b"3")])
            .unwrap();

        engine
            .apply(&[BatchOp::delete_prefix(b"!t!".to_vec())])
            .unwrap();

        assert_eq!(engine.get(b"!t!a").unwrap(), None);
        assert_eq!(engine.get(b"!t!b").unwrap(), None);
        assert_eq!(engine.get(b"!u!a").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn memory_delete_empty_prefix_clears_all() {
        let engine = MemoryEngine::new();
        engine.apply(&[put(b"a", b"1"), put(b"b", b"2")]).unwrap();

        engine.apply(&[BatchOp::delete_prefix(Vec::new())]).unwrap();
        assert!(engine.is_empty().unwrap());
    }

    #[test]
    fn memory_batch_ops_apply_in_order() {
        let engine = MemoryEngine::new();
        engine.apply(&[put(b"!t!a", b"old")]).unwrap();

        // Truncate then re-insert inside one batch
        engine
            .apply(&[
                BatchOp::delete_prefix(b"!t!".to_vec()),
                put(b"!t!b", b"new"),
            ])
            .unwrap();

        assert_eq!(engine.get(b"!t!a").unwrap(), None);
        assert_eq!(engine.get(b"!t!b").unwrap(), Some(b"new".to_vec()));
    }
}
