//! Memtable: the sorted in-memory write buffer of a store.
//!
//! All batches land in the active memtable together with the op id and
//! hybrid time that produced them. A flush freezes the memtable and turns it
//! into an immutable file carrying the same frontier.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::frontier::ConsensusFrontier;
use crate::mvcc_key::{KeyRange, Value, VersionedKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemTableError {
    #[error("memtable is frozen")]
    Frozen,
}

/// What a flush filter gets to see of a memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemtableInfo {
    pub entries: u64,
    pub approx_bytes: u64,
    pub frontier: Option<ConsensusFrontier>,
}

pub struct MemTable {
    map: RwLock<BTreeMap<VersionedKey, Value>>,
    frontier: RwLock<Option<ConsensusFrontier>>,
    approx_bytes: AtomicU64,
    entry_count: AtomicU64,
    frozen: AtomicBool,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            frontier: RwLock::new(None),
            approx_bytes: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Insert a batch of versions and widen the frontier. Versions are
    /// immutable, so re-inserting a key only replaces an identical version.
    pub fn insert_batch(
        &self,
        entries: Vec<(VersionedKey, Value)>,
        frontier: Option<ConsensusFrontier>,
    ) -> Result<(), MemTableError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(MemTableError::Frozen);
        }
        let mut map = self.map.write();
        for (key, value) in entries {
            let size = (key.row.len() + 16 + value.approx_size()) as u64;
            if map.insert(key, value).is_none() {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                self.approx_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        if let Some(f) = frontier {
            let mut current = self.frontier.write();
            match current.as_mut() {
                Some(existing) => existing.merge(&f),
                None => *current = Some(f),
            }
        }
        Ok(())
    }

    /// Versions in `range` with `ht <= read_time`, in key order.
    pub fn scan(&self, range: &KeyRange, read_time: granite_common::HybridTime) -> Vec<(VersionedKey, Value)> {
        let map = self.map.read();
        map.range(VersionedKey::row_start(&range.start)..)
            .take_while(|(k, _)| range.end.as_deref().map_or(true, |end| k.row.as_slice() < end))
            .filter(|(k, _)| k.ht <= read_time)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count.load(Ordering::Relaxed) == 0
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn frontier(&self) -> Option<ConsensusFrontier> {
        *self.frontier.read()
    }

    pub fn info(&self) -> MemtableInfo {
        MemtableInfo {
            entries: self.entry_count(),
            approx_bytes: self.approx_bytes(),
            frontier: self.frontier(),
        }
    }

    /// Copy of the sorted contents, used when the memtable becomes a file.
    pub fn snapshot_entries(&self) -> BTreeMap<VersionedKey, Value> {
        self.map.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_common::datum::Datum;
    use granite_common::types::ColumnId;
    use granite_common::{HybridTime, OpId};

    use crate::mvcc_key::StorageKey;

    fn put(row: &str, t: u64, v: i64) -> (VersionedKey, Value) {
        (
            VersionedKey::new(StorageKey::column(row, ColumnId(1)), HybridTime::from_micros(t), 0),
            Value::Put(Datum::Int64(v)),
        )
    }

    #[test]
    fn test_insert_tracks_size_and_frontier() {
        let mt = MemTable::new();
        assert!(mt.is_empty());
        let f = ConsensusFrontier::new(OpId::new(1, 2), HybridTime::from_micros(10));
        mt.insert_batch(vec![put("a", 10, 1), put("b", 10, 2)], Some(f)).unwrap();
        let f2 = ConsensusFrontier::new(OpId::new(1, 3), HybridTime::from_micros(20));
        mt.insert_batch(vec![put("a", 20, 3)], Some(f2)).unwrap();
        assert_eq!(mt.entry_count(), 3);
        assert!(mt.approx_bytes() > 0);
        let frontier = mt.frontier().unwrap();
        assert_eq!(frontier.op_id_min, OpId::new(1, 2));
        assert_eq!(frontier.op_id_max, OpId::new(1, 3));
    }

    #[test]
    fn test_scan_respects_range_and_read_time() {
        let mt = MemTable::new();
        mt.insert_batch(vec![put("a", 10, 1), put("a", 20, 2), put("b", 5, 3), put("c", 5, 4)], None)
            .unwrap();
        let got = mt.scan(&KeyRange::new("a", Some(b"c".to_vec())), HybridTime::from_micros(15));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1, Value::Put(Datum::Int64(1)));
        assert_eq!(got[1].0.row, b"b".to_vec());
    }

    #[test]
    fn test_frozen_rejects_writes() {
        let mt = MemTable::new();
        mt.freeze();
        assert_eq!(mt.insert_batch(vec![put("a", 1, 1)], None), Err(MemTableError::Frozen));
    }
}
