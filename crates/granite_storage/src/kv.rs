//! Ordered key-value store interface used by tablets.

use std::collections::BTreeMap;
use std::sync::Arc;

use granite_common::error::GraniteResult;
use granite_common::{HybridTime, OpId};

use crate::compaction::CompactionFilterFactory;
use crate::frontier::ConsensusFrontier;
use crate::memtable::MemtableInfo;
use crate::mvcc_key::{KeyRange, StorageKey, Value, VersionedKey};

/// Decides whether a memtable may be flushed. `Ok(false)` postpones the
/// flush, an error rejects it.
pub type FlushFilter = Arc<dyn Fn(&MemtableInfo) -> GraniteResult<bool> + Send + Sync>;

/// Atomic set of writes tagged with one hybrid time.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub hybrid_time: HybridTime,
    pub entries: Vec<(StorageKey, Value)>,
    /// Op id and hybrid time of the replicated op that produced the batch.
    pub frontier: Option<(OpId, HybridTime)>,
    /// Committed history cutoff to record in the frontier.
    pub history_cutoff: Option<HybridTime>,
}

impl WriteBatch {
    pub fn new(hybrid_time: HybridTime) -> Self {
        WriteBatch {
            hybrid_time,
            entries: Vec::new(),
            frontier: None,
            history_cutoff: None,
        }
    }

    pub fn with_frontier(mut self, op_id: OpId, ht: HybridTime) -> Self {
        self.frontier = Some((op_id, ht));
        self
    }

    pub fn put(&mut self, key: StorageKey, value: granite_common::datum::Datum) {
        self.entries.push((key, Value::Put(value)));
    }

    pub fn delete(&mut self, key: StorageKey) {
        self.entries.push((key, Value::Tombstone));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Immutable copy of a store's contents.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub entries: BTreeMap<VersionedKey, Value>,
    pub frontier: Option<ConsensusFrontier>,
}

impl Checkpoint {
    pub fn scan(&self, range: &KeyRange, read_time: HybridTime) -> Vec<(VersionedKey, Value)> {
        self.entries
            .range(VersionedKey::row_start(&range.start)..)
            .take_while(|(k, _)| range.end.as_deref().map_or(true, |end| k.row.as_slice() < end))
            .filter(|(k, _)| k.ht <= read_time)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub memtable_entries: u64,
    pub memtable_bytes: u64,
    pub files: usize,
    pub file_entries: u64,
    /// Bytes held by immutable files.
    pub on_disk_bytes: u64,
    pub flushes: u64,
    pub compactions: u64,
}

pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    fn apply_write_batch(&self, batch: WriteBatch) -> GraniteResult<()>;

    /// All versions in `range` written at or before `read_time`, newest first
    /// within each cell.
    fn iter(&self, range: &KeyRange, read_time: HybridTime) -> GraniteResult<Vec<(VersionedKey, Value)>>;

    /// Largest op id covered by flushed data. Writes above it are lost on a
    /// crash and replayed from the log.
    fn max_persistent_op_id(&self) -> OpId;

    fn flush(&self) -> GraniteResult<()>;

    /// Merge every immutable file into one, waiting for the result.
    fn compact(&self) -> GraniteResult<()>;

    fn set_flush_filter(&self, filter: FlushFilter);

    fn set_compaction_filter_factory(&self, factory: Arc<dyn CompactionFilterFactory>);

    fn enable_compactions(&self);

    /// Drop all data, keeping the op ids already covered plus `frontier`.
    fn truncate(&self, frontier: Option<(OpId, HybridTime)>) -> GraniteResult<()>;

    fn checkpoint(&self) -> GraniteResult<Checkpoint>;

    fn file_frontiers(&self) -> Vec<ConsensusFrontier>;

    fn start_shutdown(&self);

    fn shutdown(&self);

    fn stats(&self) -> StoreStats;
}
