//! Ordered key-value storage for tablets: the `KvStore` interface, an
//! in-memory LSM-style implementation, MVCC keys and compaction.

pub mod compaction;
pub mod frontier;
pub mod kv;
pub mod mem_store;
pub mod memtable;
pub mod mvcc_key;

pub use compaction::{
    CompactionFilter, CompactionFilterFactory, CompactionResult, FilterDecision,
    HistoryCutoffFilter, HistoryCutoffFilterFactory, HistoryCutoffProvider,
};
pub use frontier::ConsensusFrontier;
pub use kv::{Checkpoint, FlushFilter, KvStore, StoreStats, WriteBatch};
pub use mem_store::{ImmutableFile, MemKvStore};
pub use memtable::{MemTable, MemtableInfo};
pub use mvcc_key::{resolve_rows, KeyRange, StorageKey, Value, VersionedKey, VisibleRow};
