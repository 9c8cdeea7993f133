//! The storage side of a tablet: two KV stores (regular and intents), the
//! tablet metadata, and the prepare/apply logic of every operation kind.
//!
//! `prepare` runs on the prepare pool before an operation reaches the log
//! (leader) or before it may be applied (replica). `apply` runs on the
//! tablet's apply thread, in commit order, and must be idempotent: log
//! replay re-applies entries whose effects may already be stored.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use granite_common::config::{GraniteConfig, TabletConfig};
use granite_common::datum::Datum;
use granite_common::error::{GraniteError, GraniteResult};
use granite_common::schema::Schema;
use granite_common::types::{ColumnId, TableId, TabletId, TransactionId};
use granite_common::{bail_invalid_argument, HybridTime, OpId};
use granite_executor::PriorityThreadPool;
use granite_storage::{
    resolve_rows, Checkpoint, FlushFilter, HistoryCutoffFilterFactory, KeyRange, KvStore, MemKvStore,
    StorageKey, Value, VersionedKey, VisibleRow, WriteBatch,
};

use crate::locks::{RowLockManager, WritePermits};
use crate::operation::{
    ChangeMetadataRequest, Operation, OperationRequest, RowOpKind, SnapshotOperation, SnapshotRequest,
    SplitRequest, TransactionStatus, UpdateTransactionRequest, WriteRequest,
};
use crate::retention::HistoryRetentionPolicy;

/// Columns of a transaction record on a transaction status tablet.
pub const TXN_STATUS_COLUMN: ColumnId = ColumnId(1);
pub const TXN_COMMIT_HT_COLUMN: ColumnId = ColumnId(2);

// ── Metadata ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    Regular,
    /// Holds the coordinator records of distributed transactions.
    TransactionStatus,
}

/// Half-open key range `[start, end)` owned by a tablet. An empty bound is
/// unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Partition {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Partition {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    /// True if splitting at `key` leaves both halves non-empty.
    pub fn strictly_contains(&self, key: &[u8]) -> bool {
        key > self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start.clone(), (!self.end.is_empty()).then(|| self.end.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletDataState {
    Ready,
    SplitCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRecord {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    pub split_key: Vec<u8>,
    pub children: [TabletId; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub table_name: String,
    pub table_type: TableType,
    pub schema: Schema,
    pub partition: Partition,
    pub data_state: TabletDataState,
    pub split: Option<SplitRecord>,
}

impl TabletMetadata {
    pub fn new(tablet_id: TabletId, table_id: TableId, schema: Schema) -> Self {
        TabletMetadata {
            table_name: table_id.as_str().to_string(),
            tablet_id,
            table_id,
            table_type: TableType::Regular,
            schema,
            partition: Partition::default(),
            data_state: TabletDataState::Ready,
            split: None,
        }
    }

    pub fn with_table_type(mut self, table_type: TableType) -> Self {
        self.table_type = table_type;
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }
}

/// Receives committed splits; creating the child tablets is its business.
pub trait TabletSplitter: Send + Sync {
    fn apply_split(&self, parent: &TabletId, split: &SplitRecord) -> GraniteResult<()>;
}

// ── Read results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRow {
    pub key: Vec<u8>,
    /// Projected columns, in projection order.
    pub columns: Vec<(String, Datum)>,
}

impl ReadRow {
    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub struct TabletSnapshot {
    pub snapshot_id: String,
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    pub checkpoint: Checkpoint,
}

// ── Tablet ─────────────────────────────────────────────────────────────────

pub struct Tablet {
    tablet_id: TabletId,
    metadata: RwLock<TabletMetadata>,
    regular: Arc<dyn KvStore>,
    intents: Arc<dyn KvStore>,
    row_locks: Arc<RowLockManager>,
    write_permits: Arc<WritePermits>,
    retention: Arc<HistoryRetentionPolicy>,
    snapshots: Mutex<BTreeMap<String, TabletSnapshot>>,
    monotonic_counter: AtomicU64,
    write_pause_timeout: Duration,
    splitter: RwLock<Option<Arc<dyn TabletSplitter>>>,
}

impl Tablet {
    pub fn new(
        metadata: TabletMetadata,
        regular: Arc<dyn KvStore>,
        intents: Arc<dyn KvStore>,
        retention: Arc<HistoryRetentionPolicy>,
        config: &TabletConfig,
    ) -> Arc<Self> {
        regular.set_compaction_filter_factory(HistoryCutoffFilterFactory::new(retention.clone()));
        Arc::new(Self {
            tablet_id: metadata.tablet_id.clone(),
            metadata: RwLock::new(metadata),
            regular,
            intents,
            row_locks: RowLockManager::new(),
            write_permits: WritePermits::new(),
            retention,
            snapshots: Mutex::new(BTreeMap::new()),
            monotonic_counter: AtomicU64::new(0),
            write_pause_timeout: Duration::from_millis(config.write_pause_timeout_ms),
            splitter: RwLock::new(None),
        })
    }

    /// Tablet over fresh in-memory stores whose compactions run on `pool`.
    pub fn in_memory(
        metadata: TabletMetadata,
        config: &GraniteConfig,
        pool: Option<Arc<PriorityThreadPool>>,
    ) -> Arc<Self> {
        let id = metadata.tablet_id.clone();
        let regular = MemKvStore::new(format!("{id}-regular"), config.storage.clone(), pool.clone());
        let intents = MemKvStore::new(format!("{id}-intents"), config.storage.clone(), pool);
        let retention = Arc::new(HistoryRetentionPolicy::new(&config.retention));
        Tablet::new(metadata, regular, intents, retention, &config.tablet)
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn metadata(&self) -> TabletMetadata {
        self.metadata.read().clone()
    }

    pub fn schema(&self) -> Schema {
        self.metadata.read().schema.clone()
    }

    pub fn table_type(&self) -> TableType {
        self.metadata.read().table_type
    }

    pub fn data_state(&self) -> TabletDataState {
        self.metadata.read().data_state
    }

    pub fn split_record(&self) -> Option<SplitRecord> {
        self.metadata.read().split.clone()
    }

    pub fn set_splitter(&self, splitter: Arc<dyn TabletSplitter>) {
        *self.splitter.write() = Some(splitter);
    }

    pub fn retention(&self) -> &Arc<HistoryRetentionPolicy> {
        &self.retention
    }

    pub fn regular_db(&self) -> &Arc<dyn KvStore> {
        &self.regular
    }

    pub fn intents_db(&self) -> &Arc<dyn KvStore> {
        &self.intents
    }

    pub fn row_locks(&self) -> &Arc<RowLockManager> {
        &self.row_locks
    }

    pub fn write_permits(&self) -> &Arc<WritePermits> {
        &self.write_permits
    }

    pub fn monotonic_counter(&self) -> u64 {
        self.monotonic_counter.load(Ordering::Acquire)
    }

    pub fn update_monotonic_counter(&self, value: u64) {
        self.monotonic_counter.fetch_max(value, Ordering::AcqRel);
    }

    /// Flushed op ids of the regular and intents stores.
    pub fn max_persistent_op_ids(&self) -> (OpId, OpId) {
        (self.regular.max_persistent_op_id(), self.intents.max_persistent_op_id())
    }

    /// Highest op index whose effects survive a crash in both stores.
    pub fn persistent_floor(&self) -> u64 {
        let (regular, intents) = self.max_persistent_op_ids();
        regular.index.min(intents.index)
    }

    pub fn set_flush_filter(&self, filter: FlushFilter) {
        self.regular.set_flush_filter(filter.clone());
        self.intents.set_flush_filter(filter);
    }

    pub fn enable_compactions(&self) {
        self.regular.enable_compactions();
        self.intents.enable_compactions();
    }

    pub fn flush(&self) -> GraniteResult<()> {
        self.intents.flush()?;
        self.regular.flush()
    }

    pub fn compact(&self) -> GraniteResult<()> {
        self.regular.compact()?;
        self.intents.compact()
    }

    pub fn on_disk_size(&self) -> u64 {
        self.regular.stats().on_disk_bytes + self.intents.stats().on_disk_bytes
    }

    pub fn start_shutdown(&self) {
        self.regular.start_shutdown();
        self.intents.start_shutdown();
    }

    pub fn shutdown(&self) {
        self.regular.shutdown();
        self.intents.shutdown();
    }

    // ── Prepare ────────────────────────────────────────────────────────────

    /// Validate `op` and take the locks it holds until completion. Replicas
    /// skip validation: the leader already did it and the entry is in the
    /// log.
    pub fn prepare(&self, op: &mut Operation, leader: bool, deadline: Instant) -> GraniteResult<()> {
        match op.request().clone() {
            OperationRequest::Write(w) if leader => self.prepare_write(op, &w, deadline),
            OperationRequest::ChangeMetadata(c) => self.prepare_change_metadata(op, &c, leader),
            OperationRequest::UpdateTransaction(u) if leader => self.check_update_transaction(&u),
            OperationRequest::Snapshot(s) if leader => self.check_snapshot(&s),
            OperationRequest::Split(s) if leader => self.check_split(&s),
            _ => Ok(()),
        }
    }

    fn prepare_write(&self, op: &mut Operation, w: &WriteRequest, deadline: Instant) -> GraniteResult<()> {
        {
            let meta = self.metadata.read();
            if meta.data_state != TabletDataState::Ready {
                return Err(GraniteError::IllegalState(format!(
                    "tablet {} has been split",
                    self.tablet_id
                )));
            }
            if w.schema_version != meta.schema.version {
                bail_invalid_argument!(
                    "schema version mismatch: request {}, tablet {}",
                    w.schema_version,
                    meta.schema.version
                );
            }
            for row in &w.rows {
                if !meta.partition.contains(&row.key) {
                    bail_invalid_argument!("row key {:?} is outside the tablet partition", row.key);
                }
                for (column_id, value) in &row.columns {
                    let Some(column) = meta.schema.column_by_id(*column_id) else {
                        bail_invalid_argument!("unknown column {column_id}");
                    };
                    meta.schema
                        .check_value(column, value)
                        .map_err(GraniteError::InvalidArgument)?;
                }
            }
        }

        op.write_permit = Some(self.write_permits.acquire(deadline)?);
        op.row_locks = Some(self.row_locks.lock(w.rows.iter().map(|r| r.key.clone()), deadline)?);

        let mut inserted = HashSet::new();
        for row in w.rows.iter().filter(|r| r.kind == RowOpKind::Insert) {
            if !inserted.insert(row.key.as_slice()) || self.row_exists(&row.key)? {
                return Err(GraniteError::AlreadyPresent(format!(
                    "row {:?} already exists",
                    String::from_utf8_lossy(&row.key)
                )));
            }
        }
        Ok(())
    }

    fn row_exists(&self, key: &[u8]) -> GraniteResult<bool> {
        let versions = self.regular.iter(&KeyRange::single(key), HybridTime::MAX)?;
        Ok(!resolve_rows(versions).is_empty())
    }

    fn prepare_change_metadata(&self, op: &mut Operation, c: &ChangeMetadataRequest, leader: bool) -> GraniteResult<()> {
        let current = self.schema();
        let requested = &c.schema;
        if requested.version > current.version {
            if leader {
                op.write_permit = Some(self.write_permits.pause(Instant::now() + self.write_pause_timeout)?);
            }
            return Ok(());
        }
        if !leader {
            debug!(
                tablet_id = %self.tablet_id,
                requested = requested.version,
                current = current.version,
                "replicated schema change already installed"
            );
            op.is_noop = true;
            return Ok(());
        }
        if requested.version < current.version {
            bail_invalid_argument!(
                "schema version {} is older than the current version {}",
                requested.version,
                current.version
            );
        }
        if !requested.same_columns(&current) {
            return Err(GraniteError::Corruption(format!(
                "schema version {} already installed with different columns: {current} vs {requested}",
                current.version
            )));
        }
        op.is_noop = true;
        Ok(())
    }

    fn check_update_transaction(&self, u: &UpdateTransactionRequest) -> GraniteResult<()> {
        if self.table_type() == TableType::TransactionStatus {
            return Ok(());
        }
        match u.status {
            TransactionStatus::Pending => {
                bail_invalid_argument!("PENDING is only recorded on a transaction status tablet")
            }
            TransactionStatus::Committed { commit_ht } if !commit_ht.is_valid() => {
                bail_invalid_argument!("commit of {} without a commit time", u.transaction_id)
            }
            _ => Ok(()),
        }
    }

    fn check_snapshot(&self, s: &SnapshotRequest) -> GraniteResult<()> {
        let snapshots = self.snapshots.lock();
        match s.operation {
            SnapshotOperation::Create if snapshots.contains_key(&s.snapshot_id) => Err(
                GraniteError::AlreadyPresent(format!("snapshot {} already exists", s.snapshot_id)),
            ),
            SnapshotOperation::Delete if !snapshots.contains_key(&s.snapshot_id) => Err(
                GraniteError::NotFound(format!("snapshot {} does not exist", s.snapshot_id)),
            ),
            SnapshotOperation::Restore => {
                bail_invalid_argument!("restoring snapshot {} is not supported", s.snapshot_id)
            }
            _ => Ok(()),
        }
    }

    fn check_split(&self, s: &SplitRequest) -> GraniteResult<()> {
        let meta = self.metadata.read();
        if meta.data_state == TabletDataState::SplitCompleted {
            return Err(GraniteError::AlreadyPresent(format!(
                "tablet {} is already split",
                self.tablet_id
            )));
        }
        if !meta.partition.strictly_contains(&s.split_key) {
            bail_invalid_argument!("split key {:?} is not inside the tablet partition", s.split_key);
        }
        if s.children[0] == s.children[1] {
            bail_invalid_argument!("split children must differ");
        }
        Ok(())
    }

    // ── Apply ──────────────────────────────────────────────────────────────

    /// Apply a committed operation at its op id and hybrid time.
    pub fn apply(&self, op: &Operation) -> GraniteResult<()> {
        let op_id = op.op_id();
        let ht = op.hybrid_time();
        if !op_id.is_valid() || !ht.is_valid() {
            return Err(GraniteError::internal_bug(
                "APPLY_WITHOUT_OP_ID",
                format!("{} applied at {op_id} / {ht}", op.kind()),
            ));
        }
        match op.request() {
            OperationRequest::Write(w) => self.apply_write(w, op_id, ht),
            OperationRequest::ChangeMetadata(c) => {
                if !op.is_noop {
                    self.install_schema(&c.schema);
                }
                self.apply_frontier_only(op_id, ht)
            }
            OperationRequest::UpdateTransaction(u) => self.apply_update_transaction(u, op_id, ht),
            OperationRequest::Truncate => {
                self.regular.truncate(Some((op_id, ht)))?;
                self.intents.truncate(Some((op_id, ht)))?;
                info!(tablet_id = %self.tablet_id, %op_id, "tablet truncated");
                Ok(())
            }
            OperationRequest::Snapshot(s) => self.apply_snapshot(s, op_id, ht),
            OperationRequest::HistoryCutoff(h) => {
                self.retention.set_committed_history_cutoff(h.cutoff);
                let mut batch = WriteBatch::new(ht).with_frontier(op_id, ht);
                batch.history_cutoff = Some(h.cutoff);
                self.regular.apply_write_batch(batch)?;
                self.intents
                    .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht))
            }
            OperationRequest::Split(s) => self.apply_split(s, op_id, ht),
            OperationRequest::Empty { .. } => Ok(()),
        }
    }

    fn apply_frontier_only(&self, op_id: OpId, ht: HybridTime) -> GraniteResult<()> {
        self.regular
            .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht))?;
        self.intents
            .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht))
    }

    fn apply_write(&self, w: &WriteRequest, op_id: OpId, ht: HybridTime) -> GraniteResult<()> {
        let mut batch = WriteBatch::new(ht).with_frontier(op_id, ht);
        for row in &w.rows {
            match row.kind {
                RowOpKind::Insert | RowOpKind::Upsert => {
                    batch.put(StorageKey::row_marker(row.key.clone()), Datum::Null);
                    for (column, value) in &row.columns {
                        batch.put(StorageKey::column(row.key.clone(), *column), value.clone());
                    }
                }
                RowOpKind::Delete => batch.delete(StorageKey::row_marker(row.key.clone())),
            }
        }
        let Some(txn) = w.transaction else {
            self.regular.apply_write_batch(batch)?;
            return self
                .intents
                .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht));
        };

        let mut intents = WriteBatch::new(ht).with_frontier(op_id, ht);
        for (key, value) in batch.entries {
            let encoded = bincode::serialize(&value)
                .map_err(|e| GraniteError::internal_bug("ENCODE_INTENT", e.to_string()))?;
            intents.put(intent_key(txn, &key), Datum::Bytes(encoded));
        }
        self.intents.apply_write_batch(intents)?;
        self.regular
            .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht))
    }

    fn install_schema(&self, schema: &Schema) {
        let mut meta = self.metadata.write();
        if schema.version > meta.schema.version {
            info!(
                tablet_id = %self.tablet_id,
                from = meta.schema.version,
                to = schema.version,
                "schema changed"
            );
            meta.schema = schema.clone();
        }
    }

    fn apply_update_transaction(&self, u: &UpdateTransactionRequest, op_id: OpId, ht: HybridTime) -> GraniteResult<()> {
        if self.table_type() == TableType::TransactionStatus {
            let key = u.transaction_id.0.to_be_bytes().to_vec();
            let mut batch = WriteBatch::new(ht).with_frontier(op_id, ht);
            batch.put(StorageKey::row_marker(key.clone()), Datum::Null);
            batch.put(
                StorageKey::column(key.clone(), TXN_STATUS_COLUMN),
                Datum::Text(u.status.as_str().into()),
            );
            if let TransactionStatus::Committed { commit_ht } = u.status {
                batch.put(
                    StorageKey::column(key, TXN_COMMIT_HT_COLUMN),
                    Datum::Int64(commit_ht.to_raw() as i64),
                );
            }
            self.regular.apply_write_batch(batch)?;
            return self
                .intents
                .apply_write_batch(WriteBatch::new(ht).with_frontier(op_id, ht));
        }

        let commit_ht = match u.status {
            TransactionStatus::Pending => return self.apply_frontier_only(op_id, ht),
            TransactionStatus::Committed { commit_ht } => Some(commit_ht),
            TransactionStatus::Aborted => None,
        };
        // read below the op's own time so a replay still finds the intents
        let intents = self.pending_intents(u.transaction_id, ht.decremented())?;
        let mut cleanup = WriteBatch::new(ht).with_frontier(op_id, ht);
        let mut regular = WriteBatch::new(commit_ht.unwrap_or(ht)).with_frontier(op_id, ht);
        for (key, value) in intents {
            if commit_ht.is_some() {
                regular.entries.push((strip_intent_prefix(&key), value));
            }
            cleanup.delete(key);
        }
        debug!(
            tablet_id = %self.tablet_id,
            transaction = %u.transaction_id,
            status = u.status.as_str(),
            intents = cleanup.len(),
            "resolving transaction intents"
        );
        self.regular.apply_write_batch(regular)?;
        self.intents.apply_write_batch(cleanup)
    }

    /// Newest live intent per cell of `txn`, as visible at `read_time`.
    fn pending_intents(&self, txn: TransactionId, read_time: HybridTime) -> GraniteResult<Vec<(StorageKey, Value)>> {
        let versions = self.intents.iter(&intent_range(txn), read_time)?;
        let mut out = Vec::new();
        let mut last: Option<VersionedKey> = None;
        for (key, value) in versions {
            if last.as_ref().is_some_and(|l| l.same_cell(&key)) {
                continue;
            }
            // a tombstone as the newest version means the intent was resolved
            if let Value::Put(Datum::Bytes(encoded)) = &value {
                let decoded: Value = bincode::deserialize(encoded)
                    .map_err(|e| GraniteError::Corruption(format!("undecodable intent: {e}")))?;
                out.push((key.storage_key(), decoded));
            }
            last = Some(key);
        }
        Ok(out)
    }

    fn apply_snapshot(&self, s: &SnapshotRequest, op_id: OpId, ht: HybridTime) -> GraniteResult<()> {
        match s.operation {
            SnapshotOperation::Create => {
                let checkpoint = self.regular.checkpoint()?;
                self.snapshots.lock().insert(
                    s.snapshot_id.clone(),
                    TabletSnapshot {
                        snapshot_id: s.snapshot_id.clone(),
                        op_id,
                        hybrid_time: ht,
                        checkpoint,
                    },
                );
                info!(tablet_id = %self.tablet_id, snapshot_id = %s.snapshot_id, %ht, "snapshot created");
            }
            SnapshotOperation::Delete => {
                self.snapshots.lock().remove(&s.snapshot_id);
            }
            SnapshotOperation::Restore => {
                warn!(tablet_id = %self.tablet_id, snapshot_id = %s.snapshot_id, "ignoring replicated restore");
            }
        }
        self.apply_frontier_only(op_id, ht)
    }

    fn apply_split(&self, s: &SplitRequest, op_id: OpId, ht: HybridTime) -> GraniteResult<()> {
        let record = SplitRecord {
            op_id,
            hybrid_time: ht,
            split_key: s.split_key.clone(),
            children: s.children.clone(),
        };
        let first_time = {
            let mut meta = self.metadata.write();
            let first_time = meta.split.as_ref().map(|r| r.op_id) != Some(op_id);
            meta.split = Some(record.clone());
            meta.data_state = TabletDataState::SplitCompleted;
            first_time
        };
        self.apply_frontier_only(op_id, ht)?;
        info!(
            tablet_id = %self.tablet_id,
            %op_id,
            left = %record.children[0],
            right = %record.children[1],
            "tablet split"
        );
        let splitter = self.splitter.read().clone();
        match splitter {
            Some(splitter) if first_time => splitter.apply_split(&self.tablet_id, &record),
            _ => Ok(()),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    /// Rows in `range` visible at `read_time`, projected to `projection`
    /// (all columns when `None`).
    pub fn read(&self, range: &KeyRange, projection: Option<&[String]>, read_time: HybridTime) -> GraniteResult<Vec<ReadRow>> {
        let schema = self.schema();
        let columns: Vec<(String, ColumnId)> = match projection {
            None => schema.columns.iter().map(|c| (c.name.clone(), c.id)).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    schema
                        .column_by_name(name)
                        .map(|c| (c.name.clone(), c.id))
                        .ok_or_else(|| GraniteError::InvalidArgument(format!("unknown column {name}")))
                })
                .collect::<GraniteResult<_>>()?,
        };
        let rows = resolve_rows(self.regular.iter(range, read_time)?);
        Ok(rows.into_iter().map(|row| project(row, &columns)).collect())
    }

    /// Rows of snapshot `snapshot_id` in `range`.
    pub fn read_snapshot(&self, snapshot_id: &str, range: &KeyRange) -> GraniteResult<Vec<ReadRow>> {
        let snapshots = self.snapshots.lock();
        let snapshot = snapshots
            .get(snapshot_id)
            .ok_or_else(|| GraniteError::NotFound(format!("snapshot {snapshot_id} does not exist")))?;
        let schema = self.schema();
        let columns: Vec<_> = schema.columns.iter().map(|c| (c.name.clone(), c.id)).collect();
        let rows = resolve_rows(snapshot.checkpoint.scan(range, snapshot.hybrid_time));
        Ok(rows.into_iter().map(|row| project(row, &columns)).collect())
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshots.lock().keys().cloned().collect()
    }

    /// Status recorded for `txn` on a transaction status tablet.
    pub fn transaction_status(&self, txn: TransactionId, read_time: HybridTime) -> GraniteResult<Option<String>> {
        let key = txn.0.to_be_bytes();
        let rows = resolve_rows(self.regular.iter(&KeyRange::single(&key), read_time)?);
        Ok(rows
            .first()
            .and_then(|r| r.columns.get(&TXN_STATUS_COLUMN))
            .and_then(|d| d.as_text().map(str::to_string)))
    }

    /// CRC32 over every visible row at `read_time`, plus the row count.
    pub fn checksum(&self, read_time: HybridTime) -> GraniteResult<(u32, u64)> {
        let rows = resolve_rows(self.regular.iter(&KeyRange::all(), read_time)?);
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::new();
        for row in &rows {
            buf.clear();
            buf.extend_from_slice(&(row.key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&row.key);
            for (column, value) in &row.columns {
                buf.extend_from_slice(&column.0.to_le_bytes());
                value.checksum_bytes(&mut buf);
            }
            hasher.update(&buf);
        }
        Ok((hasher.finalize(), rows.len() as u64))
    }

    /// Rows of `range` visible at `read_time` as one batch, without a
    /// frontier. Seeds the stores of a split child.
    pub fn rows_as_batch(&self, range: &KeyRange, read_time: HybridTime) -> GraniteResult<WriteBatch> {
        let mut batch = WriteBatch::new(read_time);
        for row in resolve_rows(self.regular.iter(range, read_time)?) {
            batch.put(StorageKey::row_marker(row.key.clone()), Datum::Null);
            for (column, value) in row.columns {
                batch.put(StorageKey::column(row.key.clone(), column), value);
            }
        }
        Ok(batch)
    }

    /// Middle row key, splitting the visible rows in two halves.
    pub fn split_key(&self) -> GraniteResult<Vec<u8>> {
        let rows = resolve_rows(self.regular.iter(&KeyRange::all(), HybridTime::MAX)?);
        if rows.len() < 2 {
            return Err(GraniteError::IllegalState(format!(
                "tablet {} has {} row(s), too few to split",
                self.tablet_id,
                rows.len()
            )));
        }
        Ok(rows[rows.len() / 2].key.clone())
    }
}

fn project(row: VisibleRow, columns: &[(String, ColumnId)]) -> ReadRow {
    ReadRow {
        columns: columns
            .iter()
            .map(|(name, id)| (name.clone(), row.columns.get(id).cloned().unwrap_or(Datum::Null)))
            .collect(),
        key: row.key,
    }
}

const INTENT_PREFIX_LEN: usize = 16;

fn intent_key(txn: TransactionId, key: &StorageKey) -> StorageKey {
    let mut row = txn.0.to_be_bytes().to_vec();
    row.extend_from_slice(&key.row);
    StorageKey {
        row,
        column: key.column,
    }
}

fn strip_intent_prefix(key: &StorageKey) -> StorageKey {
    StorageKey {
        row: key.row.get(INTENT_PREFIX_LEN..).unwrap_or_default().to_vec(),
        column: key.column,
    }
}

fn intent_range(txn: TransactionId) -> KeyRange {
    let start = txn.0.to_be_bytes().to_vec();
    let end = txn.0.checked_add(1).map(|next| next.to_be_bytes().to_vec());
    KeyRange::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_common::schema::{ColumnSchema, DataType};
    use granite_common::types::ClientRequestId;

    use crate::operation::RowOp;

    fn schema(version: u32) -> Schema {
        Schema::new(
            version,
            vec![
                ColumnSchema {
                    id: ColumnId(1),
                    name: "v".into(),
                    data_type: DataType::Int64,
                    nullable: true,
                },
                ColumnSchema {
                    id: ColumnId(2),
                    name: "s".into(),
                    data_type: DataType::Text,
                    nullable: true,
                },
            ],
        )
    }

    fn tablet() -> Arc<Tablet> {
        let meta = TabletMetadata::new(TabletId::new("t1"), TableId::new("tbl"), schema(1))
            .with_partition(Partition::new(b"a".to_vec(), b"m".to_vec()));
        Tablet::in_memory(meta, &GraniteConfig::default(), None)
    }

    fn write(rows: Vec<RowOp>) -> WriteRequest {
        WriteRequest {
            schema_version: 1,
            rows,
            transaction: None,
            client_request: None,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    /// Prepare as leader, then apply at (1, index) / ht micros.
    fn run(t: &Tablet, request: OperationRequest, index: u64, ht: u64) -> GraniteResult<()> {
        let mut op = Operation::new(request);
        t.prepare(&mut op, true, soon())?;
        op.set_op_id_and_time(OpId::new(1, index), HybridTime::from_micros(ht));
        t.apply(&op)
    }

    fn upsert(key: &str, v: i64) -> RowOp {
        RowOp::upsert(key, vec![(ColumnId(1), Datum::Int64(v))])
    }

    #[test]
    fn test_write_and_read_at_time() {
        let t = tablet();
        run(&t, OperationRequest::Write(write(vec![upsert("b", 1)])), 1, 10).unwrap();
        run(&t, OperationRequest::Write(write(vec![upsert("b", 2)])), 2, 20).unwrap();
        let at = |micros| t.read(&KeyRange::all(), None, HybridTime::from_micros(micros)).unwrap();
        assert!(at(5).is_empty());
        assert_eq!(at(15)[0].get("v"), Some(&Datum::Int64(1)));
        assert_eq!(at(25)[0].get("v"), Some(&Datum::Int64(2)));
        assert_eq!(at(25)[0].get("s"), Some(&Datum::Null));
    }

    #[test]
    fn test_reinsert_after_delete_starts_empty() {
        let t = tablet();
        let full = RowOp::upsert("c", vec![(ColumnId(1), Datum::Int64(1)), (ColumnId(2), Datum::Text("old".into()))]);
        run(&t, OperationRequest::Write(write(vec![full])), 1, 10).unwrap();
        run(&t, OperationRequest::Write(write(vec![RowOp::delete("c")])), 2, 20).unwrap();
        let reinsert = RowOp::insert("c", vec![(ColumnId(1), Datum::Int64(2))]);
        run(&t, OperationRequest::Write(write(vec![reinsert])), 3, 30).unwrap();

        let at = |micros| t.read(&KeyRange::all(), None, HybridTime::from_micros(micros)).unwrap();
        assert!(at(25).is_empty());
        let rows = at(40);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Datum::Int64(2)));
        assert_eq!(rows[0].get("s"), Some(&Datum::Null));

        t.flush().unwrap();
        assert_eq!(at(40)[0].get("s"), Some(&Datum::Null));
    }

    #[test]
    fn test_write_validation() {
        let t = tablet();
        let mut bad_version = write(vec![upsert("b", 1)]);
        bad_version.schema_version = 7;
        let err = run(&t, OperationRequest::Write(bad_version), 1, 10).unwrap_err();
        assert!(matches!(err, GraniteError::InvalidArgument(_)));

        let outside = run(&t, OperationRequest::Write(write(vec![upsert("z", 1)])), 1, 10).unwrap_err();
        assert!(matches!(outside, GraniteError::InvalidArgument(_)));

        let wrong_type = RowOp::upsert("b", vec![(ColumnId(1), Datum::Text("x".into()))]);
        let err = run(&t, OperationRequest::Write(write(vec![wrong_type])), 1, 10).unwrap_err();
        assert!(matches!(err, GraniteError::InvalidArgument(_)));
    }

    #[test]
    fn test_insert_of_existing_row_fails() {
        let t = tablet();
        let insert = |v| RowOp::insert("c", vec![(ColumnId(1), Datum::Int64(v))]);
        run(&t, OperationRequest::Write(write(vec![insert(1)])), 1, 10).unwrap();
        let err = run(&t, OperationRequest::Write(write(vec![insert(2)])), 2, 20).unwrap_err();
        assert!(err.is_already_present());
        // locks of the failed prepare are gone with the operation
        assert_eq!(t.row_locks().locked_count(), 0);

        run(&t, OperationRequest::Write(write(vec![RowOp::delete("c")])), 3, 30).unwrap();
        run(&t, OperationRequest::Write(write(vec![insert(3)])), 4, 40).unwrap();
    }

    #[test]
    fn test_change_metadata_rules() {
        let t = tablet();
        let change = |s: Schema| OperationRequest::ChangeMetadata(ChangeMetadataRequest { schema: s });

        let mut op = Operation::new(change(schema(1)));
        t.prepare(&mut op, true, soon()).unwrap();
        assert!(op.is_noop);

        let mut different = schema(1);
        different.columns.pop();
        let err = run(&t, change(different), 1, 10).unwrap_err();
        assert!(matches!(err, GraniteError::Corruption(_)));

        run(&t, change(schema(2)), 1, 10).unwrap();
        assert_eq!(t.schema().version, 2);
        let err = run(&t, change(schema(1)), 2, 20).unwrap_err();
        assert!(matches!(err, GraniteError::InvalidArgument(_)));
    }

    #[test]
    fn test_schema_change_pauses_writes() {
        let t = tablet();
        let mut w = Operation::new(OperationRequest::Write(write(vec![upsert("b", 1)])));
        t.prepare(&mut w, true, soon()).unwrap();
        let mut change = Operation::new(OperationRequest::ChangeMetadata(ChangeMetadataRequest {
            schema: schema(2),
        }));
        let err = t.prepare(&mut change, true, soon()).unwrap_err();
        assert!(matches!(err, GraniteError::TryAgain(_)));
    }

    #[test]
    fn test_transaction_commit_moves_intents() {
        let t = tablet();
        let txn = TransactionId(42);
        let mut w = write(vec![upsert("d", 9)]);
        w.transaction = Some(txn);
        run(&t, OperationRequest::Write(w), 1, 10).unwrap();
        assert!(t.read(&KeyRange::all(), None, HybridTime::MAX).unwrap().is_empty());

        let commit = OperationRequest::UpdateTransaction(UpdateTransactionRequest {
            transaction_id: txn,
            status: TransactionStatus::Committed {
                commit_ht: HybridTime::from_micros(15),
            },
        });
        run(&t, commit.clone(), 2, 20).unwrap();
        let rows = t.read(&KeyRange::all(), None, HybridTime::from_micros(15)).unwrap();
        assert_eq!(rows[0].key, b"d".to_vec());
        assert_eq!(rows[0].get("v"), Some(&Datum::Int64(9)));
        assert!(t.pending_intents(txn, HybridTime::MAX).unwrap().is_empty());

        // replay of the commit finds the intents below its own time
        let mut replay = Operation::new(commit);
        replay.set_op_id_and_time(OpId::new(1, 2), HybridTime::from_micros(20));
        t.apply(&replay).unwrap();
        assert_eq!(t.read(&KeyRange::all(), None, HybridTime::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_transaction_abort_drops_intents() {
        let t = tablet();
        let txn = TransactionId(7);
        let mut w = write(vec![upsert("e", 1)]);
        w.transaction = Some(txn);
        run(&t, OperationRequest::Write(w), 1, 10).unwrap();
        let abort = OperationRequest::UpdateTransaction(UpdateTransactionRequest {
            transaction_id: txn,
            status: TransactionStatus::Aborted,
        });
        run(&t, abort, 2, 20).unwrap();
        assert!(t.pending_intents(txn, HybridTime::MAX).unwrap().is_empty());
        assert!(t.read(&KeyRange::all(), None, HybridTime::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_status_tablet_records_transactions() {
        let meta = TabletMetadata::new(TabletId::new("status"), TableId::new("txns"), schema(1))
            .with_table_type(TableType::TransactionStatus);
        let t = Tablet::in_memory(meta, &GraniteConfig::default(), None);
        let update = |status| {
            OperationRequest::UpdateTransaction(UpdateTransactionRequest {
                transaction_id: TransactionId(5),
                status,
            })
        };
        run(&t, update(TransactionStatus::Pending), 1, 10).unwrap();
        run(
            &t,
            update(TransactionStatus::Committed {
                commit_ht: HybridTime::from_micros(19),
            }),
            2,
            20,
        )
        .unwrap();
        let status = |ht| t.transaction_status(TransactionId(5), HybridTime::from_micros(ht)).unwrap();
        assert_eq!(status(15).as_deref(), Some("PENDING"));
        assert_eq!(status(25).as_deref(), Some("COMMITTED"));
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let t = tablet();
        let snap = |op| {
            OperationRequest::Snapshot(SnapshotRequest {
                snapshot_id: "s1".into(),
                operation: op,
            })
        };
        run(&t, OperationRequest::Write(write(vec![upsert("b", 1)])), 1, 10).unwrap();
        run(&t, snap(SnapshotOperation::Create), 2, 20).unwrap();
        run(&t, OperationRequest::Write(write(vec![upsert("c", 1)])), 3, 30).unwrap();
        assert_eq!(t.read_snapshot("s1", &KeyRange::all()).unwrap().len(), 1);
        assert_eq!(t.snapshot_ids(), vec!["s1".to_string()]);
        assert!(run(&t, snap(SnapshotOperation::Create), 4, 40).unwrap_err().is_already_present());
        assert!(matches!(
            run(&t, snap(SnapshotOperation::Restore), 4, 40),
            Err(GraniteError::InvalidArgument(_))
        ));
        run(&t, snap(SnapshotOperation::Delete), 4, 40).unwrap();
        assert!(t.snapshot_ids().is_empty());
        assert!(matches!(
            run(&t, snap(SnapshotOperation::Delete), 5, 50),
            Err(GraniteError::NotFound(_))
        ));
    }

    struct RecordingSplitter(Mutex<Vec<SplitRecord>>);

    impl TabletSplitter for RecordingSplitter {
        fn apply_split(&self, _parent: &TabletId, split: &SplitRecord) -> GraniteResult<()> {
            self.0.lock().push(split.clone());
            Ok(())
        }
    }

    #[test]
    fn test_split_rules() {
        let t = tablet();
        let splitter = Arc::new(RecordingSplitter(Mutex::new(Vec::new())));
        t.set_splitter(splitter.clone());
        let split = |key: &str| {
            OperationRequest::Split(SplitRequest {
                split_key: key.as_bytes().to_vec(),
                children: [TabletId::new("l"), TabletId::new("r")],
            })
        };
        assert!(matches!(run(&t, split("a"), 1, 10), Err(GraniteError::InvalidArgument(_))));
        assert!(matches!(run(&t, split("q"), 1, 10), Err(GraniteError::InvalidArgument(_))));
        run(&t, split("f"), 1, 10).unwrap();
        assert_eq!(t.data_state(), TabletDataState::SplitCompleted);
        assert_eq!(splitter.0.lock().len(), 1);
        assert_eq!(t.split_record().unwrap().hybrid_time, HybridTime::from_micros(10));
        assert!(run(&t, split("g"), 2, 20).unwrap_err().is_already_present());
        let w = run(&t, OperationRequest::Write(write(vec![upsert("b", 1)])), 2, 20);
        assert!(w.unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_projection_and_checksum() {
        let t = tablet();
        let row = RowOp::upsert("b", vec![(ColumnId(1), Datum::Int64(1)), (ColumnId(2), Datum::Text("x".into()))]);
        run(&t, OperationRequest::Write(write(vec![row])), 1, 10).unwrap();
        let only_s = vec!["s".to_string()];
        let rows = t.read(&KeyRange::all(), Some(&only_s), HybridTime::MAX).unwrap();
        assert_eq!(rows[0].columns, vec![("s".to_string(), Datum::Text("x".into()))]);
        let unknown = vec!["nope".to_string()];
        assert!(matches!(
            t.read(&KeyRange::all(), Some(&unknown), HybridTime::MAX),
            Err(GraniteError::InvalidArgument(_))
        ));

        let (before, count) = t.checksum(HybridTime::MAX).unwrap();
        assert_eq!(count, 1);
        run(&t, OperationRequest::Write(write(vec![upsert("c", 2)])), 2, 20).unwrap();
        assert_ne!(t.checksum(HybridTime::MAX).unwrap().0, before);
        assert_eq!(t.checksum(HybridTime::from_micros(15)).unwrap().0, before);
    }

    #[test]
    fn test_history_cutoff_recorded() {
        let t = tablet();
        let cutoff = HybridTime::from_micros(5);
        run(&t, OperationRequest::HistoryCutoff(crate::operation::HistoryCutoffRequest { cutoff }), 1, 10).unwrap();
        assert_eq!(t.retention().committed_history_cutoff(), cutoff);
    }

    #[test]
    fn test_truncate_keeps_frontier() {
        let t = tablet();
        let mut w = write(vec![upsert("b", 1)]);
        w.client_request = Some(ClientRequestId {
            client_id: 1,
            request_id: 1,
        });
        run(&t, OperationRequest::Write(w), 1, 10).unwrap();
        t.flush().unwrap();
        run(&t, OperationRequest::Truncate, 2, 20).unwrap();
        assert!(t.read(&KeyRange::all(), None, HybridTime::MAX).unwrap().is_empty());
        assert_eq!(t.max_persistent_op_ids().0, OpId::new(1, 2));
    }

    #[test]
    fn test_split_key_is_middle_row() {
        let t = tablet();
        assert!(t.split_key().unwrap_err().is_illegal_state());
        let rows = vec![upsert("b", 1), upsert("c", 1), upsert("d", 1)];
        run(&t, OperationRequest::Write(write(rows)), 1, 10).unwrap();
        assert_eq!(t.split_key().unwrap(), b"c".to_vec());
    }

    #[test]
    fn test_rows_as_batch_seeds_a_child() {
        let t = tablet();
        let rows = vec![upsert("b", 1), upsert("c", 1), upsert("d", 1)];
        run(&t, OperationRequest::Write(write(rows)), 1, 10).unwrap();
        run(&t, OperationRequest::Write(write(vec![upsert("c", 2)])), 2, 20).unwrap();

        let half = Partition::new(b"c".to_vec(), b"m".to_vec());
        let batch = t.rows_as_batch(&half.key_range(), HybridTime::from_micros(15)).unwrap();
        assert!(batch.frontier.is_none());
        let meta = TabletMetadata::new(TabletId::new("child"), TableId::new("tbl"), schema(1)).with_partition(half);
        let child = Tablet::in_memory(meta, &GraniteConfig::default(), None);
        child.regular_db().apply_write_batch(batch).unwrap();

        let seeded = child.read(&KeyRange::all(), None, HybridTime::MAX).unwrap();
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded[0].key, b"c".to_vec());
        assert_eq!(seeded[0].get("v"), Some(&Datum::Int64(1)));
        assert!(child.read(&KeyRange::all(), None, HybridTime::from_micros(14)).unwrap().is_empty());
    }
}
