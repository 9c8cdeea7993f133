//! In-memory implementation of [`KvStore`].
//!
//! Layout mirrors an LSM tree with a single level: one active memtable plus
//! a list of immutable "files" (oldest first). Only data in files counts as
//! persistent; [`MemKvStore::simulate_crash`] throws the memtable away the
//! way a process crash would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use granite_common::config::StorageConfig;
use granite_common::error::{GraniteError, GraniteResult, StorageError};
use granite_common::{HybridTime, OpId};
use granite_executor::PriorityThreadPool;

use crate::compaction::{
    self, CompactionFilterFactory, CompactionResult, CompactionTask, MANUAL_COMPACTION_PRIORITY,
};
use crate::frontier::{merge_frontiers, ConsensusFrontier};
use crate::kv::{Checkpoint, FlushFilter, KvStore, StoreStats, WriteBatch};
use crate::memtable::{MemTable, MemTableError};
use crate::mvcc_key::{KeyRange, Value, VersionedKey};

static NEXT_STORE_KEY: AtomicU64 = AtomicU64::new(1);

/// A flushed memtable or a compaction output.
#[derive(Debug)]
pub struct ImmutableFile {
    pub id: u64,
    pub entries: BTreeMap<VersionedKey, Value>,
    pub frontier: Option<ConsensusFrontier>,
    pub size_bytes: u64,
}

impl ImmutableFile {
    pub fn new(id: u64, entries: BTreeMap<VersionedKey, Value>, frontier: Option<ConsensusFrontier>) -> Self {
        let size_bytes = entries
            .iter()
            .map(|(k, v)| (k.row.len() + 16 + v.approx_size()) as u64)
            .sum();
        Self {
            id,
            entries,
            frontier,
            size_bytes,
        }
    }
}

struct StoreData {
    memtable: Arc<MemTable>,
    files: Vec<Arc<ImmutableFile>>,
    /// Op ids persisted without data: truncated stores and flushes of
    /// memtables that only carried a frontier.
    dataless_frontier: Option<ConsensusFrontier>,
}

pub(crate) struct StoreInner {
    name: String,
    key: u64,
    config: StorageConfig,
    data: RwLock<StoreData>,
    pool: Option<Arc<PriorityThreadPool>>,
    flush_filter: Mutex<Option<FlushFilter>>,
    filter_factory: Mutex<Option<Arc<dyn CompactionFilterFactory>>>,
    compactions_enabled: AtomicBool,
    compaction_scheduled: AtomicBool,
    shutting_down: AtomicBool,
    next_file_id: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

impl StoreInner {
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn compaction_finished(&self) {
        self.compaction_scheduled.store(false, Ordering::Release);
    }

    /// Merge `inputs` and swap them for the output. Inputs that disappeared
    /// meanwhile (truncate) make the result obsolete.
    pub(crate) fn run_compaction(
        &self,
        inputs: &[Arc<ImmutableFile>],
        checkpoint: impl FnMut(),
    ) -> GraniteResult<CompactionResult> {
        let factory = self.filter_factory.lock().clone();
        let mut filter = factory.map(|f| f.create());
        let (entries, result) = compaction::merge_files(
            inputs,
            filter.as_mut().map(|f| -> &mut dyn compaction::CompactionFilter { &mut **f }),
            self.config.compaction_chunk_entries,
            checkpoint,
        );
        let output = Arc::new(ImmutableFile::new(
            self.next_file_id.fetch_add(1, Ordering::Relaxed),
            entries,
            compaction::output_frontier(inputs),
        ));

        let mut data = self.data.write();
        let first = inputs.first().map(|f| f.id);
        let Some(position) = data.files.iter().position(|f| Some(f.id) == first) else {
            return Err(StorageError::Compaction(format!("{}: inputs vanished", self.name)).into());
        };
        let all_present = inputs
            .iter()
            .all(|input| data.files.iter().any(|f| f.id == input.id));
        if !all_present {
            return Err(StorageError::Compaction(format!("{}: inputs vanished", self.name)).into());
        }
        data.files.retain(|f| !inputs.iter().any(|input| input.id == f.id));
        let len = data.files.len();
        data.files.insert(position.min(len), output);
        drop(data);

        self.compactions.fetch_add(1, Ordering::Relaxed);
        compaction::log_result(&self.name, &result);
        Ok(result)
    }
}

pub struct MemKvStore {
    inner: Arc<StoreInner>,
}

impl MemKvStore {
    pub fn new(
        name: impl Into<String>,
        config: StorageConfig,
        pool: Option<Arc<PriorityThreadPool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                key: NEXT_STORE_KEY.fetch_add(1, Ordering::Relaxed),
                config,
                data: RwLock::new(StoreData {
                    memtable: Arc::new(MemTable::new()),
                    files: Vec::new(),
                    dataless_frontier: None,
                }),
                pool,
                flush_filter: Mutex::new(None),
                filter_factory: Mutex::new(None),
                compactions_enabled: AtomicBool::new(false),
                compaction_scheduled: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                next_file_id: AtomicU64::new(1),
                flushes: AtomicU64::new(0),
                compactions: AtomicU64::new(0),
            }),
        })
    }

    /// Key under which this store's compactions are queued in the pool.
    pub fn store_key(&self) -> u64 {
        self.inner.key
    }

    /// Lose the memtable as a crash would, then accept work again. Flushed
    /// files survive. Compactions stay disabled until re-enabled.
    pub fn simulate_crash(&self) {
        let mut data = self.inner.data.write();
        let lost = data.memtable.entry_count();
        data.memtable = Arc::new(MemTable::new());
        drop(data);
        self.inner.compactions_enabled.store(false, Ordering::Release);
        self.inner.shutting_down.store(false, Ordering::Release);
        info!(store = %self.inner.name, lost_entries = lost, "simulated crash");
    }

    fn check_not_shutting_down(&self) -> GraniteResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(StorageError::ShuttingDown.into());
        }
        Ok(())
    }

    fn maybe_schedule_compaction(&self) {
        let inner = &self.inner;
        if !inner.compactions_enabled.load(Ordering::Acquire)
            || inner.shutting_down.load(Ordering::Acquire)
        {
            return;
        }
        let Some(pool) = inner.pool.as_ref() else {
            return;
        };
        let inputs = inner.data.read().files.clone();
        if inputs.len() < inner.config.compaction_trigger_files.max(2) {
            return;
        }
        if inner.compaction_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = CompactionTask::new(inner, inputs, None);
        let priority = task.priority();
        if let Err(e) = pool.submit(priority, Box::new(task)) {
            inner.compaction_finished();
            warn!(store = %inner.name, error = %e, "failed to schedule compaction");
        }
    }

    fn wait_for_compaction_idle(&self, max_wait: Duration) -> bool {
        let deadline = std::time::Instant::now() + max_wait;
        while self.inner.compaction_scheduled.load(Ordering::Acquire) {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl KvStore for MemKvStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn apply_write_batch(&self, batch: WriteBatch) -> GraniteResult<()> {
        self.check_not_shutting_down()?;
        let ht = batch.hybrid_time;
        let mut frontier = batch.frontier.map(|(op_id, fht)| ConsensusFrontier::new(op_id, fht));
        if let (Some(f), Some(cutoff)) = (frontier.as_mut(), batch.history_cutoff) {
            f.set_history_cutoff(cutoff);
        }
        let entries: Vec<(VersionedKey, Value)> = batch
            .entries
            .into_iter()
            .enumerate()
            .map(|(i, (key, value))| (VersionedKey::new(key, ht, i as u32), value))
            .collect();

        // the read lock keeps a flush from freezing the memtable mid-insert
        let memtable_bytes = {
            let data = self.inner.data.read();
            if let Err(MemTableError::Frozen) = data.memtable.insert_batch(entries, frontier) {
                return Err(GraniteError::internal_bug(
                    "FROZEN_MEMTABLE_WRITE",
                    format!("{}: write to a flushed memtable", self.inner.name),
                ));
            }
            data.memtable.approx_bytes()
        };

        let limit = self.inner.config.memtable_flush_bytes as u64;
        if limit > 0 && memtable_bytes >= limit {
            match self.flush() {
                Ok(()) => {}
                Err(GraniteError::Storage(StorageError::FlushBlocked(reason))) => {
                    debug!(store = %self.inner.name, %reason, "automatic flush postponed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn iter(&self, range: &KeyRange, read_time: HybridTime) -> GraniteResult<Vec<(VersionedKey, Value)>> {
        self.check_not_shutting_down()?;
        let data = self.inner.data.read();
        let mut merged: BTreeMap<VersionedKey, Value> = data.memtable.scan(range, read_time).into_iter().collect();
        for file in &data.files {
            merged.extend(
                file.entries
                    .range(VersionedKey::row_start(&range.start)..)
                    .take_while(|(k, _)| range.end.as_deref().map_or(true, |end| k.row.as_slice() < end))
                    .filter(|(k, _)| k.ht <= read_time)
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        Ok(merged.into_iter().collect())
    }

    fn max_persistent_op_id(&self) -> OpId {
        let data = self.inner.data.read();
        data.files
            .iter()
            .filter_map(|f| f.frontier.as_ref())
            .chain(data.dataless_frontier.as_ref())
            .map(|f| f.op_id_max)
            .fold(OpId::INVALID, OpId::max)
    }

    fn flush(&self) -> GraniteResult<()> {
        self.check_not_shutting_down()?;
        let filter = self.inner.flush_filter.lock().clone();
        {
            let mut data = self.inner.data.write();
            let memtable = data.memtable.clone();
            if memtable.is_empty() && memtable.frontier().is_none() {
                return Ok(());
            }
            if let Some(filter) = filter {
                if !filter(&memtable.info())? {
                    return Err(StorageError::FlushBlocked(format!(
                        "{}: memtable frontier {:?} not yet in the log",
                        self.inner.name,
                        memtable.frontier().map(|f| f.op_id_max)
                    ))
                    .into());
                }
            }
            memtable.freeze();
            if memtable.is_empty() {
                // nothing to write, but the op ids it saw are now durable
                let covered = merge_frontiers(data.dataless_frontier.iter().chain(memtable.frontier().as_ref()));
                data.dataless_frontier = covered;
                data.memtable = Arc::new(MemTable::new());
                debug!(store = %self.inner.name, "flushed frontier-only memtable");
                return Ok(());
            }
            let file = ImmutableFile::new(
                self.inner.next_file_id.fetch_add(1, Ordering::Relaxed),
                memtable.snapshot_entries(),
                memtable.frontier(),
            );
            debug!(
                store = %self.inner.name,
                file_id = file.id,
                entries = file.entries.len(),
                "flushed memtable"
            );
            data.files.push(Arc::new(file));
            data.memtable = Arc::new(MemTable::new());
        }
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        self.maybe_schedule_compaction();
        Ok(())
    }

    fn compact(&self) -> GraniteResult<()> {
        self.check_not_shutting_down()?;
        if !self.inner.compactions_enabled.load(Ordering::Acquire) {
            return Err(GraniteError::IllegalState(format!(
                "{}: compactions are disabled",
                self.inner.name
            )));
        }
        // a background compaction may own the current files
        if !self.wait_for_compaction_idle(Duration::from_secs(30)) {
            return Err(GraniteError::TimedOut(format!(
                "{}: background compaction still running",
                self.inner.name
            )));
        }
        let inputs = self.inner.data.read().files.clone();
        if inputs.len() < 2 && self.inner.filter_factory.lock().is_none() {
            return Ok(());
        }
        if inputs.is_empty() {
            return Ok(());
        }
        if self.inner.compaction_scheduled.swap(true, Ordering::AcqRel) {
            return Err(GraniteError::TryAgain(format!(
                "{}: compaction already scheduled",
                self.inner.name
            )));
        }

        let (tx, rx) = mpsc::channel();
        let mut task = CompactionTask::new(&self.inner, inputs, Some(tx));
        match self.inner.pool.as_ref() {
            Some(pool) => {
                if let Err(e) = pool.submit(MANUAL_COMPACTION_PRIORITY, Box::new(task)) {
                    self.inner.compaction_finished();
                    return Err(e);
                }
            }
            None => task.execute(None),
        }
        match rx.recv() {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(GraniteError::Aborted(format!(
                "{}: compaction dropped",
                self.inner.name
            ))),
        }
    }

    fn set_flush_filter(&self, filter: FlushFilter) {
        *self.inner.flush_filter.lock() = Some(filter);
    }

    fn set_compaction_filter_factory(&self, factory: Arc<dyn CompactionFilterFactory>) {
        *self.inner.filter_factory.lock() = Some(factory);
    }

    fn enable_compactions(&self) {
        self.inner.compactions_enabled.store(true, Ordering::Release);
        self.maybe_schedule_compaction();
    }

    fn truncate(&self, frontier: Option<(OpId, HybridTime)>) -> GraniteResult<()> {
        self.check_not_shutting_down()?;
        let mut data = self.inner.data.write();
        let memtable_frontier = data.memtable.frontier();
        let mut kept = merge_frontiers(
            data.files
                .iter()
                .filter_map(|f| f.frontier.as_ref())
                .chain(data.dataless_frontier.as_ref())
                .chain(memtable_frontier.as_ref()),
        );
        if let Some((op_id, ht)) = frontier {
            match kept.as_mut() {
                Some(f) => f.update(op_id, ht),
                None => kept = Some(ConsensusFrontier::new(op_id, ht)),
            }
        }
        data.files.clear();
        data.memtable = Arc::new(MemTable::new());
        data.dataless_frontier = kept;
        info!(store = %self.inner.name, "truncated");
        Ok(())
    }

    fn checkpoint(&self) -> GraniteResult<Checkpoint> {
        self.check_not_shutting_down()?;
        let data = self.inner.data.read();
        let mut entries = BTreeMap::new();
        for file in &data.files {
            entries.extend(file.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        entries.extend(data.memtable.snapshot_entries());
        let memtable_frontier = data.memtable.frontier();
        let frontier = merge_frontiers(
            data.files
                .iter()
                .filter_map(|f| f.frontier.as_ref())
                .chain(memtable_frontier.as_ref()),
        );
        Ok(Checkpoint { entries, frontier })
    }

    fn file_frontiers(&self) -> Vec<ConsensusFrontier> {
        self.inner
            .data
            .read()
            .files
            .iter()
            .filter_map(|f| f.frontier)
            .collect()
    }

    /// Stops background work. Writes of in-flight operations are still
    /// accepted until `shutdown`.
    fn start_shutdown(&self) {
        self.inner.compactions_enabled.store(false, Ordering::Release);
        if let Some(pool) = self.inner.pool.as_ref() {
            pool.remove(self.inner.key);
        }
    }

    fn shutdown(&self) {
        self.start_shutdown();
        self.inner.shutting_down.store(true, Ordering::Release);
        if !self.wait_for_compaction_idle(Duration::from_secs(60)) {
            warn!(store = %self.inner.name, "compaction still running at shutdown");
        }
    }

    fn stats(&self) -> StoreStats {
        let data = self.inner.data.read();
        StoreStats {
            memtable_entries: data.memtable.entry_count(),
            memtable_bytes: data.memtable.approx_bytes(),
            files: data.files.len(),
            file_entries: data.files.iter().map(|f| f.entries.len() as u64).sum(),
            on_disk_bytes: data.files.iter().map(|f| f.size_bytes).sum(),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            compactions: self.inner.compactions.load(Ordering::Relaxed),
        }
    }
}
