//! Background compaction of immutable files.
//!
//! A compaction merges a set of immutable files into one, running every
//! version through a [`CompactionFilter`]. The work is packaged as a
//! [`PriorityTask`] for the shared [`PriorityThreadPool`]: priority grows
//! with the number of input files, and the merge yields to higher-priority
//! work every `chunk_entries` versions.
//!
//! [`PriorityThreadPool`]: granite_executor::PriorityThreadPool

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use granite_common::error::GraniteResult;
use granite_common::HybridTime;
use granite_executor::{CompactionInfo, PriorityTask, Suspender};

use crate::frontier::{merge_frontiers, ConsensusFrontier};
use crate::mem_store::{ImmutableFile, StoreInner};
use crate::mvcc_key::{Value, VersionedKey};

/// Priority of a compaction requested explicitly through `KvStore::compact`.
pub const MANUAL_COMPACTION_PRIORITY: i32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Discard,
}

/// Sees every version of a compaction in key order.
pub trait CompactionFilter: Send {
    fn filter(&mut self, key: &VersionedKey, value: &Value) -> FilterDecision;
}

pub trait CompactionFilterFactory: Send + Sync {
    fn create(&self) -> Box<dyn CompactionFilter>;
}

/// Source of the committed history cutoff.
pub trait HistoryCutoffProvider: Send + Sync {
    /// Versions at or below this time are only needed for the newest one
    /// per cell. `HybridTime::INVALID` keeps everything.
    fn history_cutoff(&self) -> HybridTime;
}

// ── History cutoff filter ──────────────────────────────────────────────────

/// Drops versions shadowed at or below the cutoff, plus tombstones at or
/// below the cutoff (everything older than them is dropped with them).
pub struct HistoryCutoffFilter {
    cutoff: HybridTime,
    cell: Option<VersionedKey>,
    seen_below_cutoff: bool,
    row_deleted_at: Option<HybridTime>,
}

impl HistoryCutoffFilter {
    pub fn new(cutoff: HybridTime) -> Self {
        Self {
            cutoff,
            cell: None,
            seen_below_cutoff: false,
            row_deleted_at: None,
        }
    }
}

impl CompactionFilter for HistoryCutoffFilter {
    fn filter(&mut self, key: &VersionedKey, value: &Value) -> FilterDecision {
        if !self.cutoff.is_valid() {
            return FilterDecision::Keep;
        }
        let same_row = self.cell.as_ref().is_some_and(|c| c.row == key.row);
        let same_cell = same_row && self.cell.as_ref().is_some_and(|c| c.column == key.column);
        if !same_row {
            self.row_deleted_at = None;
        }
        if !same_cell {
            self.cell = Some(key.clone());
            self.seen_below_cutoff = false;
        }

        if key.ht > self.cutoff {
            return FilterDecision::Keep;
        }
        // a delete shadowed by a later reinsert still hides older columns
        if key.column.is_none() && value.is_tombstone() && self.row_deleted_at.is_none() {
            self.row_deleted_at = Some(key.ht);
        }
        if self.seen_below_cutoff {
            return FilterDecision::Discard;
        }
        self.seen_below_cutoff = true;

        match key.column {
            None => {
                if value.is_tombstone() {
                    FilterDecision::Discard
                } else {
                    FilterDecision::Keep
                }
            }
            Some(_) => {
                if self.row_deleted_at.is_some_and(|t| key.ht <= t) || value.is_tombstone() {
                    FilterDecision::Discard
                } else {
                    FilterDecision::Keep
                }
            }
        }
    }
}

pub struct HistoryCutoffFilterFactory {
    provider: Arc<dyn HistoryCutoffProvider>,
}

impl HistoryCutoffFilterFactory {
    pub fn new(provider: Arc<dyn HistoryCutoffProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

impl CompactionFilterFactory for HistoryCutoffFilterFactory {
    fn create(&self) -> Box<dyn CompactionFilter> {
        Box::new(HistoryCutoffFilter::new(self.provider.history_cutoff()))
    }
}

// ── Merge ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub files_in: usize,
    pub entries_in: usize,
    pub entries_out: usize,
}

impl CompactionResult {
    pub fn entries_dropped(&self) -> usize {
        self.entries_in - self.entries_out
    }
}

/// Merge `inputs` into a single sorted map, filtering versions and calling
/// `checkpoint` after every `chunk_entries` versions.
pub fn merge_files(
    inputs: &[Arc<ImmutableFile>],
    filter: Option<&mut dyn CompactionFilter>,
    chunk_entries: usize,
    mut checkpoint: impl FnMut(),
) -> (BTreeMap<VersionedKey, Value>, CompactionResult) {
    let mut merged: BTreeMap<&VersionedKey, &Value> = BTreeMap::new();
    for file in inputs {
        merged.extend(file.entries.iter());
    }
    let mut result = CompactionResult {
        files_in: inputs.len(),
        entries_in: merged.len(),
        entries_out: 0,
    };
    let chunk = chunk_entries.max(1);
    let mut out = BTreeMap::new();
    let mut filter = filter;
    for (i, (key, value)) in merged.into_iter().enumerate() {
        if i > 0 && i % chunk == 0 {
            checkpoint();
        }
        let keep = match filter.as_mut() {
            Some(f) => f.filter(key, value) == FilterDecision::Keep,
            None => true,
        };
        if keep {
            out.insert(key.clone(), value.clone());
        }
    }
    result.entries_out = out.len();
    (out, result)
}

// ── Task ───────────────────────────────────────────────────────────────────

pub(crate) struct CompactionTask {
    store: Weak<StoreInner>,
    store_key: u64,
    inputs: Vec<Arc<ImmutableFile>>,
    done: Option<mpsc::Sender<GraniteResult<CompactionResult>>>,
}

impl CompactionTask {
    pub(crate) fn new(
        store: &Arc<StoreInner>,
        inputs: Vec<Arc<ImmutableFile>>,
        done: Option<mpsc::Sender<GraniteResult<CompactionResult>>>,
    ) -> Self {
        Self {
            store: Arc::downgrade(store),
            store_key: store.key(),
            inputs,
            done,
        }
    }

    pub(crate) fn priority(&self) -> i32 {
        self.inputs.len().min(i32::MAX as usize) as i32
    }

    fn finish(&mut self, result: GraniteResult<CompactionResult>) {
        if let Some(done) = self.done.take() {
            // receiver gone means nobody waits
            let _ = done.send(result);
        }
    }

    /// Merge and install. Public to the crate so stores without a pool can
    /// compact inline.
    pub(crate) fn execute(&mut self, suspender: Option<&dyn Suspender>) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let result = store.run_compaction(&self.inputs, || {
            if let Some(s) = suspender {
                s.pause_if_necessary();
            }
        });
        store.compaction_finished();
        self.finish(result);
    }
}

impl PriorityTask for CompactionTask {
    fn run(&mut self, status: GraniteResult<()>, suspender: Option<&dyn Suspender>) {
        if let Err(e) = status {
            debug!(store_key = self.store_key, error = %e, "compaction aborted before start");
            if let Some(store) = self.store.upgrade() {
                store.compaction_finished();
            }
            self.finish(Err(e));
            return;
        }
        self.execute(suspender);
    }

    fn should_remove_with_key(&self, key: u64) -> bool {
        self.store_key == key
    }

    fn compaction_info(&self) -> Option<CompactionInfo> {
        Some(CompactionInfo {
            file_count: self.inputs.len() as u64,
            byte_count: self.inputs.iter().map(|f| f.size_bytes).sum(),
        })
    }

    fn describe(&self) -> String {
        format!(
            "compaction store_key={} files={:?}",
            self.store_key,
            self.inputs.iter().map(|f| f.id).collect::<Vec<_>>()
        )
    }
}

impl Drop for CompactionTask {
    fn drop(&mut self) {
        if self.done.is_some() {
            warn!(store_key = self.store_key, "compaction task dropped without running");
        }
    }
}

/// Frontier of a compaction output: the union of its inputs.
pub(crate) fn output_frontier(inputs: &[Arc<ImmutableFile>]) -> Option<ConsensusFrontier> {
    merge_frontiers(inputs.iter().filter_map(|f| f.frontier.as_ref()))
}

pub(crate) fn log_result(store: &str, result: &CompactionResult) {
    info!(
        store,
        files_in = result.files_in,
        entries_in = result.entries_in,
        entries_out = result.entries_out,
        "compaction finished"
    );
    granite_observability::record_compaction_finished(result.files_in, result.entries_dropped());
}
