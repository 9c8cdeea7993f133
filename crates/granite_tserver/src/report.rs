//! Tablet reports sent with catalog heartbeats, and the set of tablets that
//! changed since the last acknowledged report.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use granite_common::types::{TableId, TabletId};
use granite_common::OpId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedTablet {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub state: String,
    pub last_op_id: OpId,
    pub on_disk_size: u64,
    pub leader: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReport {
    pub node_id: String,
    pub sequence: u64,
    /// Only tablets that changed since the previous acknowledged report.
    pub incremental: bool,
    pub tablets: Vec<ReportedTablet>,
}

/// Tablets whose state changed since the catalog last heard about them.
///
/// Every mark bumps a per-tablet change number. Acknowledging a report
/// clears a tablet only if it was not marked again after the report was
/// taken.
#[derive(Default)]
pub struct DirtyTablets {
    entries: Mutex<BTreeMap<TabletId, DirtyEntry>>,
}

#[derive(Debug, Clone)]
struct DirtyEntry {
    change: u64,
    reason: String,
}

/// Change numbers captured when a report was built.
#[derive(Debug, Clone, Default)]
pub struct DirtySnapshot(Vec<(TabletId, u64)>);

impl DirtySnapshot {
    pub fn tablet_ids(&self) -> impl Iterator<Item = &TabletId> {
        self.0.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl DirtyTablets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, tablet_id: &TabletId, reason: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(tablet_id.clone()).or_insert_with(|| DirtyEntry {
            change: 0,
            reason: String::new(),
        });
        entry.change += 1;
        entry.reason = reason.to_string();
        tracing::debug!(%tablet_id, reason, "tablet marked dirty");
    }

    pub fn snapshot(&self) -> DirtySnapshot {
        DirtySnapshot(
            self.entries
                .lock()
                .iter()
                .map(|(id, e)| (id.clone(), e.change))
                .collect(),
        )
    }

    pub fn acknowledge(&self, snapshot: &DirtySnapshot) {
        let mut entries = self.entries.lock();
        for (id, change) in &snapshot.0 {
            if entries.get(id).map(|e| e.change) == Some(*change) {
                entries.remove(id);
            }
        }
    }

    pub fn reason(&self, tablet_id: &TabletId) -> Option<String> {
        self.entries.lock().get(tablet_id).map(|e| e.reason.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
