//! Consensus frontiers: the op id and hybrid time range covered by a
//! memtable or an immutable file.

use serde::{Deserialize, Serialize};

use granite_common::{HybridTime, OpId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusFrontier {
    pub op_id_min: OpId,
    pub op_id_max: OpId,
    pub ht_min: HybridTime,
    pub ht_max: HybridTime,
    /// Committed history cutoff at the time the data was written.
    pub history_cutoff: HybridTime,
}

impl ConsensusFrontier {
    pub fn new(op_id: OpId, ht: HybridTime) -> Self {
        ConsensusFrontier {
            op_id_min: op_id,
            op_id_max: op_id,
            ht_min: ht,
            ht_max: ht,
            history_cutoff: HybridTime::INVALID,
        }
    }

    pub fn update(&mut self, op_id: OpId, ht: HybridTime) {
        if op_id.is_valid() {
            if !self.op_id_min.is_valid() || op_id < self.op_id_min {
                self.op_id_min = op_id;
            }
            self.op_id_max = self.op_id_max.max(op_id);
        }
        if ht.is_valid() {
            if !self.ht_min.is_valid() || ht < self.ht_min {
                self.ht_min = ht;
            }
            if !self.ht_max.is_valid() || ht > self.ht_max {
                self.ht_max = ht;
            }
        }
    }

    pub fn set_history_cutoff(&mut self, cutoff: HybridTime) {
        if !self.history_cutoff.is_valid() || cutoff > self.history_cutoff {
            self.history_cutoff = cutoff;
        }
    }

    /// Widen `self` to also cover `other`.
    pub fn merge(&mut self, other: &ConsensusFrontier) {
        self.update(other.op_id_min, other.ht_min);
        self.update(other.op_id_max, other.ht_max);
        if other.history_cutoff.is_valid() {
            self.set_history_cutoff(other.history_cutoff);
        }
    }
}

/// Merge optional frontiers, `None` when every input is `None`.
pub fn merge_frontiers<'a>(
    frontiers: impl IntoIterator<Item = &'a ConsensusFrontier>,
) -> Option<ConsensusFrontier> {
    let mut result: Option<ConsensusFrontier> = None;
    for f in frontiers {
        match result.as_mut() {
            Some(acc) => acc.merge(f),
            None => result = Some(*f),
        }
    }
    result
}
