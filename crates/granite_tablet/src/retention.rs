//! History retention: how far back MVCC versions must stay readable.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use granite_common::config::RetentionConfig;
use granite_common::HybridTime;
use granite_storage::HistoryCutoffProvider;

#[derive(Debug)]
struct RetentionState {
    committed_cutoff: HybridTime,
    last_propagated_at: Option<Instant>,
}

/// Tracks the committed history cutoff (replicated through HistoryCutoff
/// operations) and decides when the leader should propose a new one.
#[derive(Debug)]
pub struct HistoryRetentionPolicy {
    retention: Duration,
    propagation_interval: Duration,
    state: Mutex<RetentionState>,
}

impl HistoryRetentionPolicy {
    pub fn new(config: &RetentionConfig) -> Self {
        Self {
            retention: config.history_retention(),
            propagation_interval: config.propagation_interval(),
            state: Mutex::new(RetentionState {
                committed_cutoff: HybridTime::INVALID,
                last_propagated_at: None,
            }),
        }
    }

    pub fn committed_history_cutoff(&self) -> HybridTime {
        self.state.lock().committed_cutoff
    }

    /// Install a replicated cutoff. Older values are ignored.
    pub fn set_committed_history_cutoff(&self, cutoff: HybridTime) {
        let mut st = self.state.lock();
        if cutoff.is_valid() && (!st.committed_cutoff.is_valid() || cutoff > st.committed_cutoff) {
            st.committed_cutoff = cutoff;
        }
    }

    /// New cutoff for the leader to replicate, at most once per propagation
    /// interval and only when it moves the committed cutoff forward.
    pub fn history_cutoff_to_propagate(&self, now: HybridTime, at: Instant) -> Option<HybridTime> {
        let mut st = self.state.lock();
        if let Some(last) = st.last_propagated_at {
            if at.saturating_duration_since(last) < self.propagation_interval {
                return None;
            }
        }
        let candidate = now.sub_duration(self.retention);
        if candidate == HybridTime::MIN {
            return None;
        }
        if st.committed_cutoff.is_valid() && candidate <= st.committed_cutoff {
            return None;
        }
        st.last_propagated_at = Some(at);
        Some(candidate)
    }
}

impl HistoryCutoffProvider for HistoryRetentionPolicy {
    fn history_cutoff(&self) -> HybridTime {
        self.committed_history_cutoff()
    }
}
