//! MVCC manager: tracks hybrid times of replicating operations and derives
//! the tablet's safe time.
//!
//! Leader-pending and follower-pending entries share one queue in log
//! order. An entry leaves the queue when its operation is applied
//! (`replicated`) or fails (`aborted`).
//!
//! | role     | safe time                                                  |
//! |----------|------------------------------------------------------------|
//! | leader   | `front - 1`, else `now - 1`; capped by the lease           |
//! | follower | `min(propagated safe time, front - 1)`                     |
//!
//! Neither value ever goes backwards.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use granite_common::clock::HybridClock;
use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::TabletId;
use granite_common::{HybridTime, HybridTimeLease, OpId};

/// Leader safe time re-checks the clock at least this often while waiting.
const LEADER_WAIT_SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    ht: HybridTime,
    op_id: OpId,
}

#[derive(Debug, Default)]
struct MvccState {
    queue: VecDeque<PendingEntry>,
    propagated_safe_time: HybridTime,
    last_replicated: HybridTime,
    max_leader_safe_time: HybridTime,
    max_follower_safe_time: HybridTime,
}

pub struct MvccManager {
    tablet_id: TabletId,
    clock: Arc<HybridClock>,
    state: Mutex<MvccState>,
    changed: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MvccSnapshot {
    pub pending: usize,
    pub front: Option<HybridTime>,
    pub last_replicated: HybridTime,
    pub propagated_safe_time: HybridTime,
}

impl MvccManager {
    pub fn new(tablet_id: TabletId, clock: Arc<HybridClock>) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            clock,
            state: Mutex::new(MvccState {
                queue: VecDeque::new(),
                propagated_safe_time: HybridTime::INVALID,
                last_replicated: HybridTime::INVALID,
                max_leader_safe_time: HybridTime::INVALID,
                max_follower_safe_time: HybridTime::INVALID,
            }),
            changed: Condvar::new(),
        })
    }

    /// Pick the hybrid time of a new leader operation and register it.
    /// Reading the clock under the lock keeps the new time above every
    /// leader safe time handed out so far.
    pub fn add_leader_pending(&self, op_id: OpId) -> HybridTime {
        let mut st = self.state.lock();
        let mut ht = self.clock.now();
        if let Some(back) = st.queue.back() {
            if ht <= back.ht {
                ht = back.ht.incremented();
                self.clock.update(ht);
            }
        }
        st.queue.push_back(PendingEntry { ht, op_id });
        ht
    }

    /// Register a replicated entry received from the leader.
    pub fn add_follower_pending(&self, ht: HybridTime, op_id: OpId) {
        let mut st = self.state.lock();
        if let Some(back) = st.queue.back() {
            if ht <= back.ht {
                warn!(
                    tablet_id = %self.tablet_id,
                    %ht,
                    back = %back.ht,
                    "follower pending hybrid time out of order"
                );
            }
        }
        st.queue.push_back(PendingEntry { ht, op_id });
    }

    /// The operation at `ht` was applied.
    pub fn replicated(&self, ht: HybridTime) {
        let mut st = self.state.lock();
        match st.queue.front() {
            Some(front) if front.ht == ht => {
                st.queue.pop_front();
            }
            _ => {
                if let Some(pos) = st.queue.iter().position(|e| e.ht == ht) {
                    debug!(tablet_id = %self.tablet_id, %ht, pos, "replicated out of queue order");
                    st.queue.remove(pos);
                }
            }
        }
        if !st.last_replicated.is_valid() || ht > st.last_replicated {
            st.last_replicated = ht;
        }
        self.changed.notify_all();
    }

    pub fn aborted(&self, ht: HybridTime) {
        let mut st = self.state.lock();
        if let Some(pos) = st.queue.iter().position(|e| e.ht == ht) {
            st.queue.remove(pos);
        }
        self.changed.notify_all();
    }

    /// Restore the last applied hybrid time after log replay.
    pub fn set_last_replicated(&self, ht: HybridTime) {
        let mut st = self.state.lock();
        if ht.is_valid() && (!st.last_replicated.is_valid() || ht > st.last_replicated) {
            st.last_replicated = ht;
        }
    }

    pub fn set_propagated_safe_time(&self, ht: HybridTime) {
        let mut st = self.state.lock();
        if ht.is_valid() && (!st.propagated_safe_time.is_valid() || ht > st.propagated_safe_time) {
            st.propagated_safe_time = ht;
            self.changed.notify_all();
        }
    }

    pub fn last_replicated(&self) -> HybridTime {
        self.state.lock().last_replicated
    }

    /// Smallest op index still pending, 0 if none.
    pub fn min_pending_op_index(&self) -> u64 {
        self.state
            .lock()
            .queue
            .iter()
            .map(|e| e.op_id.index)
            .filter(|i| *i > 0)
            .min()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MvccSnapshot {
        let st = self.state.lock();
        MvccSnapshot {
            pending: st.queue.len(),
            front: st.queue.front().map(|e| e.ht),
            last_replicated: st.last_replicated,
            propagated_safe_time: st.propagated_safe_time,
        }
    }

    fn leader_candidate(&self, st: &MvccState, lease: &HybridTimeLease) -> HybridTime {
        let mut safe = match st.queue.front() {
            Some(front) => front.ht.decremented(),
            None => self.clock.now().decremented(),
        };
        if lease.has_lease() && lease.lease < safe {
            safe = lease.lease;
        }
        if st.max_leader_safe_time.is_valid() && safe < st.max_leader_safe_time {
            safe = st.max_leader_safe_time;
        }
        safe
    }

    /// Safe time on the leader, waiting until `deadline` for it to reach
    /// `min_allowed` (invalid = no minimum).
    pub fn safe_time_for_leader(
        &self,
        min_allowed: HybridTime,
        deadline: Option<Instant>,
        lease: HybridTimeLease,
    ) -> GraniteResult<HybridTime> {
        let started = Instant::now();
        let mut st = self.state.lock();
        loop {
            let safe = self.leader_candidate(&st, &lease);
            if !min_allowed.is_valid() || safe >= min_allowed {
                st.max_leader_safe_time = safe;
                drop(st);
                granite_observability::record_safe_time_wait_us(started.elapsed().as_micros() as u64);
                return Ok(safe);
            }
            if lease.has_lease() && lease.lease < min_allowed {
                return Err(GraniteError::TimedOut(format!(
                    "lease {} below requested time {min_allowed}",
                    lease.lease
                )));
            }
            let now = Instant::now();
            match deadline {
                Some(d) if now < d => {
                    let wake = d.min(now + LEADER_WAIT_SLICE);
                    self.changed.wait_until(&mut st, wake);
                }
                _ => {
                    return Err(GraniteError::TimedOut(format!(
                        "leader safe time {safe} did not reach {min_allowed}"
                    )))
                }
            }
        }
    }

    /// Safe time on a follower, waiting until `deadline` for it to reach
    /// `min_allowed` (invalid = no minimum).
    pub fn safe_time_for_follower(&self, min_allowed: HybridTime, deadline: Option<Instant>) -> GraniteResult<HybridTime> {
        let started = Instant::now();
        let mut st = self.state.lock();
        loop {
            let mut safe = st.propagated_safe_time;
            if let Some(front) = st.queue.front() {
                let below_front = front.ht.decremented();
                if !safe.is_valid() || below_front < safe {
                    safe = below_front;
                }
            }
            if !safe.is_valid() {
                safe = st.last_replicated;
            }
            if st.max_follower_safe_time.is_valid() && (!safe.is_valid() || safe < st.max_follower_safe_time) {
                safe = st.max_follower_safe_time;
            }
            if safe.is_valid() && (!min_allowed.is_valid() || safe >= min_allowed) {
                st.max_follower_safe_time = safe;
                drop(st);
                granite_observability::record_safe_time_wait_us(started.elapsed().as_micros() as u64);
                return Ok(safe);
            }
            match deadline {
                Some(d) if Instant::now() < d => {
                    self.changed.wait_until(&mut st, d);
                }
                _ => {
                    return Err(GraniteError::TimedOut(format!(
                        "follower safe time {safe} did not reach {min_allowed}"
                    )))
                }
            }
        }
    }
}
