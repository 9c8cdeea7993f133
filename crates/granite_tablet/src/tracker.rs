//! In-flight operations of one tablet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::TabletId;

use crate::driver::{DriverSnapshot, OperationDriver};

pub struct OperationTracker {
    tablet_id: TabletId,
    /// 0 = unlimited.
    max_in_flight: usize,
    pending: DashMap<u64, Arc<OperationDriver>>,
    count: AtomicUsize,
    drained: Mutex<()>,
    drained_cond: Condvar,
}

impl OperationTracker {
    pub fn new(tablet_id: TabletId, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            max_in_flight,
            pending: DashMap::new(),
            count: AtomicUsize::new(0),
            drained: Mutex::new(()),
            drained_cond: Condvar::new(),
        })
    }

    /// Track `driver`. Replicated entries pass `enforce_limit = false`: a
    /// follower cannot refuse what the leader already logged.
    pub fn add(&self, driver: Arc<OperationDriver>, enforce_limit: bool) -> GraniteResult<()> {
        let n = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if enforce_limit && self.max_in_flight > 0 && n > self.max_in_flight {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(GraniteError::ServiceUnavailable(format!(
                "tablet {} has {} operations in flight (limit {})",
                self.tablet_id,
                n - 1,
                self.max_in_flight
            )));
        }
        self.pending.insert(driver.id(), driver);
        granite_observability::record_in_flight_operations(self.tablet_id.as_str(), n);
        Ok(())
    }

    pub fn release(&self, driver_id: u64) {
        if self.pending.remove(&driver_id).is_none() {
            return;
        }
        let n = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        granite_observability::record_in_flight_operations(self.tablet_id.as_str(), n);
        if n == 0 {
            let _guard = self.drained.lock();
            self.drained_cond.notify_all();
        }
    }

    pub fn get(&self, driver_id: u64) -> Option<Arc<OperationDriver>> {
        self.pending.get(&driver_id).map(|e| Arc::clone(e.value()))
    }

    pub fn num_pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn pending_operations(&self) -> Vec<Arc<OperationDriver>> {
        self.pending.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn snapshots(&self) -> Vec<DriverSnapshot> {
        let mut out: Vec<_> = self.pending.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by_key(|s| s.driver_id);
        out
    }

    /// Smallest op index among tracked operations that have one, 0 if none.
    pub fn min_pending_op_index(&self) -> u64 {
        self.pending
            .iter()
            .map(|e| e.value().op_id().index)
            .filter(|i| *i > 0)
            .min()
            .unwrap_or(0)
    }

    /// Block until no operation is tracked. Reports progress every
    /// `report_every`, fails with TimedOut after `max_wait`.
    pub fn wait_for_all_to_finish(&self, report_every: Duration, max_wait: Duration) -> GraniteResult<()> {
        let start = Instant::now();
        let mut guard = self.drained.lock();
        while self.num_pending() > 0 {
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return Err(GraniteError::TimedOut(format!(
                    "{} operations still in flight after {elapsed:?}",
                    self.num_pending()
                )));
            }
            let wake = Instant::now() + report_every.min(max_wait - elapsed);
            if self.drained_cond.wait_until(&mut guard, wake).timed_out() && self.num_pending() > 0 {
                warn!(
                    tablet_id = %self.tablet_id,
                    pending = self.num_pending(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    "waiting for in-flight operations"
                );
                for op in self.snapshots().iter().take(5) {
                    info!(tablet_id = %self.tablet_id, operation = ?op, "still in flight");
                }
            }
        }
        Ok(())
    }
}
