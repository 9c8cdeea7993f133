//! Row locks and write permits of a tablet.
//!
//! Leader writes lock their rows from prepare until completion so that
//! conflicting writes are replicated one after the other. A schema change
//! pauses writes: it waits for outstanding write permits to drain and keeps
//! new ones from being handed out until it completes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use granite_common::error::{GraniteError, GraniteResult};

// ── Row locks ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RowLockManager {
    locked: Mutex<HashSet<Vec<u8>>>,
    released: Condvar,
}

impl RowLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock every key, all-or-nothing, waiting until `deadline`.
    pub fn lock(self: &Arc<Self>, keys: impl IntoIterator<Item = Vec<u8>>, deadline: Instant) -> GraniteResult<RowLocks> {
        // sorted and deduplicated so a batch never waits on itself
        let keys: BTreeSet<Vec<u8>> = keys.into_iter().collect();
        let mut locked = self.locked.lock();
        loop {
            if keys.iter().all(|k| !locked.contains(k)) {
                locked.extend(keys.iter().cloned());
                return Ok(RowLocks {
                    manager: Arc::clone(self),
                    keys: keys.into_iter().collect(),
                });
            }
            if self.released.wait_until(&mut locked, deadline).timed_out() {
                return Err(GraniteError::TimedOut(format!(
                    "timed out waiting for {} row lock(s)",
                    keys.len()
                )));
            }
        }
    }

    pub fn locked_count(&self) -> usize {
        self.locked.lock().len()
    }
}

/// Held row locks, released on drop.
pub struct RowLocks {
    manager: Arc<RowLockManager>,
    keys: Vec<Vec<u8>>,
}

impl Drop for RowLocks {
    fn drop(&mut self) {
        let mut locked = self.manager.locked.lock();
        for key in &self.keys {
            locked.remove(key);
        }
        self.manager.released.notify_all();
    }
}

// ── Write permits ──────────────────────────────────────────────────────────

#[derive(Default)]
struct PermitState {
    active: usize,
    paused: bool,
}

#[derive(Default)]
pub struct WritePermits {
    state: Mutex<PermitState>,
    changed: Condvar,
}

impl WritePermits {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Permit for one write, waiting out a pause until `deadline`.
    pub fn acquire(self: &Arc<Self>, deadline: Instant) -> GraniteResult<WritePermit> {
        let mut st = self.state.lock();
        while st.paused {
            if self.changed.wait_until(&mut st, deadline).timed_out() && st.paused {
                return Err(GraniteError::TryAgain("writes are paused".into()));
            }
        }
        st.active += 1;
        Ok(WritePermit {
            permits: Arc::clone(self),
            pause: false,
        })
    }

    /// Stop handing out permits and wait for active ones to be returned.
    pub fn pause(self: &Arc<Self>, deadline: Instant) -> GraniteResult<WritePermit> {
        let mut st = self.state.lock();
        while st.paused {
            if self.changed.wait_until(&mut st, deadline).timed_out() && st.paused {
                return Err(GraniteError::TryAgain("another operation paused writes".into()));
            }
        }
        st.paused = true;
        while st.active > 0 {
            if self.changed.wait_until(&mut st, deadline).timed_out() && st.active > 0 {
                st.paused = false;
                self.changed.notify_all();
                return Err(GraniteError::TryAgain(format!(
                    "could not pause writes: {} still in flight",
                    st.active
                )));
            }
        }
        Ok(WritePermit {
            permits: Arc::clone(self),
            pause: true,
        })
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}

/// A write permit or a write pause, returned on drop.
pub struct WritePermit {
    permits: Arc<WritePermits>,
    pause: bool,
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        let mut st = self.permits.state.lock();
        if self.pause {
            st.paused = false;
        } else {
            st.active -= 1;
        }
        self.permits.changed.notify_all();
    }
}
