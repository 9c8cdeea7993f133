//! Background log garbage collection.
//!
//! Each running tablet peer registers a [`LogGcOp`]; one [`LogGcRunner`]
//! thread performs every registered op once per interval. Unregistering
//! waits for an in-progress run of that op, so a peer that returns from
//! `start_shutdown` is never collected concurrently.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::shutdown::ShutdownSignal;

use crate::peer::TabletPeer;

/// Periodic background work owned by a tablet.
pub trait MaintenanceOp: Send + Sync {
    fn name(&self) -> &str;

    /// Run once; returns the amount of work done.
    fn perform(&self) -> GraniteResult<usize>;
}

/// Reclaims log segments no longer needed by a tablet peer.
pub struct LogGcOp {
    name: String,
    peer: Weak<TabletPeer>,
}

impl LogGcOp {
    pub fn new(peer: &Arc<TabletPeer>) -> Arc<Self> {
        Arc::new(Self {
            name: format!("log-gc-{}", peer.tablet_id()),
            peer: Arc::downgrade(peer),
        })
    }
}

impl MaintenanceOp for LogGcOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn perform(&self) -> GraniteResult<usize> {
        match self.peer.upgrade() {
            Some(peer) => peer.run_log_gc(),
            None => Ok(0),
        }
    }
}

struct RunnerShared {
    ops: Mutex<BTreeMap<String, Arc<dyn MaintenanceOp>>>,
    /// Held while an op runs; unregister takes it to wait the run out.
    running: Mutex<()>,
}

impl RunnerShared {
    fn run_once(&self) {
        let ops: Vec<_> = self.ops.lock().values().cloned().collect();
        for op in ops {
            let _running = self.running.lock();
            if !self.ops.lock().contains_key(op.name()) {
                continue;
            }
            match op.perform() {
                Ok(0) => {}
                Ok(n) => debug!(op = op.name(), work = n, "maintenance op finished"),
                Err(e) if e.is_shutdown_in_progress() || e.is_illegal_state() => {
                    debug!(op = op.name(), error = %e, "maintenance op skipped");
                }
                Err(e) => warn!(op = op.name(), error = %e, "maintenance op failed"),
            }
        }
    }
}

pub struct LogGcRunner {
    shared: Arc<RunnerShared>,
    signal: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogGcRunner {
    /// Spawn the runner thread. A zero interval disables periodic runs;
    /// `run_now` still works.
    pub fn start(interval: Duration) -> GraniteResult<Arc<Self>> {
        let shared = Arc::new(RunnerShared {
            ops: Mutex::new(BTreeMap::new()),
            running: Mutex::new(()),
        });
        let signal = ShutdownSignal::new();
        let handle = if interval.is_zero() {
            None
        } else {
            let worker = Arc::clone(&shared);
            let stop = signal.clone();
            let handle = std::thread::Builder::new()
                .name("granite-log-gc".into())
                .spawn(move || {
                    info!(interval_ms = interval.as_millis() as u64, "log GC runner started");
                    while !stop.wait_timeout(interval) {
                        worker.run_once();
                    }
                    info!("log GC runner stopped");
                })
                .map_err(|e| GraniteError::ServiceUnavailable(format!("cannot spawn log GC runner: {e}")))?;
            Some(handle)
        };
        Ok(Arc::new(Self {
            shared,
            signal,
            handle: Mutex::new(handle),
        }))
    }

    pub fn register(&self, op: Arc<dyn MaintenanceOp>) {
        let name = op.name().to_string();
        if self.shared.ops.lock().insert(name.clone(), op).is_some() {
            warn!(op = %name, "maintenance op registered twice");
        }
    }

    /// Remove the op, waiting for a run in progress to finish.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.shared.ops.lock().remove(name).is_some();
        drop(self.shared.running.lock());
        removed
    }

    pub fn registered(&self) -> Vec<String> {
        self.shared.ops.lock().keys().cloned().collect()
    }

    pub fn run_now(&self) {
        self.shared.run_once();
    }

    pub fn stop(&self) {
        self.signal.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("log GC runner panicked");
            }
        }
    }
}

impl Drop for LogGcRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
