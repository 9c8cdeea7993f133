//! Prepare stage of the operation pipeline.
//!
//! Prepares of all tablets share one bounded [`ThreadPool`]; a full queue
//! rejects the operation instead of blocking the submitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::TabletId;
use granite_executor::ThreadPool;

use crate::driver::OperationDriver;

/// Delay applied before each prepare. Test hook.
pub type PrepareLatency = Arc<dyn Fn() -> Duration + Send + Sync>;

pub struct Preparer {
    tablet_id: TabletId,
    pool: Arc<ThreadPool>,
    stopped: AtomicBool,
    latency: Mutex<Option<PrepareLatency>>,
}

impl Preparer {
    pub fn new(tablet_id: TabletId, pool: Arc<ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            pool,
            stopped: AtomicBool::new(false),
            latency: Mutex::new(None),
        })
    }

    pub fn submit(&self, driver: Arc<OperationDriver>) -> GraniteResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(GraniteError::ShutdownInProgress(format!(
                "prepare pipeline of tablet {} is stopped",
                self.tablet_id
            )));
        }
        let delay = self.latency.lock().as_ref().map(|f| f());
        self.pool.submit(Box::new(move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            driver.prepare_and_start();
        }))
    }

    /// Reject further prepares. Jobs already queued still run.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(tablet_id = %self.tablet_id, "prepare pipeline stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn inject_prepare_latency(&self, latency: PrepareLatency) {
        *self.latency.lock() = Some(latency);
    }
}
