//! Per-tablet apply thread.
//!
//! Committed operations reserve a slot in commit order. The thread applies
//! the front slot once its driver is prepared, so storage observes writes
//! in log order even when prepares finish out of order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::TabletId;

use crate::driver::OperationDriver;

#[derive(Default)]
struct QueueState {
    slots: VecDeque<Arc<OperationDriver>>,
    stopped: bool,
}

struct Shared {
    tablet_id: TabletId,
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub struct ApplyQueue {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ApplyQueue {
    pub fn start(tablet_id: TabletId) -> GraniteResult<Arc<Self>> {
        let shared = Arc::new(Shared {
            tablet_id,
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("apply-{}", shared.tablet_id))
            .spawn(move || worker.run())
            .map_err(|e| GraniteError::ServiceUnavailable(format!("cannot spawn apply thread: {e}")))?;
        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Reserve the next slot. Called in commit order.
    pub fn enqueue(&self, driver: Arc<OperationDriver>) -> GraniteResult<()> {
        let mut st = self.shared.state.lock();
        if st.stopped {
            return Err(GraniteError::ShutdownInProgress(format!(
                "apply queue of tablet {} is stopped",
                self.shared.tablet_id
            )));
        }
        st.slots.push_back(driver);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// A queued driver finished preparing.
    pub fn notify(&self) {
        let _st = self.shared.state.lock();
        self.shared.cond.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply what is ready, abort the rest and join the thread.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!(tablet_id = %self.shared.tablet_id, "apply thread panicked");
            }
        }
    }
}

impl Drop for ApplyQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        loop {
            let driver = {
                let mut st = self.state.lock();
                loop {
                    let ready = st.slots.front().map(|d| d.is_prepared());
                    match ready {
                        Some(true) => break st.slots.pop_front(),
                        Some(false) if st.stopped => break None,
                        None if st.stopped => break None,
                        _ => self.cond.wait(&mut st),
                    }
                }
            };
            match driver {
                Some(driver) => driver.apply(),
                None => break,
            }
        }

        let leftover: Vec<_> = self.state.lock().slots.drain(..).collect();
        if !leftover.is_empty() {
            warn!(
                tablet_id = %self.tablet_id,
                count = leftover.len(),
                "apply queue stopped with unprepared operations"
            );
        }
        for driver in leftover {
            driver.abort(GraniteError::Aborted("apply queue stopped".into()));
        }
        debug!(tablet_id = %self.tablet_id, "apply thread exiting");
    }
}
