//! Interruptible stop signal for background runners (log GC, heartbeats).
//!
//! Runners sleep through `wait_timeout` instead of `thread::sleep` so that a
//! stop request wakes them within milliseconds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter. Returns false if shutdown had
    /// already been requested.
    pub fn shutdown(&self) -> bool {
        let _guard = self.inner.mutex.lock();
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`. Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_shutdown() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_signal_starts_clear() {
        let sig = ShutdownSignal::new();
        assert!(!sig.is_shutdown());
        assert!(!sig.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_shutdown_reports_first_caller() {
        let sig = ShutdownSignal::new();
        assert!(sig.shutdown());
        assert!(!sig.shutdown());
        assert!(sig.is_shutdown());
    }

    #[test]
    fn test_wait_wakes_on_shutdown() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = sig2.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }
}
