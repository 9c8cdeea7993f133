//! Hybrid logical clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::hybrid_time::HybridTime;

/// Source of physical time in microseconds since the Unix epoch.
pub trait PhysicalClock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemPhysicalClock;

impl PhysicalClock for SystemPhysicalClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct MockPhysicalClock {
    micros: AtomicU64,
}

impl MockPhysicalClock {
    pub fn new(start_micros: u64) -> Arc<Self> {
        Arc::new(Self {
            micros: AtomicU64::new(start_micros),
        })
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance_micros(&self, delta: u64) {
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }
}

impl PhysicalClock for MockPhysicalClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Hybrid clock: `now()` never repeats and never goes backwards, and
/// `update()` folds in timestamps observed from other nodes.
pub struct HybridClock {
    physical: Arc<dyn PhysicalClock>,
    last: Mutex<HybridTime>,
}

impl HybridClock {
    pub fn new(physical: Arc<dyn PhysicalClock>) -> Arc<Self> {
        Arc::new(Self {
            physical,
            last: Mutex::new(HybridTime::MIN),
        })
    }

    pub fn system() -> Arc<Self> {
        Self::new(Arc::new(SystemPhysicalClock))
    }

    pub fn now(&self) -> HybridTime {
        let physical = HybridTime::from_micros(self.physical.now_micros());
        let mut last = self.last.lock();
        let next = if physical > *last {
            physical
        } else {
            last.incremented()
        };
        *last = next;
        next
    }

    /// Largest hybrid time handed out so far (does not advance the clock).
    pub fn peek(&self) -> HybridTime {
        *self.last.lock()
    }

    /// Move the clock forward so that subsequent `now()` values exceed `observed`.
    pub fn update(&self, observed: HybridTime) {
        if !observed.is_valid() || observed == HybridTime::MAX {
            return;
        }
        let mut last = self.last.lock();
        if observed > *last {
            *last = observed;
        }
    }

    pub fn physical_now_micros(&self) -> u64 {
        self.physical.now_micros()
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &*self.last.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_strictly_increasing_with_frozen_physical() {
        let physical = MockPhysicalClock::new(1_000);
        let clock = HybridClock::new(physical.clone());
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
        assert_eq!(a.physical_micros(), 1_000);
        assert_eq!(b.logical(), a.logical() + 1);
        physical.advance_micros(10);
        let c = clock.now();
        assert_eq!(c.physical_micros(), 1_010);
        assert_eq!(c.logical(), 0);
    }

    #[test]
    fn test_update_moves_clock_forward() {
        let physical = MockPhysicalClock::new(1_000);
        let clock = HybridClock::new(physical);
        let remote = HybridTime::from_micros_and_logical(5_000, 3);
        clock.update(remote);
        assert!(clock.now() > remote);
        clock.update(HybridTime::from_micros(10));
        assert!(clock.now() > remote);
    }

    #[test]
    fn test_update_ignores_invalid() {
        let clock = HybridClock::new(MockPhysicalClock::new(7));
        clock.update(HybridTime::INVALID);
        clock.update(HybridTime::MAX);
        assert_eq!(clock.now().physical_micros(), 7);
    }

    #[test]
    fn test_concurrent_now_unique() {
        let clock = HybridClock::new(MockPhysicalClock::new(100));
        let mut all = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..500).map(|_| clock.now()).collect::<Vec<_>>()))
                .collect();
            for h in handles {
                all.extend(h.join().unwrap());
            }
        });
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len);
    }
}
