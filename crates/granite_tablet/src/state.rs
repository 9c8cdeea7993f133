//! Tablet peer lifecycle state.
//!
//! ```text
//! NOT_STARTED ──► BOOTSTRAPPING ──► RUNNING ──► QUIESCING ──► SHUTDOWN
//!      │                │              │
//!      └────────────────┴──────────────┴──► FAILED ──► QUIESCING
//! ```
//!
//! SHUTDOWN is terminal. Transitions go through compare-and-swap only.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TabletPeerState {
    NotStarted = 0,
    Bootstrapping = 1,
    Running = 2,
    Quiescing = 3,
    Failed = 4,
    Shutdown = 5,
}

impl TabletPeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TabletPeerState::NotStarted,
            1 => TabletPeerState::Bootstrapping,
            2 => TabletPeerState::Running,
            3 => TabletPeerState::Quiescing,
            4 => TabletPeerState::Failed,
            _ => TabletPeerState::Shutdown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TabletPeerState::NotStarted => "NOT_STARTED",
            TabletPeerState::Bootstrapping => "BOOTSTRAPPING",
            TabletPeerState::Running => "RUNNING",
            TabletPeerState::Quiescing => "QUIESCING",
            TabletPeerState::Failed => "FAILED",
            TabletPeerState::Shutdown => "SHUTDOWN",
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// States from which shutdown has already begun.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, TabletPeerState::Quiescing | TabletPeerState::Shutdown)
    }
}

impl fmt::Display for TabletPeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct AtomicPeerState(AtomicU8);

impl AtomicPeerState {
    pub fn new(state: TabletPeerState) -> Self {
        AtomicPeerState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TabletPeerState {
        TabletPeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Returns the observed state on failure.
    pub fn transition(&self, from: TabletPeerState, to: TabletPeerState) -> Result<(), TabletPeerState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TabletPeerState::from_u8)
    }

    /// CAS loop moving to `to` from any state accepted by `allowed`.
    /// Returns the previous state, or the blocking state on failure.
    pub fn transition_if(
        &self,
        to: TabletPeerState,
        allowed: impl Fn(TabletPeerState) -> bool,
    ) -> Result<TabletPeerState, TabletPeerState> {
        let mut current = self.load();
        loop {
            if !allowed(current) {
                return Err(current);
            }
            match self.transition(current, to) {
                Ok(()) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_cas() {
        let s = AtomicPeerState::new(TabletPeerState::NotStarted);
        assert_eq!(
            s.transition(TabletPeerState::Running, TabletPeerState::Quiescing),
            Err(TabletPeerState::NotStarted)
        );
        s.transition(TabletPeerState::NotStarted, TabletPeerState::Bootstrapping)
            .unwrap();
        assert_eq!(s.load(), TabletPeerState::Bootstrapping);
    }

    #[test]
    fn test_transition_if() {
        let s = AtomicPeerState::new(TabletPeerState::Running);
        let prev = s
            .transition_if(TabletPeerState::Failed, |st| !st.is_shutting_down())
            .unwrap();
        assert_eq!(prev, TabletPeerState::Running);
        s.transition(TabletPeerState::Failed, TabletPeerState::Quiescing).unwrap();
        assert_eq!(
            s.transition_if(TabletPeerState::Failed, |st| !st.is_shutting_down()),
            Err(TabletPeerState::Quiescing)
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(TabletPeerState::NotStarted.to_string(), "NOT_STARTED");
        assert_eq!(TabletPeerState::Shutdown.code(), 5);
    }
}
