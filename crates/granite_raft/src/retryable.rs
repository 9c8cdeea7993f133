//! Client request ids seen by consensus, for duplicate write detection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::ClientRequestId;
use granite_common::OpId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    op_id: OpId,
    replicated: bool,
    at: Instant,
}

/// Request ids that are in flight or were replicated within the retention
/// window.
#[derive(Debug)]
pub struct RetryableRequests {
    timeout: Duration,
    entries: HashMap<ClientRequestId, Entry>,
}

impl RetryableRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    /// Track `id` at `op_id`. Fails with `AlreadyPresent` if the request is
    /// already in flight or was replicated.
    pub fn register(&mut self, id: ClientRequestId, op_id: OpId, now: Instant) -> GraniteResult<()> {
        if let Some(existing) = self.entries.get(&id) {
            let what = if existing.replicated {
                "already replicated"
            } else {
                "already in flight"
            };
            return Err(GraniteError::AlreadyPresent(format!(
                "duplicate request {id}: {what} at {}",
                existing.op_id
            )));
        }
        self.entries.insert(
            id,
            Entry {
                op_id,
                replicated: false,
                at: now,
            },
        );
        Ok(())
    }

    pub fn replicated(&mut self, id: ClientRequestId, now: Instant) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.replicated = true;
            e.at = now;
        }
    }

    /// Forget an in-flight request that failed to replicate.
    pub fn aborted(&mut self, id: ClientRequestId) {
        if matches!(self.entries.get(&id), Some(e) if !e.replicated) {
            self.entries.remove(&id);
        }
    }

    /// Drop replicated requests older than the retention window.
    pub fn clean_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, e| !e.replicated || now.saturating_duration_since(e.at) < timeout);
        before - self.entries.len()
    }

    /// Smallest op id still tracked, `OpId::INVALID` if none.
    pub fn min_op_id(&self) -> OpId {
        self.entries
            .values()
            .map(|e| e.op_id)
            .min()
            .unwrap_or(OpId::INVALID)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
