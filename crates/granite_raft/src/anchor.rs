//! Log anchors: owners that need log entries kept past GC.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use granite_common::error::{GraniteError, GraniteResult};

#[derive(Default)]
pub struct LogAnchorRegistry {
    anchors: Mutex<HashMap<String, u64>>,
}

impl LogAnchorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or move) the anchor of `owner` to `index`.
    pub fn register(&self, owner: &str, index: u64) {
        self.anchors.lock().insert(owner.to_string(), index);
    }

    pub fn unregister(&self, owner: &str) -> GraniteResult<()> {
        self.anchors
            .lock()
            .remove(owner)
            .map(|_| ())
            .ok_or_else(|| GraniteError::NotFound(format!("no log anchor owned by {owner}")))
    }

    /// Smallest anchored index, `None` without anchors.
    pub fn earliest_registered_index(&self) -> Option<u64> {
        self.anchors.lock().values().copied().min()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.lock().len()
    }

    /// RAII anchor released on drop.
    pub fn anchor(self: &Arc<Self>, owner: impl Into<String>, index: u64) -> LogAnchor {
        let owner = owner.into();
        self.register(&owner, index);
        LogAnchor {
            registry: Arc::clone(self),
            owner,
        }
    }
}

pub struct LogAnchor {
    registry: Arc<LogAnchorRegistry>,
    owner: String,
}

impl LogAnchor {
    pub fn update(&self, index: u64) {
        self.registry.register(&self.owner, index);
    }
}

impl Drop for LogAnchor {
    fn drop(&mut self) {
        let _ = self.registry.unregister(&self.owner);
    }
}
