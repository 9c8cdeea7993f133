//! Consensus metadata (term, vote, configuration) and its store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use granite_common::error::{GraniteError, GraniteResult, StorageError};
use granite_common::types::{PeerId, TabletId};

/// Voting members of a raft group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub voters: Vec<PeerId>,
}

impl RaftConfig {
    pub fn new(voters: Vec<PeerId>) -> Self {
        RaftConfig { voters }
    }

    pub fn single(peer: PeerId) -> Self {
        RaftConfig {
            voters: vec![peer],
        }
    }

    pub fn majority_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.voters.contains(peer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMetadata {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub committed_config: RaftConfig,
}

/// Stand-in for the on-disk consensus metadata files of all tablets on a
/// server. Records are kept encoded so that a reload goes through the same
/// decode path as a restart.
#[derive(Default)]
pub struct ConsensusMetadataStore {
    records: Mutex<HashMap<(TabletId, PeerId), Vec<u8>>>,
}

impl ConsensusMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn save(&self, tablet: &TabletId, peer: &PeerId, meta: &ConsensusMetadata) -> GraniteResult<()> {
        let encoded = bincode::serialize(meta)
            .map_err(|e| StorageError::Serialization(format!("consensus metadata: {e}")))?;
        self.records
            .lock()
            .insert((tablet.clone(), peer.clone()), encoded);
        Ok(())
    }

    pub fn load(&self, tablet: &TabletId, peer: &PeerId) -> GraniteResult<Option<ConsensusMetadata>> {
        let records = self.records.lock();
        let Some(bytes) = records.get(&(tablet.clone(), peer.clone())) else {
            return Ok(None);
        };
        bincode::deserialize(bytes)
            .map(Some)
            .map_err(|e| GraniteError::Corruption(format!("consensus metadata of {tablet}: {e}")))
    }

    pub fn delete(&self, tablet: &TabletId, peer: &PeerId) {
        self.records.lock().remove(&(tablet.clone(), peer.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let store = ConsensusMetadataStore::new();
        let tablet = TabletId::new("t1");
        let peer = PeerId::new("ts-1");
        assert_eq!(store.load(&tablet, &peer).unwrap(), None);
        let meta = ConsensusMetadata {
            current_term: 3,
            voted_for: Some(peer.clone()),
            committed_config: RaftConfig::single(peer.clone()),
        };
        store.save(&tablet, &peer, &meta).unwrap();
        assert_eq!(store.load(&tablet, &peer).unwrap(), Some(meta));
        store.delete(&tablet, &peer);
        assert_eq!(store.load(&tablet, &peer).unwrap(), None);
    }

    #[test]
    fn test_majority() {
        let cfg = RaftConfig::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(cfg.majority_size(), 2);
        assert_eq!(RaftConfig::single("a".into()).majority_size(), 1);
        assert!(cfg.contains(&PeerId::new("b")));
    }
}
