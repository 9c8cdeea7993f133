//! Replicate messages and consensus rounds.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use granite_common::error::GraniteResult;
use granite_common::types::ClientRequestId;
use granite_common::{HybridTime, OpId};

/// Consensus-level type tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    NoOp,
    ChangeConfig,
    Write,
    ChangeMetadata,
    UpdateTransaction,
    Truncate,
    Snapshot,
    HistoryCutoff,
    Split,
    Unknown,
}

impl OpType {
    /// Entries consumed by consensus itself and never handed to the tablet.
    pub fn is_consensus_internal(self) -> bool {
        matches!(self, OpType::NoOp | OpType::ChangeConfig)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpType::NoOp => "no_op",
            OpType::ChangeConfig => "change_config",
            OpType::Write => "write",
            OpType::ChangeMetadata => "change_metadata",
            OpType::UpdateTransaction => "update_transaction",
            OpType::Truncate => "truncate",
            OpType::Snapshot => "snapshot",
            OpType::HistoryCutoff => "history_cutoff",
            OpType::Split => "split",
            OpType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    pub op_type: OpType,
    /// Encoded tablet request; empty for consensus-internal entries.
    pub payload: Bytes,
    /// Leader's committed op id when the entry was appended.
    pub committed_op_id: OpId,
    pub monotonic_counter: u64,
    pub client_request: Option<ClientRequestId>,
}

impl ReplicateMsg {
    /// A message whose op id and hybrid time are assigned at append time.
    pub fn new(op_type: OpType, payload: Bytes) -> Self {
        ReplicateMsg {
            op_id: OpId::INVALID,
            hybrid_time: HybridTime::INVALID,
            op_type,
            payload,
            committed_op_id: OpId::INVALID,
            monotonic_counter: 0,
            client_request: None,
        }
    }

    pub fn with_client_request(mut self, id: ClientRequestId) -> Self {
        self.client_request = Some(id);
        self
    }

    pub fn encoded_len(&self) -> usize {
        self.payload.len() + 48
    }
}

/// Notifications a round sends to the operation that owns it.
pub trait ConsensusRoundCallback: Send + Sync {
    /// Called under the leader's append lock once the entry has an op id.
    /// Returns the hybrid time to stamp into the entry.
    fn added_to_leader(&self, op_id: OpId, committed_op_id: OpId) -> HybridTime;

    /// Called exactly once: `Ok(op_id)` when committed, the error otherwise.
    fn replication_finished(&self, result: GraniteResult<OpId>, leader_term: Option<u64>);
}

/// An entry travelling through consensus together with its callback.
///
/// The callback is taken when it fires so that a finished round no longer
/// keeps its operation alive.
pub struct ConsensusRound {
    msg: Mutex<ReplicateMsg>,
    bound_term: Option<u64>,
    callback: Mutex<Option<Arc<dyn ConsensusRoundCallback>>>,
}

impl ConsensusRound {
    pub fn new(msg: ReplicateMsg) -> Arc<Self> {
        Arc::new(Self {
            msg: Mutex::new(msg),
            bound_term: None,
            callback: Mutex::new(None),
        })
    }

    /// A leader round that must be appended in `term` or fail.
    pub fn bound_to_term(msg: ReplicateMsg, term: u64) -> Arc<Self> {
        Arc::new(Self {
            msg: Mutex::new(msg),
            bound_term: Some(term),
            callback: Mutex::new(None),
        })
    }

    pub fn set_callback(&self, callback: Arc<dyn ConsensusRoundCallback>) {
        *self.callback.lock() = Some(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn bound_term(&self) -> Option<u64> {
        self.bound_term
    }

    pub fn replicate_msg(&self) -> ReplicateMsg {
        self.msg.lock().clone()
    }

    pub fn op_id(&self) -> OpId {
        self.msg.lock().op_id
    }

    pub fn op_type(&self) -> OpType {
        self.msg.lock().op_type
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.msg.lock().hybrid_time
    }

    pub fn client_request(&self) -> Option<ClientRequestId> {
        self.msg.lock().client_request
    }

    pub(crate) fn update_msg(&self, f: impl FnOnce(&mut ReplicateMsg)) {
        f(&mut self.msg.lock());
    }

    /// `None` when the round has no callback (consensus-internal entries).
    pub(crate) fn notify_added_to_leader(&self, op_id: OpId, committed: OpId) -> Option<HybridTime> {
        let callback = self.callback.lock().clone();
        callback.map(|cb| cb.added_to_leader(op_id, committed))
    }

    pub(crate) fn notify_replication_finished(
        &self,
        result: GraniteResult<OpId>,
        leader_term: Option<u64>,
    ) {
        let callback = self.callback.lock().take();
        if let Some(cb) = callback {
            cb.replication_finished(result, leader_term);
        }
    }
}

impl fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.msg.lock();
        f.debug_struct("ConsensusRound")
            .field("op_id", &msg.op_id)
            .field("op_type", &msg.op_type)
            .field("bound_term", &self.bound_term)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        finished: AtomicUsize,
    }

    impl ConsensusRoundCallback for Counting {
        fn added_to_leader(&self, _op_id: OpId, _committed: OpId) -> HybridTime {
            HybridTime::from_micros(7)
        }

        fn replication_finished(&self, _result: GraniteResult<OpId>, _term: Option<u64>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_callback_fires_once() {
        let cb = Arc::new(Counting {
            finished: AtomicUsize::new(0),
        });
        let round = ConsensusRound::new(ReplicateMsg::new(OpType::Write, Bytes::new()));
        round.set_callback(cb.clone());
        assert_eq!(
            round.notify_added_to_leader(OpId::new(1, 1), OpId::INVALID),
            Some(HybridTime::from_micros(7))
        );
        round.notify_replication_finished(Ok(OpId::new(1, 1)), Some(1));
        round.notify_replication_finished(Ok(OpId::new(1, 1)), Some(1));
        assert_eq!(cb.finished.load(Ordering::SeqCst), 1);
        assert!(!round.has_callback());
    }

    #[test]
    fn test_internal_op_types() {
        assert!(OpType::NoOp.is_consensus_internal());
        assert!(OpType::ChangeConfig.is_consensus_internal());
        assert!(!OpType::Write.is_consensus_internal());
        assert!(!OpType::Unknown.is_consensus_internal());
    }

    #[test]
    fn test_msg_serializes() {
        let msg = ReplicateMsg::new(OpType::Write, Bytes::from_static(b"abc")).with_client_request(
            ClientRequestId {
                client_id: 1,
                request_id: 2,
            },
        );
        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: ReplicateMsg = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
