//! Consensus interface consumed by the tablet peer.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use granite_common::error::GraniteResult;
use granite_common::types::PeerId;
use granite_common::{HybridTime, OpId};

use crate::round::{ConsensusRound, ReplicateMsg};

/// Outcome of log replay handed to consensus at start.
#[derive(Debug, Clone, Default)]
pub struct ConsensusBootstrapInfo {
    pub last_id: OpId,
    pub last_committed_id: OpId,
    /// Replicated but uncommitted entries found at the tail of the log.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    NotLeader,
    /// Leader, but the entry opening its term is not committed yet.
    LeaderButNoOpNotCommitted,
    LeaderButNoMajorityReplicatedLease,
    LeaderAndReady,
}

impl fmt::Display for LeaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaderStatus::NotLeader => "NOT_LEADER",
            LeaderStatus::LeaderButNoOpNotCommitted => "LEADER_BUT_NO_OP_NOT_COMMITTED",
            LeaderStatus::LeaderButNoMajorityReplicatedLease => {
                "LEADER_BUT_NO_MAJORITY_REPLICATED_LEASE"
            }
            LeaderStatus::LeaderAndReady => "LEADER_AND_READY",
        };
        f.write_str(s)
    }
}

/// Callbacks from consensus into the replicated state machine.
pub trait ConsensusContext: Send + Sync {
    /// A follower received `round`; build and start its operation.
    fn start_replica_operation(
        &self,
        round: Arc<ConsensusRound>,
        propagated_safe_time: HybridTime,
    ) -> GraniteResult<()>;

    /// Called by the leader before each outgoing request. Returns the safe
    /// time to propagate to followers.
    fn prepare_peer_request(&self) -> HybridTime;

    /// A majority acknowledged the leader's latest request.
    fn majority_replicated(&self);

    /// A follower learned the leader's safe time.
    fn set_propagated_safe_time(&self, ht: HybridTime);
}

/// Black-box replicated log with leader election.
pub trait Consensus: Send + Sync {
    fn start(&self, info: ConsensusBootstrapInfo) -> GraniteResult<()>;

    fn is_running(&self) -> bool;

    /// Queue a leader round. Failures after queueing are delivered through
    /// the round's callback.
    fn replicate(&self, round: Arc<ConsensusRound>) -> GraniteResult<()>;

    /// Current term if this peer is leader.
    fn leader_term(&self) -> Option<u64>;

    fn leader_status(&self) -> LeaderStatus;

    /// Majority-replicated hybrid time lease, waiting until `deadline` for
    /// it to reach `min_allowed`. `HybridTime::MAX` when leases are off.
    fn majority_replicated_ht_lease_expiration(
        &self,
        min_allowed: HybridTime,
        deadline: Option<Instant>,
    ) -> GraniteResult<HybridTime>;

    fn last_committed_op_id(&self) -> OpId;

    fn last_received_op_id(&self) -> OpId;

    /// Smallest op id of a tracked retryable request, invalid if none.
    fn min_retryable_request_op_id(&self) -> OpId;

    fn step_down(&self) -> GraniteResult<()>;

    fn shutdown(&self);

    fn peer_id(&self) -> &PeerId;
}

/// Builds the consensus of a tablet, wiring it to its context.
pub type ConsensusFactory =
    Box<dyn FnOnce(Weak<dyn ConsensusContext>) -> GraniteResult<Arc<dyn Consensus>> + Send>;
