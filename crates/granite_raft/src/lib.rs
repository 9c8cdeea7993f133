//! Replication layer of a tablet: the replicated log, consensus rounds,
//! log anchors, consensus metadata, retryable request tracking and the
//! in-process consensus implementation.

pub mod anchor;
pub mod consensus;
pub mod local;
pub mod log;
pub mod metadata;
pub mod retryable;
pub mod round;

pub use anchor::{LogAnchor, LogAnchorRegistry};
pub use consensus::{
    Consensus, ConsensusBootstrapInfo, ConsensusContext, ConsensusFactory, LeaderStatus,
};
pub use local::{LocalConsensus, LocalConsensusOptions, RaftRole};
pub use log::{MemLog, ReplicatedLog};
pub use metadata::{ConsensusMetadata, ConsensusMetadataStore, RaftConfig};
pub use retryable::RetryableRequests;
pub use round::{ConsensusRound, ConsensusRoundCallback, OpType, ReplicateMsg};
