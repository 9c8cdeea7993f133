//! Tablet bootstrap: bring storage up to the committed log position after a
//! restart.
//!
//! Committed entries above what storage already persisted are applied
//! directly, without going through consensus. Entries past the committed
//! index are handed back as orphans; consensus re-drives them once it starts.

use std::time::Instant;

use tracing::{debug, info, warn};

use granite_common::clock::HybridClock;
use granite_common::error::{ConsensusError, GraniteError, GraniteResult};
use granite_common::HybridTime;
use granite_raft::{ConsensusBootstrapInfo, ReplicateMsg, ReplicatedLog};

use crate::operation::{Operation, OperationRequest};
use crate::tablet::Tablet;

#[derive(Debug, Clone, Default)]
pub struct BootstrapResult {
    pub info: ConsensusBootstrapInfo,
    /// Hybrid time of the last committed entry, invalid for an empty log.
    pub last_replicated_ht: HybridTime,
    /// Entries applied to storage during replay.
    pub replayed: usize,
}

pub fn bootstrap_tablet(tablet: &Tablet, log: &dyn ReplicatedLog, clock: &HybridClock) -> GraniteResult<BootstrapResult> {
    let started = Instant::now();
    let floor = tablet.persistent_floor();
    let last_id = log.latest_entry_op_id();
    let committed = log.last_committed_op_id();

    let entries = read_replay_range(log, floor)?;
    let mut result = BootstrapResult {
        info: ConsensusBootstrapInfo {
            last_id,
            last_committed_id: committed,
            orphaned_replicates: Vec::new(),
        },
        ..Default::default()
    };

    for msg in entries {
        if msg.hybrid_time.is_valid() {
            clock.update(msg.hybrid_time);
        }
        tablet.update_monotonic_counter(msg.monotonic_counter);
        if msg.op_id.index > committed.index {
            result.info.orphaned_replicates.push(msg);
            continue;
        }
        if msg.hybrid_time.is_valid() {
            result.last_replicated_ht = result.last_replicated_ht.or(msg.hybrid_time).max(msg.hybrid_time);
        }
        if msg.op_type.is_consensus_internal() || msg.op_id.index <= floor {
            continue;
        }
        replay_entry(tablet, &msg)?;
        result.replayed += 1;
    }

    info!(
        tablet_id = %tablet.tablet_id(),
        %last_id,
        last_committed = %committed,
        persistent_floor = floor,
        replayed = result.replayed,
        orphans = result.info.orphaned_replicates.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "tablet bootstrap finished"
    );
    Ok(result)
}

/// Entries from the persisted floor on. The floor entry itself is read too
/// when still present, for its hybrid time.
fn read_replay_range(log: &dyn ReplicatedLog, floor: u64) -> GraniteResult<Vec<ReplicateMsg>> {
    let start = floor.max(1);
    match log.read_from(start) {
        Err(GraniteError::Consensus(ConsensusError::LogEntryGone { .. })) => {
            let first = log.first_index();
            if first > floor + 1 {
                return Err(GraniteError::Corruption(format!(
                    "log starts at {first} but storage only persisted up to {floor}"
                )));
            }
            debug!(floor, first, "replaying from first retained entry");
            log.read_from(first)
        }
        other => other,
    }
}

fn replay_entry(tablet: &Tablet, msg: &ReplicateMsg) -> GraniteResult<()> {
    let request = OperationRequest::decode(msg.op_type, &msg.payload)?;
    let mut op = Operation::new(request);
    op.set_op_id_and_time(msg.op_id, msg.hybrid_time);
    // replica prepare: no validation, only the no-op check of schema changes
    tablet.prepare(&mut op, false, Instant::now())?;
    tablet.apply(&op).map_err(|e| {
        warn!(tablet_id = %tablet.tablet_id(), op_id = %msg.op_id, error = %e, "replay failed");
        e.with_context(&format!("replaying {}", msg.op_id))
    })
}
