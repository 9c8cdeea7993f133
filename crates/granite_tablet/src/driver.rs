//! Operation driver: moves one operation through prepare, replicate and
//! apply.
//!
//! ```text
//! Init ─► Prepare ─► Replicate ─► Apply ─► Done
//!   └────────┴───────────┴──────────┴────► Aborted
//! ```
//!
//! Leader drivers carry the term they were submitted in and get their op id
//! and hybrid time from consensus (`added_to_leader`). Replica drivers carry
//! no term; their round arrives with both already fixed. Either way the
//! commit notification reserves a slot in the tablet's [`ApplyQueue`] and
//! the apply thread runs `apply` in commit order.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::TabletId;
use granite_common::{HybridTime, OpId};
use granite_raft::{Consensus, ConsensusRound, ConsensusRoundCallback, ReplicateMsg};

use crate::apply_queue::ApplyQueue;
use crate::mvcc::MvccManager;
use crate::operation::{Operation, OperationKind, OperationRequest};
use crate::preparer::Preparer;
use crate::tablet::Tablet;
use crate::tracker::OperationTracker;

/// How long a leader prepare waits for row locks and write permits.
const PREPARE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Init,
    Prepare,
    Replicate,
    Apply,
    Done,
    Aborted,
}

impl DriverPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverPhase::Init => "INIT",
            DriverPhase::Prepare => "PREPARE",
            DriverPhase::Replicate => "REPLICATE",
            DriverPhase::Apply => "APPLY",
            DriverPhase::Done => "DONE",
            DriverPhase::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DriverPhase::Done | DriverPhase::Aborted)
    }
}

impl fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a driver, for in-flight operation listings.
#[derive(Debug, Clone)]
pub struct DriverSnapshot {
    pub driver_id: u64,
    pub kind: OperationKind,
    pub phase: DriverPhase,
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    pub leader_term: Option<u64>,
    pub running_for: Duration,
    /// Time from driver creation to entering each phase.
    pub trace: Vec<(DriverPhase, Duration)>,
}

/// Shared per-tablet context of every driver.
pub struct Pipeline {
    pub(crate) tablet_id: TabletId,
    pub(crate) tablet: Arc<Tablet>,
    pub(crate) mvcc: Arc<MvccManager>,
    pub(crate) tracker: Arc<OperationTracker>,
    pub(crate) preparer: Arc<Preparer>,
    pub(crate) apply_queue: Arc<ApplyQueue>,
    pub(crate) consensus: OnceLock<Arc<dyn Consensus>>,
    on_apply_failure: Box<dyn Fn(&GraniteError) + Send + Sync>,
    next_driver_id: AtomicU64,
}

impl Pipeline {
    pub fn new(
        tablet: Arc<Tablet>,
        mvcc: Arc<MvccManager>,
        tracker: Arc<OperationTracker>,
        preparer: Arc<Preparer>,
        apply_queue: Arc<ApplyQueue>,
        on_apply_failure: Box<dyn Fn(&GraniteError) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tablet_id: tablet.tablet_id().clone(),
            tablet,
            mvcc,
            tracker,
            preparer,
            apply_queue,
            consensus: OnceLock::new(),
            on_apply_failure,
            next_driver_id: AtomicU64::new(1),
        })
    }

    pub fn set_consensus(&self, consensus: Arc<dyn Consensus>) -> GraniteResult<()> {
        self.consensus
            .set(consensus)
            .map_err(|_| GraniteError::IllegalState("consensus already attached".into()))
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn preparer(&self) -> &Arc<Preparer> {
        &self.preparer
    }

    pub fn apply_queue(&self) -> &Arc<ApplyQueue> {
        &self.apply_queue
    }

    /// Build a driver and start it: register, then prepare on the pool.
    /// Failures before the operation reaches the pool are reported through
    /// its callback and returned.
    pub fn submit(self: &Arc<Self>, operation: Operation, leader_term: Option<u64>) -> GraniteResult<()> {
        let driver = OperationDriver::new(Arc::clone(self), operation, leader_term);
        driver.execute()
    }

    /// Start a replica operation whose round already carries its op id.
    pub fn submit_replica(self: &Arc<Self>, mut operation: Operation, round: Arc<ConsensusRound>) -> GraniteResult<()> {
        operation.set_op_id_and_time(round.op_id(), round.hybrid_time());
        operation.set_round(Arc::clone(&round));
        let driver = OperationDriver::new(Arc::clone(self), operation, None);
        round.set_callback(driver.clone());
        driver.execute()
    }
}

struct DriverState {
    phase: DriverPhase,
    operation: Option<Operation>,
    op_id: OpId,
    hybrid_time: HybridTime,
    prepare_error: Option<GraniteError>,
    trace: Vec<(DriverPhase, Duration)>,
}

pub struct OperationDriver {
    id: u64,
    pipeline: Arc<Pipeline>,
    leader_term: Option<u64>,
    kind: OperationKind,
    started: Instant,
    prepared: AtomicBool,
    state: Mutex<DriverState>,
}

impl OperationDriver {
    fn new(pipeline: Arc<Pipeline>, operation: Operation, leader_term: Option<u64>) -> Arc<Self> {
        let id = pipeline.next_driver_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            leader_term,
            kind: operation.kind(),
            started: Instant::now(),
            prepared: AtomicBool::new(false),
            state: Mutex::new(DriverState {
                phase: DriverPhase::Init,
                op_id: operation.op_id(),
                hybrid_time: operation.hybrid_time(),
                operation: Some(operation),
                prepare_error: None,
                trace: vec![(DriverPhase::Init, Duration::ZERO)],
            }),
            pipeline,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn leader_term(&self) -> Option<u64> {
        self.leader_term
    }

    pub fn phase(&self) -> DriverPhase {
        self.state.lock().phase
    }

    pub fn op_id(&self) -> OpId {
        self.state.lock().op_id
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.state.lock().hybrid_time
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        let st = self.state.lock();
        DriverSnapshot {
            driver_id: self.id,
            kind: self.kind,
            phase: st.phase,
            op_id: st.op_id,
            hybrid_time: st.hybrid_time,
            leader_term: self.leader_term,
            running_for: self.started.elapsed(),
            trace: st.trace.clone(),
        }
    }

    fn set_phase(st: &mut DriverState, started: Instant, phase: DriverPhase) {
        st.phase = phase;
        st.trace.push((phase, started.elapsed()));
    }

    fn execute(self: &Arc<Self>) -> GraniteResult<()> {
        let p = &self.pipeline;
        if let Err(e) = p.tracker.add(Arc::clone(self), self.leader_term.is_some()) {
            self.finish(Err(e.clone()));
            return Err(e);
        }
        // in-memory operations are committed by definition
        if self.kind == OperationKind::Empty {
            self.prepared.store(true, Ordering::Release);
            Self::set_phase(&mut self.state.lock(), self.started, DriverPhase::Apply);
            if let Err(e) = p.apply_queue.enqueue(Arc::clone(self)) {
                self.abort(e.clone());
                return Err(e);
            }
            return Ok(());
        }
        Self::set_phase(&mut self.state.lock(), self.started, DriverPhase::Prepare);
        if let Err(e) = p.preparer.submit(Arc::clone(self)) {
            if self.leader_term.is_none() {
                // a replicated entry must still be applied
                debug!(tablet_id = %p.tablet_id, kind = %self.kind, error = %e, "preparing replica operation inline");
                self.prepare_and_start();
                return Ok(());
            }
            warn!(tablet_id = %p.tablet_id, kind = %self.kind, error = %e, "prepare rejected");
            self.abort(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Runs on the prepare pool.
    pub(crate) fn prepare_and_start(self: &Arc<Self>) {
        let p = &self.pipeline;
        let leader = self.leader_term.is_some();
        let deadline = Instant::now() + PREPARE_LOCK_TIMEOUT;
        // prepare may wait on row locks; keep the driver lock free meanwhile
        let Some(mut op) = self.state.lock().operation.take() else {
            return;
        };
        let result = p.tablet.prepare(&mut op, leader, deadline);
        {
            let mut st = self.state.lock();
            if st.phase.is_terminal() {
                drop(st);
                op.complete(Err(GraniteError::Aborted("operation aborted during prepare".into())));
                return;
            }
            st.operation = Some(op);
        }

        let Some(term) = self.leader_term else {
            match result {
                Ok(()) => {
                    self.prepared.store(true, Ordering::Release);
                    p.apply_queue.notify();
                }
                Err(e) => self.fail_replica_prepare(e),
            }
            return;
        };
        if let Err(e) = result {
            debug!(tablet_id = %p.tablet_id, kind = %self.kind, error = %e, "prepare failed");
            self.abort(e);
            return;
        }

        let round = match self.build_round(term) {
            Ok(round) => round,
            Err(e) => {
                self.abort(e);
                return;
            }
        };
        self.prepared.store(true, Ordering::Release);
        let Some(consensus) = p.consensus.get() else {
            self.abort(GraniteError::IllegalState("consensus is not initialized".into()));
            return;
        };
        if let Err(e) = consensus.replicate(round) {
            self.abort(e);
        }
    }

    fn build_round(self: &Arc<Self>, term: u64) -> GraniteResult<Arc<ConsensusRound>> {
        let mut st = self.state.lock();
        let Some(op) = st.operation.as_mut() else {
            return Err(GraniteError::Aborted("operation already finished".into()));
        };
        let op_type = op.kind().op_type().ok_or_else(|| {
            GraniteError::internal_bug("REPLICATE_IN_MEMORY_OP", format!("{} has no log type", op.kind()))
        })?;
        let mut msg = ReplicateMsg::new(op_type, op.request().encode()?);
        if let Some(id) = op.request().client_request() {
            msg = msg.with_client_request(id);
        }
        let round = ConsensusRound::bound_to_term(msg, term);
        round.set_callback(Arc::clone(self) as Arc<dyn ConsensusRoundCallback>);
        op.set_round(Arc::clone(&round));
        Self::set_phase(&mut st, self.started, DriverPhase::Replicate);
        Ok(round)
    }

    /// A replica operation that could not be prepared is still committed;
    /// it is marked prepared so the apply thread reaches it and fails the
    /// tablet.
    fn fail_replica_prepare(&self, error: GraniteError) {
        self.state.lock().prepare_error = Some(error);
        self.prepared.store(true, Ordering::Release);
        self.pipeline.apply_queue.notify();
    }

    /// Runs on the apply thread, in commit order.
    pub(crate) fn apply(self: &Arc<Self>) {
        let p = &self.pipeline;
        let (op_id, ht, prepare_error) = {
            let mut st = self.state.lock();
            Self::set_phase(&mut st, self.started, DriverPhase::Apply);
            (st.op_id, st.hybrid_time, st.prepare_error.take())
        };

        if let OperationKind::Empty = self.kind {
            let propagated = self.state.lock().operation.as_ref().and_then(|op| match op.request() {
                OperationRequest::Empty {
                    propagated_safe_time,
                } => Some(*propagated_safe_time),
                _ => None,
            });
            if let Some(safe_time) = propagated {
                p.mvcc.set_propagated_safe_time(safe_time);
            }
            self.finish(Ok(()));
            return;
        }

        let result = match prepare_error {
            Some(e) => Err(e),
            None if op_id.index <= p.tablet.persistent_floor() => {
                debug!(tablet_id = %p.tablet_id, %op_id, "skipping already persisted operation");
                Ok(())
            }
            None => {
                let st = self.state.lock();
                match st.operation.as_ref() {
                    Some(op) => p.tablet.apply(op),
                    None => Ok(()),
                }
            }
        };

        match result {
            Ok(()) => {
                p.mvcc.replicated(ht);
                self.finish(Ok(()));
            }
            Err(e) => {
                error!(
                    tablet_id = %p.tablet_id,
                    %op_id,
                    kind = %self.kind,
                    error = %e,
                    "failed to apply committed operation"
                );
                p.mvcc.aborted(ht);
                (p.on_apply_failure)(&e);
                self.finish(Err(e));
            }
        }
    }

    /// Abort before or instead of apply.
    pub(crate) fn abort(&self, error: GraniteError) {
        self.finish(Err(error));
    }

    fn finish(&self, result: GraniteResult<()>) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        let operation = {
            let mut st = self.state.lock();
            if st.phase.is_terminal() {
                return;
            }
            let phase = if result.is_ok() {
                DriverPhase::Done
            } else {
                DriverPhase::Aborted
            };
            Self::set_phase(&mut st, self.started, phase);
            st.operation.take()
        };
        // completion runs outside the driver lock
        if let Some(mut op) = operation {
            op.complete(result);
        }
        self.pipeline.tracker.release(self.id);
        granite_observability::record_operation(
            self.kind.as_str(),
            outcome,
            self.started.elapsed().as_micros() as u64,
        );
    }
}

impl ConsensusRoundCallback for OperationDriver {
    fn added_to_leader(&self, op_id: OpId, _committed_op_id: OpId) -> HybridTime {
        let ht = self.pipeline.mvcc.add_leader_pending(op_id);
        let mut st = self.state.lock();
        st.op_id = op_id;
        st.hybrid_time = ht;
        if let Some(op) = st.operation.as_mut() {
            op.set_op_id_and_time(op_id, ht);
        }
        ht
    }

    fn replication_finished(&self, result: GraniteResult<OpId>, _leader_term: Option<u64>) {
        match result {
            Ok(op_id) => {
                let Some(me) = self.pipeline.tracker.get(self.id) else {
                    warn!(tablet_id = %self.pipeline.tablet_id, %op_id, "committed operation is not tracked");
                    return;
                };
                if let Err(e) = self.pipeline.apply_queue.enqueue(me) {
                    error!(tablet_id = %self.pipeline.tablet_id, %op_id, error = %e, "cannot queue committed operation");
                    (self.pipeline.on_apply_failure)(&e);
                    self.abort(e);
                }
            }
            Err(e) => {
                let ht = self.hybrid_time();
                if ht.is_valid() {
                    self.pipeline.mvcc.aborted(ht);
                }
                debug!(tablet_id = %self.pipeline.tablet_id, kind = %self.kind, error = %e, "replication failed");
                self.abort(e);
            }
        }
    }
}

impl fmt::Debug for OperationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDriver")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("leader_term", &self.leader_term)
            .finish()
    }
}
