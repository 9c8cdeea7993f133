//! Tablet peer: one replica of a tablet.
//!
//! The peer owns the tablet's runtime pieces (storage, log, consensus, the
//! operation pipeline, MVCC) and sequences their lifecycle:
//!
//! ```text
//! new ─► set_bootstrapping ─► init_tablet_peer ─► start ─► shutdown
//! ```
//!
//! It is also the consensus state machine: replicated entries come back
//! through [`ConsensusContext`] and the leader asks it for the safe time to
//! propagate with every request.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use granite_common::clock::HybridClock;
use granite_common::config::GraniteConfig;
use granite_common::error::{GraniteError, GraniteResult};
use granite_common::types::{PeerId, TableId, TabletId};
use granite_common::{HybridTime, HybridTimeLease, OpId};
use granite_executor::ThreadPool;
use granite_raft::{
    Consensus, ConsensusContext, ConsensusFactory, ConsensusRound, LeaderStatus, LogAnchorRegistry,
    ReplicatedLog,
};
use granite_storage::{FlushFilter, KeyRange, MemtableInfo};

use crate::apply_queue::ApplyQueue;
use crate::bootstrap::BootstrapResult;
use crate::driver::{DriverSnapshot, Pipeline};
use crate::log_gc::{LogGcOp, LogGcRunner, MaintenanceOp};
use crate::mvcc::MvccManager;
use crate::operation::{HistoryCutoffRequest, Operation, OperationRequest};
use crate::preparer::{PrepareLatency, Preparer};
use crate::state::{AtomicPeerState, TabletPeerState};
use crate::tablet::{ReadRow, Tablet, TableType, TabletDataState};
use crate::tracker::OperationTracker;
use crate::write_query::WriteQuery;

/// Notified when the peer changes in a way the catalog should hear about.
/// The second argument is a human readable reason.
pub type MarkDirtyCallback = Arc<dyn Fn(&TabletId, &str) + Send + Sync>;

/// Lower bound on the log index still needed by the transaction
/// coordinator, 0 when it needs nothing.
pub type TransactionGcBound = Arc<dyn Fn() -> u64 + Send + Sync>;

/// What `init_tablet_peer` wires together.
pub struct TabletPeerResources {
    pub tablet: Arc<Tablet>,
    pub log: Arc<dyn ReplicatedLog>,
    pub consensus_factory: ConsensusFactory,
    pub prepare_pool: Arc<ThreadPool>,
    pub log_gc_runner: Option<Arc<LogGcRunner>>,
}

struct PeerComponents {
    tablet: Arc<Tablet>,
    log: Arc<dyn ReplicatedLog>,
    consensus: Arc<dyn Consensus>,
    mvcc: Arc<MvccManager>,
    pipeline: Arc<Pipeline>,
    log_gc_runner: Option<Arc<LogGcRunner>>,
    log_gc_op: Mutex<Option<Arc<LogGcOp>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Served by the leader at a lease-bounded safe time.
    Strong,
    /// Served by any replica at its safe time.
    ConsistentPrefix,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub range: KeyRange,
    /// Column names; `None` reads every column.
    pub projection: Option<Vec<String>>,
    pub read_time: Option<HybridTime>,
    pub consistency: ReadConsistency,
    pub deadline: Option<Instant>,
}

impl ReadRequest {
    pub fn new(range: KeyRange, consistency: ReadConsistency) -> Self {
        ReadRequest {
            range,
            projection: None,
            read_time: None,
            consistency,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub rows: Vec<ReadRow>,
    pub read_time: HybridTime,
}

#[derive(Debug, Clone)]
pub struct TabletStatus {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub state: TabletPeerState,
    pub last_op_id: OpId,
    pub on_disk_size: u64,
    pub last_status: String,
}

/// Inputs of the log GC bound. Zero means "no constraint" for every
/// optional source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcBoundInputs {
    pub latest_index: u64,
    pub earliest_anchor: Option<u64>,
    pub min_pending_index: u64,
    pub min_retryable_index: u64,
    pub transaction_bound: u64,
    pub last_committed_index: u64,
    /// Max persisted op index of each store that participates. Zero here
    /// does constrain the bound.
    pub persistent_indexes: Vec<u64>,
}

/// Smallest log index that must be retained.
pub fn earliest_needed_log_index(inputs: &GcBoundInputs) -> u64 {
    if inputs.latest_index == 0 {
        return 0;
    }
    let optional = [
        inputs.min_pending_index,
        inputs.min_retryable_index,
        inputs.transaction_bound,
    ];
    optional
        .into_iter()
        .filter(|i| *i > 0)
        .chain(inputs.earliest_anchor)
        .chain(inputs.persistent_indexes.iter().copied())
        .chain([inputs.latest_index, inputs.last_committed_index])
        .min()
        .unwrap_or(0)
}

pub struct TabletPeer {
    tablet_id: TabletId,
    peer_id: PeerId,
    config: Arc<GraniteConfig>,
    clock: Arc<HybridClock>,
    state: AtomicPeerState,
    weak_self: Weak<TabletPeer>,
    components: OnceLock<PeerComponents>,
    anchors: Arc<LogAnchorRegistry>,
    mark_dirty: Option<MarkDirtyCallback>,
    transaction_gc_bound: Mutex<Option<TransactionGcBound>>,
    failure: Mutex<Option<GraniteError>>,
    last_status: Mutex<String>,
}

impl TabletPeer {
    pub fn new(
        tablet_id: TabletId,
        peer_id: PeerId,
        config: Arc<GraniteConfig>,
        clock: Arc<HybridClock>,
        mark_dirty: Option<MarkDirtyCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            tablet_id,
            peer_id,
            config,
            clock,
            state: AtomicPeerState::new(TabletPeerState::NotStarted),
            weak_self: weak_self.clone(),
            components: OnceLock::new(),
            anchors: LogAnchorRegistry::new(),
            mark_dirty,
            transaction_gc_bound: Mutex::new(None),
            failure: Mutex::new(None),
            last_status: Mutex::new(String::new()),
        })
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> TabletPeerState {
        self.state.load()
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn log_anchor_registry(&self) -> &Arc<LogAnchorRegistry> {
        &self.anchors
    }

    fn components(&self) -> GraniteResult<&PeerComponents> {
        self.components.get().ok_or_else(|| {
            GraniteError::IllegalState(format!("tablet peer {} is not initialized", self.tablet_id))
        })
    }

    pub fn tablet(&self) -> GraniteResult<Arc<Tablet>> {
        Ok(Arc::clone(&self.components()?.tablet))
    }

    pub fn consensus(&self) -> GraniteResult<Arc<dyn Consensus>> {
        Ok(Arc::clone(&self.components()?.consensus))
    }

    pub fn log(&self) -> GraniteResult<Arc<dyn ReplicatedLog>> {
        Ok(Arc::clone(&self.components()?.log))
    }

    pub fn mvcc(&self) -> GraniteResult<Arc<MvccManager>> {
        Ok(Arc::clone(&self.components()?.mvcc))
    }

    pub fn operation_tracker(&self) -> GraniteResult<Arc<OperationTracker>> {
        Ok(Arc::clone(self.components()?.pipeline.tracker()))
    }

    pub fn set_transaction_gc_bound(&self, bound: TransactionGcBound) {
        *self.transaction_gc_bound.lock() = Some(bound);
    }

    /// Test hook: delay every prepare of this tablet.
    pub fn inject_prepare_latency(&self, latency: PrepareLatency) -> GraniteResult<()> {
        self.components()?.pipeline.preparer().inject_prepare_latency(latency);
        Ok(())
    }

    pub fn set_last_status(&self, status: impl Into<String>) {
        *self.last_status.lock() = status.into();
    }

    pub fn last_status(&self) -> String {
        self.last_status.lock().clone()
    }

    fn record_state(&self) {
        granite_observability::record_tablet_state(self.tablet_id.as_str(), self.state().code());
    }

    fn notify_dirty(&self, reason: &str) {
        if let Some(cb) = &self.mark_dirty {
            cb(&self.tablet_id, reason);
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    pub fn set_bootstrapping(&self) -> GraniteResult<()> {
        self.state
            .transition(TabletPeerState::NotStarted, TabletPeerState::Bootstrapping)
            .map_err(|current| {
                GraniteError::IllegalState(format!(
                    "cannot bootstrap tablet {} in state {current}",
                    self.tablet_id
                ))
            })?;
        self.set_last_status("bootstrapping");
        self.record_state();
        Ok(())
    }

    pub fn init_tablet_peer(&self, resources: TabletPeerResources) -> GraniteResult<()> {
        let state = self.state();
        if state != TabletPeerState::Bootstrapping {
            return Err(GraniteError::IllegalState(format!(
                "cannot initialize tablet {} in state {state}",
                self.tablet_id
            )));
        }
        if self.components.get().is_some() {
            return Err(GraniteError::IllegalState(format!(
                "tablet peer {} is already initialized",
                self.tablet_id
            )));
        }
        let TabletPeerResources {
            tablet,
            log,
            consensus_factory,
            prepare_pool,
            log_gc_runner,
        } = resources;

        let tablet_config = &self.config.tablet;
        let mvcc = MvccManager::new(self.tablet_id.clone(), Arc::clone(&self.clock));
        let tracker = OperationTracker::new(self.tablet_id.clone(), tablet_config.max_in_flight_operations);
        let preparer = Preparer::new(self.tablet_id.clone(), prepare_pool);
        let apply_queue = ApplyQueue::start(self.tablet_id.clone())?;
        let weak = self.weak_self.clone();
        let pipeline = Pipeline::new(
            Arc::clone(&tablet),
            Arc::clone(&mvcc),
            tracker,
            preparer,
            apply_queue,
            Box::new(move |e: &GraniteError| {
                if let Some(peer) = weak.upgrade() {
                    peer.set_failed(e.clone());
                }
            }),
        );

        tablet.set_flush_filter(flush_filter(Arc::clone(&log)));

        let context: Weak<dyn ConsensusContext> = self.weak_self.clone();
        let consensus = consensus_factory(context)?;
        pipeline.set_consensus(Arc::clone(&consensus))?;

        let components = PeerComponents {
            tablet,
            log,
            consensus,
            mvcc,
            pipeline,
            log_gc_runner,
            log_gc_op: Mutex::new(None),
        };
        if self.components.set(components).is_err() {
            return Err(GraniteError::IllegalState(format!(
                "tablet peer {} is already initialized",
                self.tablet_id
            )));
        }
        debug!(tablet_id = %self.tablet_id, peer = %self.peer_id, "tablet peer initialized");
        Ok(())
    }

    pub fn start(&self, bootstrap: BootstrapResult) -> GraniteResult<()> {
        let c = self.components()?;
        c.mvcc.set_last_replicated(bootstrap.last_replicated_ht);
        c.consensus.start(bootstrap.info)?;

        self.state
            .transition(TabletPeerState::Bootstrapping, TabletPeerState::Running)
            .map_err(|current| {
                GraniteError::IllegalState(format!("cannot start tablet {} in state {current}", self.tablet_id))
            })?;
        self.record_state();
        self.set_last_status("running");
        c.tablet.enable_compactions();

        if let (Some(runner), Some(me)) = (&c.log_gc_runner, self.weak_self.upgrade()) {
            let op = LogGcOp::new(&me);
            runner.register(op.clone());
            *c.log_gc_op.lock() = Some(op);
        }
        info!(tablet_id = %self.tablet_id, peer = %self.peer_id, "tablet peer started");
        self.notify_dirty("tablet peer started");
        Ok(())
    }

    pub fn check_running(&self) -> GraniteResult<()> {
        match self.state() {
            TabletPeerState::Running => Ok(()),
            TabletPeerState::Quiescing => Err(GraniteError::ShutdownInProgress(format!(
                "tablet {} is shutting down",
                self.tablet_id
            ))),
            other => Err(GraniteError::IllegalState(format!(
                "tablet {} is not running: {other}",
                self.tablet_id
            ))),
        }
    }

    /// Move to FAILED. Ignored once shutdown has begun.
    pub fn set_failed(&self, error: GraniteError) {
        let result = self
            .state
            .transition_if(TabletPeerState::Failed, |s| !s.is_shutting_down() && s != TabletPeerState::Failed);
        match result {
            Ok(previous) => {
                error!(
                    tablet_id = %self.tablet_id,
                    peer = %self.peer_id,
                    previous = %previous,
                    error = %error,
                    "tablet peer failed"
                );
                self.set_last_status(error.to_string());
                *self.failure.lock() = Some(error);
                self.record_state();
                self.notify_dirty("tablet peer failed");
            }
            Err(current) => {
                debug!(tablet_id = %self.tablet_id, state = %current, error = %error, "set_failed ignored");
            }
        }
    }

    pub fn failure(&self) -> Option<GraniteError> {
        self.failure.lock().clone()
    }

    pub fn wait_until_consensus_running(&self, timeout: Duration) -> GraniteResult<()> {
        let deadline = Instant::now() + timeout;
        let max_exp = self.config.tablet.consensus_backoff_max_exponent;
        let mut exp = 0u32;
        loop {
            let state = self.state();
            if !matches!(state, TabletPeerState::Bootstrapping | TabletPeerState::Running) {
                return Err(GraniteError::IllegalState(format!(
                    "tablet {} is in state {state} while waiting for consensus",
                    self.tablet_id
                )));
            }
            if let Some(c) = self.components.get() {
                if c.consensus.is_running() {
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GraniteError::TimedOut(format!(
                    "consensus of tablet {} not running after {timeout:?}",
                    self.tablet_id
                )));
            }
            let backoff = Duration::from_millis(1u64 << exp.min(max_exp));
            std::thread::sleep(backoff.min(deadline - now));
            exp = (exp + 1).min(max_exp);
        }
    }

    /// Returns `true` if this call moved the peer to QUIESCING.
    pub fn start_shutdown(&self) -> bool {
        let previous = match self
            .state
            .transition_if(TabletPeerState::Quiescing, |s| !s.is_shutting_down())
        {
            Ok(previous) => previous,
            Err(_) => return false,
        };
        info!(tablet_id = %self.tablet_id, peer = %self.peer_id, %previous, "tablet peer shutting down");
        self.record_state();
        self.set_last_status("shutting down");

        if let Some(c) = self.components.get() {
            let gc_op = c.log_gc_op.lock().take();
            if let (Some(runner), Some(op)) = (&c.log_gc_runner, gc_op) {
                runner.unregister(op.name());
            }
            c.tablet.start_shutdown();
            c.consensus.shutdown();
        }
        true
    }

    pub fn complete_shutdown(&self) {
        if let Some(c) = self.components.get() {
            let tablet_config = &self.config.tablet;
            let tracker = c.pipeline.tracker();
            while let Err(e) = tracker.wait_for_all_to_finish(
                tablet_config.shutdown_report_interval(),
                tablet_config.shutdown_max_wait(),
            ) {
                error!(tablet_id = %self.tablet_id, error = %e, "in-flight operations did not drain");
            }
            c.pipeline.preparer().stop();
            c.pipeline.apply_queue().shutdown();
            c.log.close();
            c.tablet.shutdown();
        }
        if let Err(current) = self
            .state
            .transition(TabletPeerState::Quiescing, TabletPeerState::Shutdown)
        {
            error!(tablet_id = %self.tablet_id, state = %current, "unexpected state at end of shutdown");
        }
        self.record_state();
        self.set_last_status("shut down");
        info!(tablet_id = %self.tablet_id, peer = %self.peer_id, "tablet peer shut down");
    }

    pub fn shutdown(&self) {
        if self.start_shutdown() {
            self.complete_shutdown();
        } else {
            self.wait_until_shutdown();
        }
    }

    /// Block until another caller finishes shutting the peer down.
    pub fn wait_until_shutdown(&self) {
        let cfg = &self.config.tablet;
        let started = Instant::now();
        let mut last_report = started;
        let mut reported_stuck = false;
        while self.state() != TabletPeerState::Shutdown {
            std::thread::sleep(cfg.shutdown_poll_interval());
            let waited = started.elapsed();
            if !reported_stuck && waited >= cfg.shutdown_max_wait() {
                error!(
                    tablet_id = %self.tablet_id,
                    waited_ms = waited.as_millis() as u64,
                    state = %self.state(),
                    "tablet peer shutdown is stuck"
                );
                reported_stuck = true;
            } else if last_report.elapsed() >= cfg.shutdown_report_interval() {
                warn!(
                    tablet_id = %self.tablet_id,
                    waited_ms = waited.as_millis() as u64,
                    state = %self.state(),
                    "waiting for tablet peer shutdown"
                );
                last_report = Instant::now();
            }
        }
    }

    // ── Operations ─────────────────────────────────────────────────────────

    /// Run `operation` on this peer: leader path with `Some(term)`, replica
    /// path with `None`. Rejected operations complete with the state error.
    pub fn submit(&self, mut operation: Operation, leader_term: Option<u64>) -> GraniteResult<()> {
        let pipeline = match self.check_running().and_then(|_| self.components()) {
            Ok(c) => &c.pipeline,
            Err(e) => {
                operation.complete(Err(e.clone()));
                return Err(e);
            }
        };
        pipeline.submit(operation, leader_term)
    }

    pub fn write_async(&self, query: WriteQuery) -> GraniteResult<()> {
        let term = match self.check_running().and_then(|_| self.leader_term_or_error()) {
            Ok(term) => term,
            Err(e) => {
                query.cancel(e.clone());
                return Err(e);
            }
        };
        self.submit(query.into_operation(), Some(term))
    }

    fn leader_term_or_error(&self) -> GraniteResult<u64> {
        self.leader_term().ok_or_else(|| {
            GraniteError::IllegalState(format!(
                "peer {} is not the leader of tablet {}",
                self.peer_id, self.tablet_id
            ))
        })
    }

    pub fn get_in_flight_operations(&self) -> Vec<DriverSnapshot> {
        self.components
            .get()
            .map(|c| c.pipeline.tracker().snapshots())
            .unwrap_or_default()
    }

    // ── Log retention ──────────────────────────────────────────────────────

    pub fn get_earliest_needed_log_index(&self) -> GraniteResult<u64> {
        let c = self.components()?;
        let latest_index = c.log.latest_entry_op_id().index;
        // committed before persistent: a flush racing with this call must
        // not let its log entries go
        let last_committed_index = c.consensus.last_committed_op_id().index;
        let mut persistent_indexes = Vec::new();
        if c.tablet.table_type() != TableType::TransactionStatus {
            let (regular, intents) = c.tablet.max_persistent_op_ids();
            // a store that never flushed has persisted nothing: index 0
            persistent_indexes.extend([regular.index, intents.index]);
        }
        let tracker_min = c.pipeline.tracker().min_pending_op_index();
        let mvcc_min = c.mvcc.min_pending_op_index();
        let min_pending_index = [tracker_min, mvcc_min].into_iter().filter(|i| *i > 0).min().unwrap_or(0);
        let transaction_bound = self.transaction_gc_bound.lock().as_ref().map(|f| f()).unwrap_or(0);

        let inputs = GcBoundInputs {
            latest_index,
            earliest_anchor: self.anchors.earliest_registered_index(),
            min_pending_index,
            min_retryable_index: c.consensus.min_retryable_request_op_id().index,
            transaction_bound,
            last_committed_index,
            persistent_indexes,
        };
        let earliest = earliest_needed_log_index(&inputs);
        debug!(tablet_id = %self.tablet_id, earliest, ?inputs, "computed log GC bound");
        Ok(earliest)
    }

    /// Reclaim log segments below the GC bound. Returns segments reclaimed.
    pub fn run_log_gc(&self) -> GraniteResult<usize> {
        self.check_running()?;
        let min_index = self.get_earliest_needed_log_index()?;
        let reclaimed = self.components()?.log.gc(min_index)?;
        if reclaimed > 0 {
            info!(tablet_id = %self.tablet_id, min_index, reclaimed, "log GC finished");
        }
        granite_observability::record_log_gc(self.tablet_id.as_str(), reclaimed);
        Ok(reclaimed)
    }

    // ── Safe time & reads ──────────────────────────────────────────────────

    /// Leader safe time bounded by the majority-replicated lease.
    fn leader_safe_time(&self, min_allowed: HybridTime, deadline: Option<Instant>) -> GraniteResult<HybridTime> {
        let c = self.components()?;
        let lease = c
            .consensus
            .majority_replicated_ht_lease_expiration(min_allowed, deadline)?;
        c.mvcc.safe_time_for_leader(
            min_allowed,
            deadline,
            HybridTimeLease {
                time: HybridTime::INVALID,
                lease,
            },
        )
    }

    /// Safe time of this replica: lease-bounded on the leader, propagated on
    /// a follower.
    pub fn safe_time(&self, min_allowed: HybridTime, deadline: Option<Instant>) -> GraniteResult<HybridTime> {
        if self.leader_term().is_some() {
            self.leader_safe_time(min_allowed, deadline)
        } else {
            self.components()?.mvcc.safe_time_for_follower(min_allowed, deadline)
        }
    }

    pub fn read(&self, request: &ReadRequest) -> GraniteResult<ReadResponse> {
        self.check_running()?;
        let c = self.components()?;
        let deadline = request
            .deadline
            .unwrap_or_else(|| Instant::now() + Duration::from_millis(self.config.tablet.default_read_timeout_ms));
        let min_allowed = request.read_time.unwrap_or(HybridTime::INVALID);
        let safe = match request.consistency {
            ReadConsistency::Strong => {
                self.leader_term_or_error()?;
                self.leader_safe_time(min_allowed, Some(deadline))?
            }
            ReadConsistency::ConsistentPrefix => self.safe_time(min_allowed, Some(deadline))?,
        };
        let read_time = request.read_time.unwrap_or(safe);
        let rows = c
            .tablet
            .read(&request.range, request.projection.as_deref(), read_time)?;
        Ok(ReadResponse { rows, read_time })
    }

    // ── Status ─────────────────────────────────────────────────────────────

    pub fn leader_term(&self) -> Option<u64> {
        self.components.get().and_then(|c| c.consensus.leader_term())
    }

    pub fn leader_status(&self) -> LeaderStatus {
        self.components
            .get()
            .map(|c| c.consensus.leader_status())
            .unwrap_or(LeaderStatus::NotLeader)
    }

    pub fn is_leader_and_ready(&self) -> bool {
        self.state() == TabletPeerState::Running && self.leader_status() == LeaderStatus::LeaderAndReady
    }

    pub fn human_readable_state(&self) -> String {
        match self.state() {
            TabletPeerState::Bootstrapping => format!("BOOTSTRAPPING ({})", self.last_status()),
            TabletPeerState::Failed => match self.failure() {
                Some(e) => format!("FAILED ({e})"),
                None => "FAILED".to_string(),
            },
            other => other.as_str().to_string(),
        }
    }

    pub fn get_tablet_status(&self) -> TabletStatus {
        let (table_id, last_op_id, on_disk_size) = match self.components.get() {
            Some(c) => (
                c.tablet.metadata().table_id,
                c.consensus.last_committed_op_id(),
                c.tablet.on_disk_size(),
            ),
            None => (TableId::from(""), OpId::INVALID, 0),
        };
        TabletStatus {
            tablet_id: self.tablet_id.clone(),
            table_id,
            state: self.state(),
            last_op_id,
            on_disk_size,
            last_status: self.last_status(),
        }
    }

    /// A split parent may be deleted once its split is committed and applied.
    pub fn can_be_deleted(&self) -> bool {
        let Some(c) = self.components.get() else {
            return false;
        };
        if c.tablet.data_state() != TabletDataState::SplitCompleted {
            return false;
        }
        match c.tablet.split_record() {
            Some(split) => c.consensus.last_committed_op_id().index >= split.op_id.index,
            None => false,
        }
    }

    fn submit_history_cutoff(&self, c: &PeerComponents) {
        let Some(cutoff) = c
            .tablet
            .retention()
            .history_cutoff_to_propagate(self.clock.now(), Instant::now())
        else {
            return;
        };
        let Some(term) = c.consensus.leader_term() else {
            return;
        };
        let op = Operation::new(OperationRequest::HistoryCutoff(HistoryCutoffRequest { cutoff }));
        if let Err(e) = self.submit(op, Some(term)) {
            debug!(tablet_id = %self.tablet_id, %cutoff, error = %e, "history cutoff not propagated");
        }
    }
}

/// A memtable may be flushed only once every entry it holds is in the log.
fn flush_filter(log: Arc<dyn ReplicatedLog>) -> FlushFilter {
    Arc::new(move |info: &MemtableInfo| match &info.frontier {
        Some(frontier) => Ok(frontier.op_id_max.index <= log.latest_entry_op_id().index),
        None if info.entries == 0 => Ok(true),
        None => Err(GraniteError::IllegalState(format!(
            "memtable with {} entries has no frontier",
            info.entries
        ))),
    })
}

impl ConsensusContext for TabletPeer {
    fn start_replica_operation(&self, round: Arc<ConsensusRound>, _propagated_safe_time: HybridTime) -> GraniteResult<()> {
        let c = self.components()?;
        let msg = round.replicate_msg();
        let request = match OperationRequest::decode(msg.op_type, &msg.payload) {
            Ok(request) => request,
            Err(e) => {
                e.log_if_fatal(self.tablet_id.as_str());
                self.set_failed(e.clone());
                return Err(e);
            }
        };
        self.clock.update(msg.hybrid_time);
        c.tablet.update_monotonic_counter(msg.monotonic_counter);
        c.mvcc.add_follower_pending(msg.hybrid_time, msg.op_id);
        if let Err(e) = c.pipeline.submit_replica(Operation::new(request), round) {
            warn!(tablet_id = %self.tablet_id, op_id = %msg.op_id, error = %e, "replica operation not started");
            return Err(e);
        }
        Ok(())
    }

    fn prepare_peer_request(&self) -> HybridTime {
        let Some(c) = self.components.get() else {
            return HybridTime::INVALID;
        };
        if self.state() != TabletPeerState::Running {
            return HybridTime::INVALID;
        }
        self.submit_history_cutoff(c);
        // non-blocking: no lease yet means nothing to propagate
        self.leader_safe_time(HybridTime::INVALID, Some(Instant::now()))
            .unwrap_or(HybridTime::INVALID)
    }

    fn majority_replicated(&self) {
        if self.state() != TabletPeerState::Running {
            return;
        }
        match self.leader_safe_time(HybridTime::INVALID, Some(Instant::now())) {
            Ok(ht) => {
                if let Some(c) = self.components.get() {
                    c.mvcc.set_propagated_safe_time(ht);
                }
            }
            Err(e) => {
                debug!(tablet_id = %self.tablet_id, error = %e, "no leader safe time after majority replication");
            }
        }
    }

    fn set_propagated_safe_time(&self, ht: HybridTime) {
        let Some(c) = self.components.get() else {
            return;
        };
        if self.state().is_shutting_down() {
            return;
        }
        let op = Operation::new(OperationRequest::Empty {
            propagated_safe_time: ht,
        });
        if let Err(e) = c.pipeline.submit(op, None) {
            debug!(tablet_id = %self.tablet_id, %ht, error = %e, "propagated safe time dropped");
        }
    }
}

impl std::fmt::Debug for TabletPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletPeer")
            .field("tablet_id", &self.tablet_id)
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> GcBoundInputs {
        GcBoundInputs {
            latest_index: 100,
            earliest_anchor: None,
            min_pending_index: 0,
            min_retryable_index: 0,
            transaction_bound: 0,
            last_committed_index: 90,
            persistent_indexes: vec![80, 85],
        }
    }

    #[test]
    fn test_gc_bound_empty_log() {
        let mut i = inputs();
        i.latest_index = 0;
        assert_eq!(earliest_needed_log_index(&i), 0);
    }

    #[test]
    fn test_gc_bound_takes_minimum() {
        assert_eq!(earliest_needed_log_index(&inputs()), 80);
        let mut i = inputs();
        i.earliest_anchor = Some(12);
        assert_eq!(earliest_needed_log_index(&i), 12);
        let mut i = inputs();
        i.min_retryable_index = 40;
        i.min_pending_index = 50;
        assert_eq!(earliest_needed_log_index(&i), 40);
    }

    #[test]
    fn test_gc_bound_zero_sources_ignored() {
        let mut i = inputs();
        i.persistent_indexes.clear();
        i.transaction_bound = 0;
        assert_eq!(earliest_needed_log_index(&i), 90);
    }
}
