//! In-process consensus.
//!
//! One `LocalConsensus` per tablet replica. A dedicated append thread per
//! instance drains the leader's replicate queue, appends to the log, ships
//! entries to the attached followers and commits once a majority of the
//! configured voters acknowledged. The same thread sends heartbeats, which
//! refresh the majority-replicated lease and carry the leader's safe time.
//!
//! Followers receive entries through [`LocalConsensus::update_replica`];
//! there is no network and no election protocol. Leadership is assigned
//! explicitly with `become_leader` / `step_down`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use granite_common::clock::HybridClock;
use granite_common::config::ConsensusConfig;
use granite_common::error::{ConsensusError, GraniteError, GraniteResult};
use granite_common::types::{PeerId, TabletId};
use granite_common::{HybridTime, OpId};

use crate::consensus::{Consensus, ConsensusBootstrapInfo, ConsensusContext, LeaderStatus};
use crate::log::ReplicatedLog;
use crate::metadata::{ConsensusMetadata, ConsensusMetadataStore, RaftConfig};
use crate::retryable::RetryableRequests;
use crate::round::{ConsensusRound, OpType, ReplicateMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
pub struct LocalConsensusOptions {
    pub tablet_id: TabletId,
    pub peer_id: PeerId,
    /// Used when no consensus metadata has been persisted yet.
    pub initial_config: RaftConfig,
    /// Become leader right after start.
    pub start_as_leader: bool,
    pub config: ConsensusConfig,
}

struct RaftState {
    role: RaftRole,
    meta: ConsensusMetadata,
    last_received: OpId,
    committed: OpId,
    next_index: u64,
    /// Index of the NoOp opening the current leader term.
    term_start_index: u64,
    noop_committed: bool,
    /// Appended, not yet committed entries keyed by index.
    pending: BTreeMap<u64, Arc<ConsensusRound>>,
    retryable: RetryableRequests,
    lease_expiration: HybridTime,
    monotonic_counter: u64,
}

#[derive(Default)]
struct AppendQueue {
    rounds: VecDeque<Arc<ConsensusRound>>,
    stopped: bool,
}

pub struct LocalConsensus {
    options: LocalConsensusOptions,
    weak_self: Weak<LocalConsensus>,
    log: Arc<dyn ReplicatedLog>,
    clock: Arc<HybridClock>,
    meta_store: Arc<ConsensusMetadataStore>,
    context: Weak<dyn ConsensusContext>,
    state: Mutex<RaftState>,
    lease_cond: Condvar,
    queue: Mutex<AppendQueue>,
    queue_cond: Condvar,
    followers: Mutex<Vec<Arc<LocalConsensus>>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LocalConsensus {
    pub fn new(
        options: LocalConsensusOptions,
        log: Arc<dyn ReplicatedLog>,
        clock: Arc<HybridClock>,
        meta_store: Arc<ConsensusMetadataStore>,
        context: Weak<dyn ConsensusContext>,
    ) -> Arc<Self> {
        let retention = options.config.retryable_request_timeout();
        let committed_config = options.initial_config.clone();
        Arc::new_cyclic(|weak_self| Self {
            options,
            weak_self: weak_self.clone(),
            log,
            clock,
            meta_store,
            context,
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                meta: ConsensusMetadata {
                    current_term: 0,
                    voted_for: None,
                    committed_config,
                },
                last_received: OpId::INVALID,
                committed: OpId::INVALID,
                next_index: 1,
                term_start_index: u64::MAX,
                noop_committed: false,
                pending: BTreeMap::new(),
                retryable: RetryableRequests::new(retention),
                lease_expiration: HybridTime::INVALID,
                monotonic_counter: 0,
            }),
            lease_cond: Condvar::new(),
            queue: Mutex::new(AppendQueue::default()),
            queue_cond: Condvar::new(),
            followers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.options.tablet_id
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().meta.current_term
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.state.lock().meta.committed_config.clone()
    }

    /// Wire `follower` as a replication target of this instance.
    pub fn attach_follower(&self, follower: Arc<LocalConsensus>) {
        self.followers.lock().push(follower);
    }

    pub fn detach_followers(&self) {
        self.followers.lock().clear();
    }

    /// Start a new term with this peer as leader. The term opens with a NoOp
    /// entry; the leader is ready once that entry commits.
    pub fn become_leader(&self) -> GraniteResult<u64> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning.into());
        }
        let term = {
            let mut st = self.state.lock();
            st.meta.current_term = st.meta.current_term.max(st.last_received.term) + 1;
            st.meta.voted_for = Some(self.options.peer_id.clone());
            self.meta_store
                .save(&self.options.tablet_id, &self.options.peer_id, &st.meta)?;
            st.role = RaftRole::Leader;
            st.noop_committed = false;
            st.term_start_index = u64::MAX;
            st.lease_expiration = HybridTime::INVALID;
            st.meta.current_term
        };
        tracing::info!(
            tablet_id = %self.options.tablet_id,
            peer = %self.options.peer_id,
            term,
            "became leader"
        );
        let noop = ConsensusRound::bound_to_term(ReplicateMsg::new(OpType::NoOp, Bytes::new()), term);
        let mut queue = self.queue.lock();
        queue.rounds.push_front(noop);
        self.queue_cond.notify_one();
        Ok(term)
    }

    /// Receive entries from the leader of `leader_term`. Returns the last
    /// received op id, which acts as the acknowledgement.
    pub fn update_replica(
        &self,
        msgs: &[ReplicateMsg],
        leader_term: u64,
        leader_committed: OpId,
        propagated_safe_time: HybridTime,
    ) -> GraniteResult<OpId> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning.into());
        }
        let now = Instant::now();
        let mut new_rounds = Vec::new();
        let mut replaced = Vec::new();
        let mut failure = None;
        {
            let mut st = self.state.lock();
            let current = st.meta.current_term;
            if leader_term < current || (leader_term == current && st.role == RaftRole::Leader) {
                return Err(ConsensusError::TermMismatch {
                    bound: leader_term,
                    current,
                }
                .into());
            }
            if leader_term > current {
                st.meta.current_term = leader_term;
                st.meta.voted_for = None;
                self.meta_store
                    .save(&self.options.tablet_id, &self.options.peer_id, &st.meta)?;
            }
            st.role = RaftRole::Follower;

            for msg in msgs {
                let index = msg.op_id.index;
                if index <= st.last_received.index {
                    if index <= st.committed.index
                        || st.pending.get(&index).map(|r| r.op_id()) == Some(msg.op_id)
                    {
                        continue;
                    }
                    let dropped = st.pending.split_off(&index);
                    for round in dropped.into_values() {
                        if let Some(id) = round.client_request() {
                            st.retryable.aborted(id);
                        }
                        replaced.push(round);
                    }
                    if let Err(e) = self.log.truncate_after(index - 1) {
                        failure = Some(e);
                        break;
                    }
                    st.last_received = self.log.latest_entry_op_id();
                    st.next_index = index;
                }
                if index != st.last_received.index + 1 {
                    failure = Some(GraniteError::IllegalState(format!(
                        "gap in replicated entries: got {}, last received {}",
                        msg.op_id, st.last_received
                    )));
                    break;
                }
                if let Err(e) = self.log.append(msg.clone()) {
                    failure = Some(e);
                    break;
                }
                st.last_received = msg.op_id;
                st.next_index = index + 1;
                if let Some(id) = msg.client_request {
                    let _ = st.retryable.register(id, msg.op_id, now);
                }
                let round = ConsensusRound::new(msg.clone());
                st.pending.insert(index, Arc::clone(&round));
                if !msg.op_type.is_consensus_internal() {
                    new_rounds.push(round);
                }
            }
        }

        for round in replaced {
            round.notify_replication_finished(
                Err(GraniteError::Aborted("entry replaced by a new leader".into())),
                None,
            );
        }

        let context = self.context.upgrade();
        if let Some(ctx) = &context {
            for round in new_rounds {
                let op_id = round.op_id();
                if let Err(e) = ctx.start_replica_operation(round, propagated_safe_time) {
                    tracing::error!(
                        tablet_id = %self.options.tablet_id,
                        op_id = %op_id,
                        error = %e,
                        "failed to start replica operation"
                    );
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let (finished, last_received) = {
            let mut st = self.state.lock();
            let commit_to = leader_committed.index.min(st.last_received.index);
            let finished = if commit_to > st.committed.index {
                self.commit_up_to(&mut st, commit_to)
            } else {
                Vec::new()
            };
            (finished, st.last_received)
        };
        fire_committed(finished, None);

        if propagated_safe_time.is_valid() {
            if let Some(ctx) = &context {
                ctx.set_propagated_safe_time(propagated_safe_time);
            }
        }
        Ok(last_received)
    }

    fn commit_up_to(&self, st: &mut RaftState, index: u64) -> Vec<Arc<ConsensusRound>> {
        let rest = st.pending.split_off(&(index + 1));
        let committed: Vec<_> = std::mem::replace(&mut st.pending, rest)
            .into_values()
            .collect();
        let now = Instant::now();
        for round in &committed {
            if let Some(id) = round.client_request() {
                st.retryable.replicated(id, now);
            }
            let op_id = round.op_id();
            if st.role == RaftRole::Leader
                && round.op_type() == OpType::NoOp
                && op_id.term == st.meta.current_term
            {
                st.noop_committed = true;
            }
            st.committed = st.committed.max(op_id);
        }
        self.log.mark_committed(st.committed);
        committed
    }

    fn run_loop(self: Arc<Self>) {
        let interval = self.options.config.heartbeat_interval();
        let mut last_heartbeat = Instant::now();
        loop {
            let batch: Vec<_> = {
                let mut queue = self.queue.lock();
                if queue.rounds.is_empty() && !queue.stopped {
                    let wait = interval.saturating_sub(last_heartbeat.elapsed());
                    self.queue_cond.wait_for(&mut queue, wait);
                }
                if queue.stopped {
                    break;
                }
                queue.rounds.drain(..).collect()
            };
            if !batch.is_empty() {
                self.append_batch(batch);
            }
            if last_heartbeat.elapsed() >= interval {
                self.heartbeat();
                last_heartbeat = Instant::now();
            }
        }
        tracing::debug!(tablet_id = %self.options.tablet_id, "consensus append thread exiting");
    }

    fn append_batch(&self, batch: Vec<Arc<ConsensusRound>>) {
        let safe_time = self
            .context
            .upgrade()
            .map(|ctx| ctx.prepare_peer_request())
            .unwrap_or(HybridTime::INVALID);
        let sent_at_micros = self.clock.physical_now_micros();

        let mut failed: Vec<(Arc<ConsensusRound>, GraniteError)> = Vec::new();
        let mut msgs = Vec::with_capacity(batch.len());
        let term = {
            let mut st = self.state.lock();
            let term = st.meta.current_term;
            let now = Instant::now();
            for round in batch {
                if st.role != RaftRole::Leader {
                    failed.push((round, ConsensusError::NotLeader { term }.into()));
                    continue;
                }
                if let Some(bound) = round.bound_term() {
                    if bound != term {
                        failed.push((
                            round,
                            ConsensusError::TermMismatch {
                                bound,
                                current: term,
                            }
                            .into(),
                        ));
                        continue;
                    }
                }
                let op_id = OpId::new(term, st.next_index);
                if let Some(id) = round.client_request() {
                    if let Err(e) = st.retryable.register(id, op_id, now) {
                        failed.push((round, e));
                        continue;
                    }
                }
                let committed = st.committed;
                let ht = round
                    .notify_added_to_leader(op_id, committed)
                    .unwrap_or_else(|| self.clock.now());
                st.monotonic_counter += 1;
                let counter = st.monotonic_counter;
                round.update_msg(|m| {
                    m.op_id = op_id;
                    m.hybrid_time = ht;
                    m.committed_op_id = committed;
                    m.monotonic_counter = counter;
                });
                let msg = round.replicate_msg();
                if let Err(e) = self.log.append(msg.clone()) {
                    if let Some(id) = msg.client_request {
                        st.retryable.aborted(id);
                    }
                    failed.push((round, e));
                    continue;
                }
                if msg.op_type == OpType::NoOp {
                    st.term_start_index = st.term_start_index.min(op_id.index);
                }
                st.next_index += 1;
                st.last_received = op_id;
                st.pending.insert(op_id.index, round);
                msgs.push(msg);
            }
            term
        };

        for (round, error) in failed {
            tracing::debug!(
                tablet_id = %self.options.tablet_id,
                term,
                error = %error,
                "round failed before append"
            );
            round.notify_replication_finished(Err(error), Some(term));
        }
        if !msgs.is_empty() {
            self.send_to_followers(&msgs, safe_time, sent_at_micros);
        }
    }

    fn heartbeat(&self) {
        {
            let mut st = self.state.lock();
            st.retryable.clean_expired(Instant::now());
            if st.role != RaftRole::Leader {
                return;
            }
        }
        let safe_time = self
            .context
            .upgrade()
            .map(|ctx| ctx.prepare_peer_request())
            .unwrap_or(HybridTime::INVALID);
        let sent_at_micros = self.clock.physical_now_micros();
        self.send_to_followers(&[], safe_time, sent_at_micros);
    }

    fn send_to_followers(&self, msgs: &[ReplicateMsg], safe_time: HybridTime, sent_at_micros: u64) {
        let (term, committed, majority, own_index) = {
            let st = self.state.lock();
            if st.role != RaftRole::Leader {
                return;
            }
            (
                st.meta.current_term,
                st.committed,
                st.meta.committed_config.majority_size(),
                st.last_received.index,
            )
        };
        let followers = self.followers.lock().clone();
        let mut acked = vec![own_index];
        for follower in &followers {
            match follower.update_replica(msgs, term, committed, safe_time) {
                Ok(last) => acked.push(last.index),
                Err(e) => tracing::debug!(
                    tablet_id = %self.options.tablet_id,
                    follower = %follower.options.peer_id,
                    error = %e,
                    "follower rejected update"
                ),
            }
        }
        if acked.len() < majority {
            return;
        }
        acked.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = acked[majority - 1];

        let lease_micros = self.options.config.leader_lease_duration().as_micros() as u64;
        let finished = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader || st.meta.current_term != term {
                return;
            }
            let lease = HybridTime::from_micros(sent_at_micros.saturating_add(lease_micros));
            if !st.lease_expiration.is_valid() || lease > st.lease_expiration {
                st.lease_expiration = lease;
            }
            self.lease_cond.notify_all();
            if majority_index >= st.term_start_index && majority_index > st.committed.index {
                self.commit_up_to(&mut st, majority_index)
            } else {
                Vec::new()
            }
        };
        let advanced = !finished.is_empty();
        fire_committed(finished, Some(term));
        if let Some(ctx) = self.context.upgrade() {
            ctx.majority_replicated();
        }
        if advanced {
            let committed = self.state.lock().committed;
            for follower in &followers {
                let _ = follower.update_replica(&[], term, committed, safe_time);
            }
        }
    }

    fn abort_all(&self, reason: &str) {
        let queued: Vec<_> = self.queue.lock().rounds.drain(..).collect();
        let (pending, term) = {
            let mut st = self.state.lock();
            let pending: Vec<_> = std::mem::take(&mut st.pending).into_values().collect();
            for round in &pending {
                if let Some(id) = round.client_request() {
                    st.retryable.aborted(id);
                }
            }
            (pending, st.meta.current_term)
        };
        for round in queued.into_iter().chain(pending) {
            round.notify_replication_finished(Err(GraniteError::Aborted(reason.into())), Some(term));
        }
    }
}

fn fire_committed(rounds: Vec<Arc<ConsensusRound>>, leader_term: Option<u64>) {
    for round in rounds {
        let op_id = round.op_id();
        round.notify_replication_finished(Ok(op_id), leader_term);
    }
}

impl Consensus for LocalConsensus {
    fn start(&self, info: ConsensusBootstrapInfo) -> GraniteResult<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(GraniteError::IllegalState("consensus already running".into()));
        }
        let stored = self
            .meta_store
            .load(&self.options.tablet_id, &self.options.peer_id)?;
        let mut orphans = Vec::new();
        {
            let mut st = self.state.lock();
            if let Some(meta) = stored {
                st.meta = meta;
            }
            st.meta.current_term = st.meta.current_term.max(info.last_id.term);
            st.last_received = info.last_id;
            st.committed = info.last_committed_id;
            st.next_index = info.last_id.index + 1;
            let now = Instant::now();
            for msg in info.orphaned_replicates {
                if msg.op_id.index <= st.committed.index {
                    continue;
                }
                if let Some(id) = msg.client_request {
                    let _ = st.retryable.register(id, msg.op_id, now);
                }
                let internal = msg.op_type.is_consensus_internal();
                let round = ConsensusRound::new(msg);
                st.pending.insert(round.op_id().index, Arc::clone(&round));
                if !internal {
                    orphans.push(round);
                }
            }
        }
        self.running.store(true, Ordering::Release);
        self.queue.lock().stopped = false;

        if let Some(ctx) = self.context.upgrade() {
            for round in orphans {
                ctx.start_replica_operation(round, HybridTime::INVALID)?;
            }
        }

        let Some(me) = self.weak_self.upgrade() else {
            return Err(GraniteError::IllegalState("consensus dropped during start".into()));
        };
        let handle = std::thread::Builder::new()
            .name(format!("raft-{}", self.options.tablet_id))
            .spawn(move || me.run_loop())
            .map_err(|e| GraniteError::ServiceUnavailable(format!("cannot spawn consensus thread: {e}")))?;
        *self.thread.lock() = Some(handle);

        tracing::info!(
            tablet_id = %self.options.tablet_id,
            peer = %self.options.peer_id,
            last_id = %info.last_id,
            last_committed = %info.last_committed_id,
            "consensus started"
        );
        if self.options.start_as_leader {
            self.become_leader()?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn replicate(&self, round: Arc<ConsensusRound>) -> GraniteResult<()> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning.into());
        }
        {
            let st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Err(ConsensusError::NotLeader {
                    term: st.meta.current_term,
                }
                .into());
            }
            if let Some(bound) = round.bound_term() {
                if bound != st.meta.current_term {
                    return Err(ConsensusError::TermMismatch {
                        bound,
                        current: st.meta.current_term,
                    }
                    .into());
                }
            }
        }
        let mut queue = self.queue.lock();
        if queue.stopped {
            return Err(ConsensusError::NotRunning.into());
        }
        queue.rounds.push_back(round);
        self.queue_cond.notify_one();
        Ok(())
    }

    fn leader_term(&self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        let st = self.state.lock();
        (st.role == RaftRole::Leader).then_some(st.meta.current_term)
    }

    fn leader_status(&self) -> LeaderStatus {
        if !self.is_running() {
            return LeaderStatus::NotLeader;
        }
        let st = self.state.lock();
        if st.role != RaftRole::Leader {
            return LeaderStatus::NotLeader;
        }
        if !st.noop_committed {
            return LeaderStatus::LeaderButNoOpNotCommitted;
        }
        if self.options.config.leader_leases_enabled {
            let now = HybridTime::from_micros(self.clock.physical_now_micros());
            if !st.lease_expiration.is_valid() || st.lease_expiration < now {
                return LeaderStatus::LeaderButNoMajorityReplicatedLease;
            }
        }
        LeaderStatus::LeaderAndReady
    }

    fn majority_replicated_ht_lease_expiration(
        &self,
        min_allowed: HybridTime,
        deadline: Option<Instant>,
    ) -> GraniteResult<HybridTime> {
        let mut st = self.state.lock();
        loop {
            if st.role != RaftRole::Leader || !self.is_running() {
                return Err(ConsensusError::NotLeader {
                    term: st.meta.current_term,
                }
                .into());
            }
            if !self.options.config.leader_leases_enabled {
                return Ok(HybridTime::MAX);
            }
            let lease = st.lease_expiration;
            if lease.is_valid() && (!min_allowed.is_valid() || lease >= min_allowed) {
                return Ok(lease);
            }
            match deadline {
                Some(d) if Instant::now() < d => {
                    self.lease_cond.wait_until(&mut st, d);
                }
                _ => return Err(ConsensusError::LeaderHasNoLease.into()),
            }
        }
    }

    fn last_committed_op_id(&self) -> OpId {
        self.state.lock().committed
    }

    fn last_received_op_id(&self) -> OpId {
        self.state.lock().last_received
    }

    fn min_retryable_request_op_id(&self) -> OpId {
        self.state.lock().retryable.min_op_id()
    }

    fn step_down(&self) -> GraniteResult<()> {
        let (aborted, term) = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Err(ConsensusError::NotLeader {
                    term: st.meta.current_term,
                }
                .into());
            }
            st.role = RaftRole::Follower;
            st.noop_committed = false;
            st.lease_expiration = HybridTime::INVALID;
            let aborted: Vec<_> = std::mem::take(&mut st.pending).into_values().collect();
            for round in &aborted {
                if let Some(id) = round.client_request() {
                    st.retryable.aborted(id);
                }
            }
            if let Err(e) = self.log.truncate_after(st.committed.index) {
                tracing::warn!(tablet_id = %self.options.tablet_id, error = %e, "log truncation on step down failed");
            }
            st.last_received = self.log.latest_entry_op_id().max(st.committed);
            st.next_index = st.last_received.index + 1;
            (aborted, st.meta.current_term)
        };
        self.lease_cond.notify_all();
        tracing::info!(
            tablet_id = %self.options.tablet_id,
            term,
            aborted = aborted.len(),
            "stepped down"
        );
        for round in aborted {
            round.notify_replication_finished(
                Err(GraniteError::Aborted("leader stepped down".into())),
                Some(term),
            );
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            queue.stopped = true;
            self.queue_cond.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!(tablet_id = %self.options.tablet_id, "consensus thread panicked");
            }
        }
        self.abort_all("consensus is shutting down");
        {
            let mut st = self.state.lock();
            st.role = RaftRole::Follower;
        }
        self.lease_cond.notify_all();
        tracing::info!(tablet_id = %self.options.tablet_id, "consensus shut down");
    }

    fn peer_id(&self) -> &PeerId {
        &self.options.peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use crate::round::ConsensusRoundCallback;
    use granite_common::types::ClientRequestId;
    use std::time::Duration;

    /// Context that starts nothing and records what consensus told it.
    #[derive(Default)]
    struct RecordingContext {
        replica_rounds: Mutex<Vec<Arc<ConsensusRound>>>,
        propagated: Mutex<Vec<HybridTime>>,
        majority_calls: Mutex<usize>,
        results: Arc<Mutex<Vec<GraniteResult<OpId>>>>,
    }

    impl ConsensusContext for RecordingContext {
        fn start_replica_operation(&self, round: Arc<ConsensusRound>, _ht: HybridTime) -> GraniteResult<()> {
            round.set_callback(Arc::new(Recorder {
                results: Arc::clone(&self.results),
            }));
            self.replica_rounds.lock().push(round);
            Ok(())
        }

        fn prepare_peer_request(&self) -> HybridTime {
            HybridTime::from_micros(1)
        }

        fn majority_replicated(&self) {
            *self.majority_calls.lock() += 1;
        }

        fn set_propagated_safe_time(&self, ht: HybridTime) {
            self.propagated.lock().push(ht);
        }
    }

    struct Recorder {
        results: Arc<Mutex<Vec<GraniteResult<OpId>>>>,
    }

    impl ConsensusRoundCallback for Recorder {
        fn added_to_leader(&self, op_id: OpId, _committed: OpId) -> HybridTime {
            HybridTime::from_micros(1_000 + op_id.index)
        }

        fn replication_finished(&self, result: GraniteResult<OpId>, _term: Option<u64>) {
            self.results.lock().push(result);
        }
    }

    struct Node {
        consensus: Arc<LocalConsensus>,
        context: Arc<RecordingContext>,
        log: Arc<MemLog>,
    }

    fn node(name: &str, voters: &[&str], leader: bool, store: &Arc<ConsensusMetadataStore>) -> Node {
        let context = Arc::new(RecordingContext::default());
        let log = MemLog::new(4);
        let weak: Weak<dyn ConsensusContext> = Arc::downgrade(&(context.clone() as Arc<dyn ConsensusContext>));
        let config = ConsensusConfig {
            heartbeat_interval_ms: 5,
            ..ConsensusConfig::default()
        };
        let consensus = LocalConsensus::new(
            LocalConsensusOptions {
                tablet_id: TabletId::new("t1"),
                peer_id: PeerId::new(name),
                initial_config: RaftConfig::new(voters.iter().map(|v| PeerId::new(*v)).collect()),
                start_as_leader: leader,
                config,
            },
            log.clone(),
            HybridClock::system(),
            Arc::clone(store),
            weak,
        );
        Node {
            consensus,
            context,
            log,
        }
    }

    fn write_round(ctx: &RecordingContext, request: Option<u64>) -> Arc<ConsensusRound> {
        let mut msg = ReplicateMsg::new(OpType::Write, Bytes::from_static(b"w"));
        if let Some(r) = request {
            msg = msg.with_client_request(ClientRequestId {
                client_id: 9,
                request_id: r,
            });
        }
        let round = ConsensusRound::new(msg);
        round.set_callback(Arc::new(Recorder {
            results: Arc::clone(&ctx.results),
        }));
        round
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_single_node_commits_in_order() {
        let store = ConsensusMetadataStore::new();
        let n = node("a", &["a"], true, &store);
        n.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        wait_for("leader ready", || n.consensus.leader_status() == LeaderStatus::LeaderAndReady);
        assert_eq!(n.consensus.leader_term(), Some(1));

        for _ in 0..5 {
            n.consensus.replicate(write_round(&n.context, None)).unwrap();
        }
        wait_for("commits", || n.context.results.lock().len() == 5);
        let indexes: Vec<u64> = n
            .context
            .results
            .lock()
            .iter()
            .map(|r| r.as_ref().unwrap().index)
            .collect();
        assert_eq!(indexes, vec![2, 3, 4, 5, 6]);
        assert_eq!(n.consensus.last_committed_op_id(), OpId::new(1, 6));
        assert_eq!(n.log.last_committed_op_id(), OpId::new(1, 6));
        n.consensus.shutdown();
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let store = ConsensusMetadataStore::new();
        let n = node("a", &["a"], true, &store);
        n.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        n.consensus.replicate(write_round(&n.context, Some(1))).unwrap();
        wait_for("first commit", || n.context.results.lock().len() == 1);
        n.consensus.replicate(write_round(&n.context, Some(1))).unwrap();
        wait_for("second result", || n.context.results.lock().len() == 2);
        let results = n.context.results.lock();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_already_present());
        assert_eq!(n.consensus.min_retryable_request_op_id(), OpId::new(1, 2));
        drop(results);
        n.consensus.shutdown();
    }

    #[test]
    fn test_follower_replication_and_safe_time() {
        let store = ConsensusMetadataStore::new();
        let voters = ["a", "b", "c"];
        let leader = node("a", &voters, true, &store);
        let f1 = node("b", &voters, false, &store);
        let f2 = node("c", &voters, false, &store);
        f1.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        f2.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        leader.consensus.attach_follower(f1.consensus.clone());
        leader.consensus.attach_follower(f2.consensus.clone());
        leader.consensus.start(ConsensusBootstrapInfo::default()).unwrap();

        leader.consensus.replicate(write_round(&leader.context, None)).unwrap();
        wait_for("leader commit", || leader.context.results.lock().len() == 1);
        wait_for("follower commit", || f1.context.results.lock().len() == 1);
        assert_eq!(f1.consensus.last_committed_op_id(), OpId::new(1, 2));
        assert_eq!(f2.log.latest_entry_op_id(), OpId::new(1, 2));
        // NoOp is consensus-internal, only the write reaches the context
        assert_eq!(f1.context.replica_rounds.lock().len(), 1);
        wait_for("propagated safe time", || !f1.context.propagated.lock().is_empty());
        assert_eq!(f1.consensus.role(), RaftRole::Follower);
        assert_eq!(f1.consensus.current_term(), 1);

        for n in [&leader, &f1, &f2] {
            n.consensus.shutdown();
        }
    }

    #[test]
    fn test_no_majority_then_step_down_aborts() {
        let store = ConsensusMetadataStore::new();
        let leader = node("a", &["a", "b", "c"], true, &store);
        leader.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        leader.consensus.replicate(write_round(&leader.context, Some(4))).unwrap();
        wait_for("appended", || leader.consensus.last_received_op_id().index == 2);
        std::thread::sleep(Duration::from_millis(20));
        assert!(leader.context.results.lock().is_empty());
        assert_eq!(
            leader.consensus.leader_status(),
            LeaderStatus::LeaderButNoOpNotCommitted
        );

        leader.consensus.step_down().unwrap();
        let results = leader.context.results.lock().clone();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_aborted());
        assert_eq!(leader.consensus.leader_term(), None);
        assert_eq!(leader.log.latest_entry_op_id(), OpId::INVALID);
        assert!(leader
            .consensus
            .replicate(write_round(&leader.context, None))
            .is_err());
        leader.consensus.shutdown();
    }

    #[test]
    fn test_lease_wait_times_out_for_future_time() {
        let store = ConsensusMetadataStore::new();
        let n = node("a", &["a"], true, &store);
        n.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        wait_for("lease", || {
            n.consensus
                .majority_replicated_ht_lease_expiration(HybridTime::INVALID, None)
                .is_ok()
        });
        let far = HybridTime::from_micros(u64::MAX >> 13);
        let err = n
            .consensus
            .majority_replicated_ht_lease_expiration(
                far,
                Some(Instant::now() + Duration::from_millis(20)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "LEADER_HAS_NO_LEASE");
        n.consensus.shutdown();
        assert!(n
            .consensus
            .majority_replicated_ht_lease_expiration(HybridTime::INVALID, None)
            .is_err());
    }

    #[test]
    fn test_restart_redrives_orphans() {
        let store = ConsensusMetadataStore::new();
        let first = node("a", &["a"], true, &store);
        first.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        wait_for("noop", || first.consensus.last_committed_op_id().index == 1);
        first.consensus.shutdown();

        let mut orphan = ReplicateMsg::new(OpType::Write, Bytes::from_static(b"o"));
        orphan.op_id = OpId::new(1, 2);
        orphan.hybrid_time = HybridTime::from_micros(5);
        first.log.reopen().append(orphan.clone()).unwrap();

        let second = node("a", &["a"], true, &store);
        second
            .consensus
            .start(ConsensusBootstrapInfo {
                last_id: OpId::new(1, 2),
                last_committed_id: OpId::new(1, 1),
                orphaned_replicates: vec![orphan],
            })
            .unwrap();
        assert_eq!(second.consensus.leader_term(), Some(2));
        assert_eq!(second.context.replica_rounds.lock().len(), 1);
        wait_for("orphan committed", || second.context.results.lock().len() == 1);
        assert_eq!(
            second.context.results.lock()[0].as_ref().unwrap(),
            &OpId::new(1, 2)
        );
        second.consensus.shutdown();
    }

    #[test]
    fn test_shutdown_aborts_pending() {
        let store = ConsensusMetadataStore::new();
        let leader = node("a", &["a", "b", "c"], true, &store);
        leader.consensus.start(ConsensusBootstrapInfo::default()).unwrap();
        leader.consensus.replicate(write_round(&leader.context, None)).unwrap();
        wait_for("appended", || leader.consensus.last_received_op_id().index == 2);
        leader.consensus.shutdown();
        let results = leader.context.results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_aborted());
        assert!(!leader.consensus.is_running());
    }
}
