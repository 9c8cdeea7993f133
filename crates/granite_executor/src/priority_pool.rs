//! Priority thread pool for background maintenance (compactions).
//!
//! Bounds the number of concurrently *running* tasks and lets a newly
//! submitted higher-priority task preempt a lower-priority one that is
//! already running.
//!
//! # Task states
//!
//! | State | Meaning | Holds a worker |
//! |-------|---------|----------------|
//! | **NotStarted** | queued, waiting for a worker | no |
//! | **Running** | executing `PriorityTask::run` | yes |
//! | **Paused** | blocked inside `Suspender::pause_if_necessary` | yes (parked) |
//!
//! # Design
//!
//! - One mutex guards the task arena and its three indices: by priority
//!   (priority desc, serial asc), by state (non-running first, then priority
//!   desc, then state, then serial) and by serial number (the arena key).
//! - Tasks pause only at checkpoints where the task calls
//!   `pause_if_necessary`. An atomic `max_priority_to_defer` keeps that
//!   call lock-free unless more tasks exist than running slots.
//! - A worker is identified by its index in the worker table; tasks refer
//!   to workers by that index.
//! - When preemption needs a fresh worker and none can be obtained, the
//!   preempting task stays queued and the current task keeps running.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use granite_common::error::{GraniteError, GraniteResult};

/// Serial number of a submitted task. Globally unique and increasing.
pub type TaskSerialNo = u64;

/// Value of `max_priority_to_defer` when no task may be deferred.
pub const EMPTY_QUEUE_PRIORITY: i32 = i32::MIN;

static NEXT_SERIAL_NO: AtomicU64 = AtomicU64::new(1);

const REMOVED_MESSAGE: &str = "Task removed from priority thread pool";
const SHUTDOWN_MESSAGE: &str = "Priority thread pool shutdown";
const NO_WORKERS_MESSAGE: &str = "No workers to perform task";

// ── Task contract ───────────────────────────────────────────────────────────

/// Task lifecycle state. The declaration order is the order used by the
/// state index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityTaskState {
    Paused,
    NotStarted,
    Running,
}

impl fmt::Display for PriorityTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityTaskState::Paused => write!(f, "PAUSED"),
            PriorityTaskState::NotStarted => write!(f, "NOT_STARTED"),
            PriorityTaskState::Running => write!(f, "RUNNING"),
        }
    }
}

/// File and byte totals a compaction task reports for the scheduler gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionInfo {
    pub file_count: u64,
    pub byte_count: u64,
}

/// Checkpoint handle given to a running task.
pub trait Suspender {
    /// Blocks while a higher-priority task needs this worker's slot.
    fn pause_if_necessary(&self);
}

/// A unit of background work.
pub trait PriorityTask: Send {
    /// Executes the task. `status` is an error when the task is aborted
    /// without ever running (removal or shutdown); `suspender` is `None` then.
    fn run(&mut self, status: GraniteResult<()>, suspender: Option<&dyn Suspender>);

    /// Whether `remove(key)` should cancel this task while it is queued.
    fn should_remove_with_key(&self, key: u64) -> bool;

    /// File/byte info for compaction tasks. Other tasks return `None` and do
    /// not affect the compaction gauges.
    fn compaction_info(&self) -> Option<CompactionInfo> {
        None
    }

    fn describe(&self) -> String;
}

// ── Metrics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateGauges {
    pub tasks: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Compaction gauges split by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub active: StateGauges,
    pub paused: StateGauges,
    pub queued: StateGauges,
}

impl PoolMetrics {
    fn gauges_mut(&mut self, state: PriorityTaskState) -> &mut StateGauges {
        match state {
            PriorityTaskState::Running => &mut self.active,
            PriorityTaskState::Paused => &mut self.paused,
            PriorityTaskState::NotStarted => &mut self.queued,
        }
    }

    fn add(&mut self, state: PriorityTaskState, info: Option<CompactionInfo>) {
        if let Some(info) = info {
            let g = self.gauges_mut(state);
            g.tasks += 1;
            g.files += info.file_count;
            g.bytes += info.byte_count;
        }
    }

    fn sub(&mut self, state: PriorityTaskState, info: Option<CompactionInfo>) {
        if let Some(info) = info {
            let g = self.gauges_mut(state);
            g.tasks = g.tasks.saturating_sub(1);
            g.files = g.files.saturating_sub(info.file_count);
            g.bytes = g.bytes.saturating_sub(info.byte_count);
        }
    }

    fn publish(&self) {
        granite_observability::record_compaction_gauges(
            "active",
            self.active.tasks,
            self.active.files,
            self.active.bytes,
        );
        granite_observability::record_compaction_gauges(
            "paused",
            self.paused.tasks,
            self.paused.files,
            self.paused.bytes,
        );
        granite_observability::record_compaction_gauges(
            "queued",
            self.queued.tasks,
            self.queued.files,
            self.queued.bytes,
        );
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub tasks: usize,
    pub running: usize,
    pub paused: usize,
    pub queued: usize,
    pub workers: usize,
    pub paused_workers: usize,
    pub free_workers: usize,
    pub max_priority_to_defer: i32,
    pub metrics: PoolMetrics,
}

// ── Internal bookkeeping ────────────────────────────────────────────────────

type WorkerId = usize;

struct TaskRecord {
    priority: i32,
    /// Shared with the running worker for the lock-free checkpoint.
    priority_cell: Arc<AtomicI32>,
    state: PriorityTaskState,
    worker: Option<WorkerId>,
    /// Present while the task is queued; moved into a worker when it starts.
    task: Option<Box<dyn PriorityTask>>,
    info: Option<CompactionInfo>,
    description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    priority: Reverse<i32>,
    serial: TaskSerialNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct StateKey {
    running: bool,
    priority: Reverse<i32>,
    state: PriorityTaskState,
    serial: TaskSerialNo,
}

fn priority_key(serial: TaskSerialNo, r: &TaskRecord) -> PriorityKey {
    PriorityKey {
        priority: Reverse(r.priority),
        serial,
    }
}

fn state_key(serial: TaskSerialNo, r: &TaskRecord) -> StateKey {
    StateKey {
        running: r.state == PriorityTaskState::Running,
        priority: Reverse(r.priority),
        state: r.state,
        serial,
    }
}

struct Assignment {
    serial: TaskSerialNo,
    task: Box<dyn PriorityTask>,
    priority: Arc<AtomicI32>,
}

#[derive(Default)]
struct PoolState {
    tasks: HashMap<TaskSerialNo, TaskRecord>,
    by_priority: BTreeSet<PriorityKey>,
    by_state: BTreeSet<StateKey>,
    workers: Vec<Arc<Worker>>,
    free_workers: Vec<WorkerId>,
    paused_workers: usize,
    threads: Vec<JoinHandle<()>>,
    metrics: PoolMetrics,
}

impl PoolState {
    fn insert(&mut self, serial: TaskSerialNo, record: TaskRecord) {
        self.by_priority.insert(priority_key(serial, &record));
        self.by_state.insert(state_key(serial, &record));
        self.metrics.add(record.state, record.info);
        self.tasks.insert(serial, record);
    }

    fn remove(&mut self, serial: TaskSerialNo) -> Option<TaskRecord> {
        let record = self.tasks.remove(&serial)?;
        self.by_priority.remove(&priority_key(serial, &record));
        self.by_state.remove(&state_key(serial, &record));
        self.metrics.sub(record.state, record.info);
        Some(record)
    }

    fn set_state(&mut self, serial: TaskSerialNo, state: PriorityTaskState) {
        let Some(record) = self.tasks.get_mut(&serial) else {
            return;
        };
        self.by_state.remove(&state_key(serial, record));
        self.metrics.sub(record.state, record.info);
        record.state = state;
        self.metrics.add(record.state, record.info);
        self.by_state.insert(state_key(serial, record));
    }

    fn set_priority(&mut self, serial: TaskSerialNo, priority: i32) -> bool {
        let Some(record) = self.tasks.get_mut(&serial) else {
            return false;
        };
        self.by_priority.remove(&priority_key(serial, record));
        self.by_state.remove(&state_key(serial, record));
        record.priority = priority;
        record.priority_cell.store(priority, Ordering::Release);
        self.by_priority.insert(priority_key(serial, record));
        self.by_state.insert(state_key(serial, record));
        true
    }

    /// Move a queued task onto `worker`.
    fn start_task(&mut self, serial: TaskSerialNo, worker: WorkerId) -> Option<Assignment> {
        let record = self.tasks.get_mut(&serial)?;
        let task = record.task.take()?;
        record.worker = Some(worker);
        let priority = record.priority_cell.clone();
        self.set_state(serial, PriorityTaskState::Running);
        Some(Assignment {
            serial,
            task,
            priority,
        })
    }

    fn resume(&mut self, serial: TaskSerialNo) {
        let worker = match self.tasks.get(&serial) {
            Some(r) if r.state == PriorityTaskState::Paused => r.worker,
            _ => return,
        };
        self.set_state(serial, PriorityTaskState::Running);
        self.paused_workers = self.paused_workers.saturating_sub(1);
        if let Some(w) = worker.and_then(|id| self.workers.get(id)) {
            w.resume_cond.notify_all();
        }
    }

    fn count_in(&self, state: PriorityTaskState) -> usize {
        self.tasks.values().filter(|r| r.state == state).count()
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct WorkerSlot {
    assignment: Option<Assignment>,
    running: bool,
    stopped: bool,
}

struct Worker {
    id: WorkerId,
    slot: Mutex<WorkerSlot>,
    slot_cond: Condvar,
    /// Paired with the pool mutex; signalled when this worker's paused task resumes.
    resume_cond: Condvar,
}

impl Worker {
    fn new(id: WorkerId) -> Self {
        Worker {
            id,
            slot: Mutex::new(WorkerSlot::default()),
            slot_cond: Condvar::new(),
            resume_cond: Condvar::new(),
        }
    }

    /// Hand a task to this worker. Returns it back if the worker is stopped.
    fn perform(&self, assignment: Assignment) -> Option<Assignment> {
        let mut slot = self.slot.lock();
        if slot.stopped {
            return Some(assignment);
        }
        slot.assignment = Some(assignment);
        self.slot_cond.notify_one();
        None
    }

    /// Stop the worker. A task already handed over counts as running and
    /// still runs to completion.
    fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = true;
        self.slot_cond.notify_all();
    }

    fn next_assignment(&self) -> Option<Assignment> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(a) = slot.assignment.take() {
                slot.running = true;
                return Some(a);
            }
            if slot.stopped {
                return None;
            }
            self.slot_cond.wait(&mut slot);
        }
    }

    fn set_idle(&self) {
        self.slot.lock().running = false;
    }
}

struct WorkerSuspender<'a> {
    shared: &'a Arc<Shared>,
    worker: &'a Arc<Worker>,
    serial: TaskSerialNo,
    priority: &'a AtomicI32,
}

impl Suspender for WorkerSuspender<'_> {
    fn pause_if_necessary(&self) {
        self.shared.pause_if_necessary(
            self.worker,
            self.serial,
            self.priority.load(Ordering::Acquire),
        );
    }
}

fn worker_main(shared: Arc<Shared>, worker: Arc<Worker>) {
    while let Some(mut current) = worker.next_assignment() {
        loop {
            let suspender = WorkerSuspender {
                shared: &shared,
                worker: &worker,
                serial: current.serial,
                priority: &current.priority,
            };
            current.task.run(Ok(()), Some(&suspender));
            match shared.worker_finished(&worker, current.serial) {
                Some(next) => current = next,
                None => break,
            }
        }
        worker.set_idle();
    }
    tracing::debug!(pool = %shared.name, worker = worker.id, "priority pool worker exiting");
}

// ── Pool ────────────────────────────────────────────────────────────────────

struct Shared {
    name: String,
    max_running_tasks: usize,
    state: Mutex<PoolState>,
    stopping: AtomicBool,
    max_priority_to_defer: AtomicI32,
    thread_failures_to_inject: AtomicUsize,
}

/// Bounded pool of preemptible background tasks.
pub struct PriorityThreadPool {
    shared: Arc<Shared>,
}

impl PriorityThreadPool {
    pub fn new(name: impl Into<String>, max_running_tasks: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_running_tasks,
                state: Mutex::new(PoolState::default()),
                stopping: AtomicBool::new(false),
                max_priority_to_defer: AtomicI32::new(EMPTY_QUEUE_PRIORITY),
                thread_failures_to_inject: AtomicUsize::new(0),
            }),
        })
    }

    pub fn max_running_tasks(&self) -> usize {
        self.shared.max_running_tasks
    }

    /// Submit a task. On success the task is either running on a worker or
    /// queued by (priority desc, serial asc).
    pub fn submit(&self, priority: i32, task: Box<dyn PriorityTask>) -> GraniteResult<TaskSerialNo> {
        let serial = NEXT_SERIAL_NO.fetch_add(1, Ordering::Relaxed);
        let handoff = {
            let mut state = self.shared.state.lock();
            if self.shared.stopping.load(Ordering::Acquire) {
                return Err(GraniteError::Aborted(SHUTDOWN_MESSAGE.into()));
            }
            let worker = self.shared.pick_worker(&mut state);
            if worker.is_none() && state.workers.is_empty() {
                return Err(GraniteError::Aborted(NO_WORKERS_MESSAGE.into()));
            }
            let priority_cell = Arc::new(AtomicI32::new(priority));
            let record = TaskRecord {
                priority,
                priority_cell: priority_cell.clone(),
                state: PriorityTaskState::NotStarted,
                worker: None,
                task: None,
                info: task.compaction_info(),
                description: task.describe(),
            };
            // handed over under the pool lock so shutdown cannot stop the
            // worker between the Running mark and the handoff
            let rejected = match worker {
                Some(w) => {
                    state.insert(
                        serial,
                        TaskRecord {
                            state: PriorityTaskState::Running,
                            worker: Some(w.id),
                            ..record
                        },
                    );
                    w.perform(Assignment {
                        serial,
                        task,
                        priority: priority_cell,
                    })
                }
                None => {
                    state.insert(
                        serial,
                        TaskRecord {
                            task: Some(task),
                            ..record
                        },
                    );
                    None
                }
            };
            self.shared.update_max_priority_to_defer(&state);
            state.metrics.publish();
            rejected
        };
        if let Some(assignment) = handoff {
            self.shared.abort(assignment, SHUTDOWN_MESSAGE);
        }
        Ok(serial)
    }

    /// Abort every queued task whose `should_remove_with_key(key)` matches.
    /// Running and paused tasks are left alone.
    pub fn remove(&self, key: u64) {
        let removed: Vec<Box<dyn PriorityTask>> = {
            let mut state = self.shared.state.lock();
            let serials: Vec<TaskSerialNo> = state
                .tasks
                .iter()
                .filter(|(_, r)| {
                    r.state == PriorityTaskState::NotStarted
                        && r.task.as_ref().is_some_and(|t| t.should_remove_with_key(key))
                })
                .map(|(s, _)| *s)
                .collect();
            let removed = serials
                .into_iter()
                .filter_map(|s| state.remove(s))
                .filter_map(|r| r.task)
                .collect();
            self.shared.update_max_priority_to_defer(&state);
            state.metrics.publish();
            removed
        };
        for mut task in removed {
            task.run(Err(GraniteError::Aborted(REMOVED_MESSAGE.into())), None);
        }
    }

    /// Change the priority of a tracked task. Returns false if the task has
    /// already finished.
    pub fn change_task_priority(&self, serial: TaskSerialNo, priority: i32) -> bool {
        let mut state = self.shared.state.lock();
        let old = match state.tasks.get(&serial) {
            Some(r) => r.priority,
            None => return false,
        };
        state.set_priority(serial, priority);
        self.shared.update_max_priority_to_defer(&state);
        tracing::info!(
            pool = %self.shared.name,
            serial,
            old,
            new = priority,
            "changed task priority"
        );
        true
    }

    /// First phase of shutdown: reject new work, abort queued tasks, resume
    /// paused workers and ask every worker to stop.
    pub fn start_shutdown(&self) {
        let (aborted, workers) = {
            let mut state = self.shared.state.lock();
            if self.shared.stopping.swap(true, Ordering::AcqRel) {
                return;
            }
            let mut queued = Vec::new();
            let mut paused = Vec::new();
            for (serial, r) in &state.tasks {
                match r.state {
                    PriorityTaskState::NotStarted => queued.push(*serial),
                    PriorityTaskState::Paused => paused.push(*serial),
                    PriorityTaskState::Running => {}
                }
            }
            let aborted: Vec<Box<dyn PriorityTask>> = queued
                .into_iter()
                .filter_map(|s| state.remove(s))
                .filter_map(|r| r.task)
                .collect();
            for serial in paused {
                state.resume(serial);
            }
            self.shared.update_max_priority_to_defer(&state);
            state.metrics.publish();
            (aborted, state.workers.clone())
        };
        for worker in workers {
            worker.stop();
        }
        for mut task in aborted {
            task.run(Err(GraniteError::Aborted(SHUTDOWN_MESSAGE.into())), None);
        }
        tracing::info!(pool = %self.shared.name, "priority thread pool shutdown started");
    }

    /// Second phase of shutdown: join all worker threads.
    pub fn complete_shutdown(&self) {
        let threads = std::mem::take(&mut self.shared.state.lock().threads);
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.name, "priority pool worker panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        self.start_shutdown();
        self.complete_shutdown();
    }

    /// Next `count` worker thread creations fail as if the OS refused them.
    pub fn inject_thread_creation_failures(&self, count: usize) {
        self.shared
            .thread_failures_to_inject
            .store(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.state.lock();
        PoolSnapshot {
            tasks: state.tasks.len(),
            running: state.count_in(PriorityTaskState::Running),
            paused: state.count_in(PriorityTaskState::Paused),
            queued: state.count_in(PriorityTaskState::NotStarted),
            workers: state.workers.len(),
            paused_workers: state.paused_workers,
            free_workers: state.free_workers.len(),
            max_priority_to_defer: self.shared.max_priority_to_defer.load(Ordering::Acquire),
            metrics: state.metrics,
        }
    }

    /// State of one task, `None` once it has finished.
    pub fn task_state(&self, serial: TaskSerialNo) -> Option<PriorityTaskState> {
        self.shared.state.lock().tasks.get(&serial).map(|r| r.state)
    }

    /// Diagnostic dump.
    pub fn state_to_string(&self) -> String {
        let state = self.shared.state.lock();
        let mut tasks: Vec<_> = state.tasks.iter().collect();
        tasks.sort_by_key(|(serial, r)| (Reverse(r.priority), **serial));
        let tasks: Vec<String> = tasks
            .into_iter()
            .map(|(serial, r)| {
                format!(
                    "{{ serial_no: {} priority: {} state: {} worker: {:?} task: {} }}",
                    serial, r.priority, r.state, r.worker, r.description
                )
            })
            .collect();
        format!(
            "{{ max_running_tasks: {} tasks: [{}] workers: {} paused_workers: {} free_workers: {} stopping: {} max_priority_to_defer: {} }}",
            self.shared.max_running_tasks,
            tasks.join(", "),
            state.workers.len(),
            state.paused_workers,
            state.free_workers.len(),
            self.shared.stopping.load(Ordering::Acquire),
            self.shared.max_priority_to_defer.load(Ordering::Acquire),
        )
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Obtain a worker for a new running task, if the running cap allows it.
    fn pick_worker(self: &Arc<Self>, state: &mut PoolState) -> Option<Arc<Worker>> {
        let busy = state
            .workers
            .len()
            .saturating_sub(state.paused_workers)
            .saturating_sub(state.free_workers.len());
        if busy >= self.max_running_tasks {
            return None;
        }
        if let Some(id) = state.free_workers.pop() {
            return state.workers.get(id).cloned();
        }

        let id = state.workers.len();
        let injected = self
            .thread_failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tracing::warn!(pool = %self.name, "failed to create worker thread: injected failure");
            return None;
        }
        let worker = Arc::new(Worker::new(id));
        let shared = Arc::clone(self);
        let thread_worker = Arc::clone(&worker);
        match std::thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || worker_main(shared, thread_worker))
        {
            Ok(handle) => {
                state.threads.push(handle);
                state.workers.push(Arc::clone(&worker));
                Some(worker)
            }
            Err(e) => {
                tracing::warn!(pool = %self.name, error = %e, "failed to create worker thread");
                None
            }
        }
    }

    fn abort(&self, mut assignment: Assignment, message: &str) {
        assignment
            .task
            .run(Err(GraniteError::Aborted(message.into())), None);
        let mut state = self.state.lock();
        state.remove(assignment.serial);
        self.update_max_priority_to_defer(&state);
        state.metrics.publish();
    }

    fn update_max_priority_to_defer(&self, state: &PoolState) {
        let value = if state.tasks.len() <= self.max_running_tasks {
            EMPTY_QUEUE_PRIORITY
        } else {
            state
                .by_priority
                .iter()
                .nth(self.max_running_tasks)
                .map(|k| k.priority.0)
                .unwrap_or(EMPTY_QUEUE_PRIORITY)
        };
        self.max_priority_to_defer.store(value, Ordering::Release);
    }

    fn pause_if_necessary(self: &Arc<Self>, worker: &Arc<Worker>, serial: TaskSerialNo, priority: i32) {
        if self.max_priority_to_defer.load(Ordering::Acquire) < priority {
            return;
        }

        let mut state = self.state.lock();
        if self.max_priority_to_defer.load(Ordering::Acquire) < priority
            || self.stopping.load(Ordering::Acquire)
        {
            return;
        }
        let Some(top) = state.by_state.first().copied() else {
            return;
        };
        if top.priority.0 <= priority {
            return;
        }

        state.paused_workers += 1;
        let mut rejected = None;
        match top.state {
            PriorityTaskState::Paused => state.resume(top.serial),
            PriorityTaskState::NotStarted => match self.pick_worker(&mut state) {
                Some(new_worker) => match state.start_task(top.serial, new_worker.id) {
                    Some(assignment) => rejected = new_worker.perform(assignment),
                    None => {
                        state.free_workers.push(new_worker.id);
                        state.paused_workers -= 1;
                        return;
                    }
                },
                None => {
                    state.paused_workers -= 1;
                    tracing::info!(
                        pool = %self.name,
                        serial,
                        preempting = top.serial,
                        "no worker available for preemption, continuing current task"
                    );
                    return;
                }
            },
            PriorityTaskState::Running => {
                state.paused_workers -= 1;
                tracing::error!(
                    pool = %self.name,
                    serial,
                    top = top.serial,
                    "higher priority task already running at top of state index"
                );
                return;
            }
        }

        if let Some(assignment) = rejected {
            state.paused_workers -= 1;
            drop(state);
            self.abort(assignment, SHUTDOWN_MESSAGE);
            return;
        }

        state.set_state(serial, PriorityTaskState::Paused);
        self.update_max_priority_to_defer(&state);
        state.metrics.publish();
        tracing::debug!(pool = %self.name, serial, preempted_by = top.serial, "pausing task");

        while state.tasks.get(&serial).map(|r| r.state) == Some(PriorityTaskState::Paused) {
            worker.resume_cond.wait(&mut state);
        }
        tracing::debug!(pool = %self.name, serial, "resumed task");
    }

    /// Bookkeeping after `serial` finished on `worker`. Returns the next
    /// task this worker should run, if any.
    fn worker_finished(&self, worker: &Worker, serial: TaskSerialNo) -> Option<Assignment> {
        let mut state = self.state.lock();
        state.remove(serial);
        let next = match state.by_state.first().copied() {
            None => None,
            Some(top) => match top.state {
                PriorityTaskState::Paused => {
                    state.resume(top.serial);
                    None
                }
                PriorityTaskState::NotStarted => state.start_task(top.serial, worker.id),
                PriorityTaskState::Running => None,
            },
        };
        if next.is_none() {
            state.free_workers.push(worker.id);
        }
        self.update_max_priority_to_defer(&state);
        state.metrics.publish();
        next
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    /// Test task driven by shared flags.
    struct TestTask {
        key: u64,
        info: Option<CompactionInfo>,
        release: Arc<AtomicBool>,
        started: Arc<AtomicBool>,
        outcome: Arc<Mutex<Vec<(u64, Result<(), GraniteError>)>>>,
        executing: Arc<AtomicUsize>,
        max_executing: Arc<AtomicUsize>,
        checkpoints: bool,
    }

    impl TestTask {
        fn new(key: u64, release: &Arc<AtomicBool>, outcome: &Arc<Mutex<Vec<(u64, GraniteResult<()>)>>>) -> Self {
            TestTask {
                key,
                info: None,
                release: release.clone(),
                started: Arc::new(AtomicBool::new(false)),
                outcome: outcome.clone(),
                executing: Arc::new(AtomicUsize::new(0)),
                max_executing: Arc::new(AtomicUsize::new(0)),
                checkpoints: true,
            }
        }

        fn enter(&self) {
            let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_executing.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.executing.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl PriorityTask for TestTask {
        fn run(&mut self, status: GraniteResult<()>, suspender: Option<&dyn Suspender>) {
            if status.is_ok() {
                self.started.store(true, Ordering::SeqCst);
                self.enter();
                while !self.release.load(Ordering::SeqCst) {
                    if let (true, Some(s)) = (self.checkpoints, suspender) {
                        self.leave();
                        s.pause_if_necessary();
                        self.enter();
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                self.leave();
            }
            self.outcome.lock().push((self.key, status));
        }

        fn should_remove_with_key(&self, key: u64) -> bool {
            self.key == key
        }

        fn compaction_info(&self) -> Option<CompactionInfo> {
            self.info
        }

        fn describe(&self) -> String {
            format!("test task {}", self.key)
        }
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    type Outcomes = Arc<Mutex<Vec<(u64, GraniteResult<()>)>>>;

    fn outcomes() -> Outcomes {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_zero_capacity_rejects_submission() {
        let pool = PriorityThreadPool::new("zero", 0);
        let release = Arc::new(AtomicBool::new(true));
        let out = outcomes();
        let err = pool
            .submit(1, Box::new(TestTask::new(1, &release, &out)))
            .unwrap_err();
        assert_eq!(err, GraniteError::Aborted(NO_WORKERS_MESSAGE.into()));
        assert!(out.lock().is_empty());
    }

    #[test]
    fn test_serial_numbers_increase() {
        let pool = PriorityThreadPool::new("serial", 1);
        let release = Arc::new(AtomicBool::new(true));
        let out = outcomes();
        let a = pool.submit(1, Box::new(TestTask::new(1, &release, &out))).unwrap();
        let b = pool.submit(1, Box::new(TestTask::new(2, &release, &out))).unwrap();
        assert!(b > a);
        wait_for("both tasks", || out.lock().len() == 2);
    }

    #[test]
    fn test_runs_and_frees_workers() {
        let pool = PriorityThreadPool::new("basic", 2);
        let release = Arc::new(AtomicBool::new(true));
        let out = outcomes();
        for i in 0..6 {
            pool.submit(1, Box::new(TestTask::new(i, &release, &out))).unwrap();
        }
        wait_for("all tasks", || out.lock().len() == 6);
        wait_for("idle pool", || pool.snapshot().tasks == 0);
        let snap = pool.snapshot();
        assert!(snap.workers <= 2);
        assert_eq!(snap.free_workers, snap.workers);
        assert_eq!(snap.max_priority_to_defer, EMPTY_QUEUE_PRIORITY);
        assert!(out.lock().iter().all(|(_, s)| s.is_ok()));
    }

    #[test]
    fn test_running_never_exceeds_cap() {
        const CAP: usize = 3;
        let pool = PriorityThreadPool::new("cap", CAP);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let executing = Arc::new(AtomicUsize::new(0));
        let max_executing = Arc::new(AtomicUsize::new(0));
        for i in 0..12u64 {
            let mut task = TestTask::new(i, &release, &out);
            task.executing = executing.clone();
            task.max_executing = max_executing.clone();
            pool.submit((i % 4) as i32, Box::new(task)).unwrap();
            let snap = pool.snapshot();
            assert!(snap.running <= CAP, "running {} > cap", snap.running);
        }
        for _ in 0..50 {
            let snap = pool.snapshot();
            assert!(snap.running <= CAP, "running {} > cap", snap.running);
            std::thread::sleep(Duration::from_millis(2));
        }
        release.store(true, Ordering::SeqCst);
        wait_for("all tasks", || out.lock().len() == 12);
        assert!(max_executing.load(Ordering::SeqCst) <= CAP);
    }

    #[test]
    fn test_higher_priority_preempts_one_running_task() {
        let pool = PriorityThreadPool::new("preempt", 2);
        let low_release = Arc::new(AtomicBool::new(false));
        let high_release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let low1 = pool.submit(1, Box::new(TestTask::new(1, &low_release, &out))).unwrap();
        let low2 = pool.submit(1, Box::new(TestTask::new(2, &low_release, &out))).unwrap();
        wait_for("low tasks running", || pool.snapshot().running == 2);

        let high = TestTask::new(3, &high_release, &out);
        let high_started = high.started.clone();
        let high_serial = pool.submit(2, Box::new(high)).unwrap();
        assert_eq!(pool.snapshot().max_priority_to_defer, 1);

        wait_for("high task started", || high_started.load(Ordering::SeqCst));
        wait_for("one task paused", || pool.snapshot().paused == 1);
        let snap = pool.snapshot();
        assert_eq!(snap.running, 2);
        assert_eq!(snap.queued, 0);
        assert_eq!(pool.task_state(high_serial), Some(PriorityTaskState::Running));
        let paused_lows = [low1, low2]
            .iter()
            .filter(|s| pool.task_state(**s) == Some(PriorityTaskState::Paused))
            .count();
        assert_eq!(paused_lows, 1);

        high_release.store(true, Ordering::SeqCst);
        wait_for("paused task resumed", || {
            let s = pool.snapshot();
            s.paused == 0 && s.running == 2
        });
        low_release.store(true, Ordering::SeqCst);
        wait_for("all done", || out.lock().len() == 3);
        assert_eq!(out.lock()[0].0, 3);
    }

    #[test]
    fn test_preemption_abandoned_without_worker() {
        let pool = PriorityThreadPool::new("fallback", 2);
        let low_release = Arc::new(AtomicBool::new(false));
        let high_release = Arc::new(AtomicBool::new(true));
        let out = outcomes();
        pool.submit(1, Box::new(TestTask::new(1, &low_release, &out))).unwrap();
        pool.submit(1, Box::new(TestTask::new(2, &low_release, &out))).unwrap();
        wait_for("low tasks running", || pool.snapshot().running == 2);

        pool.inject_thread_creation_failures(usize::MAX);
        let high = TestTask::new(3, &high_release, &out);
        let high_started = high.started.clone();
        pool.submit(5, Box::new(high)).unwrap();

        for _ in 0..50 {
            let snap = pool.snapshot();
            assert_eq!(snap.running, 2);
            assert_eq!(snap.paused, 0);
            assert_eq!(snap.queued, 1);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!high_started.load(Ordering::SeqCst));

        pool.inject_thread_creation_failures(0);
        wait_for("high task ran", || high_started.load(Ordering::SeqCst));
        low_release.store(true, Ordering::SeqCst);
        wait_for("all done", || out.lock().len() == 3);
    }

    #[test]
    fn test_remove_aborts_only_queued_matches() {
        let pool = PriorityThreadPool::new("remove", 1);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let mut blocker = TestTask::new(7, &release, &out);
        blocker.checkpoints = false;
        pool.submit(10, Box::new(blocker)).unwrap();
        wait_for("blocker running", || pool.snapshot().running == 1);

        pool.submit(1, Box::new(TestTask::new(7, &release, &out))).unwrap();
        pool.submit(1, Box::new(TestTask::new(8, &release, &out))).unwrap();
        pool.remove(7);

        {
            let out = out.lock();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].0, 7);
            assert_eq!(
                out[0].1,
                Err(GraniteError::Aborted(REMOVED_MESSAGE.into()))
            );
        }
        assert_eq!(pool.snapshot().queued, 1);
        release.store(true, Ordering::SeqCst);
        wait_for("remaining done", || out.lock().len() == 3);
        assert!(out.lock()[1..].iter().all(|(_, s)| s.is_ok()));
    }

    #[test]
    fn test_change_priority_reorders_queue() {
        let pool = PriorityThreadPool::new("reprioritize", 1);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let mut blocker = TestTask::new(0, &release, &out);
        blocker.checkpoints = false;
        pool.submit(100, Box::new(blocker)).unwrap();
        wait_for("blocker running", || pool.snapshot().running == 1);

        let done = Arc::new(AtomicBool::new(true));
        let a = pool.submit(1, Box::new(TestTask::new(1, &done, &out))).unwrap();
        pool.submit(2, Box::new(TestTask::new(2, &done, &out))).unwrap();
        assert!(pool.change_task_priority(a, 3));

        release.store(true, Ordering::SeqCst);
        wait_for("all done", || out.lock().len() == 3);
        let order: Vec<u64> = out.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(!pool.change_task_priority(a, 9));
    }

    #[test]
    fn test_shutdown_aborts_queued_and_rejects_new() {
        let pool = PriorityThreadPool::new("shutdown", 1);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let mut blocker = TestTask::new(1, &release, &out);
        blocker.checkpoints = false;
        pool.submit(1, Box::new(blocker)).unwrap();
        wait_for("blocker running", || pool.snapshot().running == 1);
        pool.submit(1, Box::new(TestTask::new(2, &release, &out))).unwrap();

        pool.start_shutdown();
        assert_eq!(
            out.lock()[0],
            (2, Err(GraniteError::Aborted(SHUTDOWN_MESSAGE.into())))
        );
        let err = pool
            .submit(1, Box::new(TestTask::new(3, &release, &out)))
            .unwrap_err();
        assert_eq!(err, GraniteError::Aborted(SHUTDOWN_MESSAGE.into()));
        release.store(true, Ordering::SeqCst);
        pool.complete_shutdown();
        let out = out.lock();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], (1, Ok(())));
    }

    #[test]
    fn test_shutdown_lets_handed_over_task_finish() {
        for _ in 0..20 {
            let pool = PriorityThreadPool::new("handoff", 1);
            let release = Arc::new(AtomicBool::new(false));
            let out = outcomes();
            let mut task = TestTask::new(7, &release, &out);
            task.checkpoints = false;
            pool.submit(1, Box::new(task)).unwrap();
            // counted as running from the moment submit returns
            assert_eq!(pool.snapshot().running, 1);
            pool.start_shutdown();
            release.store(true, Ordering::SeqCst);
            pool.complete_shutdown();
            assert_eq!(*out.lock(), vec![(7, Ok(()))]);
        }
    }

    #[test]
    fn test_shutdown_resumes_paused_tasks() {
        let pool = PriorityThreadPool::new("shutdown-paused", 1);
        let low_release = Arc::new(AtomicBool::new(false));
        let high_release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let low = pool.submit(1, Box::new(TestTask::new(1, &low_release, &out))).unwrap();
        wait_for("low running", || pool.snapshot().running == 1);
        let mut high = TestTask::new(2, &high_release, &out);
        high.checkpoints = false;
        pool.submit(2, Box::new(high)).unwrap();
        wait_for("low paused", || pool.task_state(low) == Some(PriorityTaskState::Paused));

        pool.start_shutdown();
        assert_eq!(pool.task_state(low), Some(PriorityTaskState::Running));
        low_release.store(true, Ordering::SeqCst);
        high_release.store(true, Ordering::SeqCst);
        pool.complete_shutdown();
        assert_eq!(out.lock().len(), 2);
    }

    #[test]
    fn test_compaction_metrics_follow_state() {
        let pool = PriorityThreadPool::new("metrics", 1);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let mut running = TestTask::new(1, &release, &out);
        running.checkpoints = false;
        running.info = Some(CompactionInfo {
            file_count: 3,
            byte_count: 300,
        });
        pool.submit(1, Box::new(running)).unwrap();
        let mut queued = TestTask::new(2, &release, &out);
        queued.info = Some(CompactionInfo {
            file_count: 2,
            byte_count: 50,
        });
        pool.submit(1, Box::new(queued)).unwrap();
        pool.submit(1, Box::new(TestTask::new(3, &release, &out))).unwrap();

        let m = pool.snapshot().metrics;
        assert_eq!(
            m.active,
            StateGauges {
                tasks: 1,
                files: 3,
                bytes: 300
            }
        );
        assert_eq!(
            m.queued,
            StateGauges {
                tasks: 1,
                files: 2,
                bytes: 50
            }
        );
        assert_eq!(m.paused, StateGauges::default());

        release.store(true, Ordering::SeqCst);
        wait_for("all done", || out.lock().len() == 3);
        wait_for("gauges drained", || pool.snapshot().metrics == PoolMetrics::default());
    }

    #[test]
    fn test_state_to_string() {
        let pool = PriorityThreadPool::new("dump", 2);
        let s = pool.state_to_string();
        assert!(s.starts_with("{ max_running_tasks: 2 tasks: []"));
        assert!(s.contains("stopping: false"));
    }

    #[test]
    fn test_defer_priority_is_boundary_task() {
        let pool = PriorityThreadPool::new("defer", 1);
        let release = Arc::new(AtomicBool::new(false));
        let out = outcomes();
        let mut blocker = TestTask::new(0, &release, &out);
        blocker.checkpoints = false;
        pool.submit(9, Box::new(blocker)).unwrap();
        assert_eq!(pool.snapshot().max_priority_to_defer, EMPTY_QUEUE_PRIORITY);
        pool.submit(4, Box::new(TestTask::new(1, &release, &out))).unwrap();
        assert_eq!(pool.snapshot().max_priority_to_defer, 4);
        pool.submit(6, Box::new(TestTask::new(2, &release, &out))).unwrap();
        assert_eq!(pool.snapshot().max_priority_to_defer, 6);
        release.store(true, Ordering::SeqCst);
        wait_for("all done", || out.lock().len() == 3);
    }
}
