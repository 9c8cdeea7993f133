//! Tablet manager: owns every tablet peer hosted by this server.
//!
//! Opening a tablet runs `set_bootstrapping → bootstrap_tablet →
//! init_tablet_peer → start`. A tablet that fails to open stays registered
//! in FAILED state so that reports and status calls can show why.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use granite_common::clock::HybridClock;
use granite_common::config::GraniteConfig;
use granite_common::error::{ErrorContext, GraniteError, GraniteResult};
use granite_common::types::{PeerId, TableId, TabletId};
use granite_executor::{PriorityThreadPool, ThreadPool};
use granite_raft::{
    Consensus, ConsensusFactory, ConsensusMetadataStore, LeaderStatus, LocalConsensus, LocalConsensusOptions,
    MemLog, RaftConfig, ReplicatedLog,
};
use granite_tablet::{
    bootstrap_tablet, LogGcRunner, MarkDirtyCallback, Partition, SplitRecord, Tablet, TabletMetadata,
    TabletPeer, TabletPeerResources, TabletSplitter, TabletStatus,
};

use crate::catalog::CatalogClient;
use crate::report::{DirtySnapshot, DirtyTablets, ReportedTablet, TabletReport};

#[derive(Debug, Clone)]
pub struct CreateTabletRequest {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub partition: Partition,
}

/// A running leader and the term it leads in.
#[derive(Clone)]
pub struct LeaderTabletPeer {
    pub peer: Arc<TabletPeer>,
    pub leader_term: u64,
}

pub struct TabletManager {
    config: Arc<GraniteConfig>,
    node_id: PeerId,
    clock: Arc<HybridClock>,
    catalog: Arc<dyn CatalogClient>,
    prepare_pool: Arc<ThreadPool>,
    compaction_pool: Arc<PriorityThreadPool>,
    log_gc_runner: Option<Arc<LogGcRunner>>,
    meta_store: Arc<ConsensusMetadataStore>,
    peers: RwLock<BTreeMap<TabletId, Arc<TabletPeer>>>,
    dirty: Arc<DirtyTablets>,
    report_sequence: AtomicU64,
    /// The next heartbeat carries every tablet.
    full_report_pending: AtomicBool,
    shutting_down: AtomicBool,
    weak_self: Weak<TabletManager>,
}

impl TabletManager {
    pub fn new(config: Arc<GraniteConfig>, catalog: Arc<dyn CatalogClient>) -> GraniteResult<Arc<Self>> {
        Self::with_clock(config, catalog, HybridClock::system())
    }

    pub fn with_clock(
        config: Arc<GraniteConfig>,
        catalog: Arc<dyn CatalogClient>,
        clock: Arc<HybridClock>,
    ) -> GraniteResult<Arc<Self>> {
        let prepare_pool = ThreadPool::new(
            "prepare",
            config.tablet.prepare_pool_threads,
            config.tablet.prepare_queue_capacity,
        )?;
        let compaction_pool = PriorityThreadPool::new("compaction", config.scheduler.max_running_compactions);
        let log_gc_runner = if config.log_gc.enabled {
            Some(LogGcRunner::start(Duration::from_millis(config.log_gc.interval_ms))?)
        } else {
            None
        };
        let node_id = PeerId::new(config.server.node_id.clone());
        info!(node = %node_id, "tablet manager started");
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            node_id,
            clock,
            catalog,
            prepare_pool,
            compaction_pool,
            log_gc_runner,
            meta_store: ConsensusMetadataStore::new(),
            peers: RwLock::new(BTreeMap::new()),
            dirty: Arc::new(DirtyTablets::new()),
            report_sequence: AtomicU64::new(0),
            full_report_pending: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn config(&self) -> &Arc<GraniteConfig> {
        &self.config
    }

    pub fn node_id(&self) -> &PeerId {
        &self.node_id
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn dirty_tablets(&self) -> &Arc<DirtyTablets> {
        &self.dirty
    }

    pub fn compaction_pool(&self) -> &Arc<PriorityThreadPool> {
        &self.compaction_pool
    }

    // ── Opening tablets ────────────────────────────────────────────────────

    /// Create a new tablet of `table_id` over fresh stores and open it as the
    /// single-replica leader.
    pub fn create_tablet(&self, request: CreateTabletRequest) -> GraniteResult<Arc<TabletPeer>> {
        self.check_not_shutting_down()?;
        let table = self.catalog.get_table(&request.table_id)?;
        let metadata = TabletMetadata::new(request.tablet_id, request.table_id, table.schema)
            .with_table_type(table.table_type)
            .with_partition(request.partition);
        let tablet = Tablet::in_memory(metadata, &self.config, Some(Arc::clone(&self.compaction_pool)));
        self.open_tablet(tablet, MemLog::new(self.config.consensus.log_segment_entries))
    }

    /// Register `tablet` and bring its peer up over `log`.
    pub fn open_tablet(&self, tablet: Arc<Tablet>, log: Arc<dyn ReplicatedLog>) -> GraniteResult<Arc<TabletPeer>> {
        self.check_not_shutting_down()?;
        let tablet_id = tablet.tablet_id().clone();
        let dirty = Arc::clone(&self.dirty);
        let mark_dirty: MarkDirtyCallback = Arc::new(move |id: &TabletId, reason: &str| dirty.mark(id, reason));
        let peer = TabletPeer::new(
            tablet_id.clone(),
            self.node_id.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
            Some(mark_dirty),
        );
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&tablet_id) {
                return Err(GraniteError::AlreadyPresent(format!(
                    "tablet {tablet_id} is already hosted on {}",
                    self.node_id
                )));
            }
            peers.insert(tablet_id.clone(), Arc::clone(&peer));
        }
        self.dirty.mark(&tablet_id, "tablet registered");
        tablet.set_splitter(Arc::new(SplitChildCreator {
            manager: self.weak_self.clone(),
        }));

        if let Err(e) = self.bootstrap_and_start(&peer, tablet, log) {
            error!(tablet_id = %tablet_id, error = %e, "failed to open tablet");
            peer.set_failed(e.clone());
            return Err(e);
        }
        Ok(peer)
    }

    fn bootstrap_and_start(
        &self,
        peer: &Arc<TabletPeer>,
        tablet: Arc<Tablet>,
        log: Arc<dyn ReplicatedLog>,
    ) -> GraniteResult<()> {
        let tablet_id = peer.tablet_id().clone();
        peer.set_bootstrapping()?;
        let bootstrap = bootstrap_tablet(&tablet, log.as_ref(), &self.clock)
            .ctx_with(|| format!("bootstrap of tablet {tablet_id}"))?;
        peer.set_last_status(format!("bootstrap replayed {} entries", bootstrap.replayed));

        let options = LocalConsensusOptions {
            tablet_id: tablet_id.clone(),
            peer_id: self.node_id.clone(),
            initial_config: RaftConfig::single(self.node_id.clone()),
            start_as_leader: true,
            config: self.config.consensus.clone(),
        };
        let consensus_log = Arc::clone(&log);
        let clock = Arc::clone(&self.clock);
        let meta_store = Arc::clone(&self.meta_store);
        let consensus_factory: ConsensusFactory = Box::new(move |context| {
            let consensus = LocalConsensus::new(options, consensus_log, clock, meta_store, context);
            Ok(consensus as Arc<dyn Consensus>)
        });
        peer.init_tablet_peer(TabletPeerResources {
            tablet,
            log,
            consensus_factory,
            prepare_pool: Arc::clone(&self.prepare_pool),
            log_gc_runner: self.log_gc_runner.clone(),
        })?;
        peer.start(bootstrap)
    }

    fn check_not_shutting_down(&self) -> GraniteResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GraniteError::ShutdownInProgress(format!(
                "tablet server {} is shutting down",
                self.node_id
            )));
        }
        Ok(())
    }

    // ── Lookup ─────────────────────────────────────────────────────────────

    pub fn lookup(&self, tablet_id: &TabletId) -> GraniteResult<Arc<TabletPeer>> {
        self.peers
            .read()
            .get(tablet_id)
            .cloned()
            .ok_or_else(|| GraniteError::NotFound(format!("tablet {tablet_id} is not hosted on {}", self.node_id)))
    }

    /// The peer of `tablet_id` if it is running and a ready leader.
    pub fn lookup_leader(&self, tablet_id: &TabletId) -> GraniteResult<LeaderTabletPeer> {
        let peer = self.lookup(tablet_id)?;
        peer.check_running()?;
        match peer.leader_status() {
            LeaderStatus::LeaderAndReady => {}
            LeaderStatus::NotLeader => {
                return Err(GraniteError::IllegalState(format!(
                    "{} is not the leader of tablet {tablet_id}",
                    self.node_id
                )));
            }
            status => {
                return Err(GraniteError::ServiceUnavailable(format!(
                    "leader of tablet {tablet_id} is not ready to serve: {status}"
                )));
            }
        }
        let leader_term = peer.leader_term().ok_or_else(|| {
            GraniteError::IllegalState(format!("{} lost leadership of tablet {tablet_id}", self.node_id))
        })?;
        Ok(LeaderTabletPeer { peer, leader_term })
    }

    pub fn peers(&self) -> Vec<Arc<TabletPeer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn list_tablets(&self) -> Vec<TabletStatus> {
        self.peers().iter().map(|p| p.get_tablet_status()).collect()
    }

    /// Shut down and forget `tablet_id`.
    pub fn delete_tablet(&self, tablet_id: &TabletId) -> GraniteResult<()> {
        let peer = self
            .peers
            .write()
            .remove(tablet_id)
            .ok_or_else(|| GraniteError::NotFound(format!("tablet {tablet_id}")))?;
        peer.shutdown();
        self.meta_store.delete(tablet_id, &self.node_id);
        info!(%tablet_id, "tablet deleted");
        Ok(())
    }

    // ── Split ──────────────────────────────────────────────────────────────

    /// Create both children of a committed split, seeded with the parent's
    /// rows as of the split. Children that already exist are left alone.
    fn create_split_children(&self, parent_id: &TabletId, split: &SplitRecord) -> GraniteResult<()> {
        let parent = self.lookup(parent_id)?.tablet()?;
        let meta = parent.metadata();
        let halves = [
            Partition::new(meta.partition.start.clone(), split.split_key.clone()),
            Partition::new(split.split_key.clone(), meta.partition.end.clone()),
        ];
        for (child_id, partition) in split.children.iter().zip(halves) {
            if self.peers.read().contains_key(child_id) {
                continue;
            }
            let batch = parent.rows_as_batch(&partition.key_range(), split.hybrid_time)?;
            let entries = batch.len();
            let child_meta = TabletMetadata::new(child_id.clone(), meta.table_id.clone(), meta.schema.clone())
                .with_table_type(meta.table_type)
                .with_partition(partition);
            let child = Tablet::in_memory(child_meta, &self.config, Some(Arc::clone(&self.compaction_pool)));
            if !batch.is_empty() {
                child.regular_db().apply_write_batch(batch)?;
                child.flush()?;
            }
            self.open_tablet(child, MemLog::new(self.config.consensus.log_segment_entries))?;
            info!(parent = %parent_id, child = %child_id, entries, "split child created");
        }
        Ok(())
    }

    // ── Reports ────────────────────────────────────────────────────────────

    fn reported(&self, peer: &TabletPeer) -> ReportedTablet {
        let status = peer.get_tablet_status();
        ReportedTablet {
            tablet_id: status.tablet_id,
            table_id: status.table_id,
            state: peer.human_readable_state(),
            last_op_id: status.last_op_id,
            on_disk_size: status.on_disk_size,
            leader: peer.is_leader_and_ready(),
        }
    }

    /// Build a report: every tablet, or only the dirty ones.
    pub fn generate_report(&self, incremental: bool) -> (TabletReport, DirtySnapshot) {
        let snapshot = self.dirty.snapshot();
        let peers = self.peers.read();
        let tablets = if incremental {
            snapshot
                .tablet_ids()
                .filter_map(|id| peers.get(id))
                .map(|p| self.reported(p))
                .collect()
        } else {
            peers.values().map(|p| self.reported(p)).collect()
        };
        let report = TabletReport {
            node_id: self.node_id.as_str().to_string(),
            sequence: self.report_sequence.fetch_add(1, Ordering::AcqRel) + 1,
            incremental,
            tablets,
        };
        (report, snapshot)
    }

    /// Send one report to the catalog. Tablets stay dirty until a report
    /// that carried them is acknowledged.
    pub fn heartbeat(&self) -> GraniteResult<TabletReport> {
        let incremental = !self.full_report_pending.load(Ordering::Acquire);
        let (report, snapshot) = self.generate_report(incremental);
        if let Err(e) = self.catalog.report_tablets(&report) {
            warn!(sequence = report.sequence, error = %e, "tablet report rejected");
            return Err(e);
        }
        self.dirty.acknowledge(&snapshot);
        self.full_report_pending.store(false, Ordering::Release);
        Ok(report)
    }

    /// Request a full report with the next heartbeat.
    pub fn request_full_report(&self) {
        self.full_report_pending.store(true, Ordering::Release);
    }

    /// Run one log GC pass over every registered tablet right away.
    pub fn run_log_gc_now(&self) {
        if let Some(runner) = &self.log_gc_runner {
            runner.run_now();
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────────────

    /// Shut every peer down, then the shared pools. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runner) = &self.log_gc_runner {
            runner.stop();
        }
        let peers: Vec<_> = std::mem::take(&mut *self.peers.write()).into_values().collect();
        info!(node = %self.node_id, tablets = peers.len(), "shutting down tablets");
        // quiesce everything first so that no tablet waits on another
        let started: Vec<_> = peers.iter().filter(|p| p.start_shutdown()).collect();
        for peer in started {
            peer.complete_shutdown();
        }
        for peer in &peers {
            peer.wait_until_shutdown();
        }
        self.compaction_pool.shutdown();
        self.prepare_pool.shutdown();
        info!(node = %self.node_id, "tablet manager shut down");
    }
}

impl Drop for TabletManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SplitChildCreator {
    manager: Weak<TabletManager>,
}

impl TabletSplitter for SplitChildCreator {
    fn apply_split(&self, parent: &TabletId, split: &SplitRecord) -> GraniteResult<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| GraniteError::ShutdownInProgress("tablet manager is gone".into()))?;
        manager.create_split_children(parent, split)
    }
}
