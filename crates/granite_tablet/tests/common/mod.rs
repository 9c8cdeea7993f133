//! Shared harness: tablet peers over in-memory stores and `LocalConsensus`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use granite_common::clock::HybridClock;
use granite_common::config::GraniteConfig;
use granite_common::datum::Datum;
use granite_common::schema::{ColumnSchema, DataType, Schema};
use granite_common::types::{ClientRequestId, ColumnId, PeerId, TableId, TabletId};
use granite_executor::ThreadPool;
use granite_raft::{Consensus, ConsensusFactory, ConsensusMetadataStore, LocalConsensus, LocalConsensusOptions, MemLog, RaftConfig};
use granite_storage::MemKvStore;
use granite_tablet::{
    bootstrap_tablet, completion_channel, CompletionReceiver, HistoryRetentionPolicy, RowOp, Tablet,
    TabletMetadata, TabletPeer, TabletPeerResources, WriteQuery, WriteRequest,
};

pub const V: ColumnId = ColumnId(1);
pub const NAME: ColumnId = ColumnId(2);

pub fn config() -> Arc<GraniteConfig> {
    let mut cfg = GraniteConfig::default();
    cfg.consensus.heartbeat_interval_ms = 10;
    cfg.consensus.log_segment_entries = 4;
    cfg.tablet.shutdown_report_interval_ms = 500;
    Arc::new(cfg)
}

pub fn schema() -> Schema {
    Schema::new(
        1,
        vec![
            ColumnSchema {
                id: V,
                name: "v".into(),
                data_type: DataType::Int64,
                nullable: true,
            },
            ColumnSchema {
                id: NAME,
                name: "name".into(),
                data_type: DataType::Text,
                nullable: true,
            },
        ],
    )
}

pub fn upsert(key: &str, v: i64) -> WriteRequest {
    WriteRequest {
        schema_version: 1,
        rows: vec![RowOp::upsert(key, vec![(V, Datum::Int64(v))])],
        transaction: None,
        client_request: None,
    }
}

pub fn upsert_with_id(key: &str, v: i64, client_id: u64, request_id: u64) -> WriteRequest {
    let mut req = upsert(key, v);
    req.client_request = Some(ClientRequestId {
        client_id,
        request_id,
    });
    req
}

/// The stores of a tablet, kept concrete so tests can crash them.
pub struct Stores {
    pub regular: Arc<MemKvStore>,
    pub intents: Arc<MemKvStore>,
}

impl Stores {
    pub fn new(tablet_id: &str, cfg: &GraniteConfig) -> Self {
        Stores {
            regular: MemKvStore::new(format!("{tablet_id}-regular"), cfg.storage.clone(), None),
            intents: MemKvStore::new(format!("{tablet_id}-intents"), cfg.storage.clone(), None),
        }
    }

    pub fn simulate_crash(&self) {
        self.regular.simulate_crash();
        self.intents.simulate_crash();
    }

    pub fn tablet(&self, tablet_id: &str, cfg: &GraniteConfig) -> Arc<Tablet> {
        let meta = TabletMetadata::new(TabletId::from(tablet_id), TableId::from("table"), schema());
        Tablet::new(
            meta,
            self.regular.clone(),
            self.intents.clone(),
            Arc::new(HistoryRetentionPolicy::new(&cfg.retention)),
            &cfg.tablet,
        )
    }
}

pub struct PeerSpec {
    pub tablet_id: String,
    pub peer_id: String,
    pub voters: Vec<String>,
    pub leader: bool,
}

impl PeerSpec {
    pub fn single(tablet_id: &str) -> Self {
        PeerSpec {
            tablet_id: tablet_id.into(),
            peer_id: "p1".into(),
            voters: vec!["p1".into()],
            leader: true,
        }
    }
}

pub struct TestPeer {
    pub peer: Arc<TabletPeer>,
    pub consensus: Arc<LocalConsensus>,
    pub log: Arc<MemLog>,
    pub tablet: Arc<Tablet>,
}

pub struct Harness {
    pub cfg: Arc<GraniteConfig>,
    pub clock: Arc<HybridClock>,
    pub pool: Arc<ThreadPool>,
    pub meta_store: Arc<ConsensusMetadataStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(cfg: Arc<GraniteConfig>) -> Self {
        granite_observability::try_init_test_tracing();
        let pool = ThreadPool::new(
            "test-prepare",
            cfg.tablet.prepare_pool_threads,
            cfg.tablet.prepare_queue_capacity,
        )
        .unwrap();
        Harness {
            cfg,
            clock: HybridClock::system(),
            pool,
            meta_store: ConsensusMetadataStore::new(),
        }
    }

    /// Bootstrap, init and start a peer over `tablet` and `log`.
    pub fn start_peer(&self, spec: &PeerSpec, tablet: Arc<Tablet>, log: Arc<MemLog>) -> TestPeer {
        let peer = TabletPeer::new(
            TabletId::from(spec.tablet_id.as_str()),
            PeerId::from(spec.peer_id.as_str()),
            Arc::clone(&self.cfg),
            Arc::clone(&self.clock),
            None,
        );
        peer.set_bootstrapping().unwrap();
        let bootstrap = bootstrap_tablet(&tablet, log.as_ref(), &self.clock).unwrap();

        let slot: Arc<Mutex<Option<Arc<LocalConsensus>>>> = Arc::new(Mutex::new(None));
        let options = LocalConsensusOptions {
            tablet_id: TabletId::from(spec.tablet_id.as_str()),
            peer_id: PeerId::from(spec.peer_id.as_str()),
            initial_config: RaftConfig::new(spec.voters.iter().map(|v| PeerId::from(v.as_str())).collect()),
            start_as_leader: spec.leader,
            config: self.cfg.consensus.clone(),
        };
        let factory_log = log.clone();
        let clock = Arc::clone(&self.clock);
        let meta_store = Arc::clone(&self.meta_store);
        let factory_slot = Arc::clone(&slot);
        let consensus_factory: ConsensusFactory = Box::new(move |ctx| {
            let consensus = LocalConsensus::new(options, factory_log, clock, meta_store, ctx);
            *factory_slot.lock() = Some(Arc::clone(&consensus));
            Ok(consensus as Arc<dyn Consensus>)
        });
        peer.init_tablet_peer(TabletPeerResources {
            tablet: Arc::clone(&tablet),
            log: log.clone(),
            consensus_factory,
            prepare_pool: Arc::clone(&self.pool),
            log_gc_runner: None,
        })
        .unwrap();
        let consensus = slot.lock().take().unwrap();
        TestPeer {
            peer,
            consensus,
            log,
            tablet,
        }
        .start(bootstrap)
    }

    pub fn single_leader(&self, tablet_id: &str) -> TestPeer {
        let tablet = Tablet::in_memory(
            TabletMetadata::new(TabletId::from(tablet_id), TableId::from("table"), schema()),
            &self.cfg,
            None,
        );
        let log = MemLog::new(self.cfg.consensus.log_segment_entries);
        let p = self.start_peer(&PeerSpec::single(tablet_id), tablet, log);
        p.wait_leader_ready();
        p
    }
}

impl TestPeer {
    fn start(self, bootstrap: granite_tablet::BootstrapResult) -> Self {
        self.peer.start(bootstrap).unwrap();
        self
    }

    pub fn wait_leader_ready(&self) {
        wait_until(Duration::from_secs(10), || self.peer.is_leader_and_ready());
    }

    pub fn write(&self, request: WriteRequest) -> CompletionReceiver {
        let (cb, rx) = completion_channel();
        // errors are delivered through the receiver as well
        let _ = self.peer.write_async(WriteQuery::new(request, cb));
        rx
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
