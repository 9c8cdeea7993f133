//! A tablet manager over an in-memory catalog holding one `users` table.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use granite_common::config::GraniteConfig;
use granite_common::datum::Datum;
use granite_common::schema::{ColumnSchema, DataType, Schema};
use granite_common::types::{ColumnId, TableId, TabletId};
use granite_tablet::{Partition, RowOp, TableType, WriteRequest};
use granite_tserver::{
    CreateTabletRequest, InMemoryCatalog, TabletManager, TabletService, WriteTabletRequest, WriteTabletResponse,
};

pub const V: ColumnId = ColumnId(1);
pub const NAME: ColumnId = ColumnId(2);
pub const TABLE: &str = "users";

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

pub fn config() -> GraniteConfig {
    let mut cfg = GraniteConfig::default();
    cfg.server.node_id = "ts-test".into();
    cfg.consensus.heartbeat_interval_ms = 10;
    cfg.consensus.log_segment_entries = 4;
    cfg.log_gc.enabled = false;
    cfg
}

pub struct Server {
    pub catalog: Arc<InMemoryCatalog>,
    pub manager: Arc<TabletManager>,
    pub service: TabletService,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(cfg: GraniteConfig) -> Self {
        granite_observability::try_init_test_tracing();
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog
            .create_table(TableId::from(TABLE), schema(), TableType::Regular)
            .unwrap();
        let manager = TabletManager::new(Arc::new(cfg), catalog.clone()).unwrap();
        let service = TabletService::new(Arc::clone(&manager));
        Server {
            catalog,
            manager,
            service,
        }
    }

    /// Create `id` over the whole key space and wait until it leads.
    pub fn tablet(&self, id: &str) -> TabletId {
        let tablet_id = TabletId::from(id);
        self.manager
            .create_tablet(CreateTabletRequest {
                tablet_id: tablet_id.clone(),
                table_id: TableId::from(TABLE),
                partition: Partition::default(),
            })
            .unwrap();
        self.wait_leader(&tablet_id);
        tablet_id
    }

    pub fn wait_leader(&self, tablet_id: &TabletId) {
        wait_until(Duration::from_secs(10), || self.manager.lookup_leader(tablet_id).is_ok());
    }

    pub fn write(&self, tablet_id: &TabletId, rows: Vec<RowOp>) -> WriteTabletResponse {
        self.service
            .write(WriteTabletRequest {
                tablet_id: tablet_id.clone(),
                write: write_request(1, rows),
                propagated_hybrid_time: None,
                deadline: None,
            })
            .into_result()
            .unwrap()
    }

    pub fn fill(&self, tablet_id: &TabletId, count: i64) {
        for i in 0..count {
            self.write(tablet_id, vec![row(&format!("k{i:02}"), i)]);
        }
    }
}

pub fn row(key: &str, v: i64) -> RowOp {
    RowOp::upsert(key, vec![(V, Datum::Int64(v))])
}

pub fn write_request(schema_version: u32, rows: Vec<RowOp>) -> WriteRequest {
    WriteRequest {
        schema_version,
        rows,
        transaction: None,
        client_request: None,
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
