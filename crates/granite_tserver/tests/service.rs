mod common;

use std::time::Duration;

use granite_common::datum::Datum;
use granite_common::error::GraniteError;
use granite_common::schema::{ColumnSchema, DataType, Schema};
use granite_common::types::{ColumnId, TabletId};
use granite_common::{HybridTime, OpId};
use granite_storage::KeyRange;
use granite_tablet::{ReadConsistency, ReadRequest, TabletDataState};
use granite_tserver::{
    AlterSchemaRequest, FlushOperation, FlushTabletsRequest, ReadTabletRequest, SplitTabletRequest,
    WriteTabletRequest,
};

use common::{row, schema, write_request, Server};

fn strong_read(server: &Server, tablet_id: &TabletId) -> Vec<granite_tablet::ReadRow> {
    server
        .service
        .read(ReadTabletRequest {
            tablet_id: tablet_id.clone(),
            read: ReadRequest::new(KeyRange::all(), ReadConsistency::Strong),
            propagated_hybrid_time: None,
        })
        .into_result()
        .unwrap()
        .rows
}

fn flush(ids: Vec<TabletId>, all: bool, operation: FlushOperation) -> FlushTabletsRequest {
    FlushTabletsRequest {
        all_tablets: all,
        tablet_ids: ids,
        operation,
        propagated_hybrid_time: None,
    }
}

#[test]
fn test_write_then_read() {
    let server = Server::new();
    let id = server.tablet("t-rw");
    assert!(!server.manager.lookup(&id).unwrap().can_be_deleted());
    let first = server.write(&id, vec![row("a", 1), row("b", 2)]);
    let second = server.write(&id, vec![row("c", 3)]);
    assert!(first.op_id.is_valid());
    assert!(second.op_id.index > first.op_id.index);
    assert!(second.hybrid_time > first.hybrid_time);

    let rows = strong_read(&server, &id);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].get("v"), Some(&Datum::Int64(3)));
    server.manager.shutdown();
}

#[test]
fn test_empty_write_skips_consensus() {
    let server = Server::new();
    let id = server.tablet("t-empty");
    server.write(&id, vec![row("a", 1)]);
    let log = server.manager.lookup(&id).unwrap().log().unwrap();
    let before = log.latest_entry_op_id();

    let resp = server.write(&id, Vec::new());
    assert_eq!(resp.op_id, OpId::INVALID);
    assert!(resp.hybrid_time.is_valid());
    assert_eq!(log.latest_entry_op_id(), before);
    server.manager.shutdown();
}

#[test]
fn test_every_response_propagates_hybrid_time() {
    let server = Server::new();
    let id = server.tablet("t-ht");
    let ahead = server.manager.clock().now().add_duration(Duration::from_secs(2));

    // a failed call still moves the clock and reports it
    let resp = server.service.write(WriteTabletRequest {
        tablet_id: TabletId::from("missing"),
        write: write_request(1, vec![row("a", 1)]),
        propagated_hybrid_time: Some(ahead),
        deadline: None,
    });
    assert!(matches!(resp.result, Err(GraniteError::NotFound(_))));
    assert!(resp.propagated_hybrid_time > ahead);

    let written = server.write(&id, vec![row("a", 1)]);
    assert!(written.hybrid_time > ahead);
    let status = server.service.get_tablet_status(&id);
    assert!(status.propagated_hybrid_time > written.hybrid_time);
    server.manager.shutdown();
}

#[test]
fn test_alter_schema_versions() {
    let server = Server::new();
    let id = server.tablet("t-alter");
    server.write(&id, vec![row("a", 1)]);

    let mut v2 = schema();
    v2.version = 2;
    v2.columns.push(ColumnSchema {
        id: ColumnId(3),
        name: "email".into(),
        data_type: DataType::Text,
        nullable: true,
    });
    let alter = |schema: Schema| {
        server
            .service
            .alter_schema(AlterSchemaRequest {
                tablet_id: id.clone(),
                schema,
                propagated_hybrid_time: None,
            })
            .into_result()
    };

    assert!(alter(v2.clone()).unwrap().is_valid());
    let tablet = server.manager.lookup(&id).unwrap().tablet().unwrap();
    assert_eq!(tablet.schema().version, 2);
    assert_eq!(alter(v2.clone()).unwrap(), OpId::INVALID);

    let err = alter(schema()).unwrap_err();
    assert!(matches!(err, GraniteError::InvalidArgument(_)), "{err}");
    let mut conflicting = schema();
    conflicting.version = 2;
    let err = alter(conflicting).unwrap_err();
    assert!(matches!(err, GraniteError::Corruption(_)), "{err}");

    // writes must carry the new version
    let stale = server.service.write(WriteTabletRequest {
        tablet_id: id.clone(),
        write: write_request(1, vec![row("b", 2)]),
        propagated_hybrid_time: None,
        deadline: None,
    });
    assert!(matches!(stale.result, Err(GraniteError::InvalidArgument(_))));
    server.manager.shutdown();
}

#[test]
fn test_truncate_clears_rows() {
    let server = Server::new();
    let id = server.tablet("t-trunc");
    server.fill(&id, 4);
    assert_eq!(strong_read(&server, &id).len(), 4);

    let op_id = server.service.truncate(&id, None).into_result().unwrap();
    assert!(op_id.is_valid());
    assert!(strong_read(&server, &id).is_empty());
    server.write(&id, vec![row("after", 9)]);
    assert_eq!(strong_read(&server, &id).len(), 1);
    server.manager.shutdown();
}

#[test]
fn test_split_creates_children_with_parent_rows() {
    let server = Server::new();
    let id = server.tablet("t-parent");
    server.fill(&id, 10);
    let key = server.service.get_split_key(&id).into_result().unwrap();
    assert_eq!(key, b"k05".to_vec());

    let children = [TabletId::from("t-left"), TabletId::from("t-right")];
    let split = |split_key: Option<Vec<u8>>| {
        server
            .service
            .split_tablet(SplitTabletRequest {
                tablet_id: id.clone(),
                split_key,
                children: children.clone(),
                propagated_hybrid_time: None,
            })
            .into_result()
    };
    assert!(split(None).unwrap().is_valid());

    let parent = server.manager.lookup(&id).unwrap();
    assert_eq!(parent.tablet().unwrap().data_state(), TabletDataState::SplitCompleted);
    assert!(parent.can_be_deleted());
    assert!(split(None).unwrap_err().is_already_present());
    let rejected = server.service.write(WriteTabletRequest {
        tablet_id: id.clone(),
        write: write_request(1, vec![row("k01", 100)]),
        propagated_hybrid_time: None,
        deadline: None,
    });
    assert!(rejected.result.unwrap_err().is_illegal_state());

    for child in &children {
        server.wait_leader(child);
    }
    let left = strong_read(&server, &children[0]);
    let right = strong_read(&server, &children[1]);
    assert_eq!(left.len(), 5);
    assert_eq!(right.len(), 5);
    assert_eq!(left[0].key, b"k00".to_vec());
    assert_eq!(right[0].key, b"k05".to_vec());
    assert_eq!(right[4].get("v"), Some(&Datum::Int64(9)));

    // children own their halves only
    server.write(&children[1], vec![row("k99", 99)]);
    let outside = server.service.write(WriteTabletRequest {
        tablet_id: children[1].clone(),
        write: write_request(1, vec![row("k00", 0)]),
        propagated_hybrid_time: None,
        deadline: None,
    });
    assert!(matches!(outside.result, Err(GraniteError::InvalidArgument(_))));
    assert_eq!(server.manager.list_tablets().len(), 3);
    server.manager.shutdown();
}

#[test]
fn test_split_key_needs_two_rows() {
    let server = Server::new();
    let id = server.tablet("t-small");
    server.write(&id, vec![row("only", 1)]);
    let err = server.service.get_split_key(&id).into_result().unwrap_err();
    assert!(err.is_illegal_state(), "{err}");
    server.manager.shutdown();
}

#[test]
fn test_flush_compact_and_log_gc() {
    let server = Server::new();
    let id = server.tablet("t-maint");
    server.fill(&id, 12);

    let err = server
        .service
        .flush_tablets(flush(Vec::new(), false, FlushOperation::Flush))
        .into_result()
        .unwrap_err();
    assert!(matches!(err, GraniteError::InvalidArgument(_)));
    let err = server
        .service
        .flush_tablets(flush(vec![TabletId::from("missing")], false, FlushOperation::Flush))
        .into_result()
        .unwrap_err();
    assert!(matches!(err, GraniteError::NotFound(_)));

    let flushed = server
        .service
        .flush_tablets(flush(Vec::new(), true, FlushOperation::Flush))
        .into_result()
        .unwrap();
    assert_eq!(flushed, vec![id.clone()]);
    let peer = server.manager.lookup(&id).unwrap();
    assert!(peer.tablet().unwrap().persistent_floor() > 0);

    let log = peer.log().unwrap();
    let segments = log.segment_count();
    server
        .service
        .flush_tablets(flush(vec![id.clone()], false, FlushOperation::LogGc))
        .into_result()
        .unwrap();
    assert!(log.segment_count() < segments);

    server
        .service
        .flush_tablets(flush(vec![id.clone()], false, FlushOperation::Compact))
        .into_result()
        .unwrap();
    assert_eq!(strong_read(&server, &id).len(), 12);
    server.manager.shutdown();
}

#[test]
fn test_safe_time_and_checksum() {
    let server = Server::new();
    let id = server.tablet("t-sum");
    let written = server.write(&id, vec![row("a", 1), row("b", 2)]);

    let safe = server
        .service
        .get_safe_time(&id, written.hybrid_time, None)
        .into_result()
        .unwrap();
    assert!(safe >= written.hybrid_time);

    let before = server.service.checksum(&id, None).into_result().unwrap();
    assert_eq!(before.rows, 2);
    server.write(&id, vec![row("c", 3)]);
    let after = server.service.checksum(&id, None).into_result().unwrap();
    assert_eq!(after.rows, 3);
    assert_ne!(before.checksum, after.checksum);

    // a checksum at an earlier time sees the earlier rows
    let again = server
        .service
        .checksum(&id, Some(before.read_time))
        .into_result()
        .unwrap();
    assert_eq!(again.checksum, before.checksum);
    assert!(again.read_time < HybridTime::MAX);
    server.manager.shutdown();
}
