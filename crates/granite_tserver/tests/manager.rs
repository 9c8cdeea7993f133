mod common;

use std::time::Duration;

use granite_common::error::GraniteError;
use granite_common::types::{TableId, TabletId};
use granite_tablet::{Partition, TabletPeerState};
use granite_tserver::CreateTabletRequest;

use common::{row, wait_until, Server, TABLE};

fn create(server: &Server, id: &str, table: &str) -> Result<(), GraniteError> {
    server
        .manager
        .create_tablet(CreateTabletRequest {
            tablet_id: TabletId::from(id),
            table_id: TableId::from(table),
            partition: Partition::default(),
        })
        .map(|_| ())
}

#[test]
fn test_create_tablet_errors() {
    let server = Server::new();
    let err = create(&server, "t-x", "no-such-table").unwrap_err();
    assert!(matches!(err, GraniteError::NotFound(_)), "{err}");
    assert!(server.manager.peers().is_empty());

    server.tablet("t-dup");
    let err = create(&server, "t-dup", TABLE).unwrap_err();
    assert!(err.is_already_present(), "{err}");

    server.manager.shutdown();
    let err = create(&server, "t-late", TABLE).unwrap_err();
    assert!(matches!(err, GraniteError::ShutdownInProgress(_)), "{err}");
}

#[test]
fn test_lookup_and_leader_lookup() {
    let server = Server::new();
    let id = server.tablet("t-lookup");
    let missing = TabletId::from("missing");
    assert!(matches!(server.manager.lookup(&missing), Err(GraniteError::NotFound(_))));
    assert!(matches!(server.manager.lookup_leader(&missing), Err(GraniteError::NotFound(_))));

    let leader = server.manager.lookup_leader(&id).unwrap();
    assert!(leader.leader_term > 0);
    assert!(leader.peer.is_leader_and_ready());

    // a stopped peer is not served
    server.manager.lookup(&id).unwrap().shutdown();
    assert!(server.manager.lookup_leader(&id).is_err());
    server.manager.shutdown();
}

#[test]
fn test_heartbeat_keeps_tablets_dirty_until_acknowledged() {
    let server = Server::new();
    let id = server.tablet("t-hb");

    let full = server.manager.heartbeat().unwrap();
    assert!(!full.incremental);
    assert_eq!(full.tablets.len(), 1);
    assert_eq!(full.tablets[0].tablet_id, id);

    // drain marks left over from startup
    wait_until(Duration::from_secs(5), || {
        server.manager.heartbeat().unwrap();
        server.manager.dirty_tablets().is_empty()
    });
    let quiet = server.manager.heartbeat().unwrap();
    assert!(quiet.incremental);
    assert!(quiet.tablets.is_empty());

    server
        .catalog
        .set_report_failure(Some(GraniteError::ServiceUnavailable("catalog down".into())));
    server.manager.dirty_tablets().mark(&id, "flushed");
    assert!(server.manager.heartbeat().is_err());
    assert_eq!(server.manager.dirty_tablets().len(), 1);

    server.catalog.set_report_failure(None);
    let delta = server.manager.heartbeat().unwrap();
    assert!(delta.incremental);
    assert_eq!(delta.tablets.len(), 1);
    assert!(delta.sequence > quiet.sequence);

    let last = server.catalog.last_report("ts-test").unwrap();
    assert_eq!(last.tablets.len(), 1);
    assert_eq!(last.tablets[0].state, "RUNNING");
    assert!(last.tablets[0].leader);
    assert!(last.tablets[0].last_op_id.is_valid());

    server.manager.request_full_report();
    assert!(!server.manager.heartbeat().unwrap().incremental);
    server.manager.shutdown();
}

#[test]
fn test_delete_tablet() {
    let server = Server::new();
    let id = server.tablet("t-del");
    server.write(&id, vec![row("a", 1)]);
    let peer = server.manager.lookup(&id).unwrap();
    server.manager.delete_tablet(&id).unwrap();
    assert_eq!(peer.state(), TabletPeerState::Shutdown);
    assert!(matches!(server.manager.lookup(&id), Err(GraniteError::NotFound(_))));
    assert!(matches!(server.manager.delete_tablet(&id), Err(GraniteError::NotFound(_))));
    server.manager.shutdown();
}

#[test]
fn test_shutdown_stops_every_tablet() {
    let server = Server::new();
    let ids: Vec<_> = (0..3).map(|i| server.tablet(&format!("t-{i}"))).collect();
    for id in &ids {
        server.write(id, vec![row("a", 1)]);
    }
    let peers = server.manager.peers();
    assert_eq!(peers.len(), 3);

    server.manager.shutdown();
    for peer in &peers {
        assert_eq!(peer.state(), TabletPeerState::Shutdown);
    }
    assert!(server.manager.list_tablets().is_empty());
    // a second shutdown is a no-op
    server.manager.shutdown();
}
