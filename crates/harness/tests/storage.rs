use concord_core::{EdgeStatus, FieldState, RecordId, RelationshipKey};
use concord_engine::EngineError;
use concord_harness::{TestNetwork, TestPeer, init_tracing, test_config};
use concord_storage::DurableStore;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn transient_failures_are_retried() -> TestResult {
    init_tracing();
    let rt = tokio::runtime::Runtime::new()?;
    let peer = TestPeer::new("alice", rt.handle())?;
    let record = RecordId::new();

    peer.store.fail_next(2);
    let ops = peer.insert(record, "body", 0, "persist me")?;
    assert_eq!(peer.store.rejected_writes(), 2);

    let logged = peer.store.ops_for_record(record)?;
    assert_eq!(logged, ops);
    let stored = peer.store.load_record(record)?.ok_or("record not saved")?;
    assert_eq!(stored.text("body").as_deref(), Some("persist me"));
    Ok(())
}

#[test]
fn exhausted_writes_are_queued_then_replayed() -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    let peer = TestPeer::new("alice", rt.handle())?;
    let record = RecordId::new();

    peer.store.set_offline(true);
    let err = peer.insert(record, "body", 0, "offline edit").unwrap_err();
    match &err {
        EngineError::StorageExhausted {
            attempts,
            replay_id,
            source,
        } => {
            assert_eq!(*attempts, test_config().retry.max_attempts);
            assert!(replay_id.is_some());
            assert!(source.is_transient());
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let queue = peer.store.replay_queue()?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].record_id, Some(record));
    assert!(peer.store.load_record(record)?.is_none());

    peer.store.set_offline(false);
    assert_eq!(peer.engine.replay_queued()?, 1);
    assert!(peer.store.replay_queue()?.is_empty());
    assert_eq!(peer.store.ops_for_record(record)?, vec![queue[0].operation.clone()]);
    let stored = peer.store.load_record(record)?.ok_or("record not saved")?;
    assert_eq!(stored.text("body").as_deref(), Some("offline edit"));
    Ok(())
}

#[test]
fn relationship_writes_are_queued_too() -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    let peer = TestPeer::new("alice", rt.handle())?;
    let (a, b) = (RecordId::new(), RecordId::new());

    peer.store.set_offline(true);
    assert!(matches!(
        peer.link("related", a, b, 0.5),
        Err(EngineError::StorageExhausted { replay_id: Some(_), .. })
    ));
    assert!(peer.store.load_relationships()?.is_empty());
    let queued = peer.engine.drain_outbox();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].record_id, a);
    assert_eq!(queued[0].operation, peer.store.replay_queue()?[0].operation);

    peer.store.set_offline(false);
    assert_eq!(peer.engine.replay_queued()?, 1);
    let stored = peer.store.load_relationships()?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key, RelationshipKey::new(a, b, "related"));
    assert_eq!(peer.store.relationship_ops()?.len(), 1);
    Ok(())
}

#[test]
fn unpersisted_local_edits_still_reach_peers() -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 53);
    let alice = net.add_peer("alice")?;
    let bob = net.add_peer("bob")?;
    let record = RecordId::new();

    net.peer(alice).store.set_offline(true);
    assert!(matches!(
        net.peer(alice).insert(record, "body", 0, "offline edit"),
        Err(EngineError::StorageExhausted { .. })
    ));
    assert!(matches!(
        net.peer(alice).engine.set_add(record, "tags", "draft"),
        Err(EngineError::StorageExhausted { .. })
    ));
    assert_eq!(net.peer(alice).text(record, "body")?, "offline edit");

    // The merged operations leave through the outbox even though the
    // caller only saw the storage error.
    net.deliver_all()?;
    assert_eq!(net.peer(bob).text(record, "body")?, "offline edit");
    let snapshot = net.peer(bob).engine.get_state(record)?.ok_or("record missing")?;
    assert!(matches!(
        snapshot.record.field("tags"),
        Some(FieldState::Set(set)) if set.contains("draft")
    ));
    assert!(net.peer(alice).engine.drain_outbox().is_empty());
    Ok(())
}

#[test]
fn restart_restores_records_and_edges() -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("alice.db");
    let (note, topic) = (RecordId::new(), RecordId::new());
    let key = RelationshipKey::new(note, topic, "about");

    {
        let peer = TestPeer::open("alice", test_config(), &path, rt.handle())?;
        peer.insert(note, "body", 0, "before restart")?;
        peer.engine.set_add(note, "tags", "kept")?;
        peer.link("about", note, topic, 0.6)?;
        peer.unlink("about", note, topic)?;
        peer.link("about", note, topic, 0.3)?;
    }

    let peer = TestPeer::open("alice", test_config(), &path, rt.handle())?;
    assert_eq!(peer.text(note, "body")?, "before restart");
    let snapshot = peer.engine.get_state(note)?.ok_or("record missing")?;
    assert!(matches!(snapshot.record.field("tags"), Some(FieldState::Set(tags)) if tags.contains("kept")));

    let edge = peer.engine.relationship(&key).ok_or("edge missing")?;
    assert_eq!(edge.status, EdgeStatus::Active);
    assert!((edge.weight - 0.3).abs() < 1e-9);
    assert_eq!(edge.operation_history.len(), 3);

    // Editing continues on top of the restored state.
    peer.insert(note, "body", 14, ", and after")?;
    assert_eq!(peer.text(note, "body")?, "before restart, and after");
    peer.unlink("about", note, topic)?;
    assert_eq!(
        peer.engine.relationship(&key).ok_or("edge missing")?.status,
        EdgeStatus::Deleted
    );
    Ok(())
}

#[test]
fn unknown_record_has_no_state() -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    let peer = TestPeer::new("alice", rt.handle())?;
    assert!(peer.engine.get_state(RecordId::new())?.is_none());
    Ok(())
}
