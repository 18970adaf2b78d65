use concord_core::wire::{FieldOperation, FieldOperationType};
use concord_core::{FieldState, FieldValue, OpId, Operation, RecordId, TextSpan};
use concord_engine::{EngineError, MergeResult};
use concord_harness::{TestNetwork, TestPeer, init_tracing};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
}

#[test]
fn concurrent_inserts_at_same_position_order_by_actor() -> TestResult {
    init_tracing();
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 7);
    let alice = net.add_peer("alice")?;
    let bob = net.add_peer("bob")?;
    let record = RecordId::new();

    let from_bob = net.peer(bob).insert(record, "body", 0, "B")?;
    let from_alice = net.peer(alice).insert(record, "body", 0, "A")?;
    net.broadcast(bob, record, from_bob);
    net.broadcast(alice, record, from_alice);
    net.deliver_all()?;

    assert_eq!(net.peer(alice).text(record, "body")?, "AB");
    assert_eq!(net.peer(bob).text(record, "body")?, "AB");
    Ok(())
}

#[test]
fn redelivery_changes_nothing() -> TestResult {
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 11);
    let alice = net.add_peer("alice")?;
    let bob = net.add_peer("bob")?;
    let record = RecordId::new();

    let mut ops = net.peer(alice).insert(record, "body", 0, "hello world")?;
    ops.extend(net.peer(alice).delete(record, "body", 5, " world")?);
    ops.push(net.peer(alice).engine.set_add(record, "tags", "draft")?);
    net.broadcast(alice, record, ops.clone());
    net.deliver_all()?;

    let before = net
        .peer(bob)
        .engine
        .get_state(record)?
        .ok_or("bob never saw the record")?;
    net.redeliver(record, &ops)?;
    let after = net
        .peer(bob)
        .engine
        .get_state(record)?
        .ok_or("bob lost the record")?;

    assert_eq!(after.text("body").as_deref(), Some("hello"));
    assert_eq!(before.record.content_hash(), after.record.content_hash());
    assert_eq!(before.record.version_vector, after.record.version_vector);
    assert_eq!(
        net.peer(bob).engine.apply_operation(record, ops[0].clone())?,
        MergeResult::Duplicate
    );
    Ok(())
}

#[test]
fn out_of_order_delivery_waits_for_dependencies() -> TestResult {
    let rt = runtime()?;
    let alice = TestPeer::new("alice", rt.handle())?;
    let carol = TestPeer::new("carol", rt.handle())?;
    let record = RecordId::new();

    let first = alice.insert(record, "body", 0, "abc")?;
    let second = alice.insert(record, "body", 3, "def")?;

    for op in second {
        let result = carol.engine.apply_operation(record, op)?;
        assert!(matches!(result, MergeResult::Buffered { .. }));
    }
    let waiting = carol.engine.get_state(record)?.ok_or("record missing")?;
    assert_eq!(waiting.pending_operations, 1);
    assert_eq!(waiting.text("body"), None);

    for op in first {
        let result = carol.engine.apply_operation(record, op)?;
        assert!(matches!(result, MergeResult::Applied { ref drained, .. } if drained.len() == 1));
    }
    let caught_up = carol.engine.get_state(record)?.ok_or("record missing")?;
    assert_eq!(caught_up.pending_operations, 0);
    assert_eq!(caught_up.text("body").as_deref(), Some("abcdef"));
    Ok(())
}

#[test]
fn concurrent_add_survives_remove() -> TestResult {
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 3);
    let alice = net.add_peer("alice")?;
    let bob = net.add_peer("bob")?;
    let record = RecordId::new();

    let add = net.peer(alice).engine.set_add(record, "tags", "urgent")?;
    net.broadcast(alice, record, [add]);
    net.deliver_all()?;

    let remove = net.peer(bob).engine.set_remove(record, "tags", "urgent")?;
    let re_add = net.peer(alice).engine.set_add(record, "tags", "urgent")?;
    net.broadcast(bob, record, [remove]);
    net.broadcast(alice, record, [re_add]);
    net.deliver_all()?;

    for peer in net.peers() {
        let snapshot = peer.engine.get_state(record)?.ok_or("record missing")?;
        match snapshot.record.field("tags") {
            Some(FieldState::Set(tags)) => assert!(tags.contains("urgent")),
            other => panic!("unexpected tags field {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn map_writes_pick_the_same_winner() -> TestResult {
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 5);
    let alice = net.add_peer("alice")?;
    let bob = net.add_peer("bob")?;
    let record = RecordId::new();

    let a = net
        .peer(alice)
        .engine
        .map_put(record, "meta", "status", FieldValue::Text("open".into()))?;
    let b = net
        .peer(bob)
        .engine
        .map_put(record, "meta", "status", FieldValue::Text("closed".into()))?;
    net.broadcast(alice, record, [a]);
    net.broadcast(bob, record, [b]);
    net.deliver_all()?;

    let values: Vec<Option<FieldValue>> = net
        .peers()
        .iter()
        .map(|peer| {
            let snapshot = peer.engine.get_state(record).ok().flatten()?;
            match snapshot.record.field("meta") {
                Some(FieldState::Map(map)) => map.get("status").cloned(),
                _ => None,
            }
        })
        .collect();
    // Equal lamports; the higher actor id wins the register.
    assert_eq!(values, vec![Some(FieldValue::Text("closed".into())); 2]);
    Ok(())
}

#[test]
fn delta_since_catches_up_a_lagging_replica() -> TestResult {
    let rt = runtime()?;
    let alice = TestPeer::new("alice", rt.handle())?;
    let bob = TestPeer::new("bob", rt.handle())?;
    let record = RecordId::new();

    for op in alice.insert(record, "body", 0, "shared ")? {
        bob.engine.apply_operation(record, op)?;
    }
    let seen = bob
        .engine
        .get_state(record)?
        .ok_or("record missing")?
        .record
        .version_vector;
    alice.insert(record, "body", 7, "notes")?;
    alice.engine.set_add(record, "tags", "meeting")?;

    let patch = alice
        .engine
        .delta_since(record, &seen)?
        .ok_or("alice has no record")?;
    assert_eq!(patch.operations.len(), 2);
    for op in patch.operations {
        bob.engine.apply_operation(record, op)?;
    }
    assert_eq!(bob.text(record, "body")?, "shared notes");
    let bob_vv = bob.engine.get_state(record)?.ok_or("record missing")?.record.version_vector;
    assert_eq!(bob_vv, patch.version_vector);
    assert!(alice.engine.delta_since(RecordId::new(), &seen)?.is_none());
    Ok(())
}

#[derive(Debug, Clone)]
enum Edit {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
    Format { at: usize, len: usize, bold: bool },
    Replace { at: usize, len: usize, text: String },
    Tag(String),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0usize..64, "[a-z ]{1,4}").prop_map(|(at, text)| Edit::Insert { at, text }),
        2 => (0usize..64, 1usize..4).prop_map(|(at, len)| Edit::Delete { at, len }),
        2 => (0usize..64, 1usize..6, any::<bool>()).prop_map(|(at, len, bold)| Edit::Format { at, len, bold }),
        2 => (0usize..64, 1usize..4, "[A-Z]{1,3}").prop_map(|(at, len, text)| Edit::Replace { at, len, text }),
        1 => "[a-c]".prop_map(Edit::Tag),
    ]
}

fn text_edit(peer: &TestPeer, record: RecordId, kind: FieldOperationType, data: serde_json::Value) -> Result<Vec<Operation>, EngineError> {
    let op = FieldOperation {
        operation_id: OpId::new(),
        field_path: "body".into(),
        operation_type: kind,
        operation_data: data,
        validation_rules: Vec::new(),
    };
    peer.engine.edit_field(record, &op, None)
}

/// Make `edit` against the peer's current body. Edits that turn out to be
/// no-ops on this text produce nothing.
fn perform(peer: &TestPeer, record: RecordId, edit: &Edit) -> Result<Vec<Operation>, Box<dyn std::error::Error>> {
    let len = peer.text(record, "body")?.chars().count();
    let span = |at: usize, count: usize| {
        let at = at % len;
        (at, count.min(len - at))
    };
    let result = match edit {
        Edit::Insert { at, text } => peer.insert(record, "body", at % (len + 1), text),
        Edit::Tag(tag) => peer.engine.set_add(record, "tags", tag).map(|op| vec![op]),
        _ if len == 0 => return Ok(Vec::new()),
        Edit::Delete { at, len: count } => {
            let (at, count) = span(*at, *count);
            peer.delete(record, "body", at, &"x".repeat(count))
        }
        Edit::Format { at, len: count, bold } => {
            let (at, count) = span(*at, *count);
            let value = if *bold { serde_json::json!("true") } else { serde_json::Value::Null };
            text_edit(
                peer,
                record,
                FieldOperationType::Format,
                serde_json::json!({ "position": at, "length": count, "attributes": { "bold": value } }),
            )
        }
        Edit::Replace { at, len: count, text } => {
            let (at, count) = span(*at, *count);
            text_edit(
                peer,
                record,
                FieldOperationType::Replace,
                serde_json::json!({ "position": at, "length": count, "text": text }),
            )
        }
    };
    match result {
        Err(EngineError::Validation(_)) => Ok(Vec::new()),
        other => Ok(other?),
    }
}

fn spans(peer: &TestPeer, record: RecordId) -> Result<Vec<TextSpan>, Box<dyn std::error::Error>> {
    let snapshot = peer.engine.get_state(record)?.ok_or("record missing")?;
    Ok(match snapshot.record.field("body") {
        Some(FieldState::Text(text)) => text.spans(),
        _ => Vec::new(),
    })
}

/// Every peer edits the shared seed text independently, then all
/// operations are exchanged in a seeded random order.
fn converges(edits: &[(usize, Edit)], seed: u64) -> Result<bool, Box<dyn std::error::Error>> {
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), seed);
    for name in ["alice", "bob", "carol"] {
        net.add_peer(name)?;
    }
    let record = RecordId::new();
    let seed_ops = net.peer(0).insert(record, "body", 0, "the quick fox")?;
    net.broadcast(0, record, seed_ops);
    net.deliver_all()?;

    let mut all = Vec::new();
    for (index, edit) in edits {
        let ops = perform(net.peer(*index), record, edit)?;
        all.push((*index, ops));
    }
    for (from, ops) in all {
        net.broadcast(from, record, ops);
    }
    net.deliver_all()?;

    let mut hashes = Vec::new();
    let mut styled = Vec::new();
    for peer in net.peers() {
        let snapshot = peer.engine.get_state(record)?.ok_or("record missing")?;
        hashes.push(snapshot.record.content_hash());
        styled.push(spans(peer, record)?);
    }
    Ok(net.texts_agree(record, "body")?
        && hashes.windows(2).all(|w| w[0] == w[1])
        && styled.windows(2).all(|w| w[0] == w[1]))
}

/// Three peers each make one edit against the same text. A fresh replica
/// receives the three edits in every possible order; all of them must end
/// up with the text and formatting the editing peers agree on.
fn converges_in_every_order(edits: &[Edit; 3]) -> Result<bool, Box<dyn std::error::Error>> {
    let rt = runtime()?;
    let mut net = TestNetwork::new(rt.handle().clone(), 1);
    for name in ["alice", "bob", "carol"] {
        net.add_peer(name)?;
    }
    let record = RecordId::new();
    let seed_ops = net.peer(0).insert(record, "body", 0, "the quick fox")?;
    net.broadcast(0, record, seed_ops.clone());
    net.deliver_all()?;

    let mut batches = Vec::new();
    for (index, edit) in edits.iter().enumerate() {
        batches.push(perform(net.peer(index), record, edit)?);
    }
    for (from, ops) in batches.iter().enumerate() {
        net.broadcast(from, record, ops.clone());
    }
    net.deliver_all()?;
    if !net.texts_agree(record, "body")? {
        return Ok(false);
    }
    let expected = (net.peer(0).text(record, "body")?, spans(net.peer(0), record)?);

    for order in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
        let observer = TestPeer::new("observer", rt.handle())?;
        for op in &seed_ops {
            observer.engine.apply_operation(record, op.clone())?;
        }
        for batch in order {
            for op in &batches[batch] {
                observer.engine.apply_operation(record, op.clone())?;
            }
        }
        if (observer.text(record, "body")?, spans(&observer, record)?) != expected {
            return Ok(false);
        }
    }
    Ok(true)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn replicas_converge_under_any_delivery_order(
        edits in proptest::collection::vec((0usize..3, edit()), 1..12),
        seed in any::<u64>(),
    ) {
        let agreed = converges(&edits, seed).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(agreed);
    }

    #[test]
    fn three_concurrent_edits_agree_in_every_order(a in edit(), b in edit(), c in edit()) {
        let agreed = converges_in_every_order(&[a, b, c]).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(agreed);
    }
}
