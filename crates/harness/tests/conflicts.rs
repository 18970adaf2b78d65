use concord_core::{ConflictStatus, Decision, EdgeStatus, RecordId, RelationshipKey, ResolutionStrategy};
use concord_engine::config::RelationshipTypeConfig;
use concord_engine::{ConflictError, EngineConfig, EngineError};
use concord_harness::{TestNetwork, init_tracing, test_config};
use concord_storage::DurableStore;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Alice re-creates an edge while Bob deletes it. Returns the edge key.
fn create_delete_race(net: &mut TestNetwork) -> Result<RelationshipKey, Box<dyn std::error::Error>> {
    let (alice, bob) = (0, 1);
    let (a, b) = (RecordId::new(), RecordId::new());
    let create = net.peer(alice).link("related", a, b, 0.5)?;
    net.broadcast(alice, a, [create]);
    net.deliver_all()?;

    let delete = net.peer(bob).unlink("related", a, b)?;
    let recreate = net.peer(alice).link("related", a, b, 0.9)?;
    net.broadcast(bob, a, [delete]);
    net.broadcast(alice, a, [recreate]);
    net.deliver_all()?;
    Ok(RelationshipKey::new(a, b, "related"))
}

fn network(config: EngineConfig, seed: u64) -> Result<(tokio::runtime::Runtime, TestNetwork), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let mut net = TestNetwork::new(rt.handle().clone(), seed);
    net.add_peer_with_config("alice", config.clone())?;
    net.add_peer_with_config("bob", config)?;
    Ok((rt, net))
}

#[test]
fn create_delete_race_escalates_until_decided() -> TestResult {
    init_tracing();
    let (_rt, mut net) = network(test_config(), 29)?;
    let key = create_delete_race(&mut net)?;

    for peer in net.peers() {
        assert_eq!(
            peer.engine.relationship(&key).ok_or("edge missing")?.status,
            EdgeStatus::Tentative
        );
        let open = peer.engine.open_conflicts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, ConflictStatus::Escalated);
        assert!(open[0].candidate_resolutions.contains(&ResolutionStrategy::Overwrite));
    }

    let alice_conflict = net.peer(0).engine.open_conflicts()[0].conflict_id;
    let bob_conflict = net.peer(1).engine.open_conflicts()[0].conflict_id;
    let outcome = net.peer(0).engine.resolve_conflict(
        alice_conflict,
        ResolutionStrategy::Manual(Decision::KeepRelationship),
    )?;
    assert_eq!(outcome.decision, Decision::KeepRelationship);
    assert_eq!(
        net.peer(0).engine.relationship(&key).ok_or("edge missing")?.status,
        EdgeStatus::Active
    );

    // The resolution travels to bob and settles his copy of the conflict.
    net.deliver_all()?;
    assert_eq!(
        net.peer(1).engine.relationship(&key).ok_or("edge missing")?.status,
        EdgeStatus::Active
    );
    let settled = net.peer(1).engine.conflict(bob_conflict).ok_or("conflict missing")?;
    assert_eq!(settled.status, ConflictStatus::Resolved);
    assert!(net.peer(1).engine.audit_entries(bob_conflict).is_empty());

    let entries = net.peer(0).engine.audit_entries(alice_conflict);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::KeepRelationship);
    assert_eq!(entries[0].state_hash, outcome.state_hash);
    net.peer(0).engine.verify_audit_trail()?;

    let again = net
        .peer(0)
        .engine
        .resolve_conflict(alice_conflict, ResolutionStrategy::Overwrite)
        .unwrap_err();
    assert!(matches!(
        again,
        EngineError::Conflict(ConflictError::AlreadyResolved(id)) if id == alice_conflict
    ));
    Ok(())
}

#[test]
fn vector_decision_is_not_applicable_to_edges() -> TestResult {
    let (_rt, mut net) = network(test_config(), 31)?;
    create_delete_race(&mut net)?;
    let conflict = net.peer(0).engine.open_conflicts()[0].conflict_id;
    let err = net
        .peer(0)
        .engine
        .resolve_conflict(conflict, ResolutionStrategy::Manual(Decision::TakeIncomingVector))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict(ConflictError::StrategyNotApplicable { .. })
    ));
    assert_eq!(net.peer(0).engine.open_conflicts().len(), 1);
    Ok(())
}

#[test]
fn auto_resolution_converges_and_is_audited() -> TestResult {
    let mut config = test_config();
    config.conflicts.auto_resolve_destructive = true;
    let (_rt, mut net) = network(config, 37)?;
    let key = create_delete_race(&mut net)?;
    net.deliver_all()?;

    let statuses: Vec<EdgeStatus> = net
        .peers()
        .iter()
        .map(|peer| peer.engine.relationship(&key).map(|r| r.status))
        .collect::<Option<_>>()
        .ok_or("edge missing")?;
    assert_eq!(statuses[0], statuses[1]);
    assert_ne!(statuses[0], EdgeStatus::Tentative);

    for peer in net.peers() {
        assert!(peer.engine.open_conflicts().is_empty());
        let trail = peer.store.audit_trail()?;
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].strategy, ResolutionStrategy::Overwrite);
        peer.engine.verify_audit_trail()?;
    }
    Ok(())
}

fn acyclic(mut config: EngineConfig) -> EngineConfig {
    config.relationship_types.push(RelationshipTypeConfig {
        name: "depends_on".into(),
        acyclic: true,
        ..RelationshipTypeConfig::default()
    });
    config
}

/// Alice links x -> y while Bob links y -> x. Returns both keys.
fn cycle_race(net: &mut TestNetwork) -> Result<(RelationshipKey, RelationshipKey), Box<dyn std::error::Error>> {
    let (x, y) = (RecordId::new(), RecordId::new());
    let forward = net.peer(0).link("depends_on", x, y, 1.0)?;
    let backward = net.peer(1).link("depends_on", y, x, 1.0)?;
    net.broadcast(0, x, [forward]);
    net.broadcast(1, y, [backward]);
    net.deliver_all()?;
    Ok((
        RelationshipKey::new(x, y, "depends_on"),
        RelationshipKey::new(y, x, "depends_on"),
    ))
}

#[test]
fn remote_cycle_is_held_until_decided() -> TestResult {
    init_tracing();
    let (_rt, mut net) = network(acyclic(test_config()), 43)?;
    let (forward, backward) = cycle_race(&mut net)?;

    for (peer, held) in net.peers().iter().zip([&backward, &forward]) {
        assert_eq!(peer.engine.relationship(held).ok_or("edge missing")?.status, EdgeStatus::Tentative);
        assert!(!peer.engine.has_path(held.source_id, held.target_id, "depends_on"));
        let open = peer.engine.open_conflicts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, ConflictStatus::Escalated);
        assert!(open[0].candidate_resolutions.contains(&ResolutionStrategy::Manual(Decision::RemoveRivalRelationship)));
    }

    let bob_conflict = net.peer(1).engine.open_conflicts()[0].conflict_id;
    let alice_conflict = net.peer(0).engine.open_conflicts()[0].conflict_id;
    net.peer(0)
        .engine
        .resolve_conflict(alice_conflict, ResolutionStrategy::Manual(Decision::RemoveRelationship))?;
    net.deliver_all()?;

    for peer in net.peers() {
        assert_eq!(peer.engine.relationship(&forward).ok_or("edge missing")?.status, EdgeStatus::Active);
        assert_eq!(peer.engine.relationship(&backward).ok_or("edge missing")?.status, EdgeStatus::Deleted);
        assert!(peer.engine.open_conflicts().is_empty());
    }
    assert_eq!(net.peer(0).engine.relationships(), net.peer(1).engine.relationships());
    let settled = net.peer(1).engine.conflict(bob_conflict).ok_or("conflict missing")?;
    assert_eq!(settled.status, ConflictStatus::Resolved);
    Ok(())
}

#[test]
fn automatic_cycle_resolution_keeps_the_older_edge() -> TestResult {
    let mut config = acyclic(test_config());
    config.conflicts.auto_resolve_destructive = true;
    let (_rt, mut net) = network(config, 47)?;
    let (forward, backward) = cycle_race(&mut net)?;
    net.deliver_all()?;

    let live: Vec<Vec<RelationshipKey>> = net
        .peers()
        .iter()
        .map(|peer| {
            peer.engine
                .relationships()
                .into_iter()
                .filter(|r| r.status == EdgeStatus::Active)
                .map(|r| r.key)
                .collect()
        })
        .collect();
    assert_eq!(live[0], live[1]);
    assert_eq!(live[0].len(), 1);
    assert!(live[0][0] == forward || live[0][0] == backward);
    for peer in net.peers() {
        assert!(peer.engine.open_conflicts().is_empty());
        assert_eq!(peer.store.audit_trail()?.len(), 1);
        peer.engine.verify_audit_trail()?;
    }
    Ok(())
}

#[test]
fn resolving_unknown_conflict_fails() -> TestResult {
    let (_rt, net) = network(test_config(), 41)?;
    let unknown = concord_core::ConflictId::new();
    let err = net
        .peer(0)
        .engine
        .resolve_conflict(unknown, ResolutionStrategy::Merge)
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictError::NotFound(_))));
    Ok(())
}
