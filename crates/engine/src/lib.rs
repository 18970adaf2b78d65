//! Replica engine: field CRDTs, text OT, relationship graph, vector
//! consistency and conflict arbitration behind one facade.
//!
//! Every record has its own lock, so records merge in parallel. Storage I/O
//! happens after the merge step, under a second per-record lock taken before
//! the merge lock is released; writes therefore land in merge order.

pub mod causal;
pub mod config;
pub mod conflict;
pub mod crdt_core;
pub mod error;
pub mod feed;
pub mod ot;
pub mod relationship;
pub mod retry;
pub mod vector;

pub use config::EngineConfig;
pub use conflict::{ConflictError, ConflictResolutionCoordinator, ResolutionSink};
pub use crdt_core::{ApplyReport, FieldCrdtCore, FieldReplica, MergeResult, Patch};
pub use error::{EngineError, ValidationError};
pub use feed::{Change, ChangeEvent, ChangeFeed, ChangeSubscription, FeedError};
pub use ot::FieldOperationEngine;
pub use relationship::{ConstraintViolation, GraphConsistency, RelationshipOtEngine};
pub use vector::{
    EmbeddingProvider, JobOutcome, ProviderError, RegenerationHandle, SyncOutcome,
    VectorConsistencyManager, VectorError, VectorResolution, VectorView,
};

use std::sync::Arc;
use std::time::Instant;

use concord_core::wire::{
    FieldOperation, RelationshipOperation, RelationshipOperationKind, StringOperation,
    ValidationRuleSpec, VectorConsistencyState,
};
use concord_core::{
    ActorId, AuditEntry, CharId, Conflict, ConflictId, ConflictKind, ConflictRecord,
    ConflictStatus, CoreError, Decision, FieldKind, FieldMutation, FieldState, FieldValue, Hlc,
    HlcClock, OpId, Operation, OperationPayload, Outcome, Record, RecordId, Relationship,
    RelationshipKey, RelationshipMutation, ResolutionStrategy, SigningIdentity, StakeholderVector,
    TextCrdt, VectorMutation, VersionVector,
};
use concord_storage::{DurableStore, EphemeralStore, StorageError};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::ot::{LoweredEdit, delta};
use crate::relationship::RelationshipReport;
use crate::retry::{RetryExhausted, RetryPolicy};

/// Weight of a created edge when the request carries none.
pub const DEFAULT_EDGE_WEIGHT: f64 = 1.0;

/// Point-in-time copy of one record and everything attached to it.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub record: Record,
    /// Edges with this record at either end.
    pub relationships: Vec<Relationship>,
    pub vector: VectorView,
    /// Operations waiting on causal dependencies.
    pub pending_operations: usize,
}

impl RecordSnapshot {
    pub fn text(&self, field: &str) -> Option<String> {
        self.record.text(field)
    }
}

/// An operation this replica generated on its own, addressed by the record
/// it travels with.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub record_id: RecordId,
    pub operation: Operation,
}

struct RecordSlot {
    replica: Mutex<FieldReplica>,
    /// Held while writing a merge result out; see the module docs.
    persist: Mutex<()>,
}

pub struct Engine {
    replica_id: ActorId,
    config: EngineConfig,
    durable: Arc<dyn DurableStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    retry: RetryPolicy,
    crdt: FieldCrdtCore,
    ot: FieldOperationEngine,
    records: DashMap<RecordId, Arc<RecordSlot>>,
    relationships: Mutex<RelationshipOtEngine>,
    relationship_persist: Mutex<()>,
    vectors: VectorConsistencyManager,
    conflicts: ConflictResolutionCoordinator,
    feed: Arc<ChangeFeed>,
    clock: Arc<Mutex<HlcClock>>,
    /// Operations generated internally (conflict resolutions, local edits
    /// whose persistence failed after merging) that peers still need to
    /// receive.
    outbox: Mutex<Vec<Outgoing>>,
}

impl Engine {
    /// Build a replica and replay persisted relationship history. Records
    /// are loaded lazily on first access.
    pub fn new(
        config: EngineConfig,
        replica_id: ActorId,
        durable: Arc<dyn DurableStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        provider: Arc<dyn EmbeddingProvider>,
        runtime: &Handle,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let clock = Arc::new(Mutex::new(HlcClock::new()));
        let feed = Arc::new(ChangeFeed::new(&config.feed));
        let retry = RetryPolicy::from(&config.retry);

        let hook_feed = Arc::clone(&feed);
        let vectors = VectorConsistencyManager::new(
            &config.vector,
            &config.retry,
            Arc::clone(&durable),
            provider,
            Arc::clone(&clock),
            runtime,
            Some(Arc::new(move |record_id, state| {
                hook_feed.publish(
                    Some(record_id),
                    Change::VectorUpdated {
                        summary: vector::summary(state),
                    },
                );
            })),
        )?;
        let conflicts = ConflictResolutionCoordinator::new(
            &config.conflicts,
            SigningIdentity::generate(),
            Arc::clone(&durable),
            retry.clone(),
            Arc::clone(&clock),
        )?;

        let engine = Self {
            crdt: FieldCrdtCore::new(&config),
            ot: FieldOperationEngine::new(&config),
            relationships: Mutex::new(RelationshipOtEngine::new(&config)),
            relationship_persist: Mutex::new(()),
            records: DashMap::new(),
            outbox: Mutex::new(Vec::new()),
            replica_id,
            config,
            durable,
            ephemeral,
            retry,
            vectors,
            conflicts,
            feed,
            clock,
        };
        engine.restore_relationships()?;
        info!(replica = %engine.replica_id, "engine ready");
        Ok(engine)
    }

    pub fn replica_id(&self) -> &ActorId {
        &self.replica_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn restore_relationships(&self) -> Result<(), EngineError> {
        let ops = self
            .retry
            .run("relationship_ops", || self.durable.relationship_ops())
            .map_err(unavailable)?;
        if ops.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut rel = self.relationships.lock();
        let mut detected = Vec::new();
        for op in ops {
            let report = rel.apply_relationship_op(op, now)?;
            detected.extend(self.register_conflicts(&mut rel, &report)?);
        }
        drop(rel);
        debug!(conflicts = detected.len(), "relationship history replayed");
        for conflict_id in detected {
            self.settle_conflict(conflict_id);
        }
        Ok(())
    }

    fn slot(&self, record_id: RecordId, create: bool) -> Result<Option<Arc<RecordSlot>>, EngineError> {
        if let Some(slot) = self.records.get(&record_id) {
            return Ok(Some(Arc::clone(slot.value())));
        }
        let stored = self
            .retry
            .run("load_record", || self.durable.load_record(record_id))
            .map_err(unavailable)?;
        let pending = self
            .retry
            .run("causal_buffer", || self.ephemeral.causal_buffer(record_id))
            .map_err(unavailable)?;
        let replica = match stored {
            Some(record) => {
                let log = self
                    .retry
                    .run("ops_for_record", || self.durable.ops_for_record(record_id))
                    .map_err(unavailable)?;
                debug!(?record_id, ops = log.len(), pending = pending.len(), "record restored");
                self.crdt.restore_replica(record, log, pending, Instant::now())
            }
            None if create || !pending.is_empty() => {
                let created_at = self.clock.lock().tick()?;
                let record = Record::new(record_id, created_at);
                self.crdt.restore_replica(record, Vec::new(), pending, Instant::now())
            }
            None => return Ok(None),
        };
        let slot = self.records.entry(record_id).or_insert_with(|| {
            Arc::new(RecordSlot {
                replica: Mutex::new(replica),
                persist: Mutex::new(()),
            })
        });
        Ok(Some(Arc::clone(slot.value())))
    }

    fn slot_for_write(&self, record_id: RecordId) -> Result<Arc<RecordSlot>, EngineError> {
        self.slot(record_id, true)?
            .ok_or_else(|| EngineError::Storage(StorageError::NotFound(format!("{record_id:?}"))))
    }

    /// Merge an operation from any source. Duplicates are no-ops; operations
    /// with missing dependencies wait in the causal buffer.
    #[instrument(skip(self, op), fields(op = op.op_type_name(), actor = %op.actor_id))]
    pub fn apply_operation(
        &self,
        record_id: RecordId,
        op: Operation,
    ) -> Result<MergeResult, EngineError> {
        if op.actor_id != self.replica_id {
            self.clock
                .lock()
                .receive(&op.timestamp)
                .map_err(ValidationError::from)?;
        }
        if let OperationPayload::Vector(VectorMutation::StakeholderContribution { vector, weight }) =
            &op.payload
        {
            let contribution = StakeholderVector {
                actor_id: op.actor_id.clone(),
                vector: vector.clone(),
                weight: *weight,
                lamport: op.lamport_clock,
            };
            return if self.vectors.apply_stakeholder(record_id, contribution)? {
                Ok(MergeResult::Contributed {
                    operation_id: op.operation_id,
                })
            } else {
                Ok(MergeResult::Duplicate)
            };
        }
        if !matches!(op.payload, OperationPayload::Relationship { .. }) {
            return self.apply_field_op(record_id, op);
        }
        let now = Instant::now();
        let (_, result) = self.commit_relationship(|rel, _| {
            rel.apply_relationship_op(op, now).map(|report| (None, report))
        })?;
        Ok(result)
    }

    fn apply_field_op(&self, record_id: RecordId, op: Operation) -> Result<MergeResult, EngineError> {
        let slot = self.slot_for_write(record_id)?;
        let mut replica = slot.replica.lock();
        let submitted = op.clone();
        let report = self.crdt.apply(&mut replica, op, Instant::now())?;
        let replay = match report.result {
            MergeResult::Buffered { .. } => vec![submitted],
            _ => report.applied.clone(),
        };
        let result = report.result.clone();
        self.commit_field(record_id, &slot, replica, &report, &replay)?;
        Ok(result)
    }

    /// Write out a merge result and announce it. Takes the replica guard so
    /// the persist lock is acquired before the merge lock is released.
    fn commit_field(
        &self,
        record_id: RecordId,
        slot: &RecordSlot,
        replica: MutexGuard<'_, FieldReplica>,
        report: &ApplyReport,
        replay: &[Operation],
    ) -> Result<(), EngineError> {
        let record = replica.record().clone();
        let pending = replica.buffered();
        let persist = slot.persist.lock();
        drop(replica);

        if !report.applied.is_empty() {
            self.retry
                .run("append_op", || {
                    report
                        .applied
                        .iter()
                        .try_for_each(|op| self.durable.append_op(Some(record_id), op))
                })
                .and_then(|()| self.retry.run("save_record", || self.durable.save_record(&record)))
                .map_err(|e| self.exhausted(Some(record_id), replay, e))?;
        }
        self.retry
            .run("ephemeral", || {
                self.ephemeral
                    .put_version_vector(record_id, &record.version_vector)?;
                self.ephemeral.put_causal_buffer(record_id, &pending)
            })
            .map_err(|e| self.exhausted(Some(record_id), replay, e))?;

        for op in &report.applied {
            self.feed.publish(
                Some(record_id),
                Change::FieldApplied {
                    operation: op.clone(),
                },
            );
        }
        for (op, waited) in &report.expired {
            self.feed.publish(
                Some(record_id),
                Change::OperationExpired {
                    operation_id: op.operation_id,
                    waited_ms: waited.as_millis() as u64,
                },
            );
        }
        drop(persist);

        if !report.applied.is_empty() {
            self.content_committed(&record);
        }
        Ok(())
    }

    /// Content changes make the vector stale; regeneration runs in the
    /// background and failures here never fail the edit.
    fn content_committed(&self, record: &Record) {
        let hash = record.content_hash();
        match self
            .vectors
            .on_content_committed(record.id, &hash, &record.embedding_input())
        {
            Ok(Some(handle)) => {
                debug!(record_id = ?record.id, generation = handle.generation, "vector regeneration queued");
                self.feed
                    .publish(Some(record.id), Change::VectorStale { content_hash: hash });
            }
            Ok(None) => {}
            Err(err) => warn!(record_id = ?record.id, error = %err, "vector left stale"),
        }
    }

    fn exhausted(
        &self,
        record_id: Option<RecordId>,
        replay: &[Operation],
        err: RetryExhausted,
    ) -> EngineError {
        let reason = err.last.to_string();
        let mut replay_id = None;
        for op in replay {
            match self
                .durable
                .enqueue_replay(record_id, op, &reason, err.attempts)
            {
                Ok(id) => {
                    replay_id.get_or_insert(id);
                }
                Err(queue_err) => {
                    warn!(operation_id = ?op.operation_id, error = %queue_err, "operation could not be queued for replay");
                }
            }
        }
        error!(?record_id, attempts = err.attempts, ?replay_id, error = %err.last, "storage retries exhausted");
        EngineError::StorageExhausted {
            attempts: err.attempts,
            replay_id,
            source: err.last,
        }
    }

    /// A local operation that merged but could not be persisted is already
    /// part of this replica's state, so peers still need it.
    fn keep_for_peers(&self, record_id: RecordId, generated: &[Operation], err: EngineError) -> EngineError {
        if matches!(err, EngineError::StorageExhausted { .. }) && !generated.is_empty() {
            warn!(?record_id, operations = generated.len(), "queueing unpersisted local operations for peers");
            self.outbox.lock().extend(generated.iter().map(|op| Outgoing {
                record_id,
                operation: op.clone(),
            }));
        }
        err
    }

    /// Apply a text edit from the wire format. `base` is the version the
    /// client generated the edit against; concurrent history it had not seen
    /// is transformed in first. Returns the operations to send to peers.
    #[instrument(skip(self, op, base), fields(field = %op.field_path))]
    pub fn edit_field(
        &self,
        record_id: RecordId,
        op: &FieldOperation,
        base: Option<&VersionVector>,
    ) -> Result<Vec<Operation>, EngineError> {
        let delta = FieldOperationEngine::delta_from_field_operation(op)?;
        self.local_text_edit(
            record_id,
            &op.field_path,
            delta,
            base,
            &op.validation_rules,
            op.operation_id,
        )
    }

    /// Plain insert or delete at a visible position of the current text.
    pub fn edit_string(
        &self,
        record_id: RecordId,
        field: &str,
        op: &StringOperation,
    ) -> Result<Vec<Operation>, EngineError> {
        let delta = FieldOperationEngine::delta_from_string_operation(op)?;
        self.local_text_edit(record_id, field, delta, None, &[], OpId::new())
    }

    fn local_text_edit(
        &self,
        record_id: RecordId,
        field: &str,
        delta: ot::TextDelta,
        base: Option<&VersionVector>,
        rules: &[ValidationRuleSpec],
        operation_id: OpId,
    ) -> Result<Vec<Operation>, EngineError> {
        let slot = self.slot_for_write(record_id)?;
        let mut replica = slot.replica.lock();
        if replica.contains_operation(operation_id) {
            return Err(ValidationError::new(
                "operation_id",
                format!("{operation_id:?} was already applied"),
            )
            .into());
        }
        let empty = TextCrdt::new();
        let text = match replica.record().field(field) {
            None => &empty,
            Some(FieldState::Text(text)) => text,
            Some(other) => {
                return Err(ValidationError::new(
                    "field_type",
                    format!("{field} is a {} field", other.kind().as_str()),
                )
                .into());
            }
        };

        let current = replica.record().version_vector.clone();
        let base = base.unwrap_or(&current);
        let rebased = self.ot.rebase(delta, replica.history(field), base, text)?;
        let resulting = rebased.apply(&text.rich_chars())?;
        self.ot.validate(field, &delta::to_plain(&resulting), rules)?;
        let edits = FieldOperationEngine::lower(&rebased, text)?;
        if edits.is_empty() {
            return Err(ValidationError::new(
                "base_version",
                "concurrent changes already cover this edit",
            )
            .into());
        }

        let now = Instant::now();
        let mut generated: Vec<Operation> = Vec::with_capacity(edits.len());
        let mut report = ApplyReport {
            result: MergeResult::Duplicate,
            applied: Vec::new(),
            expired: Vec::new(),
            rejected: Vec::new(),
        };
        for (index, edit) in edits.into_iter().enumerate() {
            let mutation = match edit {
                LoweredEdit::Mutation(mutation) => mutation,
                LoweredEdit::FormatInserted {
                    insert_index,
                    len,
                    attribute,
                    value,
                } => {
                    let lamport = generated
                        .get(insert_index)
                        .map(|op| op.lamport_clock)
                        .ok_or_else(|| ValidationError::new("position", "format of unknown insert"))?;
                    let last = u32::try_from(len.saturating_sub(1))
                        .map_err(|_| ValidationError::new("content", "insert too long"))?;
                    FieldMutation::TextFormat {
                        start: CharId::new(lamport, self.replica_id.clone(), 0),
                        end: CharId::new(lamport, self.replica_id.clone(), last),
                        attribute,
                        value: Some(value),
                    }
                }
            };
            let op = Operation {
                operation_id: if index == 0 { operation_id } else { OpId::new() },
                actor_id: self.replica_id.clone(),
                lamport_clock: replica.tick(),
                deps: replica.record().version_vector.clone(),
                timestamp: self.clock.lock().tick()?,
                payload: OperationPayload::Field {
                    field: field.to_string(),
                    mutation,
                },
            };
            let step = self.crdt.apply(&mut replica, op.clone(), now)?;
            report.expired.extend(step.expired);
            report.rejected.extend(step.rejected);
            report.applied.extend(step.applied);
            report.result = step.result;
            generated.push(op);
        }
        debug!(operations = generated.len(), "text edit applied");
        let replay = report.applied.clone();
        self.commit_field(record_id, &slot, replica, &report, &replay)
            .map_err(|err| self.keep_for_peers(record_id, &generated, err))?;
        Ok(generated)
    }

    fn local_field_op(
        &self,
        record_id: RecordId,
        field: &str,
        build: impl FnOnce(&Record) -> Result<FieldMutation, ValidationError>,
    ) -> Result<Operation, EngineError> {
        let slot = self.slot_for_write(record_id)?;
        let mut replica = slot.replica.lock();
        let mutation = build(replica.record())?;
        let op = Operation {
            operation_id: OpId::new(),
            actor_id: self.replica_id.clone(),
            lamport_clock: replica.tick(),
            deps: replica.record().version_vector.clone(),
            timestamp: self.clock.lock().tick()?,
            payload: OperationPayload::Field {
                field: field.to_string(),
                mutation,
            },
        };
        let report = self.crdt.apply(&mut replica, op.clone(), Instant::now())?;
        let replay = report.applied.clone();
        self.commit_field(record_id, &slot, replica, &report, &replay)
            .map_err(|err| self.keep_for_peers(record_id, std::slice::from_ref(&op), err))?;
        Ok(op)
    }

    pub fn set_add(&self, record_id: RecordId, field: &str, element: &str) -> Result<Operation, EngineError> {
        self.local_field_op(record_id, field, |_| {
            Ok(FieldMutation::SetAdd {
                element: element.to_string(),
            })
        })
    }

    /// Removes only the additions this replica has observed; a concurrent
    /// add elsewhere survives.
    pub fn set_remove(&self, record_id: RecordId, field: &str, element: &str) -> Result<Operation, EngineError> {
        self.local_field_op(record_id, field, |record| {
            let observed = match record.field(field) {
                Some(FieldState::Set(set)) => set.tags(element),
                Some(other) => {
                    return Err(ValidationError::new(
                        "field_type",
                        format!("{field} is a {} field", other.kind().as_str()),
                    ));
                }
                None => Default::default(),
            };
            if observed.is_empty() {
                return Err(ValidationError::new("element", format!("{element} is not in {field}")));
            }
            Ok(FieldMutation::SetRemove {
                element: element.to_string(),
                observed,
            })
        })
    }

    pub fn map_put(
        &self,
        record_id: RecordId,
        field: &str,
        key: &str,
        value: FieldValue,
    ) -> Result<Operation, EngineError> {
        self.local_field_op(record_id, field, |_| {
            Ok(FieldMutation::MapPut {
                key: key.to_string(),
                value,
            })
        })
    }

    pub fn map_remove(&self, record_id: RecordId, field: &str, key: &str) -> Result<Operation, EngineError> {
        self.local_field_op(record_id, field, |record| match record.field(field) {
            Some(FieldState::Map(map)) if map.get(key).is_some() => Ok(FieldMutation::MapRemove {
                key: key.to_string(),
            }),
            Some(other) if other.kind() != FieldKind::Map => Err(ValidationError::new(
                "field_type",
                format!("{field} is a {} field", other.kind().as_str()),
            )),
            _ => Err(ValidationError::new("key", format!("{key} is not in {field}"))),
        })
    }

    /// Apply a relationship command from the wire format and return the
    /// operation to send to peers.
    #[instrument(skip(self, op), fields(kind = ?op.operation, relationship_type = %op.relationship_type))]
    pub fn relationship_op(&self, op: &RelationshipOperation) -> Result<Operation, EngineError> {
        let key = RelationshipKey::new(
            op.source_memory_id,
            op.target_memory_id,
            op.relationship_type.clone(),
        );
        let context = &op.transformation_context;
        let needs = |value: Option<f64>, name: &str| {
            value.ok_or_else(|| {
                ValidationError::new(
                    "transformation_context",
                    format!("{:?} needs a {name}", op.operation),
                )
            })
        };
        let mutation = match op.operation {
            RelationshipOperationKind::Create => RelationshipMutation::Create {
                weight: context.weight.unwrap_or(DEFAULT_EDGE_WEIGHT),
            },
            RelationshipOperationKind::Update => RelationshipMutation::Update {
                weight: needs(context.weight, "weight")?,
            },
            RelationshipOperationKind::Delete => RelationshipMutation::Delete,
            RelationshipOperationKind::Strengthen => RelationshipMutation::Strengthen {
                delta: needs(context.delta, "delta")?,
            },
            RelationshipOperationKind::Weaken => RelationshipMutation::Weaken {
                delta: needs(context.delta, "delta")?,
            },
        };
        let now = Instant::now();
        let (generated, _) = self.commit_relationship(|rel, timestamp| {
            let (generated, report) = rel.local_op_with_base(
                op.operation_id,
                &self.replica_id,
                key,
                mutation,
                context.base_version.as_ref(),
                timestamp,
                now,
            )?;
            Ok((Some(generated), report))
        })?;
        generated.ok_or_else(|| ValidationError::new("relationship", "no operation generated").into())
    }

    /// Run `step` against the relationship engine, then register conflicts,
    /// persist and announce what changed, and finally settle any conflict
    /// that can be resolved automatically.
    fn commit_relationship(
        &self,
        step: impl FnOnce(
            &mut RelationshipOtEngine,
            Hlc,
        ) -> Result<(Option<Operation>, RelationshipReport), EngineError>,
    ) -> Result<(Option<Operation>, MergeResult), EngineError> {
        let timestamp = self.clock.lock().tick()?;
        let mut rel = self.relationships.lock();
        let (generated, report) = step(&mut rel, timestamp)?;
        let detected = self.register_conflicts(&mut rel, &report)?;
        for conflict_id in &report.settled {
            self.conflicts.mark_resolved_remotely(*conflict_id);
        }
        let persist = self.relationship_persist.lock();
        drop(rel);

        if !report.applied.is_empty() {
            self.retry
                .run("append_relationship_op", || {
                    report
                        .applied
                        .iter()
                        .try_for_each(|op| self.durable.append_op(None, op))
                })
                .and_then(|()| {
                    self.retry.run("save_relationship", || {
                        report
                            .changed
                            .iter()
                            .try_for_each(|r| self.durable.save_relationship(r))
                    })
                })
                .map_err(|e| self.exhausted(None, &report.applied, e))
                .map_err(|err| match generated.as_ref().and_then(|op| Some((edge_source(op)?, op))) {
                    Some((record_id, op)) => self.keep_for_peers(record_id, std::slice::from_ref(op), err),
                    None => err,
                })?;
        }
        for relationship in &report.changed {
            self.feed.publish(
                Some(relationship.key.source_id),
                Change::RelationshipChanged {
                    relationship: relationship.clone(),
                },
            );
        }
        for (op, waited) in &report.expired {
            self.feed.publish(
                None,
                Change::OperationExpired {
                    operation_id: op.operation_id,
                    waited_ms: waited.as_millis() as u64,
                },
            );
        }
        for conflict_id in &detected {
            if let Some(record) = self.conflicts.get(*conflict_id) {
                self.feed.publish(
                    conflict_record_id(&record.kind),
                    Change::ConflictDetected {
                        conflict_id: *conflict_id,
                        status: record.status,
                    },
                );
            }
        }
        drop(persist);

        for conflict_id in detected {
            self.settle_conflict(conflict_id);
        }
        Ok((generated, report.result))
    }

    /// Submit every conflict `report` raised and tie it to its edge. Runs
    /// under the relationship lock; submission never calls back into the
    /// engine.
    fn register_conflicts(
        &self,
        rel: &mut RelationshipOtEngine,
        report: &RelationshipReport,
    ) -> Result<Vec<ConflictId>, EngineError> {
        let mut detected = Vec::new();
        for kind in &report.conflicts {
            let key = match kind {
                ConflictKind::RelationshipCreateDelete { key, .. } => key,
                ConflictKind::RelationshipConstraint { edge, .. } => &edge.key,
                ConflictKind::VectorSync { .. } => continue,
            };
            let conflict_id = self.conflicts.submit(Conflict {
                kind: kind.clone(),
                requires_manual: false,
                detected_at: self.clock.lock().tick()?,
            });
            if rel.attach_conflict(key, conflict_id) {
                detected.push(conflict_id);
            } else {
                self.conflicts.mark_resolved_remotely(conflict_id);
            }
        }
        Ok(detected)
    }

    fn settle_conflict(&self, conflict_id: ConflictId) {
        match self.conflicts.settle(conflict_id, self) {
            Ok(Some(outcome)) => self.announce_resolution(&outcome),
            Ok(None) => debug!(?conflict_id, "conflict awaits a manual decision"),
            Err(err) => warn!(?conflict_id, error = %err, "automatic resolution failed"),
        }
    }

    fn announce_resolution(&self, outcome: &Outcome) {
        let record_id = self
            .conflicts
            .get(outcome.conflict_id)
            .and_then(|r| conflict_record_id(&r.kind));
        self.feed.publish(
            record_id,
            Change::ConflictResolved {
                outcome: outcome.clone(),
            },
        );
    }

    /// Emit the create or delete that settles `key` and queue it for peers.
    fn settle_edge(&self, key: &RelationshipKey, keep: bool) -> Result<(), EngineError> {
        let now = Instant::now();
        let (generated, _) = self.commit_relationship(|rel, timestamp| {
            let (op, report) = rel.resolution_op(&self.replica_id, key, keep, timestamp, now)?;
            Ok((Some(op), report))
        })?;
        if let Some(op) = generated {
            self.outbox.lock().push(Outgoing {
                record_id: key.source_id,
                operation: op,
            });
        }
        Ok(())
    }

    /// Attach this replica's auxiliary vector to a record. The primary
    /// embedding is never touched.
    pub fn contribute_stakeholder_vector(
        &self,
        record_id: RecordId,
        vector: Vec<f32>,
        weight: f32,
    ) -> Result<Operation, EngineError> {
        let slot = self.slot_for_write(record_id)?;
        let (lamport_clock, deps) = {
            let mut replica = slot.replica.lock();
            (replica.tick(), replica.record().version_vector.clone())
        };
        let op = Operation {
            operation_id: OpId::new(),
            actor_id: self.replica_id.clone(),
            lamport_clock,
            deps,
            timestamp: self.clock.lock().tick()?,
            payload: OperationPayload::Vector(VectorMutation::StakeholderContribution {
                vector,
                weight,
            }),
        };
        self.apply_operation(record_id, op.clone())?;
        Ok(op)
    }

    /// Copy of the record with its edges and vector; `None` for a record
    /// this replica has never seen.
    pub fn get_state(&self, record_id: RecordId) -> Result<Option<RecordSnapshot>, EngineError> {
        let Some(slot) = self.slot(record_id, false)? else {
            return Ok(None);
        };
        let (record, pending_operations) = {
            let replica = slot.replica.lock();
            (replica.record().clone(), replica.buffered().len())
        };
        let relationships = self
            .relationships
            .lock()
            .relationships()
            .into_iter()
            .filter(|r| r.key.source_id == record_id || r.key.target_id == record_id)
            .collect();
        Ok(Some(RecordSnapshot {
            record,
            relationships,
            vector: self.vectors.view(record_id)?,
            pending_operations,
        }))
    }

    pub fn delta_since(
        &self,
        record_id: RecordId,
        since: &VersionVector,
    ) -> Result<Option<Patch>, EngineError> {
        let Some(slot) = self.slot(record_id, false)? else {
            return Ok(None);
        };
        let replica = slot.replica.lock();
        Ok(Some(self.crdt.delta_since(&replica, since)))
    }

    /// Changes from `cursor` (inclusive) onwards, or only new ones. With a
    /// `record_id`, only changes concerning that record are delivered.
    pub fn subscribe_to_changes(
        &self,
        record_id: Option<RecordId>,
        cursor: Option<u64>,
    ) -> Result<ChangeSubscription, EngineError> {
        Ok(self.feed.subscribe(cursor, record_id)?)
    }

    /// Ends every subscription once it has drained.
    pub fn close_feed(&self) {
        self.feed.close();
    }

    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> Result<Outcome, EngineError> {
        let outcome = self.conflicts.resolve(conflict_id, strategy, self)?;
        self.announce_resolution(&outcome);
        Ok(outcome)
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Option<ConflictRecord> {
        self.conflicts.get(conflict_id)
    }

    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.open_conflicts()
    }

    pub fn audit_entries(&self, conflict_id: ConflictId) -> Vec<AuditEntry> {
        self.conflicts.audit_entries(conflict_id)
    }

    pub fn verify_audit_trail(&self) -> Result<(), EngineError> {
        Ok(self.conflicts.verify_audit()?)
    }

    /// Operations this replica generated on its own, for delivery to peers.
    pub fn drain_outbox(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Drop buffered operations that waited longer than the causal timeout.
    pub fn expire_pending(&self, now: Instant) -> Vec<EngineError> {
        let slots: Vec<(RecordId, Arc<RecordSlot>)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut expired = Vec::new();
        for (record_id, slot) in slots {
            let mut replica = slot.replica.lock();
            let dropped = self.crdt.expire(&mut replica, now);
            if dropped.is_empty() {
                continue;
            }
            let pending = replica.buffered();
            drop(replica);
            if let Err(err) = self
                .retry
                .run("causal_buffer", || self.ephemeral.put_causal_buffer(record_id, &pending))
            {
                warn!(?record_id, error = %err.last, "causal buffer not saved after expiry");
            }
            self.publish_expired(Some(record_id), &dropped);
            expired.extend(dropped);
        }
        let dropped = self.relationships.lock().expire(now);
        self.publish_expired(None, &dropped);
        expired.extend(dropped);
        expired
    }

    fn publish_expired(&self, record_id: Option<RecordId>, errors: &[EngineError]) {
        for err in errors {
            if let EngineError::CausalityTimeout {
                operation_id,
                waited_ms,
            } = err
            {
                self.feed.publish(
                    record_id,
                    Change::OperationExpired {
                        operation_id: *operation_id,
                        waited_ms: *waited_ms,
                    },
                );
            }
        }
    }

    /// Re-apply and re-persist operations whose storage writes were given
    /// up on. Returns how many entries were cleared from the queue.
    pub fn replay_queued(&self) -> Result<usize, EngineError> {
        let queue = self
            .retry
            .run("replay_queue", || self.durable.replay_queue())
            .map_err(unavailable)?;
        let mut replayed = 0;
        for entry in queue {
            match entry.record_id {
                Some(record_id) => {
                    self.apply_operation(record_id, entry.operation.clone())?;
                    let slot = self.slot_for_write(record_id)?;
                    let replica = slot.replica.lock();
                    let record = replica.record().clone();
                    let applied = replica.record().has_applied(&entry.operation);
                    let persist = slot.persist.lock();
                    drop(replica);
                    self.retry
                        .run("replay_record", || {
                            if applied {
                                self.durable.append_op(Some(record_id), &entry.operation)?;
                            }
                            self.durable.save_record(&record)
                        })
                        .map_err(unavailable)?;
                    drop(persist);
                }
                None => {
                    self.apply_operation(RecordId::new(), entry.operation.clone())?;
                    let view = match &entry.operation.payload {
                        OperationPayload::Relationship { key, .. } => {
                            self.relationships.lock().relationship(key)
                        }
                        _ => None,
                    };
                    self.retry
                        .run("replay_relationship", || {
                            self.durable.append_op(None, &entry.operation)?;
                            view.iter().try_for_each(|r| self.durable.save_relationship(r))
                        })
                        .map_err(unavailable)?;
                }
            }
            self.retry
                .run("remove_replay", || self.durable.remove_replay(entry.replay_id))
                .map_err(unavailable)?;
            info!(replay_id = entry.replay_id, "queued operation replayed");
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Queue a fresh embedding for the record's current content, superseding
    /// any job already running.
    pub fn regenerate(&self, record_id: RecordId) -> Result<RegenerationHandle, EngineError> {
        let slot = self.slot_for_write(record_id)?;
        let record = slot.replica.lock().record().clone();
        let hash = record.content_hash();
        let handle = self
            .vectors
            .regenerate(record_id, &hash, &record.embedding_input())?;
        self.feed
            .publish(Some(record_id), Change::VectorStale { content_hash: hash });
        Ok(handle)
    }

    pub fn vector_view(&self, record_id: RecordId) -> Result<VectorView, EngineError> {
        Ok(self.vectors.view(record_id)?)
    }

    pub fn export_vector(&self, record_id: RecordId) -> Result<Option<VectorConsistencyState>, EngineError> {
        Ok(self.vectors.export(record_id, &self.replica_id)?)
    }

    /// Merge a vector sent by another replica. A record under manual vector
    /// resolution produces an escalated conflict instead of a merge.
    pub fn sync_vector(&self, incoming: VectorConsistencyState) -> Result<SyncOutcome, EngineError> {
        let record_id = incoming.memory_id;
        let outcome = self.vectors.sync(record_id, incoming.vector_state)?;
        if let SyncOutcome::NeedsDecision { local, incoming } = &outcome {
            let conflict_id = self.conflicts.submit(Conflict {
                kind: ConflictKind::VectorSync {
                    record_id,
                    local: local.clone(),
                    incoming: incoming.clone(),
                },
                requires_manual: true,
                detected_at: self.clock.lock().tick()?,
            });
            self.feed.publish(
                Some(record_id),
                Change::ConflictDetected {
                    conflict_id,
                    status: ConflictStatus::Escalated,
                },
            );
        }
        Ok(outcome)
    }

    pub fn set_vector_strategy(
        &self,
        record_id: RecordId,
        strategy: VectorResolution,
    ) -> Result<(), EngineError> {
        Ok(self.vectors.set_strategy(record_id, strategy)?)
    }

    /// Records whose last received vector failed its checksum.
    pub fn take_refetch_requests(&self) -> Vec<RecordId> {
        self.vectors.take_refetch_requests()
    }

    pub fn relationship(&self, key: &RelationshipKey) -> Option<Relationship> {
        self.relationships.lock().relationship(key)
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.relationships.lock().relationships()
    }

    pub fn outgoing(&self, record_id: RecordId, relationship_type: &str) -> Vec<RecordId> {
        self.relationships.lock().outgoing(record_id, relationship_type)
    }

    pub fn incoming(&self, record_id: RecordId, relationship_type: &str) -> Vec<RecordId> {
        self.relationships.lock().incoming(record_id, relationship_type)
    }

    pub fn has_path(&self, from: RecordId, to: RecordId, relationship_type: &str) -> bool {
        self.relationships.lock().has_path(from, to, relationship_type)
    }

    pub fn check_graph_consistency(&self, key: &RelationshipKey) -> GraphConsistency {
        self.relationships.lock().check_graph_consistency(key)
    }
}

impl ResolutionSink for Engine {
    fn apply_decision(
        &self,
        kind: &ConflictKind,
        decision: Decision,
    ) -> Result<String, ConflictError> {
        let write_back = |err: EngineError| ConflictError::WriteBack(err.to_string());
        match kind {
            ConflictKind::RelationshipCreateDelete { key, .. } => {
                let keep = decision == Decision::KeepRelationship;
                self.settle_edge(key, keep).map_err(write_back)?;
                state_hash(&self.relationship(key))
            }
            ConflictKind::RelationshipConstraint { edge, rival, .. } => {
                match (decision, rival) {
                    (Decision::RemoveRivalRelationship, Some(rival)) => {
                        self.settle_edge(&rival.key, false).map_err(write_back)?
                    }
                    (Decision::RemoveRivalRelationship, None) => {
                        return Err(ConflictError::StrategyNotApplicable {
                            strategy: ResolutionStrategy::Manual(decision),
                            kind: kind.name(),
                        });
                    }
                    _ => self
                        .settle_edge(&edge.key, decision == Decision::KeepRelationship)
                        .map_err(write_back)?,
                }
                state_hash(&(
                    self.relationship(&edge.key),
                    rival.as_ref().and_then(|r| self.relationship(&r.key)),
                ))
            }
            ConflictKind::VectorSync { record_id, .. } => {
                let record_id = *record_id;
                let adopted = match self.vectors.resolve_pending(record_id, decision) {
                    Ok(state) => state,
                    Err(VectorError::NoPendingDecision { .. })
                        if decision == Decision::RegenerateVector =>
                    {
                        None
                    }
                    Err(err) => return Err(write_back(err.into())),
                };
                if decision == Decision::RegenerateVector {
                    self.regenerate(record_id).map_err(write_back)?;
                }
                match adopted {
                    Some(state) => Ok(state.consistency_checksum),
                    None => state_hash(&self.vectors.view(record_id).map_err(|e| write_back(e.into()))?.state),
                }
            }
        }
    }
}

fn state_hash<T: Serialize>(value: &T) -> Result<String, ConflictError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn edge_source(op: &Operation) -> Option<RecordId> {
    match &op.payload {
        OperationPayload::Relationship { key, .. } => Some(key.source_id),
        _ => None,
    }
}

fn conflict_record_id(kind: &ConflictKind) -> Option<RecordId> {
    match kind {
        ConflictKind::RelationshipCreateDelete { key, .. } => Some(key.source_id),
        ConflictKind::RelationshipConstraint { edge, .. } => Some(edge.key.source_id),
        ConflictKind::VectorSync { record_id, .. } => Some(*record_id),
    }
}

fn unavailable(err: RetryExhausted) -> EngineError {
    EngineError::StorageExhausted {
        attempts: err.attempts,
        replay_id: None,
        source: err.last,
    }
}
