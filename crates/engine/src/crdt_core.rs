//! Causal delivery and merge of field operations for one record.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use concord_core::{
    CausalOrder, CharId, ConflictId, Dot, Hlc, LamportClock, MissingDependency, OpId, Operation,
    OperationPayload, Record, RecordId, TextCrdt, VersionVector,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::causal::CausalBuffer;
use crate::config::EngineConfig;
use crate::error::{EngineError, ValidationError};
use crate::ot::{FieldHistory, HistoryEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Applied { dot: Dot, drained: Vec<OpId> },
    /// A stakeholder vector was recorded. Contributions stay outside the
    /// record's causal history, so they carry no dot.
    Contributed { operation_id: OpId },
    Duplicate,
    Buffered { missing: Vec<MissingDependency> },
    Escalated { conflict_id: ConflictId },
}

/// Everything one `apply` call changed.
#[derive(Debug)]
pub struct ApplyReport {
    pub result: MergeResult,
    /// Integrated operations in application order, the submitted one first.
    pub applied: Vec<Operation>,
    pub expired: Vec<(Operation, Duration)>,
    /// Buffered operations that became ready but failed to integrate.
    pub rejected: Vec<(Operation, ValidationError)>,
}

/// Operations a replica at `since` is missing, in application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub record_id: RecordId,
    pub operations: Vec<Operation>,
    pub version_vector: VersionVector,
}

/// Merge state of one record: the CRDT record itself, its pending
/// operations, the applied log and recent text history for rebasing.
#[derive(Debug, Clone)]
pub struct FieldReplica {
    record: Record,
    clock: LamportClock,
    buffer: CausalBuffer,
    log: Vec<Operation>,
    histories: BTreeMap<String, FieldHistory>,
    history_floor: VersionVector,
}

impl FieldReplica {
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn buffered(&self) -> Vec<Operation> {
        self.buffer.operations().cloned().collect()
    }

    pub fn history(&self, field: &str) -> Option<&FieldHistory> {
        self.histories.get(field)
    }

    /// Lamport value for the next locally generated operation.
    pub fn tick(&mut self) -> u64 {
        self.clock.tick()
    }

    fn visible_ids(&self, field: &str) -> Vec<CharId> {
        self.record
            .field(field)
            .and_then(|s| s.as_text())
            .map(TextCrdt::visible_ids)
            .unwrap_or_default()
    }

    pub fn contains_operation(&self, operation_id: OpId) -> bool {
        self.record.has_operation(&operation_id)
    }

    pub(crate) fn integrate(
        &mut self,
        op: &Operation,
        history_limit: usize,
    ) -> Result<bool, ValidationError> {
        let text_edit = match &op.payload {
            OperationPayload::Field { field, mutation }
                if mutation.kind() == concord_core::FieldKind::Text =>
            {
                Some((field.as_str(), mutation))
            }
            _ => None,
        };
        let before = text_edit
            .map(|(field, _)| self.visible_ids(field))
            .unwrap_or_default();

        if !self.record.integrate(op)? {
            return Ok(false);
        }
        self.clock.observe(op.lamport_clock);
        self.log.push(op.clone());

        if let Some((field, mutation)) = text_edit {
            let entry = HistoryEntry::new(op.dot(), mutation, &before, &self.visible_ids(field));
            let floor = &self.history_floor;
            self.histories
                .entry(field.to_string())
                .or_insert_with(|| FieldHistory::with_floor(floor.clone()))
                .record(entry, history_limit);
        }
        Ok(true)
    }

    fn drain(&mut self, history_limit: usize, report: &mut ApplyReport) -> Vec<OpId> {
        let mut drained = Vec::new();
        loop {
            let record = &self.record;
            let Some(op) = self
                .buffer
                .take_ready(|op| record.has_applied(op) || record.missing_dependencies(op).is_empty())
            else {
                break;
            };
            match self.integrate(&op, history_limit) {
                Ok(true) => {
                    drained.push(op.operation_id);
                    report.applied.push(op);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(operation_id = ?op.operation_id, error = %err, "dropping buffered operation");
                    report.rejected.push((op, err));
                }
            }
        }
        drained
    }
}

#[derive(Debug, Clone)]
pub struct FieldCrdtCore {
    buffer_capacity: usize,
    timeout: Duration,
    history_limit: usize,
}

impl FieldCrdtCore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            buffer_capacity: config.causal.buffer_capacity,
            timeout: Duration::from_millis(config.causal.timeout_ms),
            history_limit: config.ot.history_limit,
        }
    }

    pub fn new_replica(&self, record_id: RecordId, created_at: Hlc) -> FieldReplica {
        FieldReplica {
            record: Record::new(record_id, created_at),
            clock: LamportClock::new(),
            buffer: CausalBuffer::new(self.buffer_capacity, self.timeout),
            log: Vec::new(),
            histories: BTreeMap::new(),
            history_floor: VersionVector::new(),
        }
    }

    /// Rebuild a replica from persisted state. Text history is not persisted,
    /// so edits based on anything older than the restored version are
    /// refused instead of being rebased blindly.
    pub fn restore_replica(
        &self,
        record: Record,
        log: Vec<Operation>,
        pending: Vec<Operation>,
        now: Instant,
    ) -> FieldReplica {
        let mut clock = LamportClock::new();
        clock.observe(record.lamport);
        let mut buffer = CausalBuffer::new(self.buffer_capacity, self.timeout);
        for op in pending {
            if buffer.push(op, now).is_err() {
                warn!(record_id = ?record.id, "restored causal buffer exceeds capacity");
                break;
            }
        }
        FieldReplica {
            history_floor: record.version_vector.clone(),
            record,
            clock,
            buffer,
            log,
            histories: BTreeMap::new(),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn compare(a: &VersionVector, b: &VersionVector) -> CausalOrder {
        a.compare(b)
    }

    #[instrument(skip(self, replica, op), fields(record_id = ?replica.record.id, op = op.op_type_name()))]
    pub fn apply(
        &self,
        replica: &mut FieldReplica,
        op: Operation,
        now: Instant,
    ) -> Result<ApplyReport, EngineError> {
        let mut report = ApplyReport {
            result: MergeResult::Duplicate,
            applied: Vec::new(),
            expired: replica.buffer.expire(now),
            rejected: Vec::new(),
        };
        for (expired, waited) in &report.expired {
            warn!(operation_id = ?expired.operation_id, waited_ms = waited.as_millis() as u64, "causal dependency timed out");
        }

        if replica.record.has_applied(&op) {
            debug!(operation_id = ?op.operation_id, "duplicate operation");
            return Ok(report);
        }

        let missing = replica.record.missing_dependencies(&op);
        if !missing.is_empty() {
            if !replica.buffer.contains(&op.operation_id) {
                let capacity = replica.buffer.capacity();
                replica.buffer.push(op, now).map_err(|_| EngineError::CausalBufferFull {
                    record_id: replica.record.id,
                    capacity,
                })?;
            }
            debug!(missing = missing.len(), "buffered until dependencies arrive");
            report.result = MergeResult::Buffered { missing };
            return Ok(report);
        }

        replica.integrate(&op, self.history_limit)?;
        let dot = op.dot();
        report.applied.push(op);
        let drained = replica.drain(self.history_limit, &mut report);
        if !drained.is_empty() {
            debug!(drained = drained.len(), "released buffered operations");
        }
        report.result = MergeResult::Applied { dot, drained };
        Ok(report)
    }

    /// Drop buffered operations older than the causal timeout.
    pub fn expire(&self, replica: &mut FieldReplica, now: Instant) -> Vec<EngineError> {
        replica
            .buffer
            .expire(now)
            .into_iter()
            .map(|(op, waited)| EngineError::CausalityTimeout {
                operation_id: op.operation_id,
                waited_ms: waited.as_millis() as u64,
            })
            .collect()
    }

    pub fn delta_since(&self, replica: &FieldReplica, since: &VersionVector) -> Patch {
        Patch {
            record_id: replica.record.id,
            operations: replica
                .log
                .iter()
                .filter(|op| !since.contains(&op.dot()))
                .cloned()
                .collect(),
            version_vector: replica.record.version_vector.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ActorId, CharId, FieldMutation};

    fn core() -> FieldCrdtCore {
        FieldCrdtCore::new(&EngineConfig::default())
    }

    fn insert(
        actor: &str,
        lamport: u64,
        deps: &VersionVector,
        origin_left: Option<CharId>,
        content: &str,
    ) -> Operation {
        Operation {
            operation_id: OpId::new(),
            actor_id: ActorId::from(actor),
            lamport_clock: lamport,
            deps: deps.clone(),
            timestamp: Hlc::new(lamport, 0),
            payload: OperationPayload::Field {
                field: "body".into(),
                mutation: FieldMutation::TextInsert {
                    origin_left,
                    origin_right: None,
                    content: content.into(),
                },
            },
        }
    }

    fn vv(entries: &[(&str, u64)]) -> VersionVector {
        let mut vv = VersionVector::new();
        for (actor, seq) in entries {
            vv.observe(&ActorId::from(*actor), *seq);
        }
        vv
    }

    #[test]
    fn out_of_order_ops_buffer_then_drain() -> Result<(), Box<dyn std::error::Error>> {
        let core = core();
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let now = Instant::now();

        let first = insert("a", 1, &vv(&[]), None, "ab");
        let second = insert(
            "a",
            2,
            &vv(&[("a", 1)]),
            Some(CharId::new(1, ActorId::from("a"), 1)),
            "c",
        );

        let report = core.apply(&mut replica, second.clone(), now)?;
        assert!(matches!(report.result, MergeResult::Buffered { ref missing } if missing.len() == 1));
        assert_eq!(replica.buffered().len(), 1);

        let report = core.apply(&mut replica, first, now)?;
        let MergeResult::Applied { drained, .. } = report.result else {
            panic!("expected applied");
        };
        assert_eq!(drained, vec![second.operation_id]);
        assert_eq!(replica.record().text("body").as_deref(), Some("abc"));
        assert!(replica.buffered().is_empty());
        Ok(())
    }

    #[test]
    fn reapplying_is_duplicate() -> Result<(), Box<dyn std::error::Error>> {
        let core = core();
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let op = insert("a", 1, &vv(&[]), None, "x");
        core.apply(&mut replica, op.clone(), Instant::now())?;
        let report = core.apply(&mut replica, op, Instant::now())?;
        assert_eq!(report.result, MergeResult::Duplicate);
        assert!(report.applied.is_empty());
        assert_eq!(replica.log().len(), 1);
        Ok(())
    }

    #[test]
    fn full_buffer_rejects() {
        let mut config = EngineConfig::default();
        config.causal.buffer_capacity = 1;
        let core = FieldCrdtCore::new(&config);
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let now = Instant::now();
        core.apply(&mut replica, insert("a", 3, &vv(&[("a", 2)]), None, "x"), now)
            .unwrap();
        let err = core
            .apply(&mut replica, insert("b", 3, &vv(&[("b", 2)]), None, "y"), now)
            .unwrap_err();
        assert!(matches!(err, EngineError::CausalBufferFull { capacity: 1, .. }));
    }

    #[test]
    fn stalled_dependency_times_out() {
        let mut config = EngineConfig::default();
        config.causal.timeout_ms = 10;
        let core = FieldCrdtCore::new(&config);
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let start = Instant::now();
        let stalled = insert("a", 2, &vv(&[("a", 1)]), None, "x");
        core.apply(&mut replica, stalled.clone(), start).unwrap();

        let errors = core.expire(&mut replica, start + Duration::from_millis(50));
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            EngineError::CausalityTimeout { operation_id, .. } if *operation_id == stalled.operation_id
        ));
        assert!(replica.buffered().is_empty());
    }

    #[test]
    fn invalid_reference_is_validation_error() {
        let core = core();
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let ghost = CharId::new(99, ActorId::from("ghost"), 0);
        let err = core
            .apply(&mut replica, insert("a", 1, &vv(&[]), Some(ghost), "x"), Instant::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref v) if v.rule == "position"));
        assert!(replica.record().version_vector.is_empty());
    }

    #[test]
    fn delta_since_skips_known_ops() -> Result<(), Box<dyn std::error::Error>> {
        let core = core();
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        let now = Instant::now();
        core.apply(&mut replica, insert("a", 1, &vv(&[]), None, "x"), now)?;
        core.apply(&mut replica, insert("b", 1, &vv(&[]), None, "y"), now)?;

        let patch = core.delta_since(&replica, &vv(&[("a", 1)]));
        assert_eq!(patch.operations.len(), 1);
        assert_eq!(patch.operations[0].actor_id, ActorId::from("b"));
        assert_eq!(
            FieldCrdtCore::compare(&patch.version_vector, &vv(&[("a", 1)])),
            CausalOrder::After
        );
        Ok(())
    }

    #[test]
    fn text_history_tracks_applied_deltas() -> Result<(), Box<dyn std::error::Error>> {
        let core = core();
        let mut replica = core.new_replica(RecordId::new(), Hlc::new(0, 0));
        core.apply(&mut replica, insert("a", 1, &vv(&[]), None, "hi"), Instant::now())?;
        let history = replica.history("body").ok_or("missing history")?;
        assert_eq!(history.len(), 1);
        assert_eq!(history.unseen_by(&vv(&[]))?.len(), 1);
        assert!(history.unseen_by(&vv(&[("a", 1)]))?.is_empty());
        Ok(())
    }
}
