//! Typed, weighted edges between records.
//!
//! Each edge merges three things independently: a last-writer-wins base
//! weight set by create/update, additive strengthen/weaken deltas, and the
//! set of causally maximal create/delete operations that decides whether the
//! edge exists. Concurrent create and delete leave the edge tentative until
//! the conflict coordinator decides. A remote create that breaks its type's
//! graph constraints is held out of the graph, also tentative, until a
//! decision or a later change makes it fit.

pub mod graph;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use concord_core::{
    ActorId, ConflictId, ConflictKind, Dot, EdgeClaim, EdgeStatus, Hlc, LamportClock,
    MissingDependency, OpId, OpSummary, Operation, OperationPayload, RecordId, Relationship,
    RelationshipKey, RelationshipMutation, VersionVector, clamp_weight,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use graph::{NodeIx, RelationshipGraph};
pub use registry::{RelationshipTypeRegistry, TypeConstraints};

use crate::causal::CausalBuffer;
use crate::config::EngineConfig;
use crate::crdt_core::MergeResult;
use crate::error::{EngineError, ValidationError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintViolation {
    #[error("edge {key} would close a cycle")]
    Cycle { key: RelationshipKey },

    #[error("{relationship_type} edges may not point at their source")]
    SelfReference { relationship_type: String },

    #[error("{source_id:?} already has {limit} outgoing {relationship_type} edges")]
    OutDegree {
        source_id: RecordId,
        relationship_type: String,
        limit: usize,
    },

    #[error("chain through {key} would be {depth} edges long (limit {limit})")]
    PathDepth {
        key: RelationshipKey,
        depth: usize,
        limit: usize,
    },

    #[error("no live edge {key}")]
    MissingEdge { key: RelationshipKey },
}

/// Result of checking a prospective edge against its type's constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConsistency {
    pub cycle_detected: bool,
    pub path_valid: bool,
    pub constraints_ok: bool,
}

impl GraphConsistency {
    pub fn is_consistent(&self) -> bool {
        !self.cycle_detected && self.path_valid && self.constraints_ok
    }
}

#[derive(Debug, Clone)]
struct WeightRegister {
    weight: f64,
    op_id: OpId,
    actor: ActorId,
    lamport: u64,
    deps: VersionVector,
}

impl WeightRegister {
    fn precedence(&self) -> (u64, &ActorId, &OpId) {
        (self.lamport, &self.actor, &self.op_id)
    }
}

#[derive(Debug, Clone)]
struct WeightDelta {
    dot: Dot,
    deps: VersionVector,
    amount: f64,
}

#[derive(Debug, Clone)]
struct StructuralEntry {
    dot: Dot,
    deps: VersionVector,
    create: bool,
    summary: OpSummary,
}

#[derive(Debug, Clone)]
struct EdgeState {
    key: RelationshipKey,
    base: Option<WeightRegister>,
    deltas: BTreeMap<OpId, WeightDelta>,
    /// Create/delete operations no other structural operation has seen.
    frontier: Vec<StructuralEntry>,
    version_vector: VersionVector,
    history: Vec<OpId>,
    updated_at: Hlc,
    conflict: Option<ConflictId>,
    /// Remote create held out of the graph for breaking a constraint.
    held: Option<Dot>,
}

impl EdgeState {
    fn new(key: RelationshipKey, at: Hlc) -> Self {
        Self {
            key,
            base: None,
            deltas: BTreeMap::new(),
            frontier: Vec::new(),
            version_vector: VersionVector::new(),
            history: Vec::new(),
            updated_at: at,
            conflict: None,
            held: None,
        }
    }

    fn status(&self) -> Option<EdgeStatus> {
        let creates = self.frontier.iter().any(|e| e.create);
        let deletes = self.frontier.iter().any(|e| !e.create);
        match (creates, deletes) {
            (false, false) => None,
            (true, false) if self.held.is_some() => Some(EdgeStatus::Tentative),
            (true, false) => Some(EdgeStatus::Active),
            (false, true) => Some(EdgeStatus::Deleted),
            (true, true) => Some(EdgeStatus::Tentative),
        }
    }

    fn is_linked(&self) -> bool {
        matches!(self.status(), Some(EdgeStatus::Active | EdgeStatus::Tentative))
    }

    fn in_graph(&self) -> bool {
        self.is_linked() && self.held.is_none()
    }

    /// Base weight with every delta the base setter had not seen folded in
    /// by causal depth. Deltas at the same depth are concurrent: they are
    /// summed, then the running weight is clamped before the next depth
    /// applies, so a weaken issued after a saturating strengthen still
    /// lowers the weight.
    fn weight(&self) -> f64 {
        let base = self.base.as_ref();
        let pending: Vec<&WeightDelta> = self
            .deltas
            .values()
            .filter(|d| base.is_none_or(|b| !b.deps.contains(&d.dot)))
            .collect();
        // A causal successor always has a strictly larger dependency total.
        let mut order: Vec<usize> = (0..pending.len()).collect();
        order.sort_by_key(|&i| pending[i].deps.entries().values().sum::<u64>());
        let mut depth = vec![0usize; pending.len()];
        for (pos, &i) in order.iter().enumerate() {
            depth[i] = order[..pos]
                .iter()
                .filter(|&&j| pending[i].deps.contains(&pending[j].dot))
                .map(|&j| depth[j] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut layers: BTreeMap<usize, f64> = BTreeMap::new();
        for (i, delta) in pending.iter().enumerate() {
            *layers.entry(depth[i]).or_default() += delta.amount;
        }
        layers.values().fold(
            clamp_weight(base.map_or(0.0, |b| b.weight)),
            |weight, sum| clamp_weight(weight + sum),
        )
    }

    fn view(&self) -> Option<Relationship> {
        Some(Relationship {
            key: self.key.clone(),
            weight: self.weight(),
            status: self.status()?,
            operation_history: self.history.clone(),
            version_vector: self.version_vector.clone(),
            updated_at: self.updated_at,
        })
    }

    fn missing(&self, op: &Operation) -> Vec<MissingDependency> {
        op.deps
            .entries()
            .iter()
            .filter(|(actor, seq)| self.version_vector.get(actor) < **seq)
            .map(|(actor, seq)| MissingDependency {
                actor: actor.clone(),
                seq: *seq,
            })
            .collect()
    }

    fn has_applied(&self, op: &Operation) -> bool {
        self.version_vector.contains(&op.dot()) || self.history.contains(&op.operation_id)
    }

    fn integrate(&mut self, op: &Operation, mutation: &RelationshipMutation) {
        let dot = op.dot();
        self.version_vector.observe(&dot.actor, dot.seq);
        self.history.push(op.operation_id);
        self.updated_at = self.updated_at.max(op.timestamp);

        match mutation {
            RelationshipMutation::Create { weight } | RelationshipMutation::Update { weight } => {
                let register = WeightRegister {
                    weight: clamp_weight(*weight),
                    op_id: op.operation_id,
                    actor: op.actor_id.clone(),
                    lamport: op.lamport_clock,
                    deps: op.deps.clone(),
                };
                if self
                    .base
                    .as_ref()
                    .is_none_or(|b| b.precedence() < register.precedence())
                {
                    self.base = Some(register);
                }
                if matches!(mutation, RelationshipMutation::Create { .. }) {
                    self.structural(op, dot, true);
                }
            }
            RelationshipMutation::Delete => self.structural(op, dot, false),
            RelationshipMutation::Strengthen { delta } => self.add_delta(op, dot, delta.abs()),
            RelationshipMutation::Weaken { delta } => self.add_delta(op, dot, -delta.abs()),
        }
    }

    fn add_delta(&mut self, op: &Operation, dot: Dot, amount: f64) {
        self.deltas.insert(
            op.operation_id,
            WeightDelta {
                dot,
                deps: op.deps.clone(),
                amount,
            },
        );
    }

    fn structural(&mut self, op: &Operation, dot: Dot, create: bool) {
        if self.frontier.iter().any(|e| e.deps.contains(&dot)) {
            return;
        }
        self.frontier.retain(|e| !op.deps.contains(&e.dot));
        self.frontier.push(StructuralEntry {
            dot,
            deps: op.deps.clone(),
            create,
            summary: OpSummary {
                operation_id: op.operation_id,
                actor_id: op.actor_id.clone(),
                lamport_clock: op.lamport_clock,
            },
        });
    }

    fn latest(&self, create: bool) -> Option<OpSummary> {
        self.frontier
            .iter()
            .filter(|e| e.create == create)
            .map(|e| &e.summary)
            .max_by(|a, b| a.precedence().cmp(&b.precedence()))
            .cloned()
    }

    fn claim(&self) -> Option<EdgeClaim> {
        Some(EdgeClaim {
            key: self.key.clone(),
            create_op: self.latest(true)?,
        })
    }

    fn conflict_kind(&self) -> Option<ConflictKind> {
        Some(ConflictKind::RelationshipCreateDelete {
            key: self.key.clone(),
            create_op: self.latest(true)?,
            delete_op: self.latest(false)?,
        })
    }
}

/// What one call changed.
#[derive(Debug)]
pub struct RelationshipReport {
    pub result: MergeResult,
    pub applied: Vec<Operation>,
    pub changed: Vec<Relationship>,
    /// Edges that just became tentative and need a coordinator decision.
    pub conflicts: Vec<ConflictKind>,
    /// Open conflicts settled by an incoming create or delete.
    pub settled: Vec<ConflictId>,
    pub expired: Vec<(Operation, Duration)>,
}

impl RelationshipReport {
    fn new(expired: Vec<(Operation, Duration)>) -> Self {
        Self {
            result: MergeResult::Duplicate,
            applied: Vec::new(),
            changed: Vec::new(),
            conflicts: Vec::new(),
            settled: Vec::new(),
            expired,
        }
    }
}

#[derive(Debug)]
pub struct RelationshipOtEngine {
    registry: RelationshipTypeRegistry,
    graph: RelationshipGraph,
    edges: HashMap<RelationshipKey, EdgeState>,
    buffer: CausalBuffer,
    clock: LamportClock,
}

impl RelationshipOtEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            registry: RelationshipTypeRegistry::from_config(&config.relationship_types),
            graph: RelationshipGraph::new(),
            edges: HashMap::new(),
            buffer: CausalBuffer::new(
                config.causal.buffer_capacity,
                Duration::from_millis(config.causal.timeout_ms),
            ),
            clock: LamportClock::new(),
        }
    }

    pub fn registry(&self) -> &RelationshipTypeRegistry {
        &self.registry
    }

    pub fn check_graph_consistency(&self, key: &RelationshipKey) -> GraphConsistency {
        let rules = self.registry.constraints(&key.relationship_type);
        let ty = key.relationship_type.as_str();
        let present = self.graph.contains(key);
        let cycle_detected = rules.acyclic
            && !present
            && (key.is_self_reference() || self.graph.has_path(key.target_id, key.source_id, ty));
        let path_valid = match rules.max_path_depth {
            Some(limit) if !present => self
                .graph
                .chain_length_through(key)
                .is_some_and(|depth| depth <= limit),
            _ => true,
        };
        let constraints_ok = (rules.allow_self_reference || !key.is_self_reference())
            && rules
                .max_out_degree
                .is_none_or(|max| present || self.graph.out_degree(key.source_id, ty) < max);
        GraphConsistency {
            cycle_detected,
            path_valid,
            constraints_ok,
        }
    }

    fn violation(&self, key: &RelationshipKey) -> Option<ConstraintViolation> {
        let check = self.check_graph_consistency(key);
        if check.is_consistent() {
            return None;
        }
        let rules = self.registry.constraints(&key.relationship_type);
        let ty = key.relationship_type.clone();
        if key.is_self_reference() && !rules.allow_self_reference {
            return Some(ConstraintViolation::SelfReference {
                relationship_type: ty,
            });
        }
        if check.cycle_detected {
            return Some(ConstraintViolation::Cycle { key: key.clone() });
        }
        if let Some(limit) = rules.max_out_degree
            && !check.constraints_ok
        {
            return Some(ConstraintViolation::OutDegree {
                source_id: key.source_id,
                relationship_type: ty,
                limit,
            });
        }
        Some(ConstraintViolation::PathDepth {
            key: key.clone(),
            depth: self.graph.chain_length_through(key).unwrap_or(usize::MAX),
            limit: rules.max_path_depth.unwrap_or(0),
        })
    }

    /// Generate and apply a local operation. Nothing changes when the
    /// operation is rejected.
    pub fn local_op(
        &mut self,
        actor: &ActorId,
        key: RelationshipKey,
        mutation: RelationshipMutation,
        timestamp: Hlc,
        now: Instant,
    ) -> Result<(Operation, RelationshipReport), EngineError> {
        self.local_op_with_base(OpId::new(), actor, key, mutation, None, timestamp, now)
    }

    /// Like `local_op`, for a client that had only seen `base` of the edge's
    /// history. Operations outside `base` stay concurrent with the new one.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(key = %key, actor = %actor))]
    pub fn local_op_with_base(
        &mut self,
        operation_id: OpId,
        actor: &ActorId,
        key: RelationshipKey,
        mutation: RelationshipMutation,
        base: Option<&VersionVector>,
        timestamp: Hlc,
        now: Instant,
    ) -> Result<(Operation, RelationshipReport), EngineError> {
        check_numbers(&mutation)?;
        if self.edges.get(&key).is_some_and(|e| e.history.contains(&operation_id)) {
            return Err(ValidationError::new(
                "operation_id",
                format!("{operation_id:?} was already applied"),
            )
            .into());
        }
        let edge = self.edges.get(&key);
        let linked = edge.is_some_and(EdgeState::is_linked);
        match &mutation {
            RelationshipMutation::Create { .. } if !edge.is_some_and(EdgeState::in_graph) => {
                if let Some(violation) = self.violation(&key) {
                    debug!(%violation, "create rejected");
                    return Err(violation.into());
                }
            }
            RelationshipMutation::Create { .. } => {}
            _ if !linked => return Err(ConstraintViolation::MissingEdge { key }.into()),
            _ => {}
        }
        self.emit(operation_id, actor, key, mutation, base, timestamp, now)
    }

    /// Generate the create or delete that settles a tentative edge. Its
    /// dependencies cover both sides of the conflict, so every replica
    /// collapses the edge to the same state once it arrives.
    pub fn resolution_op(
        &mut self,
        actor: &ActorId,
        key: &RelationshipKey,
        keep: bool,
        timestamp: Hlc,
        now: Instant,
    ) -> Result<(Operation, RelationshipReport), EngineError> {
        let edge = self
            .edges
            .get_mut(key)
            .ok_or_else(|| ConstraintViolation::MissingEdge { key: key.clone() })?;
        edge.conflict = None;
        let mutation = if keep {
            RelationshipMutation::Create {
                weight: edge.weight(),
            }
        } else {
            RelationshipMutation::Delete
        };
        self.emit(OpId::new(), actor, key.clone(), mutation, None, timestamp, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        operation_id: OpId,
        actor: &ActorId,
        key: RelationshipKey,
        mutation: RelationshipMutation,
        base: Option<&VersionVector>,
        timestamp: Hlc,
        now: Instant,
    ) -> Result<(Operation, RelationshipReport), EngineError> {
        let seen = self
            .edges
            .get(&key)
            .map(|e| e.version_vector.clone())
            .unwrap_or_default();
        let deps = match base {
            None => seen,
            Some(base) => {
                let mut deps = VersionVector::new();
                for (other, seq) in seen.entries() {
                    let bound = if other == actor { *seq } else { (*seq).min(base.get(other)) };
                    if bound > 0 {
                        deps.observe(other, bound);
                    }
                }
                deps
            }
        };
        let op = Operation {
            operation_id,
            actor_id: actor.clone(),
            lamport_clock: self.clock.tick(),
            deps,
            timestamp,
            payload: OperationPayload::Relationship { key, mutation },
        };
        let report = self.apply_relationship_op(op.clone(), now)?;
        Ok((op, report))
    }

    #[instrument(skip(self, op, now), fields(op = op.op_type_name()))]
    pub fn apply_relationship_op(
        &mut self,
        op: Operation,
        now: Instant,
    ) -> Result<RelationshipReport, EngineError> {
        let key = match &op.payload {
            OperationPayload::Relationship { key, mutation } => {
                check_numbers(mutation)?;
                key.clone()
            }
            _ => {
                return Err(ValidationError::new(
                    "payload",
                    format!("{} is not a relationship operation", op.op_type_name()),
                )
                .into());
            }
        };

        let mut report = RelationshipReport::new(self.buffer.expire(now));
        for (expired, waited) in &report.expired {
            warn!(operation_id = ?expired.operation_id, waited_ms = waited.as_millis() as u64, "relationship dependency timed out");
        }

        let edge = self.edges.get(&key);
        if edge.is_some_and(|e| e.has_applied(&op)) {
            return Ok(report);
        }
        let missing = match edge {
            Some(edge) => edge.missing(&op),
            None => EdgeState::new(key.clone(), op.timestamp).missing(&op),
        };
        if !missing.is_empty() {
            if !self.buffer.contains(&op.operation_id) {
                let capacity = self.buffer.capacity();
                self.buffer.push(op, now).map_err(|_| EngineError::CausalBufferFull {
                    record_id: key.source_id,
                    capacity,
                })?;
            }
            report.result = MergeResult::Buffered { missing };
            return Ok(report);
        }

        let dot = op.dot();
        self.integrate(op, &mut report);
        let mut drained = Vec::new();
        loop {
            let edges = &self.edges;
            let Some(next) = self.buffer.take_ready(|pending| match &pending.payload {
                OperationPayload::Relationship { key, .. } => match edges.get(key) {
                    Some(edge) => edge.has_applied(pending) || edge.missing(pending).is_empty(),
                    None => pending.deps.is_empty(),
                },
                _ => true,
            }) else {
                break;
            };
            let id = next.operation_id;
            if self.integrate(next, &mut report) {
                drained.push(id);
            }
        }
        report.result = MergeResult::Applied { dot, drained };
        Ok(report)
    }

    fn integrate(&mut self, op: Operation, report: &mut RelationshipReport) -> bool {
        let OperationPayload::Relationship { key, mutation } = &op.payload else {
            return false;
        };
        let violation = match mutation {
            RelationshipMutation::Create { .. } if !self.graph.contains(key) => self.violation(key),
            _ => None,
        };
        let rival = violation.as_ref().and_then(|v| self.rival(key, v));
        let edge = self
            .edges
            .entry(key.clone())
            .or_insert_with(|| EdgeState::new(key.clone(), op.timestamp));
        if edge.has_applied(&op) {
            return false;
        }
        edge.integrate(&op, mutation);
        self.clock.observe(op.lamport_clock);

        let mut held = None;
        let confirms_hold = matches!(mutation, RelationshipMutation::Create { .. })
            && edge.held.as_ref().is_some_and(|dot| op.deps.contains(dot));
        if confirms_hold || !edge.is_linked() {
            edge.held = None;
        } else if let Some(violation) = violation
            && edge.held.is_none()
        {
            warn!(%violation, actor = %op.actor_id, "remote edge breaks graph constraints, holding it");
            edge.held = Some(op.dot());
            held = Some(ConflictKind::RelationshipConstraint {
                edge: EdgeClaim {
                    key: key.clone(),
                    create_op: OpSummary {
                        operation_id: op.operation_id,
                        actor_id: op.actor_id.clone(),
                        lamport_clock: op.lamport_clock,
                    },
                },
                violation: violation.to_string(),
                rival,
            });
        }

        if edge.in_graph() {
            self.graph.link(key);
        } else {
            self.graph.unlink(key);
        }

        if edge.status() == Some(EdgeStatus::Tentative) {
            if edge.conflict.is_none()
                && let Some(kind) = held.or_else(|| edge.conflict_kind())
            {
                debug!(key = %key, kind = kind.name(), "edge needs a decision");
                report.conflicts.push(kind);
            }
        } else if let Some(id) = edge.conflict.take() {
            report.settled.push(id);
        }
        if let Some(view) = edge.view() {
            report.changed.retain(|r| r.key != view.key);
            report.changed.push(view);
        }
        report.applied.push(op);
        self.release_holds(report);
        true
    }

    /// The newest live edge taking part in `violation`, if any.
    fn rival(&self, key: &RelationshipKey, violation: &ConstraintViolation) -> Option<EdgeClaim> {
        let ty = key.relationship_type.as_str();
        let involved: Vec<RelationshipKey> = match violation {
            ConstraintViolation::Cycle { .. } => self
                .graph
                .path(key.target_id, key.source_id, ty)
                .unwrap_or_default()
                .windows(2)
                .map(|hop| RelationshipKey::new(hop[0], hop[1], ty))
                .collect(),
            ConstraintViolation::OutDegree { .. } => self
                .graph
                .outgoing(key.source_id, ty)
                .into_iter()
                .map(|target| RelationshipKey::new(key.source_id, target, ty))
                .collect(),
            _ => Vec::new(),
        };
        involved
            .iter()
            .filter_map(|k| self.edges.get(k)?.claim())
            .max_by(|a, b| a.create_op.precedence().cmp(&b.create_op.precedence()))
    }

    /// Link held edges whose constraints are satisfied again, in key order.
    fn release_holds(&mut self, report: &mut RelationshipReport) {
        let mut held: Vec<RelationshipKey> = self
            .edges
            .values()
            .filter(|e| e.held.is_some())
            .map(|e| e.key.clone())
            .collect();
        held.sort();
        for key in held {
            if self.violation(&key).is_some() {
                continue;
            }
            let Some(edge) = self.edges.get_mut(&key) else {
                continue;
            };
            debug!(key = %key, "held edge fits its constraints again");
            edge.held = None;
            if edge.in_graph() {
                self.graph.link(&key);
            }
            if edge.status() != Some(EdgeStatus::Tentative)
                && let Some(id) = edge.conflict.take()
            {
                report.settled.push(id);
            }
            if let Some(view) = edge.view() {
                report.changed.retain(|r| r.key != view.key);
                report.changed.push(view);
            }
        }
    }

    /// Remember which coordinator conflict owns a tentative edge. Returns
    /// `false` when the edge is no longer tentative or already owned.
    pub fn attach_conflict(&mut self, key: &RelationshipKey, conflict_id: ConflictId) -> bool {
        match self.edges.get_mut(key) {
            Some(edge) if edge.status() == Some(EdgeStatus::Tentative) && edge.conflict.is_none() => {
                edge.conflict = Some(conflict_id);
                true
            }
            _ => false,
        }
    }

    pub fn expire(&mut self, now: Instant) -> Vec<EngineError> {
        self.buffer
            .expire(now)
            .into_iter()
            .map(|(op, waited)| EngineError::CausalityTimeout {
                operation_id: op.operation_id,
                waited_ms: waited.as_millis() as u64,
            })
            .collect()
    }

    pub fn relationship(&self, key: &RelationshipKey) -> Option<Relationship> {
        self.edges.get(key).and_then(EdgeState::view)
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        let mut all: Vec<Relationship> = self.edges.values().filter_map(EdgeState::view).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn outgoing(&self, record_id: RecordId, relationship_type: &str) -> Vec<RecordId> {
        self.graph.outgoing(record_id, relationship_type)
    }

    pub fn incoming(&self, record_id: RecordId, relationship_type: &str) -> Vec<RecordId> {
        self.graph.incoming(record_id, relationship_type)
    }

    pub fn has_path(&self, from: RecordId, to: RecordId, relationship_type: &str) -> bool {
        self.graph.has_path(from, to, relationship_type)
    }
}

fn check_numbers(mutation: &RelationshipMutation) -> Result<(), ValidationError> {
    let value = match mutation {
        RelationshipMutation::Create { weight } | RelationshipMutation::Update { weight } => *weight,
        RelationshipMutation::Strengthen { delta } | RelationshipMutation::Weaken { delta } => *delta,
        RelationshipMutation::Delete => return Ok(()),
    };
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("weight", format!("{value} is not a finite number")))
    }
}
