//! Arbitration of conflicts no single component can settle on its own.
//!
//! Lifecycle: `Detected -> Analyzing -> {Resolved, Escalated}`. Analysis
//! ranks the viable strategies (merge before overwrite before manual) and
//! picks the best automatic one; anything that needs a human stays
//! `Escalated` until `resolve` is called with an explicit strategy.

pub mod audit;

use std::collections::BTreeMap;
use std::sync::Arc;

use concord_core::{
    AuditEntry, Conflict, ConflictId, ConflictKind, ConflictRecord, ConflictStatus, CoreError,
    Decision, HlcClock, Outcome, ResolutionStrategy, SigningIdentity,
};
use concord_storage::{DurableStore, StorageError};
use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub use audit::{AuditTrail, verify_trail};

use crate::config::ConflictConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("unknown conflict {0:?}")]
    NotFound(ConflictId),

    #[error("conflict {0:?} is already resolved")]
    AlreadyResolved(ConflictId),

    #[error("{strategy} does not apply to a {kind} conflict")]
    StrategyNotApplicable {
        strategy: ResolutionStrategy,
        kind: &'static str,
    },

    #[error("audit trail broken at entry {sequence}: {reason}")]
    AuditBroken { sequence: u64, reason: String },

    #[error("write-back failed: {0}")]
    WriteBack(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Carries a decision back into the component that owns the conflicting
/// state. Returns a hash of the resulting state for the audit trail.
pub trait ResolutionSink {
    fn apply_decision(
        &self,
        kind: &ConflictKind,
        decision: Decision,
    ) -> Result<String, ConflictError>;
}

pub struct ConflictResolutionCoordinator {
    conflicts: Mutex<BTreeMap<ConflictId, ConflictRecord>>,
    audit: Mutex<AuditTrail>,
    /// Serialises write-backs so a conflict is never applied twice. A
    /// write-back may settle conflicts it uncovers on the same thread.
    resolving: ReentrantMutex<()>,
    auto_resolve_destructive: bool,
    clock: Arc<Mutex<HlcClock>>,
}

impl ConflictResolutionCoordinator {
    pub fn new(
        config: &ConflictConfig,
        identity: SigningIdentity,
        durable: Arc<dyn DurableStore>,
        retry: RetryPolicy,
        clock: Arc<Mutex<HlcClock>>,
    ) -> Result<Self, ConflictError> {
        Ok(Self {
            conflicts: Mutex::new(BTreeMap::new()),
            audit: Mutex::new(AuditTrail::load(identity, durable, retry)?),
            resolving: ReentrantMutex::new(()),
            auto_resolve_destructive: config.auto_resolve_destructive,
            clock,
        })
    }

    /// Every strategy that could settle `kind`, best first.
    pub fn candidates(kind: &ConflictKind) -> Vec<ResolutionStrategy> {
        let mut candidates = match kind {
            ConflictKind::RelationshipCreateDelete { .. } => vec![
                ResolutionStrategy::Overwrite,
                ResolutionStrategy::Manual(Decision::KeepRelationship),
                ResolutionStrategy::Manual(Decision::RemoveRelationship),
            ],
            ConflictKind::RelationshipConstraint { rival, .. } => {
                let mut candidates = vec![
                    ResolutionStrategy::Overwrite,
                    ResolutionStrategy::Manual(Decision::KeepRelationship),
                    ResolutionStrategy::Manual(Decision::RemoveRelationship),
                ];
                if rival.is_some() {
                    candidates.push(ResolutionStrategy::Manual(Decision::RemoveRivalRelationship));
                }
                candidates
            }
            ConflictKind::VectorSync { local, incoming, .. } => {
                let mut candidates = Vec::new();
                if local.content_hash != incoming.content_hash {
                    candidates.push(ResolutionStrategy::Merge);
                }
                candidates.extend([
                    ResolutionStrategy::Overwrite,
                    ResolutionStrategy::Manual(Decision::KeepLocalVector),
                    ResolutionStrategy::Manual(Decision::TakeIncomingVector),
                    ResolutionStrategy::Manual(Decision::RegenerateVector),
                ]);
                candidates
            }
        };
        candidates.sort_by_key(ResolutionStrategy::rank);
        candidates
    }

    fn automatic_choice(&self, conflict: &Conflict, candidates: &[ResolutionStrategy]) -> Option<ResolutionStrategy> {
        if conflict.requires_manual {
            return None;
        }
        candidates.iter().copied().find(|strategy| match strategy {
            ResolutionStrategy::Manual(_) => false,
            _ if conflict.kind.is_destructive() => self.auto_resolve_destructive,
            _ => true,
        })
    }

    /// The concrete write-back `strategy` implies for `kind`.
    pub fn decision_for(
        kind: &ConflictKind,
        strategy: ResolutionStrategy,
    ) -> Result<Decision, ConflictError> {
        let not_applicable = || ConflictError::StrategyNotApplicable {
            strategy,
            kind: kind.name(),
        };
        match (kind, strategy) {
            (
                ConflictKind::RelationshipCreateDelete {
                    create_op,
                    delete_op,
                    ..
                },
                ResolutionStrategy::Overwrite,
            ) => Ok(if create_op.precedence() > delete_op.precedence() {
                Decision::KeepRelationship
            } else {
                Decision::RemoveRelationship
            }),
            (
                ConflictKind::RelationshipCreateDelete { .. } | ConflictKind::RelationshipConstraint { .. },
                ResolutionStrategy::Manual(d @ (Decision::KeepRelationship | Decision::RemoveRelationship)),
            ) => Ok(d),
            // The newer of the two contested edges gives way.
            (ConflictKind::RelationshipConstraint { edge, rival, .. }, ResolutionStrategy::Overwrite) => {
                Ok(match rival {
                    Some(rival) if rival.create_op.precedence() > edge.create_op.precedence() => {
                        Decision::RemoveRivalRelationship
                    }
                    _ => Decision::RemoveRelationship,
                })
            }
            (
                ConflictKind::RelationshipConstraint { rival: Some(_), .. },
                ResolutionStrategy::Manual(Decision::RemoveRivalRelationship),
            ) => Ok(Decision::RemoveRivalRelationship),
            (ConflictKind::VectorSync { local, incoming, .. }, ResolutionStrategy::Merge)
                if local.content_hash != incoming.content_hash =>
            {
                Ok(Decision::RegenerateVector)
            }
            (ConflictKind::VectorSync { local, incoming, .. }, ResolutionStrategy::Overwrite) => {
                Ok(if incoming.generation_timestamp > local.generation_timestamp {
                    Decision::TakeIncomingVector
                } else {
                    Decision::KeepLocalVector
                })
            }
            (
                ConflictKind::VectorSync { .. },
                ResolutionStrategy::Manual(
                    d @ (Decision::KeepLocalVector
                    | Decision::TakeIncomingVector
                    | Decision::RegenerateVector),
                ),
            ) => Ok(d),
            _ => Err(not_applicable()),
        }
    }

    /// Register and analyse a conflict. It ends up `Analyzing` when an
    /// automatic strategy is available (apply it with `settle`), otherwise
    /// `Escalated`.
    #[instrument(skip_all, fields(kind = conflict.kind.name()))]
    pub fn submit(&self, conflict: Conflict) -> ConflictId {
        let conflict_id = ConflictId::new();
        let candidate_resolutions = Self::candidates(&conflict.kind);
        let automatic = self.automatic_choice(&conflict, &candidate_resolutions);
        let status = if automatic.is_some() {
            ConflictStatus::Analyzing
        } else {
            ConflictStatus::Escalated
        };
        info!(?conflict_id, ?status, "conflict submitted");
        self.conflicts.lock().insert(
            conflict_id,
            ConflictRecord {
                conflict_id,
                components_involved: conflict.kind.components(),
                kind: conflict.kind,
                candidate_resolutions,
                chosen_strategy: automatic,
                outcome: None,
                status,
                requires_manual: conflict.requires_manual,
                detected_at: conflict.detected_at,
                audit_timestamp: None,
            },
        );
        conflict_id
    }

    /// Apply the automatic strategy chosen during analysis. `None` when the
    /// conflict is escalated or already resolved.
    pub fn settle(
        &self,
        conflict_id: ConflictId,
        sink: &dyn ResolutionSink,
    ) -> Result<Option<Outcome>, ConflictError> {
        let planned = {
            let conflicts = self.conflicts.lock();
            let record = conflicts
                .get(&conflict_id)
                .ok_or(ConflictError::NotFound(conflict_id))?;
            match (record.status, record.chosen_strategy) {
                (ConflictStatus::Analyzing, Some(strategy)) => strategy,
                _ => return Ok(None),
            }
        };
        self.resolve(conflict_id, planned, sink).map(Some)
    }

    #[instrument(skip(self, sink))]
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        sink: &dyn ResolutionSink,
    ) -> Result<Outcome, ConflictError> {
        let _serial = self.resolving.lock();
        let kind = {
            let conflicts = self.conflicts.lock();
            let record = conflicts
                .get(&conflict_id)
                .ok_or(ConflictError::NotFound(conflict_id))?;
            if record.status.is_terminal() {
                return Err(ConflictError::AlreadyResolved(conflict_id));
            }
            record.kind.clone()
        };
        let decision = Self::decision_for(&kind, strategy)?;
        let state_hash = sink.apply_decision(&kind, decision)?;
        let audit_timestamp = self.clock.lock().tick()?;
        self.audit.lock().append(
            conflict_id,
            strategy,
            decision,
            state_hash.clone(),
            audit_timestamp,
        )?;

        let outcome = Outcome {
            conflict_id,
            strategy,
            decision,
            state_hash,
        };
        if let Some(record) = self.conflicts.lock().get_mut(&conflict_id) {
            record.status = ConflictStatus::Resolved;
            record.chosen_strategy = Some(strategy);
            record.outcome = Some(outcome.clone());
            record.audit_timestamp = Some(audit_timestamp);
        }
        info!(?conflict_id, %strategy, ?decision, "conflict resolved");
        Ok(outcome)
    }

    /// Another replica's resolution already reached this one.
    pub fn mark_resolved_remotely(&self, conflict_id: ConflictId) {
        match self.conflicts.lock().get_mut(&conflict_id) {
            Some(record) if !record.status.is_terminal() => {
                info!(?conflict_id, "conflict settled by a remote resolution");
                record.status = ConflictStatus::Resolved;
            }
            Some(_) => {}
            None => warn!(?conflict_id, "remote resolution for unknown conflict"),
        }
    }

    pub fn get(&self, conflict_id: ConflictId) -> Option<ConflictRecord> {
        self.conflicts.lock().get(&conflict_id).cloned()
    }

    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn audit_entries(&self, conflict_id: ConflictId) -> Vec<AuditEntry> {
        self.audit.lock().entries_for(conflict_id)
    }

    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().entries().to_vec()
    }

    pub fn verify_audit(&self) -> Result<(), ConflictError> {
        self.audit.lock().verify()
    }
}
