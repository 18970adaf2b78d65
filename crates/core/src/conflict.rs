use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::{ActorId, ConflictId, OpId, RecordId, Signature};
use crate::relationship::RelationshipKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    FieldCrdt,
    FieldOperation,
    Relationship,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Detected,
    Analyzing,
    Resolved,
    Escalated,
}

impl ConflictStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// Concrete write-back a resolution performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    KeepRelationship,
    RemoveRelationship,
    /// Drop the competing edge a constraint conflict names.
    RemoveRivalRelationship,
    KeepLocalVector,
    TakeIncomingVector,
    RegenerateVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Keeps both sides' intent.
    Merge,
    /// One side wins by precedence.
    Overwrite,
    /// Explicit human decision.
    Manual(Decision),
}

impl ResolutionStrategy {
    /// Lower ranks are preferred.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Merge => 0,
            Self::Overwrite => 1,
            Self::Manual(_) => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Overwrite => "overwrite",
            Self::Manual(_) => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual(decision) => write!(f, "manual({decision:?})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSummary {
    pub operation_id: OpId,
    pub actor_id: ActorId,
    pub lamport_clock: u64,
}

impl OpSummary {
    pub fn precedence(&self) -> (u64, &ActorId, &OpId) {
        (self.lamport_clock, &self.actor_id, &self.operation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSummary {
    pub content_hash: String,
    pub embedding_model: String,
    pub generation_timestamp: Hlc,
    pub consistency_checksum: String,
}

/// An edge and the create that brought it into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeClaim {
    pub key: RelationshipKey,
    pub create_op: OpSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    RelationshipCreateDelete {
        key: RelationshipKey,
        create_op: OpSummary,
        delete_op: OpSummary,
    },
    /// A remote create that breaks its type's graph constraints once merged.
    /// `rival` is the newest existing edge taking part in the violation.
    RelationshipConstraint {
        edge: EdgeClaim,
        violation: String,
        rival: Option<EdgeClaim>,
    },
    VectorSync {
        record_id: RecordId,
        local: VectorSummary,
        incoming: VectorSummary,
    },
}

impl ConflictKind {
    pub fn components(&self) -> Vec<Component> {
        match self {
            Self::RelationshipCreateDelete { .. } | Self::RelationshipConstraint { .. } => {
                vec![Component::Relationship]
            }
            Self::VectorSync { .. } => vec![Component::Vector, Component::FieldCrdt],
        }
    }

    /// Every automatic outcome loses data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::RelationshipCreateDelete { .. } | Self::RelationshipConstraint { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RelationshipCreateDelete { .. } => "relationship_create_delete",
            Self::RelationshipConstraint { .. } => "relationship_constraint",
            Self::VectorSync { .. } => "vector_sync",
        }
    }
}

/// A conflict as handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// Set by a per-record manual override; analysis never auto-resolves.
    pub requires_manual: bool,
    pub detected_at: Hlc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub decision: Decision,
    pub state_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub kind: ConflictKind,
    pub components_involved: Vec<Component>,
    pub candidate_resolutions: Vec<ResolutionStrategy>,
    pub chosen_strategy: Option<ResolutionStrategy>,
    pub outcome: Option<Outcome>,
    pub status: ConflictStatus,
    pub requires_manual: bool,
    pub detected_at: Hlc,
    pub audit_timestamp: Option<Hlc>,
}

/// One link of the hash-chained audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub decision: Decision,
    pub state_hash: String,
    pub audit_timestamp: Hlc,
    pub previous_hash: String,
    pub entry_hash: String,
    pub signer: [u8; 32],
    pub signature: Signature,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    sequence: u64,
    conflict_id: &'a ConflictId,
    strategy: &'a ResolutionStrategy,
    decision: &'a Decision,
    state_hash: &'a str,
    audit_timestamp: &'a Hlc,
    previous_hash: &'a str,
}

impl AuditEntry {
    /// Canonical bytes covered by both `entry_hash` and `signature`.
    pub fn signing_bytes(
        sequence: u64,
        conflict_id: &ConflictId,
        strategy: &ResolutionStrategy,
        decision: &Decision,
        state_hash: &str,
        audit_timestamp: &Hlc,
        previous_hash: &str,
    ) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(&SignedFields {
            sequence,
            conflict_id,
            strategy,
            decision,
            state_hash,
            audit_timestamp,
            previous_hash,
        })
        .map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn own_signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Self::signing_bytes(
            self.sequence,
            &self.conflict_id,
            &self.strategy,
            &self.decision,
            &self.state_hash,
            &self.audit_timestamp,
            &self.previous_hash,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_orders_merge_first() {
        let mut strategies = vec![
            ResolutionStrategy::Manual(Decision::KeepRelationship),
            ResolutionStrategy::Overwrite,
            ResolutionStrategy::Merge,
        ];
        strategies.sort_by_key(ResolutionStrategy::rank);
        assert_eq!(strategies[0], ResolutionStrategy::Merge);
        assert_eq!(strategies[2].name(), "manual");
    }

    #[test]
    fn signing_bytes_change_with_state_hash() {
        let id = ConflictId::new();
        let ts = Hlc::new(10, 0);
        let a = AuditEntry::signing_bytes(0, &id, &ResolutionStrategy::Merge, &Decision::RegenerateVector, "aa", &ts, "")
            .unwrap();
        let b = AuditEntry::signing_bytes(0, &id, &ResolutionStrategy::Merge, &Decision::RegenerateVector, "ab", &ts, "")
            .unwrap();
        assert_ne!(a, b);
    }
}
