use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::ids::{OpId, RecordId};
use crate::version_vector::VersionVector;

/// Directed, typed edge identity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source_id: RecordId,
    pub target_id: RecordId,
    pub relationship_type: String,
}

impl RelationshipKey {
    pub fn new(source_id: RecordId, target_id: RecordId, relationship_type: impl Into<String>) -> Self {
        Self {
            source_id,
            target_id,
            relationship_type: relationship_type.into(),
        }
    }

    pub fn is_self_reference(&self) -> bool {
        self.source_id == self.target_id
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} -[{}]-> {:?}",
            self.source_id, self.relationship_type, self.target_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeStatus {
    Active,
    Deleted,
    /// Concurrent create/delete awaiting a coordinator decision.
    Tentative,
}

/// Point-in-time view of one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub key: RelationshipKey,
    pub weight: f64,
    pub status: EdgeStatus,
    pub operation_history: Vec<OpId>,
    /// Every operation applied to this edge, as a version vector.
    pub version_vector: VersionVector,
    pub updated_at: Hlc,
}

impl Relationship {
    pub fn is_live(&self) -> bool {
        self.status == EdgeStatus::Active
    }
}

pub fn clamp_weight(weight: f64) -> f64 {
    if weight.is_nan() {
        0.0
    } else {
        weight.clamp(0.0, 1.0)
    }
}
