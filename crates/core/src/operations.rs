use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crdt::CharId;
use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::hlc::Hlc;
use crate::ids::*;
use crate::relationship::RelationshipKey;
use crate::version_vector::VersionVector;

/// Storage shape a field mutation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Set,
    Map,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Set => "set",
            Self::Map => "map",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldMutation {
    TextInsert {
        origin_left: Option<CharId>,
        origin_right: Option<CharId>,
        content: String,
    },
    TextDelete {
        targets: Vec<CharId>,
    },
    TextFormat {
        start: CharId,
        end: CharId,
        attribute: String,
        value: Option<String>,
    },
    TextReplace {
        targets: Vec<CharId>,
        origin_left: Option<CharId>,
        origin_right: Option<CharId>,
        content: String,
    },
    SetAdd {
        element: String,
    },
    SetRemove {
        element: String,
        observed: BTreeSet<Dot>,
    },
    MapPut {
        key: String,
        value: FieldValue,
    },
    MapRemove {
        key: String,
    },
}

impl FieldMutation {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::TextInsert { .. }
            | Self::TextDelete { .. }
            | Self::TextFormat { .. }
            | Self::TextReplace { .. } => FieldKind::Text,
            Self::SetAdd { .. } | Self::SetRemove { .. } => FieldKind::Set,
            Self::MapPut { .. } | Self::MapRemove { .. } => FieldKind::Map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationshipMutation {
    Create { weight: f64 },
    Update { weight: f64 },
    Delete,
    Strengthen { delta: f64 },
    Weaken { delta: f64 },
}

impl RelationshipMutation {
    /// Create and Delete change whether the edge exists.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Create { .. } | Self::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VectorMutation {
    /// Auxiliary per-actor embedding; never blended into the primary vector.
    StakeholderContribution { vector: Vec<f32>, weight: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationPayload {
    Field {
        field: String,
        mutation: FieldMutation,
    },
    Relationship {
        key: RelationshipKey,
        mutation: RelationshipMutation,
    },
    Vector(VectorMutation),
}

impl OperationPayload {
    /// String name of the operation type for storage/indexing.
    pub fn op_type_name(&self) -> &'static str {
        match self {
            Self::Field { mutation, .. } => match mutation {
                FieldMutation::TextInsert { .. } => "TextInsert",
                FieldMutation::TextDelete { .. } => "TextDelete",
                FieldMutation::TextFormat { .. } => "TextFormat",
                FieldMutation::TextReplace { .. } => "TextReplace",
                FieldMutation::SetAdd { .. } => "SetAdd",
                FieldMutation::SetRemove { .. } => "SetRemove",
                FieldMutation::MapPut { .. } => "MapPut",
                FieldMutation::MapRemove { .. } => "MapRemove",
            },
            Self::Relationship { mutation, .. } => match mutation {
                RelationshipMutation::Create { .. } => "RelationshipCreate",
                RelationshipMutation::Update { .. } => "RelationshipUpdate",
                RelationshipMutation::Delete => "RelationshipDelete",
                RelationshipMutation::Strengthen { .. } => "RelationshipStrengthen",
                RelationshipMutation::Weaken { .. } => "RelationshipWeaken",
            },
            Self::Vector(VectorMutation::StakeholderContribution { .. }) => "StakeholderContribution",
        }
    }
}

/// An operation against one record. `deps` is the version vector the
/// operation was generated against; the operation itself is the next
/// entry for `actor_id` on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OpId,
    pub actor_id: ActorId,
    pub lamport_clock: u64,
    pub deps: VersionVector,
    pub timestamp: Hlc,
    pub payload: OperationPayload,
}

impl Operation {
    pub fn dot(&self) -> Dot {
        Dot::new(self.actor_id.clone(), self.deps.get(&self.actor_id) + 1)
    }

    /// `self` is part of the history `other` was generated against.
    pub fn happened_before(&self, other: &Operation) -> bool {
        other.deps.contains(&self.dot())
    }

    pub fn is_concurrent_with(&self, other: &Operation) -> bool {
        !self.happened_before(other) && !other.happened_before(self)
    }

    /// Total order used wherever concurrent operations need a deterministic
    /// winner.
    pub fn precedence(&self) -> (u64, &ActorId, &OpId) {
        (self.lamport_clock, &self.actor_id, &self.operation_id)
    }

    pub fn op_type_name(&self) -> &'static str {
        self.payload.op_type_name()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
