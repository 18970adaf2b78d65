//! External operation shapes. Field names are part of the contract with the
//! gateway layer and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crdt::Attributes;
use crate::ids::{ActorId, OpId, RecordId};
use crate::vector::VectorState;
use crate::version_vector::VersionVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringOperationType {
    Insert,
    Delete,
}

/// Plain-text edit at a visible position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringOperation {
    #[serde(rename = "type")]
    pub op_type: StringOperationType,
    pub position: usize,
    /// Inserted text, or the text being removed for a delete.
    pub content: String,
    pub actor_id: ActorId,
    /// Wall-clock milliseconds at the editing client.
    pub timestamp: u64,
    pub lamport_clock: u64,
}

impl StringOperation {
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperationType {
    Insert,
    Delete,
    Format,
    Replace,
}

/// Content rule attached to a field edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum ValidationRuleSpec {
    MaxLength(usize),
    MinLength(usize),
    Pattern(String),
    ForbiddenPattern(String),
    NonEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOperation {
    pub operation_id: OpId,
    pub field_path: String,
    pub operation_type: FieldOperationType,
    pub operation_data: serde_json::Value,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRuleSpec>,
}

/// `operation_data` for `insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertData {
    pub position: usize,
    pub text: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// `operation_data` for `delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteData {
    pub position: usize,
    pub length: usize,
}

/// `operation_data` for `format`. A `null` value clears the attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatData {
    pub position: usize,
    pub length: usize,
    pub attributes: BTreeMap<String, Option<String>>,
}

/// `operation_data` for `replace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceData {
    pub position: usize,
    pub length: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipOperationKind {
    Create,
    Update,
    Delete,
    Strengthen,
    Weaken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationContext {
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    /// Edge history the client had seen; defaults to everything local.
    #[serde(default)]
    pub base_version: Option<VersionVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipOperation {
    pub operation_id: OpId,
    pub relationship_type: String,
    pub source_memory_id: RecordId,
    pub target_memory_id: RecordId,
    pub operation: RelationshipOperationKind,
    #[serde(default)]
    pub transformation_context: TransformationContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyMetadata {
    pub source_replica: ActorId,
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConsistencyState {
    pub memory_id: RecordId,
    pub vector_state: VectorState,
    pub consistency_metadata: ConsistencyMetadata,
}
