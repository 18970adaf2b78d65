use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crdt::{FormatMark, LwwMap, OrSet, TextCrdt};
use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::{ActorId, OpId, RecordId};
use crate::operations::{FieldKind, FieldMutation, Operation, OperationPayload};
use crate::version_vector::VersionVector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldState {
    Text(TextCrdt),
    Set(OrSet),
    Map(LwwMap),
}

impl FieldState {
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => Self::Text(TextCrdt::new()),
            FieldKind::Set => Self::Set(OrSet::new()),
            FieldKind::Map => Self::Map(LwwMap::new()),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Set(_) => FieldKind::Set,
            Self::Map(_) => FieldKind::Map,
        }
    }

    /// Visible content only. Formatting and tombstones do not contribute.
    pub fn content_fingerprint(&self) -> String {
        match self {
            Self::Text(text) => text.visible_text(),
            Self::Set(set) => set.elements().collect::<Vec<_>>().join("\u{1f}"),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{k}={}", v.render()))
                .collect::<Vec<_>>()
                .join("\u{1f}"),
        }
    }

    pub fn as_text(&self) -> Option<&TextCrdt> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// One causal gap: `actor` must reach `seq` before the operation can apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    pub actor: ActorId,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub version_vector: VersionVector,
    pub fields: BTreeMap<String, FieldState>,
    pub created_at: Hlc,
    pub updated_at: Hlc,
    /// Highest lamport clock integrated so far.
    pub lamport: u64,
    applied_ops: BTreeSet<OpId>,
}

impl Record {
    pub fn new(id: RecordId, created_at: Hlc) -> Self {
        Self {
            id,
            version_vector: VersionVector::new(),
            fields: BTreeMap::new(),
            created_at,
            updated_at: created_at,
            lamport: 0,
            applied_ops: BTreeSet::new(),
        }
    }

    pub fn has_operation(&self, operation_id: &OpId) -> bool {
        self.applied_ops.contains(operation_id)
    }

    pub fn has_applied(&self, op: &Operation) -> bool {
        self.applied_ops.contains(&op.operation_id) || self.version_vector.contains(&op.dot())
    }

    /// Dependencies of `op` not yet integrated. Empty means ready. `deps`
    /// carries the actor's own previous sequence number, so in-order delivery
    /// per actor is covered too.
    pub fn missing_dependencies(&self, op: &Operation) -> Vec<MissingDependency> {
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

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(FieldState::as_text)
            .map(TextCrdt::visible_text)
    }

    /// Merge a field operation. Returns `false` for an operation already
    /// integrated. The caller is responsible for causal readiness.
    pub fn integrate(&mut self, op: &Operation) -> Result<bool, CoreError> {
        if self.has_applied(op) {
            return Ok(false);
        }
        let OperationPayload::Field { field, mutation } = &op.payload else {
            return Err(CoreError::InvalidData(format!(
                "{} is not a field operation",
                op.op_type_name()
            )));
        };
        self.apply_mutation(op, field, mutation)?;

        self.version_vector.observe(&op.actor_id, op.dot().seq);
        self.applied_ops.insert(op.operation_id);
        self.lamport = self.lamport.max(op.lamport_clock);
        self.updated_at = self.updated_at.max(op.timestamp);
        Ok(true)
    }

    fn apply_mutation(
        &mut self,
        op: &Operation,
        field: &str,
        mutation: &FieldMutation,
    ) -> Result<(), CoreError> {
        let kind = mutation.kind();
        let created = match self.fields.get(field) {
            Some(existing) if existing.kind() != kind => {
                return Err(CoreError::FieldTypeMismatch {
                    field: field.to_string(),
                    expected: existing.kind().as_str(),
                    found: kind.as_str(),
                });
            }
            Some(_) => false,
            None => {
                self.fields.insert(field.to_string(), FieldState::empty(kind));
                true
            }
        };
        let result = match self.fields.get_mut(field) {
            Some(state) => apply_to_state(state, field, op, mutation),
            None => Err(CoreError::InvalidData(format!("field {field} vanished"))),
        };
        if result.is_err() && created {
            self.fields.remove(field);
        }
        result
    }

    /// blake3 over field names and visible content, hex encoded. Drives
    /// vector staleness detection.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (name, state) in &self.fields {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(state.kind().as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(state.content_fingerprint().as_bytes());
            hasher.update(&[0x1e]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Text handed to the embedding provider.
    pub fn embedding_input(&self) -> String {
        self.fields
            .iter()
            .map(|(name, state)| format!("{name}: {}", state.content_fingerprint()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn apply_to_state(
    state: &mut FieldState,
    field: &str,
    op: &Operation,
    mutation: &FieldMutation,
) -> Result<(), CoreError> {
    let actor = &op.actor_id;
    let lamport = op.lamport_clock;
    match (state, mutation) {
        (
            FieldState::Text(text),
            FieldMutation::TextInsert {
                origin_left,
                origin_right,
                content,
            },
        ) => {
            text.insert_run(lamport, actor, origin_left.clone(), origin_right.clone(), content)?;
        }
        (FieldState::Text(text), FieldMutation::TextDelete { targets }) => {
            text.delete(targets)?;
        }
        (
            FieldState::Text(text),
            FieldMutation::TextFormat {
                start,
                end,
                attribute,
                value,
            },
        ) => {
            text.add_mark(FormatMark {
                mark_id: op.operation_id,
                start: start.clone(),
                end: end.clone(),
                attribute: attribute.clone(),
                value: value.clone(),
                lamport,
                actor: actor.clone(),
            })?;
        }
        (
            FieldState::Text(text),
            FieldMutation::TextReplace {
                targets,
                origin_left,
                origin_right,
                content,
            },
        ) => {
            for origin in origin_left.iter().chain(origin_right.iter()) {
                if !text.contains(origin) {
                    return Err(CoreError::InvalidPosition(format!(
                        "unknown replace origin {}:{}",
                        origin.lamport, origin.actor
                    )));
                }
            }
            text.delete(targets)?;
            text.insert_run(lamport, actor, origin_left.clone(), origin_right.clone(), content)?;
        }
        (FieldState::Set(set), FieldMutation::SetAdd { element }) => {
            set.add(element, op.dot());
        }
        (FieldState::Set(set), FieldMutation::SetRemove { element, observed }) => {
            set.remove(element, observed);
        }
        (FieldState::Map(map), FieldMutation::MapPut { key, value }) => {
            map.put(key, value.clone(), lamport, actor);
        }
        (FieldState::Map(map), FieldMutation::MapRemove { key }) => {
            map.remove(key, lamport, actor);
        }
        (state, mutation) => {
            return Err(CoreError::FieldTypeMismatch {
                field: field.to_string(),
                expected: state.kind().as_str(),
                found: mutation.kind().as_str(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Dot;

    fn op(actor: &str, deps: &VersionVector, lamport: u64, field: &str, mutation: FieldMutation) -> Operation {
        Operation {
            operation_id: OpId::new(),
            actor_id: ActorId::from(actor),
            lamport_clock: lamport,
            deps: deps.clone(),
            timestamp: Hlc::new(lamport, 0),
            payload: OperationPayload::Field {
                field: field.into(),
                mutation,
            },
        }
    }

    fn insert(content: &str) -> FieldMutation {
        FieldMutation::TextInsert {
            origin_left: None,
            origin_right: None,
            content: content.into(),
        }
    }

    #[test]
    fn integrate_bumps_version_vector_once() {
        let mut record = Record::new(RecordId::new(), Hlc::default());
        let o = op("alice", &VersionVector::new(), 1, "title", insert("hi"));
        assert!(record.integrate(&o).unwrap());
        assert!(!record.integrate(&o).unwrap());
        assert_eq!(record.version_vector.get(&ActorId::from("alice")), 1);
        assert_eq!(record.text("title").as_deref(), Some("hi"));
    }

    #[test]
    fn type_mismatch_rejected_without_mutation() {
        let mut record = Record::new(RecordId::new(), Hlc::default());
        let o = op("alice", &VersionVector::new(), 1, "title", insert("hi"));
        record.integrate(&o).unwrap();
        let before = record.clone();
        let bad = op(
            "bob",
            &VersionVector::new(),
            2,
            "title",
            FieldMutation::SetAdd { element: "x".into() },
        );
        assert!(matches!(
            record.integrate(&bad),
            Err(CoreError::FieldTypeMismatch { ref field, .. }) if field == "title"
        ));
        assert_eq!(record, before);
    }

    #[test]
    fn mismatched_state_names_the_field() {
        let mut state = FieldState::empty(FieldKind::Set);
        let o = op("alice", &VersionVector::new(), 1, "tags", insert("hi"));
        let err = apply_to_state(&mut state, "tags", &o, &insert("hi")).unwrap_err();
        match err {
            CoreError::FieldTypeMismatch { field, expected, found } => {
                assert_eq!(field, "tags");
                assert_eq!(expected, FieldKind::Set.as_str());
                assert_eq!(found, FieldKind::Text.as_str());
            }
            other => panic!("expected a type mismatch, got {other:?}"),
        }
    }

    #[test]
    fn failed_first_write_leaves_no_field() {
        let mut record = Record::new(RecordId::new(), Hlc::default());
        let dangling = FieldMutation::TextInsert {
            origin_left: Some(crate::crdt::CharId::new(9, ActorId::from("ghost"), 0)),
            origin_right: None,
            content: "x".into(),
        };
        let o = op("alice", &VersionVector::new(), 1, "body", dangling);
        assert!(record.integrate(&o).is_err());
        assert!(record.field("body").is_none());
        assert!(record.version_vector.is_empty());
    }

    #[test]
    fn missing_dependencies_reports_gaps() {
        let record = Record::new(RecordId::new(), Hlc::default());
        let mut deps = VersionVector::new();
        deps.observe(&ActorId::from("bob"), 2);
        deps.observe(&ActorId::from("alice"), 1);
        let o = op("alice", &deps, 4, "tags", FieldMutation::SetAdd { element: "a".into() });
        let missing = record.missing_dependencies(&o);
        assert_eq!(missing.len(), 2);
        assert!(missing.contains(&MissingDependency {
            actor: ActorId::from("bob"),
            seq: 2
        }));
    }

    #[test]
    fn content_hash_ignores_formatting() {
        let mut record = Record::new(RecordId::new(), Hlc::default());
        let first = op("alice", &VersionVector::new(), 1, "title", insert("hey"));
        record.integrate(&first).unwrap();
        let hash = record.content_hash();
        let ids = record.fields["title"].as_text().unwrap().ids_in_range(0, 3).unwrap();
        let mut deps = VersionVector::new();
        deps.observe(&ActorId::from("alice"), 1);
        let format = op(
            "alice",
            &deps,
            2,
            "title",
            FieldMutation::TextFormat {
                start: ids[0].clone(),
                end: ids[2].clone(),
                attribute: "bold".into(),
                value: Some("true".into()),
            },
        );
        record.integrate(&format).unwrap();
        assert_eq!(record.content_hash(), hash);
        assert_eq!(record.version_vector.get(&ActorId::from("alice")), 2);
    }

    #[test]
    fn set_tags_are_operation_dots() {
        let mut record = Record::new(RecordId::new(), Hlc::default());
        let o = op("carol", &VersionVector::new(), 1, "tags", FieldMutation::SetAdd { element: "x".into() });
        record.integrate(&o).unwrap();
        let FieldState::Set(set) = &record.fields["tags"] else {
            panic!("expected set");
        };
        assert_eq!(set.tags("x").into_iter().collect::<Vec<_>>(), vec![Dot::new(ActorId::from("carol"), 1)]);
    }
}
