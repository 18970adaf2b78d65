//! Operational transform for rich-text field edits.
//!
//! Edits arrive in visible-position form (wire `FieldOperation` or
//! `StringOperation`), are rebased over whatever the editor had not yet seen,
//! validated against the text they would produce, then lowered to CRDT
//! mutations that reference stable character ids.

pub mod delta;
pub mod history;
pub mod validate;

use std::collections::BTreeMap;

use concord_core::wire::{
    DeleteData, FieldOperation, FieldOperationType, FormatData, InsertData, ReplaceData,
    StringOperation, StringOperationType, ValidationRuleSpec,
};
use concord_core::{ActorId, Attributes, FieldMutation, TextCrdt, VersionVector};
use serde::de::DeserializeOwned;
use tracing::debug;

pub use delta::{AttributePatch, DeltaOp, RichText, TextDelta};
pub use history::{FieldHistory, HistoryEntry, diff_ids};
pub use validate::{ValidationRule, validate};

use crate::config::EngineConfig;
use crate::error::ValidationError;

/// A CRDT mutation planned from a delta. Formatting of freshly inserted text
/// refers to the insert by index because its character ids only exist once
/// the insert has been stamped with a lamport clock.
#[derive(Debug, Clone, PartialEq)]
pub enum LoweredEdit {
    Mutation(FieldMutation),
    FormatInserted {
        insert_index: usize,
        len: usize,
        attribute: String,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct FieldOperationEngine {
    field_rules: BTreeMap<String, Vec<ValidationRuleSpec>>,
    history_limit: usize,
}

impl FieldOperationEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            field_rules: config.field_rules.clone(),
            history_limit: config.ot.history_limit,
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Adjust `op1` as if `op2` had already been applied.
    pub fn transform(op1: &TextDelta, op2: &TextDelta, op1_first: bool) -> TextDelta {
        op1.transform(op2, op1_first)
    }

    /// Check the configured rules for `field` plus `extra`.
    pub fn validate(
        &self,
        field: &str,
        resulting_text: &str,
        extra: &[ValidationRuleSpec],
    ) -> Result<(), ValidationError> {
        let configured = self.field_rules.get(field).map(Vec::as_slice).unwrap_or_default();
        validate(resulting_text, configured)?;
        validate(resulting_text, extra)
    }

    pub fn delta_from_field_operation(op: &FieldOperation) -> Result<TextDelta, ValidationError> {
        let delta = match op.operation_type {
            FieldOperationType::Insert => {
                let data: InsertData = parse_data(op)?;
                TextDelta::new().retain(data.position).insert(&data.text, data.attributes)
            }
            FieldOperationType::Delete => {
                let data: DeleteData = parse_data(op)?;
                TextDelta::new().retain(data.position).delete(data.length)
            }
            FieldOperationType::Format => {
                let data: FormatData = parse_data(op)?;
                TextDelta::new().retain(data.position).format(data.length, data.attributes)
            }
            FieldOperationType::Replace => {
                let data: ReplaceData = parse_data(op)?;
                let removal = TextDelta::new().retain(data.position).delete(data.length);
                let insertion = TextDelta::new()
                    .retain(data.position)
                    .insert(&data.text, Attributes::new());
                removal.compose(&insertion)
            }
        };
        if delta.is_noop() {
            return Err(ValidationError::new("operation_data", "edit has no effect"));
        }
        Ok(delta)
    }

    pub fn delta_from_string_operation(op: &StringOperation) -> Result<TextDelta, ValidationError> {
        let delta = match op.op_type {
            StringOperationType::Insert => TextDelta::new()
                .retain(op.position)
                .insert(&op.content, Attributes::new()),
            StringOperationType::Delete => TextDelta::new().retain(op.position).delete(op.char_len()),
        };
        if delta.is_noop() {
            return Err(ValidationError::new("content", "edit has no effect"));
        }
        Ok(delta)
    }

    /// Transform `delta`, generated against `base`, so it applies to the
    /// current `text`. The view at `base` is rebuilt from character ids and
    /// the edit is transformed once past the exact difference to the current
    /// sequence.
    pub fn rebase(
        &self,
        delta: TextDelta,
        history: Option<&FieldHistory>,
        base: &VersionVector,
        text: &TextCrdt,
    ) -> Result<TextDelta, ValidationError> {
        let Some(history) = history else {
            return Ok(delta);
        };
        let unseen = history.unseen_by(base)?.len();
        if unseen == 0 {
            return Ok(delta);
        }
        let seen = history.view_at(text, base)?;
        if delta.base_len() > seen.len() {
            return Err(ValidationError::new(
                "position",
                format!(
                    "edit spans {} characters but the text had {} at its base version",
                    delta.base_len(),
                    seen.len()
                ),
            ));
        }
        debug!(concurrent = unseen, "rebasing edit over unseen history");
        let concurrent = diff_ids(&seen, &text.visible_ids());
        // A new edit is stamped above everything applied, so concurrent
        // inserts at the same position stay in front of it.
        Ok(delta.transform(&concurrent, false))
    }

    /// Plan CRDT mutations realising `delta` on `text`. Every position is
    /// resolved against the current sequence before anything is applied, so
    /// the planned mutations only reference ids that already exist.
    pub fn lower(delta: &TextDelta, text: &TextCrdt) -> Result<Vec<LoweredEdit>, ValidationError> {
        let items = text.rich_items();
        let ids_between = |from: usize, count: usize| {
            if from + count > items.len() {
                return Err(ValidationError::new(
                    "position",
                    format!("range {from}+{count} beyond length {}", items.len()),
                ));
            }
            Ok(items[from..from + count]
                .iter()
                .map(|(id, _, _)| id.clone())
                .collect::<Vec<_>>())
        };

        let mut edits = Vec::new();
        let mut cursor = 0;
        let mut ops = delta.ops().iter().peekable();
        while let Some(op) = ops.next() {
            match op {
                DeltaOp::Retain { count, attributes } => {
                    let ids = ids_between(cursor, *count)?;
                    if let (Some(start), Some(end)) = (ids.first(), ids.last()) {
                        for (attribute, value) in attributes {
                            edits.push(LoweredEdit::Mutation(FieldMutation::TextFormat {
                                start: start.clone(),
                                end: end.clone(),
                                attribute: attribute.clone(),
                                value: value.clone(),
                            }));
                        }
                    }
                    cursor += count;
                }
                DeltaOp::Insert { text: content, attributes } => {
                    let (origin_left, origin_right) = text.insertion_origins(cursor)?;
                    let insert_index = edits.len();
                    if let Some(DeltaOp::Delete { count }) = ops.peek() {
                        let targets = ids_between(cursor, *count)?;
                        cursor += count;
                        ops.next();
                        edits.push(LoweredEdit::Mutation(FieldMutation::TextReplace {
                            targets,
                            origin_left,
                            origin_right,
                            content: content.clone(),
                        }));
                    } else {
                        edits.push(LoweredEdit::Mutation(FieldMutation::TextInsert {
                            origin_left,
                            origin_right,
                            content: content.clone(),
                        }));
                    }
                    for (attribute, value) in attributes {
                        edits.push(LoweredEdit::FormatInserted {
                            insert_index,
                            len: content.chars().count(),
                            attribute: attribute.clone(),
                            value: value.clone(),
                        });
                    }
                }
                DeltaOp::Delete { count } => {
                    let targets = ids_between(cursor, *count)?;
                    cursor += count;
                    edits.push(LoweredEdit::Mutation(FieldMutation::TextDelete { targets }));
                }
            }
        }
        Ok(edits)
    }
}

fn parse_data<T: DeserializeOwned>(op: &FieldOperation) -> Result<T, ValidationError> {
    serde_json::from_value(op.operation_data.clone())
        .map_err(|e| ValidationError::new("operation_data", e.to_string()))
}
