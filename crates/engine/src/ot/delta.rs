//! Retain/insert/delete deltas over rich text.
//!
//! Lengths count `char`s. A delta is kept normalised: no zero-length
//! components, adjacent components of the same kind with equal attributes are
//! merged, an insert always precedes an adjacent delete, and trailing plain
//! retains are dropped.

use std::collections::BTreeMap;

use concord_core::Attributes;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Attribute changes carried by a retain. `None` clears the attribute.
pub type AttributePatch = BTreeMap<String, Option<String>>;

/// A document as seen by deltas: visible characters with their attributes.
pub type RichText = Vec<(char, Attributes)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Retain { count: usize, attributes: AttributePatch },
    Insert { text: String, attributes: Attributes },
    Delete { count: usize },
}

impl DeltaOp {
    pub fn len(&self) -> usize {
        match self {
            Self::Retain { count, .. } | Self::Delete { count } => *count,
            Self::Insert { text, .. } => text.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    ops: Vec<DeltaOp>,
}

impl TextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn retain(mut self, count: usize) -> Self {
        self.push(DeltaOp::Retain {
            count,
            attributes: AttributePatch::new(),
        });
        self
    }

    pub fn format(mut self, count: usize, attributes: AttributePatch) -> Self {
        self.push(DeltaOp::Retain { count, attributes });
        self
    }

    pub fn insert(mut self, text: &str, attributes: Attributes) -> Self {
        self.push(DeltaOp::Insert {
            text: text.to_string(),
            attributes,
        });
        self
    }

    pub fn delete(mut self, count: usize) -> Self {
        self.push(DeltaOp::Delete { count });
        self
    }

    /// Append `op`, merging with the tail where possible.
    pub fn push(&mut self, op: DeltaOp) {
        if op.is_empty() {
            return;
        }
        // Keep inserts ahead of deletes so equal edits have one representation.
        if let DeltaOp::Insert { .. } = op
            && matches!(self.ops.last(), Some(DeltaOp::Delete { .. }))
        {
            if let Some(delete) = self.ops.pop() {
                self.push(op);
                self.ops.push(delete);
                return;
            }
        }
        match (self.ops.last_mut(), op) {
            (Some(DeltaOp::Delete { count }), DeltaOp::Delete { count: more }) => *count += more,
            (
                Some(DeltaOp::Retain { count, attributes }),
                DeltaOp::Retain {
                    count: more,
                    attributes: next,
                },
            ) if *attributes == next => *count += more,
            (
                Some(DeltaOp::Insert { text, attributes }),
                DeltaOp::Insert {
                    text: more,
                    attributes: next,
                },
            ) if *attributes == next => text.push_str(&more),
            (_, op) => self.ops.push(op),
        }
    }

    pub(crate) fn chop(mut self) -> Self {
        while let Some(DeltaOp::Retain { attributes, .. }) = self.ops.last() {
            if !attributes.is_empty() {
                break;
            }
            self.ops.pop();
        }
        self
    }

    /// Length of the document this delta applies to, ignoring the implicit
    /// trailing retain.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !matches!(op, DeltaOp::Insert { .. }))
            .map(DeltaOp::len)
            .sum()
    }

    /// Length change this delta causes.
    pub fn len_change(&self) -> isize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Insert { .. } => op.len() as isize,
                DeltaOp::Delete { count } => -(*count as isize),
                DeltaOp::Retain { .. } => 0,
            })
            .sum()
    }

    /// Length of the resulting document given the length it applies to.
    pub fn target_len(&self, doc_len: usize) -> usize {
        (doc_len as isize + self.len_change()).max(0) as usize
    }

    pub fn apply(&self, doc: &RichText) -> Result<RichText, ValidationError> {
        if self.base_len() > doc.len() {
            return Err(ValidationError::new(
                "position",
                format!("delta spans {} characters but text has {}", self.base_len(), doc.len()),
            ));
        }
        let mut out = RichText::with_capacity(self.target_len(doc.len()));
        let mut cursor = 0;
        for op in &self.ops {
            match op {
                DeltaOp::Retain { count, attributes } => {
                    for (ch, attrs) in &doc[cursor..cursor + count] {
                        let mut attrs = attrs.clone();
                        apply_patch(&mut attrs, attributes);
                        out.push((*ch, attrs));
                    }
                    cursor += count;
                }
                DeltaOp::Insert { text, attributes } => {
                    out.extend(text.chars().map(|ch| (ch, attributes.clone())));
                }
                DeltaOp::Delete { count } => cursor += count,
            }
        }
        out.extend_from_slice(&doc[cursor..]);
        Ok(out)
    }

    /// The delta equivalent to applying `self` then `other`.
    pub fn compose(&self, other: &TextDelta) -> TextDelta {
        let mut a = OpIter::new(&self.ops);
        let mut b = OpIter::new(&other.ops);
        let mut out = TextDelta::new();
        while a.has_next() || b.has_next() {
            if b.peek_is_insert() {
                out.push(b.next(usize::MAX));
            } else if a.peek_is_delete() {
                out.push(a.next(usize::MAX));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next(len);
                let b_op = b.next(len);
                match (a_op, b_op) {
                    (DeltaOp::Retain { attributes: first, .. }, DeltaOp::Retain { attributes: second, .. }) => {
                        let mut merged = first;
                        merged.extend(second);
                        out.push(DeltaOp::Retain {
                            count: len,
                            attributes: merged,
                        });
                    }
                    (DeltaOp::Insert { text, mut attributes }, DeltaOp::Retain { attributes: patch, .. }) => {
                        apply_patch(&mut attributes, &patch);
                        out.push(DeltaOp::Insert { text, attributes });
                    }
                    (DeltaOp::Retain { .. }, DeltaOp::Delete { .. }) => {
                        out.push(DeltaOp::Delete { count: len });
                    }
                    // Inserted then deleted: cancels out.
                    (DeltaOp::Insert { .. }, DeltaOp::Delete { .. }) => {}
                    (a_op, _) => out.push(a_op),
                }
            }
        }
        out.chop()
    }

    /// Rewrite `self` so it applies after `other`, where both were generated
    /// against the same document. When both insert at the same position,
    /// `self_first` puts this delta's text first. The same flag decides
    /// attribute conflicts: the side that goes second wins.
    pub fn transform(&self, other: &TextDelta, self_first: bool) -> TextDelta {
        let mut a = OpIter::new(&self.ops);
        let mut b = OpIter::new(&other.ops);
        let mut out = TextDelta::new();
        while a.has_next() || b.has_next() {
            if a.peek_is_insert() && (self_first || !b.peek_is_insert()) {
                out.push(a.next(usize::MAX));
            } else if b.peek_is_insert() {
                let len = b.next(usize::MAX).len();
                out.push(DeltaOp::Retain {
                    count: len,
                    attributes: AttributePatch::new(),
                });
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next(len);
                let b_op = b.next(len);
                match (a_op, b_op) {
                    // Already deleted by `other`.
                    (_, DeltaOp::Delete { .. }) => {}
                    (DeltaOp::Delete { .. }, _) => out.push(DeltaOp::Delete { count: len }),
                    (DeltaOp::Retain { attributes, .. }, DeltaOp::Retain { attributes: theirs, .. }) => {
                        let attributes = if self_first {
                            attributes
                                .into_iter()
                                .filter(|(key, _)| !theirs.contains_key(key))
                                .collect()
                        } else {
                            attributes
                        };
                        out.push(DeltaOp::Retain { count: len, attributes });
                    }
                    (a_op, _) => out.push(a_op),
                }
            }
        }
        out.chop()
    }
}

fn apply_patch(attrs: &mut Attributes, patch: &AttributePatch) {
    for (key, value) in patch {
        match value {
            Some(value) => {
                attrs.insert(key.clone(), value.clone());
            }
            None => {
                attrs.remove(key);
            }
        }
    }
}

/// Walks delta components, splitting them on demand. Past the end it yields
/// an unbounded plain retain.
struct OpIter<'a> {
    ops: &'a [DeltaOp],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [DeltaOp]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        self.ops
            .get(self.index)
            .map(|op| op.len() - self.offset)
            .unwrap_or(usize::MAX)
    }

    fn peek_is_insert(&self) -> bool {
        matches!(self.ops.get(self.index), Some(DeltaOp::Insert { .. }))
    }

    fn peek_is_delete(&self) -> bool {
        matches!(self.ops.get(self.index), Some(DeltaOp::Delete { .. }))
    }

    fn next(&mut self, max: usize) -> DeltaOp {
        let Some(op) = self.ops.get(self.index) else {
            return DeltaOp::Retain {
                count: max,
                attributes: AttributePatch::new(),
            };
        };
        let remaining = op.len() - self.offset;
        let take = remaining.min(max);
        let start = self.offset;
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        match op {
            DeltaOp::Retain { attributes, .. } => DeltaOp::Retain {
                count: take,
                attributes: attributes.clone(),
            },
            DeltaOp::Delete { .. } => DeltaOp::Delete { count: take },
            DeltaOp::Insert { text, attributes } => DeltaOp::Insert {
                text: text.chars().skip(start).take(take).collect(),
                attributes: attributes.clone(),
            },
        }
    }
}

/// Plain text as a delta document.
pub fn plain(text: &str) -> RichText {
    text.chars().map(|ch| (ch, Attributes::new())).collect()
}

pub fn to_plain(doc: &RichText) -> String {
    doc.iter().map(|(ch, _)| *ch).collect()
}
