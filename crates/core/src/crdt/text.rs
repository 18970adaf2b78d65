//! Sequence CRDT for text fields.
//!
//! Characters are never removed: a delete flips `alive` and leaves the item in
//! place as a tombstone, so ids referenced by concurrent operations stay
//! resolvable. Each insert names the item to its left and right at generation
//! time; concurrent inserts between the same neighbours are ordered by
//! `(lamport, actor, offset)` ascending.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{ActorId, OpId};

pub type Attributes = BTreeMap<String, String>;

/// Identity of a single inserted character. The derived ordering is the
/// concurrent-insert tie-break.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct CharId {
    pub lamport: u64,
    pub actor: ActorId,
    pub offset: u32,
}

impl CharId {
    pub fn new(lamport: u64, actor: ActorId, offset: u32) -> Self {
        Self {
            lamport,
            actor,
            offset,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TextItem {
    pub id: CharId,
    pub value: char,
    pub origin_left: Option<CharId>,
    pub origin_right: Option<CharId>,
    pub alive: bool,
}

impl TextItem {
    pub fn inserted_by(&self) -> &ActorId {
        &self.id.actor
    }

    pub fn lamport_clock(&self) -> u64 {
        self.id.lamport
    }
}

/// An attribute applied to the inclusive character range `start..=end`.
/// `value: None` clears the attribute over that range.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FormatMark {
    pub mark_id: OpId,
    pub start: CharId,
    pub end: CharId,
    pub attribute: String,
    pub value: Option<String>,
    pub lamport: u64,
    pub actor: ActorId,
}

impl FormatMark {
    fn precedence(&self) -> (u64, &ActorId, &OpId) {
        (self.lamport, &self.actor, &self.mark_id)
    }
}

/// A run of visible characters sharing the same effective attributes.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub attributes: Attributes,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TextCrdt {
    items: Vec<TextItem>,
    marks: Vec<FormatMark>,
}

impl TextCrdt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_of(&self, id: &CharId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }

    pub fn contains(&self, id: &CharId) -> bool {
        self.position_of(id).is_some()
    }

    fn require(&self, id: &CharId) -> Result<usize, CoreError> {
        self.position_of(id).ok_or_else(|| {
            CoreError::InvalidPosition(format!(
                "unknown character {}:{}:{}",
                id.lamport, id.actor, id.offset
            ))
        })
    }

    /// Insert `content` as a run between `origin_left` and `origin_right`.
    /// Returns the number of characters newly integrated (0 on replay).
    pub fn insert_run(
        &mut self,
        lamport: u64,
        actor: &ActorId,
        origin_left: Option<CharId>,
        origin_right: Option<CharId>,
        content: &str,
    ) -> Result<usize, CoreError> {
        if content.is_empty() {
            return Ok(0);
        }
        if self.position_of(&CharId::new(lamport, actor.clone(), 0)).is_some() {
            return Ok(0);
        }
        let left_idx = origin_left.as_ref().map(|id| self.require(id)).transpose()?;
        let right_idx = origin_right.as_ref().map(|id| self.require(id)).transpose()?;
        if let (Some(l), Some(r)) = (left_idx, right_idx)
            && r <= l
        {
            return Err(CoreError::InvalidPosition(
                "right origin precedes left origin".into(),
            ));
        }

        let mut left = origin_left;
        let mut inserted = 0;
        for (offset, value) in content.chars().enumerate() {
            let id = CharId::new(lamport, actor.clone(), offset as u32);
            self.integrate(TextItem {
                id: id.clone(),
                value,
                origin_left: left,
                origin_right: origin_right.clone(),
                alive: true,
            })?;
            left = Some(id);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn integrate(&mut self, item: TextItem) -> Result<(), CoreError> {
        let left_idx = item.origin_left.as_ref().map(|id| self.require(id)).transpose()?;
        let right_idx = match &item.origin_right {
            Some(id) => self.require(id)?,
            None => self.items.len(),
        };

        let dest = {
            let mut dest = left_idx.map_or(0, |i| i + 1);
            let mut before_origin: HashSet<&CharId> = HashSet::new();
            let mut conflicting: HashSet<&CharId> = HashSet::new();
            let mut cursor = dest;

            while cursor < right_idx {
                let other = &self.items[cursor];
                before_origin.insert(&other.id);
                conflicting.insert(&other.id);

                if other.origin_left == item.origin_left {
                    if other.id < item.id {
                        dest = cursor + 1;
                        conflicting.clear();
                    } else if other.origin_right == item.origin_right {
                        break;
                    }
                } else if let Some(other_origin) = &other.origin_left
                    && before_origin.contains(other_origin)
                {
                    if !conflicting.contains(other_origin) {
                        dest = cursor + 1;
                        conflicting.clear();
                    }
                } else {
                    break;
                }
                cursor += 1;
            }
            dest
        };

        self.items.insert(dest, item);
        Ok(())
    }

    /// Tombstone every target. All targets are resolved before any is touched.
    /// Returns the number of characters that were alive before the call.
    pub fn delete(&mut self, targets: &[CharId]) -> Result<usize, CoreError> {
        let indices = targets
            .iter()
            .map(|id| self.require(id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut removed = 0;
        for idx in indices {
            let item = &mut self.items[idx];
            if item.alive {
                item.alive = false;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Add a formatting mark. Returns `false` if the mark was already present.
    pub fn add_mark(&mut self, mark: FormatMark) -> Result<bool, CoreError> {
        let start = self.require(&mark.start)?;
        let end = self.require(&mark.end)?;
        if end < start {
            return Err(CoreError::InvalidPosition("format range end precedes start".into()));
        }
        match self.marks.binary_search_by(|m| m.mark_id.cmp(&mark.mark_id)) {
            Ok(_) => Ok(false),
            Err(slot) => {
                self.marks.insert(slot, mark);
                Ok(true)
            }
        }
    }

    pub fn visible_text(&self) -> String {
        self.items.iter().filter(|i| i.alive).map(|i| i.value).collect()
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.alive).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.items.len() - self.len()
    }

    pub fn items(&self) -> &[TextItem] {
        &self.items
    }

    fn visible_index(&self, position: usize) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.alive)
            .nth(position)
            .map(|(idx, _)| idx)
    }

    /// Neighbour ids for an insert at visible `position`.
    pub fn insertion_origins(
        &self,
        position: usize,
    ) -> Result<(Option<CharId>, Option<CharId>), CoreError> {
        let len = self.len();
        if position > len {
            return Err(CoreError::InvalidPosition(format!(
                "insert position {position} beyond length {len}"
            )));
        }
        if position == 0 {
            return Ok((None, self.items.first().map(|i| i.id.clone())));
        }
        let left_idx = self
            .visible_index(position - 1)
            .ok_or_else(|| CoreError::InvalidPosition(format!("no character at {}", position - 1)))?;
        let left = self.items[left_idx].id.clone();
        let right = self.items.get(left_idx + 1).map(|i| i.id.clone());
        Ok((Some(left), right))
    }

    pub fn visible_ids(&self) -> Vec<CharId> {
        self.items
            .iter()
            .filter(|i| i.alive)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Ids of the `count` visible characters starting at `position`.
    pub fn ids_in_range(&self, position: usize, count: usize) -> Result<Vec<CharId>, CoreError> {
        let len = self.len();
        if position + count > len {
            return Err(CoreError::InvalidPosition(format!(
                "range {position}+{count} beyond length {len}"
            )));
        }
        Ok(self
            .items
            .iter()
            .filter(|i| i.alive)
            .skip(position)
            .take(count)
            .map(|i| i.id.clone())
            .collect())
    }

    /// Effective attributes of every item, tombstones included. Marks are
    /// applied in precedence order, so the highest `(lamport, actor)` wins
    /// per attribute.
    fn item_attributes(&self) -> Vec<Attributes> {
        let mut attrs = vec![Attributes::new(); self.items.len()];
        let mut ordered: Vec<&FormatMark> = self.marks.iter().collect();
        ordered.sort_by(|a, b| a.precedence().cmp(&b.precedence()));
        for mark in ordered {
            let (Some(start), Some(end)) = (self.position_of(&mark.start), self.position_of(&mark.end))
            else {
                continue;
            };
            for slot in &mut attrs[start..=end] {
                match &mark.value {
                    Some(value) => {
                        slot.insert(mark.attribute.clone(), value.clone());
                    }
                    None => {
                        slot.remove(&mark.attribute);
                    }
                }
            }
        }
        attrs
    }

    /// Visible characters with their ids and effective attributes.
    pub fn rich_items(&self) -> Vec<(CharId, char, Attributes)> {
        self.items
            .iter()
            .zip(self.item_attributes())
            .filter(|(item, _)| item.alive)
            .map(|(item, attrs)| (item.id.clone(), item.value, attrs))
            .collect()
    }

    /// Visible characters with their effective attributes.
    pub fn rich_chars(&self) -> Vec<(char, Attributes)> {
        self.items
            .iter()
            .zip(self.item_attributes())
            .filter(|(item, _)| item.alive)
            .map(|(item, attrs)| (item.value, attrs))
            .collect()
    }

    pub fn spans(&self) -> Vec<TextSpan> {
        let mut spans: Vec<TextSpan> = Vec::new();
        for (ch, attributes) in self.rich_chars() {
            match spans.last_mut() {
                Some(last) if last.attributes == attributes => last.text.push(ch),
                _ => spans.push(TextSpan {
                    text: ch.to_string(),
                    attributes,
                }),
            }
        }
        spans
    }
}
