use std::collections::{HashSet, VecDeque};

use concord_core::{Attributes, CharId, Dot, FieldMutation, TextCrdt, VersionVector};

use crate::error::ValidationError;
use crate::ot::delta::{DeltaOp, TextDelta};

/// What one applied text mutation did, in character ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub dot: Dot,
    /// Characters this mutation made visible.
    pub inserted: Vec<CharId>,
    /// Characters this mutation hid. A delete of an already hidden
    /// character is not listed here.
    pub removed: Vec<CharId>,
    /// Every character the mutation asked to delete.
    pub targets: Vec<CharId>,
}

impl HistoryEntry {
    /// Compare the visible sequence before and after `mutation` was applied.
    pub fn new(dot: Dot, mutation: &FieldMutation, before: &[CharId], after: &[CharId]) -> Self {
        let was_visible: HashSet<&CharId> = before.iter().collect();
        let is_visible: HashSet<&CharId> = after.iter().collect();
        let targets = match mutation {
            FieldMutation::TextDelete { targets } | FieldMutation::TextReplace { targets, .. } => {
                targets.clone()
            }
            _ => Vec::new(),
        };
        Self {
            dot,
            inserted: after
                .iter()
                .filter(|id| !was_visible.contains(id))
                .cloned()
                .collect(),
            removed: before
                .iter()
                .filter(|id| !is_visible.contains(id))
                .cloned()
                .collect(),
            targets,
        }
    }
}

/// Recent text mutations of one field in application order.
#[derive(Debug, Clone, Default)]
pub struct FieldHistory {
    entries: VecDeque<HistoryEntry>,
    /// Everything no longer available for rebasing.
    floor: VersionVector,
}

impl FieldHistory {
    pub fn with_floor(floor: VersionVector) -> Self {
        Self {
            entries: VecDeque::new(),
            floor,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry, limit: usize) {
        self.entries.push_back(entry);
        while self.entries.len() > limit.max(1) {
            if let Some(evicted) = self.entries.pop_front() {
                self.floor.observe(&evicted.dot.actor, evicted.dot.seq);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_floor(&self, base: &VersionVector) -> Result<(), ValidationError> {
        if base.covers(&self.floor) {
            Ok(())
        } else {
            Err(ValidationError::new(
                "base_version",
                "edit is based on a version older than the retained history",
            ))
        }
    }

    /// Entries an edit generated against `base` has not seen, oldest first.
    pub fn unseen_by(&self, base: &VersionVector) -> Result<Vec<&HistoryEntry>, ValidationError> {
        self.check_floor(base)?;
        Ok(self.entries.iter().filter(|e| !base.contains(&e.dot)).collect())
    }

    /// The visible sequence of `text` as it was at `base`: characters
    /// inserted by unseen mutations are left out, and characters hidden only
    /// by unseen mutations are put back. Seen and unseen entries may be
    /// interleaved in application order; a version vector is causally
    /// closed, so no seen entry depends on an unseen one.
    pub fn view_at(&self, text: &TextCrdt, base: &VersionVector) -> Result<Vec<CharId>, ValidationError> {
        self.check_floor(base)?;
        let mut unseen_inserts = HashSet::new();
        let mut unseen_removals = HashSet::new();
        let mut seen_targets = HashSet::new();
        for entry in &self.entries {
            if base.contains(&entry.dot) {
                seen_targets.extend(&entry.targets);
            } else {
                unseen_inserts.extend(&entry.inserted);
                unseen_removals.extend(&entry.removed);
            }
        }
        Ok(text
            .items()
            .iter()
            .filter(|item| !unseen_inserts.contains(&item.id))
            .filter(|item| {
                item.alive
                    || (unseen_removals.contains(&item.id) && !seen_targets.contains(&item.id))
            })
            .map(|item| item.id.clone())
            .collect())
    }
}

const PLACEHOLDER: &str = "\u{fffc}";

/// Plain delta turning the `before` sequence into `after`. Character ids
/// are stable, so the diff is exact rather than heuristic.
pub fn diff_ids(before: &[CharId], after: &[CharId]) -> TextDelta {
    let before_ids: HashSet<&CharId> = before.iter().collect();
    let after_ids: HashSet<&CharId> = after.iter().collect();
    let mut delta = TextDelta::new();
    let (mut i, mut j) = (0, 0);
    loop {
        if let Some(id) = before.get(i)
            && !after_ids.contains(id)
        {
            delta.push(DeltaOp::Delete { count: 1 });
            i += 1;
        } else if let Some(id) = after.get(j)
            && !before_ids.contains(id)
        {
            // Transform only looks at the length of a concurrent insert.
            delta = delta.insert(PLACEHOLDER, Attributes::new());
            j += 1;
        } else if before.get(i).is_some() && after.get(j).is_some() {
            delta = delta.retain(1);
            i += 1;
            j += 1;
        } else {
            break;
        }
    }
    delta.chop()
}
