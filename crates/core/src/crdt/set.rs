use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::Dot;

/// Add-wins observed-remove set. Each add carries a unique tag (the dot of
/// the adding operation); a remove deletes only the tags it observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet {
    entries: BTreeMap<String, BTreeSet<Dot>>,
    removed: BTreeSet<Dot>,
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: &str, tag: Dot) {
        if self.removed.contains(&tag) {
            return;
        }
        self.entries
            .entry(element.to_string())
            .or_default()
            .insert(tag);
    }

    pub fn remove(&mut self, element: &str, observed: &BTreeSet<Dot>) {
        self.removed.extend(observed.iter().cloned());
        if let Some(tags) = self.entries.get_mut(element) {
            tags.retain(|tag| !observed.contains(tag));
            if tags.is_empty() {
                self.entries.remove(element);
            }
        }
    }

    pub fn contains(&self, element: &str) -> bool {
        self.entries.contains_key(element)
    }

    /// Tags currently keeping `element` alive; a local remove observes these.
    pub fn tags(&self, element: &str) -> BTreeSet<Dot> {
        self.entries.get(element).cloned().unwrap_or_default()
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
