use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::ids::ActorId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwEntry {
    /// `None` is a tombstone left by a remove.
    pub value: Option<FieldValue>,
    pub lamport: u64,
    pub actor: ActorId,
}

impl LwwEntry {
    fn wins_over(&self, lamport: u64, actor: &ActorId) -> bool {
        (self.lamport, &self.actor) >= (lamport, actor)
    }
}

/// String-keyed map whose entries are last-writer-wins registers ordered by
/// `(lamport, actor)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwMap {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the write became the current value.
    pub fn put(&mut self, key: &str, value: FieldValue, lamport: u64, actor: &ActorId) -> bool {
        self.write(key, Some(value), lamport, actor)
    }

    pub fn remove(&mut self, key: &str, lamport: u64, actor: &ActorId) -> bool {
        self.write(key, None, lamport, actor)
    }

    fn write(&mut self, key: &str, value: Option<FieldValue>, lamport: u64, actor: &ActorId) -> bool {
        if let Some(existing) = self.entries.get(key)
            && existing.wins_over(lamport, actor)
        {
            return false;
        }
        self.entries.insert(
            key.to_string(),
            LwwEntry {
                value,
                lamport,
                actor: actor.clone(),
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_lamport_wins_regardless_of_order() {
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");

        let mut left = LwwMap::new();
        left.put("title", FieldValue::Text("a".into()), 2, &alice);
        left.put("title", FieldValue::Text("b".into()), 3, &bob);

        let mut right = LwwMap::new();
        right.put("title", FieldValue::Text("b".into()), 3, &bob);
        assert!(!right.put("title", FieldValue::Text("a".into()), 2, &alice));

        assert_eq!(left, right);
        assert_eq!(left.get("title"), Some(&FieldValue::Text("b".into())));
    }

    #[test]
    fn equal_lamport_breaks_tie_by_actor() {
        let mut map = LwwMap::new();
        map.put("k", FieldValue::Integer(1), 5, &ActorId::from("bob"));
        map.remove("k", 5, &ActorId::from("alice"));
        assert_eq!(map.get("k"), Some(&FieldValue::Integer(1)));
        map.remove("k", 6, &ActorId::from("alice"));
        assert!(map.get("k").is_none());
        assert!(map.is_empty());
    }
}
