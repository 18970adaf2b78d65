use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::ids::{ActorId, Dot};

/// Result of comparing two version vectors by dominance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrder {
    Before,
    After,
    Concurrent,
    Equal,
}

/// Per-replica operation counters. Entries only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<ActorId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, actor: &ActorId) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// Bump the counter for `actor` and return the new dot.
    pub fn increment(&mut self, actor: &ActorId) -> Dot {
        let entry = self.entries.entry(actor.clone()).or_insert(0);
        *entry += 1;
        Dot::new(actor.clone(), *entry)
    }

    /// Record that `actor` has reached `seq`. Keeps the max.
    pub fn observe(&mut self, actor: &ActorId, seq: u64) {
        let entry = self.entries.entry(actor.clone()).or_insert(seq);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Merge another vector into this one (take max per actor).
    pub fn merge(&mut self, other: &VersionVector) {
        for (actor, seq) in &other.entries {
            self.observe(actor, *seq);
        }
    }

    /// Whether the operation identified by `dot` is part of this history.
    pub fn contains(&self, dot: &Dot) -> bool {
        self.get(&dot.actor) >= dot.seq
    }

    /// Actors where `other` is ahead of us, with our current counter.
    pub fn diff(&self, other: &VersionVector) -> Vec<(ActorId, u64)> {
        other
            .entries
            .iter()
            .filter(|(actor, seq)| self.get(actor) < **seq)
            .map(|(actor, _)| (actor.clone(), self.get(actor)))
            .collect()
    }

    /// Check if we've seen everything `other` has seen.
    pub fn covers(&self, other: &VersionVector) -> bool {
        other.entries.iter().all(|(actor, seq)| self.get(actor) >= *seq)
    }

    pub fn compare(&self, other: &VersionVector) -> CausalOrder {
        let mut behind = false;
        let mut ahead = false;
        for actor in self.entries.keys().chain(other.entries.keys()) {
            let ours = self.get(actor);
            let theirs = other.get(actor);
            if ours < theirs {
                behind = true;
            } else if ours > theirs {
                ahead = true;
            }
        }
        match (behind, ahead) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    pub fn entries(&self) -> &BTreeMap<ActorId, u64> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(pairs: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (actor, seq) in pairs {
            v.observe(&ActorId::from(*actor), *seq);
        }
        v
    }

    #[test]
    fn observe_keeps_max() {
        let mut v = VersionVector::new();
        let a = ActorId::from("a");
        v.observe(&a, 3);
        v.observe(&a, 1);
        assert_eq!(v.get(&a), 3);
        assert_eq!(v.increment(&a), Dot::new(a.clone(), 4));
    }

    #[test]
    fn compare_classifies_dominance() {
        let base = vv(&[("a", 1), ("b", 2)]);
        assert_eq!(base.compare(&base.clone()), CausalOrder::Equal);
        assert_eq!(base.compare(&vv(&[("a", 2), ("b", 2)])), CausalOrder::Before);
        assert_eq!(vv(&[("a", 2), ("b", 2)]).compare(&base), CausalOrder::After);
        assert_eq!(base.compare(&vv(&[("a", 2), ("b", 1)])), CausalOrder::Concurrent);
        assert_eq!(VersionVector::new().compare(&base), CausalOrder::Before);
    }

    #[test]
    fn diff_and_covers() {
        let ours = vv(&[("a", 1), ("b", 2)]);
        let theirs = vv(&[("a", 1), ("b", 3), ("c", 4)]);
        let diff = ours.diff(&theirs);
        assert_eq!(
            diff,
            vec![(ActorId::from("b"), 2), (ActorId::from("c"), 0)]
        );
        assert!(theirs.covers(&ours));
        assert!(!ours.covers(&theirs));
        assert!(ours.covers(&VersionVector::new()));
    }

    #[test]
    fn merge_takes_max() {
        let mut left = vv(&[("a", 5), ("b", 1)]);
        left.merge(&vv(&[("a", 2), ("b", 7), ("c", 1)]));
        assert_eq!(left, vv(&[("a", 5), ("b", 7), ("c", 1)]));
        assert!(left.contains(&Dot::new(ActorId::from("b"), 7)));
        assert!(!left.contains(&Dot::new(ActorId::from("c"), 2)));
    }

    mod merge_laws {
        use super::*;
        use proptest::prelude::*;

        fn arb_vv() -> impl Strategy<Value = VersionVector> {
            proptest::collection::vec((0..4usize, 0..10u64), 0..6).prop_map(|pairs| {
                let mut v = VersionVector::new();
                for (actor, seq) in pairs {
                    v.observe(&ActorId::from(["a", "b", "c", "d"][actor]), seq);
                }
                v
            })
        }

        proptest! {
            #[test]
            fn merge_is_a_join(a in arb_vv(), b in arb_vv(), c in arb_vv()) {
                let mut ab = a.clone();
                ab.merge(&b);
                let mut ba = b.clone();
                ba.merge(&a);
                prop_assert_eq!(&ab, &ba);

                let mut twice = ab.clone();
                twice.merge(&b);
                prop_assert_eq!(&twice, &ab);

                let mut left = ab.clone();
                left.merge(&c);
                let mut bc = b.clone();
                bc.merge(&c);
                let mut right = a.clone();
                right.merge(&bc);
                prop_assert_eq!(&left, &right);

                prop_assert!(ab.covers(&a) && ab.covers(&b));
            }
        }
    }
}
