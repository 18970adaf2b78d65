use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::ids::ActorId;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Auxiliary per-actor embedding. Carried alongside the primary embedding,
/// never folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeholderVector {
    pub actor_id: ActorId,
    pub vector: Vec<f32>,
    pub weight: f32,
    pub lamport: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorState {
    pub primary_embedding: Vec<f32>,
    pub content_hash: String,
    pub embedding_model: String,
    pub generation_timestamp: Hlc,
    pub consistency_checksum: String,
    #[serde(default)]
    pub stakeholder_vectors: Vec<StakeholderVector>,
}

impl VectorState {
    pub fn new(
        primary_embedding: Vec<f32>,
        content_hash: String,
        embedding_model: String,
        generation_timestamp: Hlc,
    ) -> Self {
        let consistency_checksum = embedding_checksum(&primary_embedding);
        Self {
            primary_embedding,
            content_hash,
            embedding_model,
            generation_timestamp,
            consistency_checksum,
            stakeholder_vectors: Vec::new(),
        }
    }

    pub fn checksum_matches(&self) -> bool {
        embedding_checksum(&self.primary_embedding).as_bytes() == self.consistency_checksum.as_bytes()
    }

    /// Keep the contribution with the highest lamport per actor.
    pub fn upsert_stakeholder(&mut self, contribution: StakeholderVector) -> bool {
        match self
            .stakeholder_vectors
            .iter_mut()
            .find(|s| s.actor_id == contribution.actor_id)
        {
            Some(existing) if existing.lamport >= contribution.lamport => false,
            Some(existing) => {
                *existing = contribution;
                true
            }
            None => {
                self.stakeholder_vectors.push(contribution);
                self.stakeholder_vectors.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
                true
            }
        }
    }
}

/// blake3 over the little-endian bytes of every component, hex encoded.
pub fn embedding_checksum(embedding: &[f32]) -> String {
    let mut hasher = blake3::Hasher::new();
    for value in embedding {
        hasher.update(&value.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_detects_single_component_change() {
        let mut state = VectorState::new(vec![0.1, 0.2, 0.3], "h".into(), "m".into(), Hlc::default());
        assert!(state.checksum_matches());
        state.primary_embedding[1] = 0.25;
        assert!(!state.checksum_matches());
    }

    #[test]
    fn stakeholder_upsert_keeps_latest_per_actor() {
        let mut state = VectorState::new(vec![], "h".into(), "m".into(), Hlc::default());
        let contribution = |lamport, w| StakeholderVector {
            actor_id: ActorId::from("alice"),
            vector: vec![w],
            weight: w,
            lamport,
        };
        assert!(state.upsert_stakeholder(contribution(3, 0.3)));
        assert!(!state.upsert_stakeholder(contribution(2, 0.9)));
        assert!(state.upsert_stakeholder(contribution(5, 0.5)));
        assert_eq!(state.stakeholder_vectors.len(), 1);
        assert_eq!(state.stakeholder_vectors[0].weight, 0.5);
    }
}
