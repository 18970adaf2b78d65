//! Append-only, hash-chained and signed record of every resolution.

use std::sync::Arc;

use concord_core::identity::verify_signature;
use concord_core::{AuditEntry, ConflictId, Decision, Hlc, ResolutionStrategy, SigningIdentity};
use concord_storage::DurableStore;

use super::ConflictError;
use crate::retry::RetryPolicy;

pub struct AuditTrail {
    identity: SigningIdentity,
    entries: Vec<AuditEntry>,
    durable: Arc<dyn DurableStore>,
    retry: RetryPolicy,
}

impl AuditTrail {
    /// Continue the persisted chain. A chain that fails verification is
    /// refused rather than extended.
    pub fn load(
        identity: SigningIdentity,
        durable: Arc<dyn DurableStore>,
        retry: RetryPolicy,
    ) -> Result<Self, ConflictError> {
        let entries = retry
            .run("audit_trail", || durable.audit_trail())
            .map_err(|e| e.last)?;
        verify_trail(&entries)?;
        Ok(Self {
            identity,
            entries,
            durable,
            retry,
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key()
    }

    pub fn append(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        decision: Decision,
        state_hash: String,
        audit_timestamp: Hlc,
    ) -> Result<AuditEntry, ConflictError> {
        let sequence = self.entries.len() as u64 + 1;
        let previous_hash = self
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_default();
        let bytes = AuditEntry::signing_bytes(
            sequence,
            &conflict_id,
            &strategy,
            &decision,
            &state_hash,
            &audit_timestamp,
            &previous_hash,
        )?;
        let entry = AuditEntry {
            sequence,
            conflict_id,
            strategy,
            decision,
            state_hash,
            audit_timestamp,
            previous_hash,
            entry_hash: blake3::hash(&bytes).to_hex().to_string(),
            signer: self.identity.public_key(),
            signature: self.identity.sign(&bytes),
        };
        self.retry
            .run("append_audit", || self.durable.append_audit(&entry))
            .map_err(|e| e.last)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entries_for(&self, conflict_id: ConflictId) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.conflict_id == conflict_id)
            .cloned()
            .collect()
    }

    pub fn verify(&self) -> Result<(), ConflictError> {
        verify_trail(&self.entries)
    }
}

/// Check sequence numbers, hash links, entry hashes and signatures.
pub fn verify_trail(entries: &[AuditEntry]) -> Result<(), ConflictError> {
    let mut previous = String::new();
    for (idx, entry) in entries.iter().enumerate() {
        let broken = |reason: &str| ConflictError::AuditBroken {
            sequence: entry.sequence,
            reason: reason.to_string(),
        };
        if entry.sequence != idx as u64 + 1 {
            return Err(broken("sequence gap"));
        }
        if entry.previous_hash != previous {
            return Err(broken("previous hash does not link"));
        }
        let bytes = entry.own_signing_bytes()?;
        if blake3::hash(&bytes).to_hex().as_str() != entry.entry_hash {
            return Err(broken("entry hash mismatch"));
        }
        verify_signature(&entry.signer, &bytes, &entry.signature)
            .map_err(|_| broken("bad signature"))?;
        previous = entry.entry_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::SqliteStore;

    fn trail(store: Arc<SqliteStore>) -> AuditTrail {
        AuditTrail::load(
            SigningIdentity::generate(),
            store,
            RetryPolicy::from(&crate::config::RetryConfig::default()),
        )
        .unwrap()
    }

    fn append(trail: &mut AuditTrail, id: ConflictId, ms: u64) -> AuditEntry {
        trail
            .append(
                id,
                ResolutionStrategy::Overwrite,
                Decision::KeepRelationship,
                format!("state-{ms}"),
                Hlc::new(ms, 0),
            )
            .unwrap()
    }

    #[test]
    fn chain_links_and_verifies() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut trail = trail(store.clone());
        let (a, b) = (ConflictId::new(), ConflictId::new());
        let first = append(&mut trail, a, 1);
        let second = append(&mut trail, b, 2);
        append(&mut trail, a, 3);

        assert_eq!(first.previous_hash, "");
        assert_eq!(second.previous_hash, first.entry_hash);
        assert!(trail.verify().is_ok());
        assert_eq!(trail.entries_for(a).len(), 2);
        assert!(verify_trail(&store.audit_trail().unwrap()).is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut trail = trail(store);
        append(&mut trail, ConflictId::new(), 1);
        append(&mut trail, ConflictId::new(), 2);

        let mut entries = trail.entries().to_vec();
        entries[0].state_hash = "forged".into();
        assert!(matches!(
            verify_trail(&entries),
            Err(ConflictError::AuditBroken { sequence: 1, .. })
        ));

        let mut entries = trail.entries().to_vec();
        entries.remove(0);
        assert!(verify_trail(&entries).is_err());
    }

    #[test]
    fn reload_continues_chain() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut first = trail(store.clone());
        let head = append(&mut first, ConflictId::new(), 1);

        let mut second = trail(store);
        let next = append(&mut second, ConflictId::new(), 2);
        assert_eq!(next.sequence, 2);
        assert_eq!(next.previous_hash, head.entry_hash);
        assert!(second.verify().is_ok());
    }
}
