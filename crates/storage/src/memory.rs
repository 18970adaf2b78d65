use std::sync::atomic::{AtomicBool, Ordering};

use concord_core::{Operation, RecordId, VersionVector};
use dashmap::DashMap;

use crate::error::StorageError;
use crate::store::EphemeralStore;

/// In-process ephemeral store. Can be switched offline to exercise the
/// unavailable path.
#[derive(Debug, Default)]
pub struct MemoryEphemeralStore {
    version_vectors: DashMap<RecordId, VersionVector>,
    buffers: DashMap<RecordId, Vec<Operation>>,
    offline: AtomicBool,
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("ephemeral store offline".into()));
        }
        Ok(())
    }
}

impl EphemeralStore for MemoryEphemeralStore {
    fn put_version_vector(
        &self,
        record_id: RecordId,
        version_vector: &VersionVector,
    ) -> Result<(), StorageError> {
        self.check_online()?;
        self.version_vectors.insert(record_id, version_vector.clone());
        Ok(())
    }

    fn version_vector(&self, record_id: RecordId) -> Result<Option<VersionVector>, StorageError> {
        self.check_online()?;
        Ok(self.version_vectors.get(&record_id).map(|vv| vv.clone()))
    }

    fn put_causal_buffer(&self, record_id: RecordId, pending: &[Operation]) -> Result<(), StorageError> {
        self.check_online()?;
        if pending.is_empty() {
            self.buffers.remove(&record_id);
        } else {
            self.buffers.insert(record_id, pending.to_vec());
        }
        Ok(())
    }

    fn causal_buffer(&self, record_id: RecordId) -> Result<Vec<Operation>, StorageError> {
        self.check_online()?;
        Ok(self
            .buffers
            .get(&record_id)
            .map(|ops| ops.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ActorId;

    #[test]
    fn offline_store_reports_transient_error() {
        let store = MemoryEphemeralStore::new();
        let record_id = RecordId::new();
        let mut vv = VersionVector::new();
        vv.increment(&ActorId::from("alice"));
        store.put_version_vector(record_id, &vv).unwrap();

        store.set_offline(true);
        let err = store.version_vector(record_id).unwrap_err();
        assert!(err.is_transient());

        store.set_offline(false);
        assert_eq!(store.version_vector(record_id).unwrap(), Some(vv));
    }

    #[test]
    fn empty_buffer_clears_entry() {
        let store = MemoryEphemeralStore::new();
        let record_id = RecordId::new();
        store.put_causal_buffer(record_id, &[]).unwrap();
        assert!(store.causal_buffer(record_id).unwrap().is_empty());
    }
}
