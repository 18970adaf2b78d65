use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use concord_core::{AuditEntry, Operation, Record, RecordId, Relationship, VectorState};
use concord_storage::{DurableStore, ReplayEntry, SqliteStore, StorageError};
use tracing::debug;

/// SQLite store whose writes can be made to fail with a transient error.
/// Reads and the replay queue are never affected.
pub struct FlakyStore {
    inner: SqliteStore,
    failures: AtomicU32,
    offline: AtomicBool,
    rejected: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(SqliteStore::open_in_memory()?))
    }

    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Fail every write until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes refused so far.
    pub fn rejected_writes(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn write(&self, what: &str) -> Result<(), StorageError> {
        let failing = self.offline.load(Ordering::SeqCst)
            || self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            debug!(what, "injected store failure");
            return Err(StorageError::Unavailable(format!("{what} refused")));
        }
        Ok(())
    }
}

impl DurableStore for FlakyStore {
    fn save_record(&self, record: &Record) -> Result<(), StorageError> {
        self.write("save_record")?;
        self.inner.save_record(record)
    }

    fn load_record(&self, record_id: RecordId) -> Result<Option<Record>, StorageError> {
        self.inner.load_record(record_id)
    }

    fn record_ids(&self) -> Result<Vec<RecordId>, StorageError> {
        self.inner.record_ids()
    }

    fn append_op(&self, record_id: Option<RecordId>, op: &Operation) -> Result<(), StorageError> {
        self.write("append_op")?;
        self.inner.append_op(record_id, op)
    }

    fn ops_for_record(&self, record_id: RecordId) -> Result<Vec<Operation>, StorageError> {
        self.inner.ops_for_record(record_id)
    }

    fn relationship_ops(&self) -> Result<Vec<Operation>, StorageError> {
        self.inner.relationship_ops()
    }

    fn op_count(&self) -> Result<u64, StorageError> {
        self.inner.op_count()
    }

    fn save_relationship(&self, relationship: &Relationship) -> Result<(), StorageError> {
        self.write("save_relationship")?;
        self.inner.save_relationship(relationship)
    }

    fn load_relationships(&self) -> Result<Vec<Relationship>, StorageError> {
        self.inner.load_relationships()
    }

    fn save_vector_state(&self, record_id: RecordId, state: &VectorState) -> Result<(), StorageError> {
        self.write("save_vector_state")?;
        self.inner.save_vector_state(record_id, state)
    }

    fn load_vector_state(&self, record_id: RecordId) -> Result<Option<VectorState>, StorageError> {
        self.inner.load_vector_state(record_id)
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        self.write("append_audit")?;
        self.inner.append_audit(entry)
    }

    fn audit_trail(&self) -> Result<Vec<AuditEntry>, StorageError> {
        self.inner.audit_trail()
    }

    fn enqueue_replay(
        &self,
        record_id: Option<RecordId>,
        operation: &Operation,
        reason: &str,
        attempts: u32,
    ) -> Result<i64, StorageError> {
        self.inner.enqueue_replay(record_id, operation, reason, attempts)
    }

    fn replay_queue(&self) -> Result<Vec<ReplayEntry>, StorageError> {
        self.inner.replay_queue()
    }

    fn remove_replay(&self, replay_id: i64) -> Result<(), StorageError> {
        self.inner.remove_replay(replay_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_count_down() -> Result<(), Box<dyn std::error::Error>> {
        let store = FlakyStore::in_memory()?;
        store.fail_next(2);
        assert!(store.write("row").is_err_and(|e| e.is_transient()));
        assert!(store.relationship_ops()?.is_empty());
        assert!(store.write("row").is_err());
        store.write("row")?;
        assert_eq!(store.rejected_writes(), 2);
        Ok(())
    }

    #[test]
    fn offline_until_switched_back() {
        let store = FlakyStore::new(SqliteStore::open_in_memory().unwrap());
        store.set_offline(true);
        assert!(store.write("row").is_err());
        assert!(store.write("row").is_err());
        store.set_offline(false);
        assert!(store.write("row").is_ok());
    }
}
