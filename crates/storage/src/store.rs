use concord_core::{
    AuditEntry, Operation, Record, RecordId, Relationship, VectorState, VersionVector,
};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// An operation whose persistence failed after all retries, kept for manual
/// replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub replay_id: i64,
    pub record_id: Option<RecordId>,
    pub operation: Operation,
    pub reason: String,
    pub attempts: u32,
}

/// Committed record, relationship, vector and audit state.
pub trait DurableStore: Send + Sync {
    fn save_record(&self, record: &Record) -> Result<(), StorageError>;

    fn load_record(&self, record_id: RecordId) -> Result<Option<Record>, StorageError>;

    fn record_ids(&self) -> Result<Vec<RecordId>, StorageError>;

    /// Appending an operation that is already logged is a no-op.
    fn append_op(&self, record_id: Option<RecordId>, op: &Operation) -> Result<(), StorageError>;

    fn ops_for_record(&self, record_id: RecordId) -> Result<Vec<Operation>, StorageError>;

    /// Logged relationship operations in append order.
    fn relationship_ops(&self) -> Result<Vec<Operation>, StorageError>;

    fn op_count(&self) -> Result<u64, StorageError>;

    fn save_relationship(&self, relationship: &Relationship) -> Result<(), StorageError>;

    fn load_relationships(&self) -> Result<Vec<Relationship>, StorageError>;

    fn save_vector_state(
        &self,
        record_id: RecordId,
        state: &VectorState,
    ) -> Result<(), StorageError>;

    fn load_vector_state(&self, record_id: RecordId) -> Result<Option<VectorState>, StorageError>;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError>;

    fn audit_trail(&self) -> Result<Vec<AuditEntry>, StorageError>;

    /// Returns the assigned replay id.
    fn enqueue_replay(
        &self,
        record_id: Option<RecordId>,
        operation: &Operation,
        reason: &str,
        attempts: u32,
    ) -> Result<i64, StorageError>;

    fn replay_queue(&self) -> Result<Vec<ReplayEntry>, StorageError>;

    fn remove_replay(&self, replay_id: i64) -> Result<(), StorageError>;
}

/// Low-latency state for records being actively edited: version vectors and
/// the operations still waiting on causal dependencies.
pub trait EphemeralStore: Send + Sync {
    fn put_version_vector(
        &self,
        record_id: RecordId,
        version_vector: &VersionVector,
    ) -> Result<(), StorageError>;

    fn version_vector(&self, record_id: RecordId) -> Result<Option<VersionVector>, StorageError>;

    fn put_causal_buffer(&self, record_id: RecordId, pending: &[Operation]) -> Result<(), StorageError>;

    fn causal_buffer(&self, record_id: RecordId) -> Result<Vec<Operation>, StorageError>;
}
