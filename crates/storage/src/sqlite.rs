use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use concord_core::{
    AuditEntry, EdgeStatus, Operation, Record, RecordId, Relationship, VectorState,
};

use crate::error::{StorageError, decode, encode};
use crate::store::{DurableStore, ReplayEntry};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn status_str(status: EdgeStatus) -> &'static str {
    match status {
        EdgeStatus::Active => "active",
        EdgeStatus::Deleted => "deleted",
        EdgeStatus::Tentative => "tentative",
    }
}

/// Durable store over a single SQLite connection. Callers share it behind an
/// `Arc`; statements are serialized on the connection mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn blobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Vec<u8>>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl DurableStore for SqliteStore {
    fn save_record(&self, record: &Record) -> Result<(), StorageError> {
        let state = encode(record)?;
        let version_vector = record.version_vector.to_msgpack()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (record_id, version_vector, content_hash, updated_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(record_id) DO UPDATE SET
                version_vector = excluded.version_vector,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at,
                state = excluded.state",
            rusqlite::params![
                record.id.as_bytes().as_slice(),
                version_vector,
                record.content_hash(),
                &record.updated_at.to_bytes()[..],
                state,
            ],
        )?;
        debug!(record_id = %record.id, "record saved");
        Ok(())
    }

    fn load_record(&self, record_id: RecordId) -> Result<Option<Record>, StorageError> {
        let conn = self.conn.lock();
        let state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM records WHERE record_id = ?1",
                rusqlite::params![record_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        state.map(|bytes| decode(&bytes)).transpose()
    }

    fn record_ids(&self) -> Result<Vec<RecordId>, StorageError> {
        self.blobs("SELECT record_id FROM records ORDER BY record_id", [])?
            .into_iter()
            .map(|bytes| to_array::<16>(bytes, "record_id").map(RecordId::from_bytes))
            .collect()
    }

    fn append_op(&self, record_id: Option<RecordId>, op: &Operation) -> Result<(), StorageError> {
        let payload = op.to_msgpack()?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO oplog (op_id, record_id, actor_id, lamport, hlc, op_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                op.operation_id.as_bytes().as_slice(),
                record_id.map(|id| id.as_bytes().to_vec()),
                op.actor_id.as_str(),
                op.lamport_clock as i64,
                &op.timestamp.to_bytes()[..],
                op.op_type_name(),
                payload,
            ],
        )?;
        if inserted == 0 {
            debug!(op_id = %op.operation_id, "operation already logged");
        }
        Ok(())
    }

    fn ops_for_record(&self, record_id: RecordId) -> Result<Vec<Operation>, StorageError> {
        self.blobs(
            "SELECT payload FROM oplog WHERE record_id = ?1 ORDER BY rowid",
            rusqlite::params![record_id.as_bytes().as_slice()],
        )?
        .iter()
        .map(|bytes| Operation::from_msgpack(bytes).map_err(StorageError::from))
        .collect()
    }

    fn relationship_ops(&self) -> Result<Vec<Operation>, StorageError> {
        self.blobs(
            "SELECT payload FROM oplog WHERE record_id IS NULL ORDER BY rowid",
            [],
        )?
        .iter()
        .map(|bytes| Operation::from_msgpack(bytes).map_err(StorageError::from))
        .collect()
    }

    fn op_count(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM oplog", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn save_relationship(&self, relationship: &Relationship) -> Result<(), StorageError> {
        let state = encode(relationship)?;
        let key = &relationship.key;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO relationships (source_id, target_id, relationship_type, weight, status, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id, target_id, relationship_type) DO UPDATE SET
                weight = excluded.weight,
                status = excluded.status,
                state = excluded.state",
            rusqlite::params![
                key.source_id.as_bytes().as_slice(),
                key.target_id.as_bytes().as_slice(),
                key.relationship_type,
                relationship.weight,
                status_str(relationship.status),
                state,
            ],
        )?;
        Ok(())
    }

    fn load_relationships(&self) -> Result<Vec<Relationship>, StorageError> {
        self.blobs(
            "SELECT state FROM relationships ORDER BY source_id, target_id, relationship_type",
            [],
        )?
        .iter()
        .map(|bytes| decode(bytes))
        .collect()
    }

    fn save_vector_state(
        &self,
        record_id: RecordId,
        state: &VectorState,
    ) -> Result<(), StorageError> {
        let blob = encode(state)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vector_states (record_id, content_hash, embedding_model, generation_timestamp, consistency_checksum, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                embedding_model = excluded.embedding_model,
                generation_timestamp = excluded.generation_timestamp,
                consistency_checksum = excluded.consistency_checksum,
                state = excluded.state",
            rusqlite::params![
                record_id.as_bytes().as_slice(),
                state.content_hash,
                state.embedding_model,
                &state.generation_timestamp.to_bytes()[..],
                state.consistency_checksum,
                blob,
            ],
        )?;
        debug!(record_id = %record_id, content_hash = %state.content_hash, "vector state saved");
        Ok(())
    }

    fn load_vector_state(&self, record_id: RecordId) -> Result<Option<VectorState>, StorageError> {
        let conn = self.conn.lock();
        let state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM vector_states WHERE record_id = ?1",
                rusqlite::params![record_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        state.map(|bytes| decode(&bytes)).transpose()
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let blob = encode(entry)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_trail (sequence, conflict_id, previous_hash, entry_hash, entry)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.sequence as i64,
                entry.conflict_id.as_bytes().as_slice(),
                entry.previous_hash,
                entry.entry_hash,
                blob,
            ],
        )?;
        Ok(())
    }

    fn audit_trail(&self) -> Result<Vec<AuditEntry>, StorageError> {
        self.blobs("SELECT entry FROM audit_trail ORDER BY sequence", [])?
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }

    fn enqueue_replay(
        &self,
        record_id: Option<RecordId>,
        operation: &Operation,
        reason: &str,
        attempts: u32,
    ) -> Result<i64, StorageError> {
        let payload = operation.to_msgpack()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO replay_queue (record_id, op_id, reason, attempts, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record_id.map(|id| id.as_bytes().to_vec()),
                operation.operation_id.as_bytes().as_slice(),
                reason,
                attempts,
                payload,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn replay_queue(&self) -> Result<Vec<ReplayEntry>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT replay_id, record_id, reason, attempts, payload FROM replay_queue ORDER BY replay_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (replay_id, record_id, reason, attempts, payload) in rows {
            let record_id = record_id
                .map(|bytes| to_array::<16>(bytes, "record_id").map(RecordId::from_bytes))
                .transpose()?;
            entries.push(ReplayEntry {
                replay_id,
                record_id,
                operation: Operation::from_msgpack(&payload)?,
                reason,
                attempts,
            });
        }
        Ok(entries)
    }

    fn remove_replay(&self, replay_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM replay_queue WHERE replay_id = ?1",
            rusqlite::params![replay_id],
        )?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("replay entry {replay_id}")));
        }
        Ok(())
    }
}
