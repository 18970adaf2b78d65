use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use concord_core::wire::{
    RelationshipOperation, RelationshipOperationKind, StringOperation, StringOperationType,
    TransformationContext,
};
use concord_core::{ActorId, OpId, Operation, RecordId};
use concord_engine::{Engine, EngineConfig, EngineError};
use concord_storage::{MemoryEphemeralStore, SqliteStore, StorageError};
use tokio::runtime::Handle;

use crate::embedder::HashEmbedder;
use crate::flaky::FlakyStore;

/// Small vectors and short retry delays keep tests fast.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.vector.dimensions = 8;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config
}

/// One replica with handles on everything it talks to.
pub struct TestPeer {
    pub engine: Engine,
    pub store: Arc<FlakyStore>,
    pub ephemeral: Arc<MemoryEphemeralStore>,
    pub embedder: Arc<HashEmbedder>,
}

impl TestPeer {
    pub fn new(name: &str, runtime: &Handle) -> Result<Self, EngineError> {
        Self::with_config(name, test_config(), runtime)
    }

    pub fn with_config(name: &str, config: EngineConfig, runtime: &Handle) -> Result<Self, EngineError> {
        let store = FlakyStore::in_memory()?;
        Self::build(name, config, store, runtime)
    }

    /// Replica backed by a database file; opening the same path again
    /// simulates a restart.
    pub fn open(name: &str, config: EngineConfig, path: &Path, runtime: &Handle) -> Result<Self, EngineError> {
        let path = path
            .to_str()
            .ok_or_else(|| StorageError::NotFound(format!("{} is not utf-8", path.display())))?;
        let store = FlakyStore::new(SqliteStore::open(path)?);
        Self::build(name, config, store, runtime)
    }

    fn build(
        name: &str,
        config: EngineConfig,
        store: FlakyStore,
        runtime: &Handle,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(store);
        let ephemeral = Arc::new(MemoryEphemeralStore::new());
        let embedder = Arc::new(HashEmbedder::new(config.vector.dimensions));
        let engine = Engine::new(
            config,
            ActorId::new(name),
            store.clone(),
            ephemeral.clone(),
            embedder.clone(),
            runtime,
        )?;
        Ok(Self {
            engine,
            store,
            ephemeral,
            embedder,
        })
    }

    pub fn actor_id(&self) -> &ActorId {
        self.engine.replica_id()
    }

    /// Current text of a field; empty when the record or field is unknown.
    pub fn text(&self, record_id: RecordId, field: &str) -> Result<String, EngineError> {
        Ok(self
            .engine
            .get_state(record_id)?
            .and_then(|snapshot| snapshot.text(field))
            .unwrap_or_default())
    }

    pub fn insert(
        &self,
        record_id: RecordId,
        field: &str,
        position: usize,
        text: &str,
    ) -> Result<Vec<Operation>, EngineError> {
        let op = self.string_op(StringOperationType::Insert, position, text);
        self.engine.edit_string(record_id, field, &op)
    }

    /// `removed` is the text expected at `position`; only its length matters.
    pub fn delete(
        &self,
        record_id: RecordId,
        field: &str,
        position: usize,
        removed: &str,
    ) -> Result<Vec<Operation>, EngineError> {
        let op = self.string_op(StringOperationType::Delete, position, removed);
        self.engine.edit_string(record_id, field, &op)
    }

    fn string_op(&self, op_type: StringOperationType, position: usize, content: &str) -> StringOperation {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        StringOperation {
            op_type,
            position,
            content: content.to_string(),
            actor_id: self.actor_id().clone(),
            timestamp,
            lamport_clock: 0,
        }
    }

    pub fn relate(
        &self,
        relationship_type: &str,
        source: RecordId,
        target: RecordId,
        operation: RelationshipOperationKind,
        transformation_context: TransformationContext,
    ) -> Result<Operation, EngineError> {
        self.engine.relationship_op(&RelationshipOperation {
            operation_id: OpId::new(),
            relationship_type: relationship_type.to_string(),
            source_memory_id: source,
            target_memory_id: target,
            operation,
            transformation_context,
        })
    }

    pub fn link(
        &self,
        relationship_type: &str,
        source: RecordId,
        target: RecordId,
        weight: f64,
    ) -> Result<Operation, EngineError> {
        self.relate(
            relationship_type,
            source,
            target,
            RelationshipOperationKind::Create,
            TransformationContext {
                weight: Some(weight),
                ..TransformationContext::default()
            },
        )
    }

    pub fn unlink(
        &self,
        relationship_type: &str,
        source: RecordId,
        target: RecordId,
    ) -> Result<Operation, EngineError> {
        self.relate(
            relationship_type,
            source,
            target,
            RelationshipOperationKind::Delete,
            TransformationContext::default(),
        )
    }
}
