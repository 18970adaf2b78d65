//! Derived embeddings per record: staleness tracking, background
//! regeneration and replica sync.

pub mod provider;
pub mod worker;

use std::sync::Arc;

use concord_core::wire::{ConsistencyMetadata, VectorConsistencyState};
use concord_core::{
    ActorId, CoreError, Decision, HlcClock, JobId, RecordId, StakeholderVector, VectorState,
    VectorSummary,
};
use concord_storage::{DurableStore, StorageError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

pub use provider::{EmbeddingProvider, ProviderError};
pub use worker::GenerationToken;

use crate::config::{RetryConfig, VectorConfig};
use crate::retry::RetryPolicy;
use worker::RegenerationJob;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("regeneration queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("no incoming vector awaiting a decision for {record_id:?}")]
    NoPendingDecision { record_id: RecordId },

    #[error("regeneration workers have stopped")]
    WorkersStopped,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Persisted,
    Superseded,
    Failed(String),
}

/// Returned by every enqueue. Awaiting it is optional.
#[derive(Debug)]
pub struct RegenerationHandle {
    pub job_id: JobId,
    pub record_id: RecordId,
    pub generation: u64,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl RegenerationHandle {
    pub async fn outcome(self) -> JobOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("worker dropped the job".into()))
    }
}

/// How concurrent syncs of different vectors are settled for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorResolution {
    #[default]
    MostRecent,
    KeepLocal,
    PreferIncoming,
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Adopted,
    KeptLocal,
    Unchanged,
    /// Checksum did not match the embedding; nothing merged.
    RefetchRequested,
    NeedsDecision {
        local: VectorSummary,
        incoming: VectorSummary,
    },
}

/// Current vector, served even while stale.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorView {
    pub state: Option<VectorState>,
    pub stale: bool,
}

pub type PersistHook = Arc<dyn Fn(RecordId, &VectorState) + Send + Sync>;

#[derive(Debug, Default)]
struct VectorSlot {
    state: Option<VectorState>,
    /// Content hash of the latest committed record state.
    content_hash: Option<String>,
    stale: bool,
    generation: u64,
    live: Option<(GenerationToken, String)>,
    strategy: VectorResolution,
    awaiting_decision: Option<VectorState>,
    /// Contributions received before any vector existed.
    early_stakeholders: Vec<StakeholderVector>,
}

impl VectorSlot {
    fn refresh_stale(&mut self) {
        self.stale = match (&self.state, &self.content_hash) {
            (Some(state), Some(hash)) => state.content_hash != *hash,
            (None, Some(_)) => true,
            (_, None) => false,
        };
    }

    fn carry_stakeholders(&mut self, into: &mut VectorState) {
        let previous = self
            .state
            .as_ref()
            .map(|s| s.stakeholder_vectors.clone())
            .unwrap_or_default();
        for contribution in previous.into_iter().chain(self.early_stakeholders.drain(..)) {
            into.upsert_stakeholder(contribution);
        }
    }
}

pub(crate) struct VectorShared {
    slots: DashMap<RecordId, Arc<Mutex<VectorSlot>>>,
    durable: Arc<dyn DurableStore>,
    provider: Arc<dyn EmbeddingProvider>,
    dimensions: usize,
    retry: RetryPolicy,
    clock: Arc<Mutex<HlcClock>>,
    refetch: Mutex<Vec<RecordId>>,
    hook: Option<PersistHook>,
}

impl VectorShared {
    fn slot(&self, record_id: RecordId) -> Result<Arc<Mutex<VectorSlot>>, VectorError> {
        if let Some(slot) = self.slots.get(&record_id) {
            return Ok(Arc::clone(slot.value()));
        }
        let state = self
            .retry
            .run("load_vector_state", || self.durable.load_vector_state(record_id))
            .map_err(|e| e.last)?;
        let slot = self.slots.entry(record_id).or_insert_with(|| {
            Arc::new(Mutex::new(VectorSlot {
                state,
                ..VectorSlot::default()
            }))
        });
        Ok(Arc::clone(slot.value()))
    }

    fn persist(&self, record_id: RecordId, state: &VectorState) -> Result<(), StorageError> {
        self.retry
            .run("save_vector_state", || self.durable.save_vector_state(record_id, state))
            .map_err(|e| e.last)?;
        if let Some(hook) = &self.hook {
            hook(record_id, state);
        }
        Ok(())
    }

    /// Final checkpoint of a regeneration job.
    pub(crate) fn commit_generated(
        &self,
        record_id: RecordId,
        token: &GenerationToken,
        embedding: Vec<f32>,
        content_hash: String,
    ) -> JobOutcome {
        if embedding.len() != self.dimensions {
            return JobOutcome::Failed(
                VectorError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: embedding.len(),
                }
                .to_string(),
            );
        }
        let slot = match self.slot(record_id) {
            Ok(slot) => slot,
            Err(err) => return JobOutcome::Failed(err.to_string()),
        };
        let mut slot = slot.lock();
        if token.is_cancelled() || slot.generation != token.generation() {
            return JobOutcome::Superseded;
        }
        let timestamp = match self.clock.lock().tick() {
            Ok(ts) => ts,
            Err(err) => return JobOutcome::Failed(err.to_string()),
        };
        let mut state = VectorState::new(
            embedding,
            content_hash,
            self.provider.model_name().to_string(),
            timestamp,
        );
        slot.carry_stakeholders(&mut state);
        if let Err(err) = self.persist(record_id, &state) {
            return JobOutcome::Failed(err.to_string());
        }
        slot.state = Some(state);
        slot.live = None;
        slot.refresh_stale();
        JobOutcome::Persisted
    }

    /// Forget a failed job so the next content change for the same hash
    /// enqueues again. A newer generation keeps its own live job.
    pub(crate) fn release_failed(&self, record_id: RecordId, token: &GenerationToken) {
        let Some(slot) = self.slots.get(&record_id).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut slot = slot.lock();
        if slot.generation == token.generation()
            && slot.live.as_ref().is_some_and(|(live, _)| live.generation() == token.generation())
        {
            slot.live = None;
        }
    }
}

pub struct VectorConsistencyManager {
    shared: Arc<VectorShared>,
    queue: mpsc::Sender<RegenerationJob>,
    queue_capacity: usize,
}

impl VectorConsistencyManager {
    pub fn new(
        config: &VectorConfig,
        retry: &RetryConfig,
        durable: Arc<dyn DurableStore>,
        provider: Arc<dyn EmbeddingProvider>,
        clock: Arc<Mutex<HlcClock>>,
        runtime: &Handle,
        hook: Option<PersistHook>,
    ) -> Result<Self, VectorError> {
        if provider.dimensions() != config.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: config.dimensions,
                actual: provider.dimensions(),
            });
        }
        let shared = Arc::new(VectorShared {
            slots: DashMap::new(),
            durable,
            provider,
            dimensions: config.dimensions,
            retry: RetryPolicy::from(retry),
            clock,
            refetch: Mutex::new(Vec::new()),
            hook,
        });
        let (queue, jobs) = mpsc::channel(config.queue_capacity);
        worker::spawn_workers(runtime, config.worker_count, jobs, Arc::clone(&shared));
        Ok(Self {
            shared,
            queue,
            queue_capacity: config.queue_capacity,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.shared.dimensions
    }

    /// Record a committed content change. Enqueues a regeneration when the
    /// stored vector no longer matches and no live job already targets the
    /// new content.
    #[instrument(skip(self, input), fields(record_id = ?record_id))]
    pub fn on_content_committed(
        &self,
        record_id: RecordId,
        content_hash: &str,
        input: &str,
    ) -> Result<Option<RegenerationHandle>, VectorError> {
        let slot = self.shared.slot(record_id)?;
        let mut slot = slot.lock();
        slot.content_hash = Some(content_hash.to_string());
        if slot.state.as_ref().is_some_and(|s| s.content_hash == content_hash) {
            if let Some((token, _)) = slot.live.take() {
                token.cancel();
            }
            slot.stale = false;
            return Ok(None);
        }
        if slot.live.as_ref().is_some_and(|(_, hash)| hash == content_hash) {
            return Ok(None);
        }
        slot.stale = true;
        self.enqueue(&mut slot, record_id, input, content_hash).map(Some)
    }

    pub fn mark_stale(&self, record_id: RecordId) -> Result<(), VectorError> {
        self.shared.slot(record_id)?.lock().stale = true;
        Ok(())
    }

    /// Start a fresh job for `record_id`, superseding any in-flight one.
    pub fn regenerate(
        &self,
        record_id: RecordId,
        content_hash: &str,
        input: &str,
    ) -> Result<RegenerationHandle, VectorError> {
        let slot = self.shared.slot(record_id)?;
        let mut slot = slot.lock();
        slot.content_hash = Some(content_hash.to_string());
        slot.stale = true;
        self.enqueue(&mut slot, record_id, input, content_hash)
    }

    fn enqueue(
        &self,
        slot: &mut VectorSlot,
        record_id: RecordId,
        input: &str,
        content_hash: &str,
    ) -> Result<RegenerationHandle, VectorError> {
        if let Some((token, _)) = slot.live.take() {
            debug!(generation = token.generation(), "superseding in-flight regeneration");
            token.cancel();
        }
        slot.generation += 1;
        let token = GenerationToken::new(slot.generation);
        let (reply, outcome) = oneshot::channel();
        let job_id = JobId::new();
        let job = RegenerationJob {
            job_id,
            record_id,
            token: token.clone(),
            input: input.to_string(),
            content_hash: content_hash.to_string(),
            reply,
        };
        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(VectorError::QueueFull {
                    capacity: self.queue_capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(VectorError::WorkersStopped),
        }
        slot.live = Some((token, content_hash.to_string()));
        Ok(RegenerationHandle {
            job_id,
            record_id,
            generation: slot.generation,
            outcome,
        })
    }

    /// Merge a vector received from another replica.
    #[instrument(skip(self, incoming), fields(record_id = ?record_id))]
    pub fn sync(
        &self,
        record_id: RecordId,
        incoming: VectorState,
    ) -> Result<SyncOutcome, VectorError> {
        if !incoming.checksum_matches() {
            warn!("vector checksum mismatch, requesting refetch");
            let mut refetch = self.shared.refetch.lock();
            if !refetch.contains(&record_id) {
                refetch.push(record_id);
            }
            return Ok(SyncOutcome::RefetchRequested);
        }
        if incoming.primary_embedding.len() != self.shared.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.shared.dimensions,
                actual: incoming.primary_embedding.len(),
            });
        }
        self.shared.clock.lock().receive(&incoming.generation_timestamp)?;

        let slot = self.shared.slot(record_id)?;
        let mut slot = slot.lock();
        let Some(local) = slot.state.clone() else {
            self.adopt(&mut slot, record_id, incoming)?;
            return Ok(SyncOutcome::Adopted);
        };
        if local.consistency_checksum == incoming.consistency_checksum
            && local.content_hash == incoming.content_hash
        {
            let mut merged = local.clone();
            for contribution in incoming.stakeholder_vectors {
                merged.upsert_stakeholder(contribution);
            }
            if merged != local {
                self.shared.persist(record_id, &merged)?;
                slot.state = Some(merged);
            }
            return Ok(SyncOutcome::Unchanged);
        }

        let take_incoming = match slot.strategy {
            VectorResolution::MostRecent => {
                incoming.generation_timestamp > local.generation_timestamp
            }
            VectorResolution::KeepLocal => false,
            VectorResolution::PreferIncoming => true,
            VectorResolution::Manual => {
                let outcome = SyncOutcome::NeedsDecision {
                    local: summary(&local),
                    incoming: summary(&incoming),
                };
                slot.awaiting_decision = Some(incoming);
                return Ok(outcome);
            }
        };
        if take_incoming {
            self.adopt(&mut slot, record_id, incoming)?;
            Ok(SyncOutcome::Adopted)
        } else {
            let mut merged = local.clone();
            for contribution in incoming.stakeholder_vectors {
                merged.upsert_stakeholder(contribution);
            }
            if merged != local {
                self.shared.persist(record_id, &merged)?;
                slot.state = Some(merged);
            }
            Ok(SyncOutcome::KeptLocal)
        }
    }

    fn adopt(
        &self,
        slot: &mut VectorSlot,
        record_id: RecordId,
        mut incoming: VectorState,
    ) -> Result<(), VectorError> {
        slot.carry_stakeholders(&mut incoming);
        self.shared.persist(record_id, &incoming)?;
        if slot
            .live
            .as_ref()
            .is_some_and(|(_, hash)| *hash == incoming.content_hash)
            && let Some((token, _)) = slot.live.take()
        {
            token.cancel();
        }
        slot.state = Some(incoming);
        slot.refresh_stale();
        Ok(())
    }

    /// Apply a coordinator decision to a sync that was held for manual
    /// resolution. Returns the resulting state when it changed.
    pub fn resolve_pending(
        &self,
        record_id: RecordId,
        decision: Decision,
    ) -> Result<Option<VectorState>, VectorError> {
        let slot = self.shared.slot(record_id)?;
        let mut slot = slot.lock();
        let incoming = slot
            .awaiting_decision
            .take()
            .ok_or(VectorError::NoPendingDecision { record_id })?;
        match decision {
            Decision::TakeIncomingVector => {
                self.adopt(&mut slot, record_id, incoming)?;
                Ok(slot.state.clone())
            }
            Decision::RegenerateVector => {
                slot.stale = true;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub fn has_pending_decision(&self, record_id: RecordId) -> bool {
        self.shared
            .slots
            .get(&record_id)
            .is_some_and(|slot| slot.lock().awaiting_decision.is_some())
    }

    /// Auxiliary per-actor vector; never touches the primary embedding.
    pub fn apply_stakeholder(
        &self,
        record_id: RecordId,
        contribution: StakeholderVector,
    ) -> Result<bool, VectorError> {
        if contribution.vector.len() != self.shared.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.shared.dimensions,
                actual: contribution.vector.len(),
            });
        }
        let slot = self.shared.slot(record_id)?;
        let mut slot = slot.lock();
        let Some(mut state) = slot.state.clone() else {
            let early = &mut slot.early_stakeholders;
            return Ok(match early.iter_mut().find(|s| s.actor_id == contribution.actor_id) {
                Some(existing) if existing.lamport >= contribution.lamport => false,
                Some(existing) => {
                    *existing = contribution;
                    true
                }
                None => {
                    early.push(contribution);
                    true
                }
            });
        };
        if !state.upsert_stakeholder(contribution) {
            return Ok(false);
        }
        self.shared.persist(record_id, &state)?;
        slot.state = Some(state);
        Ok(true)
    }

    pub fn view(&self, record_id: RecordId) -> Result<VectorView, VectorError> {
        let slot = self.shared.slot(record_id)?;
        let slot = slot.lock();
        Ok(VectorView {
            state: slot.state.clone(),
            stale: slot.stale,
        })
    }

    /// Wire form of the local vector for sending to another replica.
    pub fn export(
        &self,
        record_id: RecordId,
        source_replica: &ActorId,
    ) -> Result<Option<VectorConsistencyState>, VectorError> {
        let view = self.view(record_id)?;
        Ok(view.state.map(|vector_state| VectorConsistencyState {
            memory_id: record_id,
            vector_state,
            consistency_metadata: ConsistencyMetadata {
                source_replica: source_replica.clone(),
                stale: view.stale,
            },
        }))
    }

    pub fn set_strategy(
        &self,
        record_id: RecordId,
        strategy: VectorResolution,
    ) -> Result<(), VectorError> {
        self.shared.slot(record_id)?.lock().strategy = strategy;
        Ok(())
    }

    pub fn take_refetch_requests(&self) -> Vec<RecordId> {
        std::mem::take(&mut *self.shared.refetch.lock())
    }
}

pub fn summary(state: &VectorState) -> VectorSummary {
    VectorSummary {
        content_hash: state.content_hash.clone(),
        embedding_model: state.embedding_model.clone(),
        generation_timestamp: state.generation_timestamp,
        consistency_checksum: state.consistency_checksum.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::Hlc;
    use concord_storage::SqliteStore;
    use std::time::Duration;

    struct Fixed {
        dims: usize,
        delay: Duration,
    }

    impl EmbeddingProvider for Fixed {
        fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            std::thread::sleep(self.delay);
            if text == "fail" {
                return Err(ProviderError("refused".into()));
            }
            Ok(vec![text.len() as f32; self.dims])
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }
    }

    fn manager(delay: Duration) -> (VectorConsistencyManager, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = VectorConfig {
            dimensions: 4,
            ..VectorConfig::default()
        };
        let manager = VectorConsistencyManager::new(
            &config,
            &RetryConfig::default(),
            store.clone(),
            Arc::new(Fixed { dims: 4, delay }),
            Arc::new(Mutex::new(HlcClock::new())),
            &Handle::current(),
            None,
        )
        .unwrap();
        (manager, store)
    }

    fn state(value: f32, hash: &str, wall_ms: u64) -> VectorState {
        VectorState::new(vec![value; 4], hash.into(), "fixed".into(), Hlc::new(wall_ms, 0))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_edit_supersedes_in_flight_job() {
        let (manager, store) = manager(Duration::from_millis(100));
        let record = RecordId::new();
        let first = manager.on_content_committed(record, "h1", "first").unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = manager.on_content_committed(record, "h2", "second!").unwrap().unwrap();
        assert!(second.generation > first.generation);

        assert_eq!(first.outcome().await, JobOutcome::Superseded);
        assert_eq!(second.outcome().await, JobOutcome::Persisted);
        let persisted = store.load_vector_state(record).unwrap().unwrap();
        assert_eq!(persisted.content_hash, "h2");
        let view = manager.view(record).unwrap();
        assert!(!view.stale);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unchanged_content_needs_no_job() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        let handle = manager.on_content_committed(record, "h1", "text").unwrap().unwrap();
        assert_eq!(handle.outcome().await, JobOutcome::Persisted);
        assert!(manager.on_content_committed(record, "h1", "text").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn provider_failure_leaves_vector_stale() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        let handle = manager.on_content_committed(record, "h1", "fail").unwrap().unwrap();
        assert!(matches!(handle.outcome().await, JobOutcome::Failed(_)));
        let view = manager.view(record).unwrap();
        assert!(view.stale);
        assert!(view.state.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn most_recent_sync_wins() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        assert_eq!(manager.sync(record, state(1.0, "a", 10)).unwrap(), SyncOutcome::Adopted);
        assert_eq!(manager.sync(record, state(2.0, "b", 5)).unwrap(), SyncOutcome::KeptLocal);
        assert_eq!(manager.sync(record, state(3.0, "c", 20)).unwrap(), SyncOutcome::Adopted);
        let view = manager.view(record).unwrap();
        assert_eq!(view.state.unwrap().content_hash, "c");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_sync_requests_refetch() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        let mut corrupt = state(1.0, "a", 10);
        corrupt.primary_embedding[0] = 9.0;
        assert_eq!(manager.sync(record, corrupt).unwrap(), SyncOutcome::RefetchRequested);
        assert!(manager.view(record).unwrap().state.is_none());
        assert_eq!(manager.take_refetch_requests(), vec![record]);
        assert!(manager.take_refetch_requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_strategy_holds_incoming() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        manager.sync(record, state(1.0, "a", 10)).unwrap();
        manager.set_strategy(record, VectorResolution::Manual).unwrap();
        let outcome = manager.sync(record, state(2.0, "b", 20)).unwrap();
        assert!(matches!(outcome, SyncOutcome::NeedsDecision { .. }));
        assert!(manager.has_pending_decision(record));

        let adopted = manager.resolve_pending(record, Decision::TakeIncomingVector).unwrap();
        assert_eq!(adopted.unwrap().content_hash, "b");
        assert!(matches!(
            manager.resolve_pending(record, Decision::KeepLocalVector),
            Err(VectorError::NoPendingDecision { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stakeholders_survive_regeneration() {
        let (manager, _) = manager(Duration::ZERO);
        let record = RecordId::new();
        let contribution = StakeholderVector {
            actor_id: ActorId::from("alice"),
            vector: vec![0.5; 4],
            weight: 0.3,
            lamport: 1,
        };
        assert!(manager.apply_stakeholder(record, contribution.clone()).unwrap());
        assert!(!manager.apply_stakeholder(record, contribution).unwrap());

        let handle = manager.on_content_committed(record, "h1", "x").unwrap().unwrap();
        assert_eq!(handle.outcome().await, JobOutcome::Persisted);
        let state = manager.view(record).unwrap().state.unwrap();
        assert_eq!(state.stakeholder_vectors.len(), 1);
        assert_eq!(state.primary_embedding, vec![1.0; 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_dimensions_rejected() {
        let (manager, _) = manager(Duration::ZERO);
        let bad = VectorState::new(vec![1.0; 3], "a".into(), "fixed".into(), Hlc::new(1, 0));
        assert!(matches!(
            manager.sync(RecordId::new(), bad),
            Err(VectorError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }
}
