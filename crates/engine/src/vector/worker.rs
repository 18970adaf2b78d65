//! Bounded pool of regeneration workers sharing one job queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use concord_core::{JobId, RecordId};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{JobOutcome, VectorShared};

/// Cancelled when a newer edit supersedes the job. Checked before the
/// provider call, after it returns, and under the slot lock before persisting.
#[derive(Debug, Clone)]
pub struct GenerationToken {
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl GenerationToken {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) struct RegenerationJob {
    pub job_id: JobId,
    pub record_id: RecordId,
    pub token: GenerationToken,
    pub input: String,
    pub content_hash: String,
    pub reply: oneshot::Sender<JobOutcome>,
}

pub(crate) fn spawn_workers(
    handle: &Handle,
    count: usize,
    jobs: mpsc::Receiver<RegenerationJob>,
    shared: Arc<VectorShared>,
) {
    let jobs = Arc::new(Mutex::new(jobs));
    for worker in 0..count {
        let jobs = Arc::clone(&jobs);
        let shared = Arc::clone(&shared);
        handle.spawn(async move {
            loop {
                let next = jobs.lock().await.recv().await;
                let Some(job) = next else {
                    break;
                };
                run_job(&shared, job).await;
            }
            debug!(worker, "vector worker stopped");
        });
    }
}

async fn run_job(shared: &Arc<VectorShared>, job: RegenerationJob) {
    let RegenerationJob {
        job_id,
        record_id,
        token,
        input,
        content_hash,
        reply,
    } = job;
    let outcome = regenerate(shared, record_id, token.clone(), input, content_hash).await;
    match &outcome {
        JobOutcome::Persisted => info!(?job_id, ?record_id, "vector regenerated"),
        JobOutcome::Superseded => debug!(?job_id, ?record_id, "regeneration superseded"),
        JobOutcome::Failed(reason) => {
            warn!(?job_id, ?record_id, reason, "regeneration failed");
            shared.release_failed(record_id, &token);
        }
    }
    // The caller may have dropped its handle.
    let _ = reply.send(outcome);
}

async fn regenerate(
    shared: &Arc<VectorShared>,
    record_id: RecordId,
    token: GenerationToken,
    input: String,
    content_hash: String,
) -> JobOutcome {
    if token.is_cancelled() {
        return JobOutcome::Superseded;
    }

    let provider = Arc::clone(&shared.provider);
    let embedding = match tokio::task::spawn_blocking(move || provider.embed(&input)).await {
        Ok(Ok(embedding)) => embedding,
        Ok(Err(err)) => return JobOutcome::Failed(err.to_string()),
        Err(join) => return JobOutcome::Failed(join.to_string()),
    };

    if token.is_cancelled() {
        return JobOutcome::Superseded;
    }

    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        shared.commit_generated(record_id, &token, embedding, content_hash)
    })
    .await
    .unwrap_or_else(|join| JobOutcome::Failed(join.to_string()))
}
