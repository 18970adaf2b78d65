use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use concord_engine::{EmbeddingProvider, ProviderError};

/// Embeds text by expanding its blake3 hash. Equal text gives equal vectors
/// on every replica.
#[derive(Debug)]
pub struct HashEmbedder {
    dimensions: usize,
    latency_ms: AtomicU64,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub const MODEL: &'static str = "hash-embedder-v1";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every later call blocks this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector `embed` returns for `text`.
    pub fn expected(&self, text: &str) -> Vec<f32> {
        let mut bytes = vec![0u8; self.dimensions * 4];
        blake3::Hasher::new()
            .update(text.as_bytes())
            .finalize_xof()
            .fill(&mut bytes);
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                (raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect()
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError("embedding service unavailable".into()));
        }
        Ok(self.expected(text))
    }

    fn model_name(&self) -> &str {
        Self::MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
