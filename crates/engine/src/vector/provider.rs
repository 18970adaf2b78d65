use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("embedding provider failed: {0}")]
pub struct ProviderError(pub String);

/// External embedding service. Calls are blocking and run on the blocking
/// thread pool.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}
