use concord_core::{CoreError, OpId, RecordId};
use concord_storage::StorageError;
use thiserror::Error;

use crate::conflict::ConflictError;
use crate::feed::FeedError;
use crate::relationship::ConstraintViolation;
use crate::vector::VectorError;

/// An operation rejected by content or format rules. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed ({rule}): {message}")]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

impl From<CoreError> for ValidationError {
    fn from(err: CoreError) -> Self {
        let rule = match &err {
            CoreError::InvalidPosition(_) => "position",
            CoreError::FieldTypeMismatch { .. } => "field_type",
            CoreError::HlcDriftTooLarge { .. } => "timestamp",
            _ => "payload",
        };
        Self::new(rule, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("causal dependencies of {operation_id:?} did not arrive within {waited_ms}ms")]
    CausalityTimeout { operation_id: OpId, waited_ms: u64 },

    #[error("causal buffer for {record_id:?} is full ({capacity} pending)")]
    CausalBufferFull { record_id: RecordId, capacity: usize },

    #[error(transparent)]
    ConstraintViolation(#[from] ConstraintViolation),

    #[error("vector for {record_id:?} is stale")]
    VectorStale { record_id: RecordId },

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("storage unavailable after {attempts} attempts: {source}")]
    StorageExhausted {
        attempts: u32,
        replay_id: Option<i64>,
        #[source]
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
