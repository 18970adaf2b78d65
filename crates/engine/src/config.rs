//! Engine configuration.
//!
//! Every section is optional in TOML; missing keys fall back to the defaults
//! documented on each field.

use std::collections::BTreeMap;

use concord_core::wire::ValidationRuleSpec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub causal: CausalConfig,
    pub ot: OtConfig,
    pub vector: VectorConfig,
    pub retry: RetryConfig,
    pub feed: FeedConfig,
    pub conflicts: ConflictConfig,
    pub relationship_types: Vec<RelationshipTypeConfig>,
    /// Rules applied to every edit of the named text field, in addition to
    /// the rules carried by the operation itself.
    pub field_rules: BTreeMap<String, Vec<ValidationRuleSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalConfig {
    /// Operations waiting on dependencies, per record. Default: 1024.
    pub buffer_capacity: usize,
    /// How long a buffered operation may wait. Default: 30_000.
    pub timeout_ms: u64,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtConfig {
    /// Applied text deltas kept per field for rebasing late edits. Default: 512.
    pub history_limit: usize,
}

impl Default for OtConfig {
    fn default() -> Self {
        Self { history_limit: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Background regeneration workers. Default: 2.
    pub worker_count: usize,
    /// Pending regeneration jobs before enqueue fails. Default: 256.
    pub queue_capacity: usize,
    /// Expected embedding length. Default: 1536.
    pub dimensions: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 256,
            dimensions: concord_core::vector::DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first. Default: 5.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Events kept for cursor replay. Default: 4096.
    pub retention: usize,
    /// Live broadcast buffer per subscriber. Default: 256.
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retention: 4096,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Let the coordinator pick a winner for concurrent create/delete.
    /// Default: false (such conflicts are escalated).
    pub auto_resolve_destructive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipTypeConfig {
    pub name: String,
    /// Reject edges that would close a cycle among edges of this type.
    pub acyclic: bool,
    pub allow_self_reference: bool,
    pub max_out_degree: Option<usize>,
    /// Longest chain of this type allowed through a new edge.
    pub max_path_depth: Option<usize>,
}

impl Default for RelationshipTypeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            acyclic: false,
            allow_self_reference: true,
            max_out_degree: None,
            max_path_depth: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.causal.buffer_capacity == 0 {
            return Err(EngineError::Config("causal.buffer_capacity must be positive".into()));
        }
        if self.vector.worker_count == 0 || self.vector.queue_capacity == 0 {
            return Err(EngineError::Config(
                "vector.worker_count and vector.queue_capacity must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be positive".into()));
        }
        if self.feed.channel_capacity == 0 {
            return Err(EngineError::Config("feed.channel_capacity must be positive".into()));
        }
        for rule in &self.relationship_types {
            if rule.name.is_empty() {
                return Err(EngineError::Config("relationship type without a name".into()));
            }
            if rule.max_path_depth.is_some() && !rule.acyclic {
                return Err(EngineError::Config(format!(
                    "relationship type {}: max_path_depth requires acyclic = true",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}
