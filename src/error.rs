// src/error.rs
use std::time::Duration;
use thiserror::Error;

use crate::models::stats_models::DuplicateGroup;

/// Domain failures the pipeline recognises and reacts to. Most travel inside
/// `anyhow::Error`; recovered ones end up rendered in run summaries.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not acquire lock '{scope_key}' within {waited:?}")]
    LockAcquisition { scope_key: String, waited: Duration },

    #[error("model '{model_id}' failed for entity '{entity_id}': {message}")]
    ModelAdapter {
        model_id: String,
        entity_id: String,
        message: String,
    },

    #[error("{count} business keys duplicated in scope '{scope_key}' after consolidation", count = .duplicates.len())]
    ConsolidationDuplicate {
        scope_key: String,
        duplicates: Vec<DuplicateGroup>,
    },

    #[error("{count} of {requested} entities have no predictions after retries", count = .missing_entities.len())]
    PartialBatchFailure {
        requested: usize,
        missing_entities: Vec<String>,
    },

    #[error("{operation} timed out after {timeout:?}")]
    CallTimeout { operation: String, timeout: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),
}
