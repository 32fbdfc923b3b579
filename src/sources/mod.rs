// src/sources/mod.rs
pub mod cache;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cache::CachedFeatureStore;
pub use memory::{MemoryFeatureStore, MemoryOutcomeSource, MemoryRosterSource};
pub use postgres::{PgFeatureStore, PgOutcomeSource, PgRosterSource};

/// Everything the models know about one entity for one slate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub entity_id: String,
    pub context_id: String,
    pub context_date: NaiveDate,
    pub active: bool,
    /// Posted thresholds; one prediction per model per threshold.
    pub thresholds: Vec<f64>,
    pub values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureLookup {
    Found(FeatureVector),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Final(f64),
    DidNotParticipate,
    /// Not settled yet; grading defers the prediction.
    NotAvailable,
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_features(&self, entity_id: &str, context_date: NaiveDate) -> Result<FeatureLookup>;
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn list_entities(&self, context_date: NaiveDate) -> Result<Vec<String>>;
}

#[async_trait]
pub trait OutcomeSource: Send + Sync {
    async fn get_actual(&self, entity_id: &str, context_id: &str) -> Result<Outcome>;
}
