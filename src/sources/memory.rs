// src/sources/memory.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{FeatureLookup, FeatureStore, FeatureVector, Outcome, OutcomeSource, RosterSource};

#[derive(Default)]
pub struct MemoryFeatureStore {
    vectors: Mutex<HashMap<(String, NaiveDate), FeatureVector>>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vector: FeatureVector) {
        if let Ok(mut vectors) = self.vectors.lock() {
            vectors.insert((vector.entity_id.clone(), vector.context_date), vector);
        }
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn get_features(&self, entity_id: &str, context_date: NaiveDate) -> Result<FeatureLookup> {
        let vectors = self
            .vectors
            .lock()
            .map_err(|_| anyhow!("feature store mutex poisoned"))?;
        Ok(match vectors.get(&(entity_id.to_string(), context_date)) {
            Some(v) => FeatureLookup::Found(v.clone()),
            None => FeatureLookup::NotFound,
        })
    }
}

#[derive(Default)]
pub struct MemoryRosterSource {
    rosters: Mutex<HashMap<NaiveDate, Vec<String>>>,
}

impl MemoryRosterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, context_date: NaiveDate, entity_ids: Vec<String>) {
        if let Ok(mut rosters) = self.rosters.lock() {
            rosters.insert(context_date, entity_ids);
        }
    }
}

#[async_trait]
impl RosterSource for MemoryRosterSource {
    async fn list_entities(&self, context_date: NaiveDate) -> Result<Vec<String>> {
        let rosters = self
            .rosters
            .lock()
            .map_err(|_| anyhow!("roster mutex poisoned"))?;
        Ok(rosters.get(&context_date).cloned().unwrap_or_default())
    }
}

/// Unknown (entity, context) pairs report `NotAvailable`.
#[derive(Default)]
pub struct MemoryOutcomeSource {
    outcomes: Mutex<HashMap<(String, String), Outcome>>,
}

impl MemoryOutcomeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: &str, context_id: &str, outcome: Outcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.insert((entity_id.to_string(), context_id.to_string()), outcome);
        }
    }
}

#[async_trait]
impl OutcomeSource for MemoryOutcomeSource {
    async fn get_actual(&self, entity_id: &str, context_id: &str) -> Result<Outcome> {
        let outcomes = self
            .outcomes
            .lock()
            .map_err(|_| anyhow!("outcome mutex poisoned"))?;
        Ok(outcomes
            .get(&(entity_id.to_string(), context_id.to_string()))
            .copied()
            .unwrap_or(Outcome::NotAvailable))
    }
}
