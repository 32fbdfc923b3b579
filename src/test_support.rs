// src/test_support.rs
//! Fixtures shared by the unit tests.
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::adapters::ModelAdapter;
use crate::models::{
    GradeRecord, ModelOutput, Prediction, PredictionRecord, Recommendation, SkipReason,
};
use crate::sources::{FeatureLookup, FeatureStore, FeatureVector, MemoryFeatureStore};
use crate::utils::config::{CoordinatorConfig, LockConfig, RetryPolicy};

pub const TEST_MIN_EDGE: f64 = 0.5;

pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 18, 0, 0).unwrap()
}

pub fn context_for(entity_id: &str) -> String {
    format!("game-{}", entity_id)
}

pub fn prediction(entity_id: &str, model_id: &str, threshold: f64, value: f64) -> PredictionRecord {
    PredictionRecord {
        entity_id: entity_id.to_string(),
        context_id: context_for(entity_id),
        context_date: test_date(),
        model_id: model_id.to_string(),
        threshold_value: threshold,
        predicted_value: value,
        confidence: 0.7,
        recommendation: Recommendation::from_edge(value, threshold, TEST_MIN_EDGE),
        model_version: "v1".to_string(),
        created_at: fixed_time(),
    }
}

pub fn grade(
    entity_id: &str,
    model_id: &str,
    threshold: f64,
    actual: Option<f64>,
    correct: Option<bool>,
) -> GradeRecord {
    GradeRecord {
        entity_id: entity_id.to_string(),
        context_id: context_for(entity_id),
        context_date: test_date(),
        model_id: model_id.to_string(),
        threshold_value: threshold,
        recommendation: Recommendation::Over,
        predicted_value: threshold + 1.0,
        actual_value: actual,
        correct,
        margin: actual.map(|a| a - threshold),
        graded_at: fixed_time(),
    }
}

/// A typical active guard line: enough games and every feature the default models read.
pub fn feature_vector(entity_id: &str, thresholds: &[f64]) -> FeatureVector {
    FeatureVector {
        entity_id: entity_id.to_string(),
        context_id: context_for(entity_id),
        context_date: test_date(),
        active: true,
        thresholds: thresholds.to_vec(),
        values: BTreeMap::from([
            ("avg_last_5".to_string(), 21.0),
            ("avg_last_10".to_string(), 20.0),
            ("season_avg".to_string(), 19.5),
            ("games_played".to_string(), 40.0),
            ("std_last_10".to_string(), 4.0),
            ("minutes".to_string(), 32.0),
        ]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    Value(f64, f64),
    Skip,
    Fail,
    Panic,
}

/// Model whose behaviour per entity is fixed by the test.
pub struct ScriptedModel {
    id: String,
    default: Script,
    per_entity: HashMap<String, Script>,
}

impl ScriptedModel {
    pub fn new(id: &str, default: Script) -> Self {
        Self {
            id: id.to_string(),
            default,
            per_entity: HashMap::new(),
        }
    }

    pub fn with_entity(mut self, entity_id: &str, script: Script) -> Self {
        self.per_entity.insert(entity_id.to_string(), script);
        self
    }

    pub fn boxed(self) -> Box<dyn ModelAdapter> {
        Box::new(self)
    }
}

pub fn scripted(id: &str, script: Script) -> Box<dyn ModelAdapter> {
    ScriptedModel::new(id, script).boxed()
}

impl ModelAdapter for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn model_version(&self) -> &str {
        "scripted"
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelOutput> {
        match self.per_entity.get(&features.entity_id).copied().unwrap_or(self.default) {
            Script::Value(v, c) => Ok(ModelOutput::Predicted(Prediction::new(v, c))),
            Script::Skip => Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(
                "scripted skip".to_string(),
            ))),
            Script::Fail => bail!("scripted failure for {}", features.entity_id),
            Script::Panic => panic!("scripted panic for {}", features.entity_id),
        }
    }
}

/// Feature store that errors for chosen entities, always or for their first N lookups.
#[derive(Default)]
pub struct FlakyFeatureStore {
    pub inner: MemoryFeatureStore,
    always_fail: HashSet<String>,
    fail_first: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl FlakyFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing(mut self, entity_id: &str) -> Self {
        self.always_fail.insert(entity_id.to_string());
        self
    }

    pub fn failing_first(self, entity_id: &str, times: usize) -> Self {
        if let Ok(mut map) = self.fail_first.lock() {
            map.insert(entity_id.to_string(), times);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl FeatureStore for FlakyFeatureStore {
    async fn get_features(&self, entity_id: &str, context_date: NaiveDate) -> Result<FeatureLookup> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail.contains(entity_id) {
            return Err(anyhow!("feature store unavailable for {}", entity_id));
        }
        {
            let mut remaining = self
                .fail_first
                .lock()
                .map_err(|_| anyhow!("flaky store mutex poisoned"))?;
            if let Some(n) = remaining.get_mut(entity_id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(anyhow!("transient feature store error for {}", entity_id));
                }
            }
        }
        self.inner.get_features(entity_id, context_date).await
    }
}

pub fn fast_lock_config() -> LockConfig {
    LockConfig {
        ttl: Duration::from_millis(600),
        acquire_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(20),
    }
}

pub fn fast_coordinator_config(partition_size: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        max_workers: 4,
        partition_size,
        partition_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        block_on_partial_failure: false,
        optional_quorum: 0.6,
    }
}
