// src/models/grading.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::prediction::{BusinessKey, Recommendation, ThresholdKey};

/// Outcome of comparing one canonical prediction with what actually happened.
/// `correct` is `None` for pushes, PASS recommendations and entities that did not play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub entity_id: String,
    pub context_id: String,
    pub context_date: NaiveDate,
    pub model_id: String,
    pub threshold_value: f64,
    pub recommendation: Recommendation,
    pub predicted_value: f64,
    pub actual_value: Option<f64>,
    pub correct: Option<bool>,
    pub margin: Option<f64>,
    pub graded_at: DateTime<Utc>,
}

impl GradeRecord {
    pub fn business_key(&self) -> BusinessKey {
        BusinessKey {
            entity_id: self.entity_id.clone(),
            context_id: self.context_id.clone(),
            model_id: self.model_id.clone(),
            threshold: ThresholdKey::from_value(self.threshold_value),
        }
    }
}
