// src/models/prediction.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Threshold as integer thousandths, so business keys hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThresholdKey(pub i64);

impl ThresholdKey {
    pub fn from_value(value: f64) -> Self {
        Self((value * 1000.0).round() as i64)
    }

    pub fn value(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

/// Natural key of one logical prediction (or grade).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey {
    pub entity_id: String,
    pub context_id: String,
    pub model_id: String,
    pub threshold: ThresholdKey,
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.entity_id,
            self.context_id,
            self.model_id,
            self.threshold.value()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Over,
    Under,
    Pass,
}

impl Recommendation {
    /// PASS inside the minimum edge, otherwise the side the prediction falls on.
    pub fn from_edge(predicted_value: f64, threshold: f64, min_edge: f64) -> Self {
        let edge = predicted_value - threshold;
        if edge == 0.0 || edge.abs() < min_edge {
            Recommendation::Pass
        } else if edge > 0.0 {
            Recommendation::Over
        } else {
            Recommendation::Under
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Over => "OVER",
            Recommendation::Under => "UNDER",
            Recommendation::Pass => "PASS",
        }
    }
}

impl FromStr for Recommendation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OVER" => Ok(Recommendation::Over),
            "UNDER" => Ok(Recommendation::Under),
            "PASS" => Ok(Recommendation::Pass),
            other => Err(PipelineError::Config(format!(
                "unknown recommendation '{}'",
                other
            ))),
        }
    }
}

/// A model's numeric opinion, before it is laid against thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_value: f64,
    pub confidence: f64,
}

impl Prediction {
    pub fn new(predicted_value: f64, confidence: f64) -> Self {
        Self {
            predicted_value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Why a model declined to give an opinion. A skip is never a zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    FeaturesNotFound,
    InactiveEntity,
    InsufficientFeatures(String),
    NoContributors,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FeaturesNotFound => write!(f, "features not found"),
            SkipReason::InactiveEntity => write!(f, "entity inactive"),
            SkipReason::InsufficientFeatures(what) => write!(f, "insufficient features: {}", what),
            SkipReason::NoContributors => write!(f, "no contributing models"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Predicted(Prediction),
    Skip(SkipReason),
}

impl ModelOutput {
    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            ModelOutput::Predicted(p) => Some(p),
            ModelOutput::Skip(_) => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, ModelOutput::Skip(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub entity_id: String,
    pub context_id: String,
    pub context_date: NaiveDate,
    pub model_id: String,
    pub threshold_value: f64,
    pub predicted_value: f64,
    pub confidence: f64,
    pub recommendation: Recommendation,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

impl PredictionRecord {
    pub fn business_key(&self) -> BusinessKey {
        BusinessKey {
            entity_id: self.entity_id.clone(),
            context_id: self.context_id.clone(),
            model_id: self.model_id.clone(),
            threshold: ThresholdKey::from_value(self.threshold_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendation_respects_min_edge() {
        assert_eq!(Recommendation::from_edge(21.0, 20.5, 1.0), Recommendation::Pass);
        assert_eq!(Recommendation::from_edge(22.0, 20.5, 1.0), Recommendation::Over);
        assert_eq!(Recommendation::from_edge(19.0, 20.5, 1.0), Recommendation::Under);
        assert_eq!(Recommendation::from_edge(20.5, 20.5, 0.0), Recommendation::Pass);
    }

    #[test]
    fn test_threshold_key_is_exact() {
        assert_eq!(ThresholdKey::from_value(20.5), ThresholdKey::from_value(20.500_000_1));
        assert_ne!(ThresholdKey::from_value(20.5), ThresholdKey::from_value(21.5));
        assert_eq!(ThresholdKey::from_value(20.5).value(), 20.5);
    }

    #[test]
    fn test_recommendation_round_trips_through_text() {
        for rec in [Recommendation::Over, Recommendation::Under, Recommendation::Pass] {
            assert_eq!(rec.as_str().parse::<Recommendation>().unwrap(), rec);
        }
        assert!("SIDEWAYS".parse::<Recommendation>().is_err());
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Prediction::new(10.0, 1.4).confidence, 1.0);
        assert_eq!(Prediction::new(10.0, -0.2).confidence, 0.0);
    }
}
