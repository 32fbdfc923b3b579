// src/adapters/similarity.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{default_version, ModelAdapter};
use crate::models::{ModelOutput, Prediction, SkipReason};
use crate::sources::FeatureVector;

/// A historical stat line and what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    #[serde(default)]
    pub label: Option<String>,
    pub values: BTreeMap<String, f64>,
    pub outcome: f64,
}

fn default_k() -> usize {
    3
}

/// k nearest reference profiles, inverse-distance weighted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityParams {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub features: Vec<String>,
    /// Per-feature divisor applied before distances; 1.0 when absent.
    #[serde(default)]
    pub scales: BTreeMap<String, f64>,
    #[serde(default = "default_k")]
    pub k: usize,
    pub references: Vec<ReferenceProfile>,
}

pub struct SimilarityModel {
    params: SimilarityParams,
}

impl SimilarityModel {
    pub fn new(params: SimilarityParams) -> Self {
        Self { params }
    }

    fn scale(&self, feature: &str) -> f64 {
        self.params
            .scales
            .get(feature)
            .copied()
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0)
    }

    /// None when the profile lacks one of the compared features.
    fn distance(&self, point: &[f64], profile: &ReferenceProfile) -> Option<f64> {
        let mut sum = 0.0;
        for (feature, value) in self.params.features.iter().zip(point) {
            let other = profile.values.get(feature)?;
            let d = (value - other) / self.scale(feature);
            sum += d * d;
        }
        Some(sum.sqrt())
    }
}

impl ModelAdapter for SimilarityModel {
    fn model_id(&self) -> &str {
        &self.params.id
    }

    fn model_version(&self) -> &str {
        &self.params.version
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelOutput> {
        let p = &self.params;
        if p.k == 0 || p.features.is_empty() {
            bail!("similarity model '{}' needs k > 0 and at least one feature", p.id);
        }

        let missing: Vec<&str> = p
            .features
            .iter()
            .filter(|f| features.get(f).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(format!(
                "missing {}",
                missing.join(", ")
            ))));
        }
        let point: Vec<f64> = p.features.iter().filter_map(|f| features.get(f)).collect();

        let mut neighbours: Vec<(f64, f64)> = p
            .references
            .iter()
            .filter_map(|r| self.distance(&point, r).map(|d| (d, r.outcome)))
            .collect();
        if neighbours.is_empty() {
            return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(
                "no comparable reference profiles".to_string(),
            )));
        }
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0));
        neighbours.truncate(p.k);

        let exact: Vec<f64> = neighbours
            .iter()
            .filter(|(d, _)| *d < 1e-9)
            .map(|(_, o)| *o)
            .collect();
        let predicted = if !exact.is_empty() {
            exact.iter().sum::<f64>() / exact.len() as f64
        } else {
            let (num, den) = neighbours
                .iter()
                .fold((0.0, 0.0), |(n, w), (d, o)| (n + o / d, w + 1.0 / d));
            num / den
        };

        let mean_distance =
            neighbours.iter().map(|(d, _)| d).sum::<f64>() / neighbours.len() as f64;
        Ok(ModelOutput::Predicted(Prediction::new(
            predicted,
            1.0 / (1.0 + mean_distance),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::feature_vector;

    fn profile(avg: f64, minutes: f64, outcome: f64) -> ReferenceProfile {
        ReferenceProfile {
            label: None,
            values: BTreeMap::from([("avg_last_5".to_string(), avg), ("minutes".to_string(), minutes)]),
            outcome,
        }
    }

    fn model(k: usize) -> SimilarityModel {
        SimilarityModel::new(SimilarityParams {
            id: "similarity_knn".into(),
            version: "v1".into(),
            features: vec!["avg_last_5".into(), "minutes".into()],
            scales: BTreeMap::from([("minutes".to_string(), 4.0)]),
            k,
            references: vec![
                profile(20.0, 32.0, 21.0),
                profile(24.0, 36.0, 25.0),
                profile(10.0, 20.0, 9.0),
            ],
        })
    }

    #[test]
    fn test_exact_match_returns_its_outcome() {
        let mut fv = feature_vector("p1", &[20.5]);
        fv.values.insert("avg_last_5".into(), 20.0);
        fv.values.insert("minutes".into(), 32.0);
        let prediction = model(2).predict(&fv).unwrap().prediction().cloned().unwrap();
        assert_eq!(prediction.predicted_value, 21.0);
    }

    #[test]
    fn test_nearer_profiles_weigh_more() {
        let mut fv = feature_vector("p1", &[20.5]);
        fv.values.insert("avg_last_5".into(), 21.0);
        fv.values.insert("minutes".into(), 33.0);
        let prediction = model(2).predict(&fv).unwrap().prediction().cloned().unwrap();
        assert!(prediction.predicted_value > 21.0 && prediction.predicted_value < 23.0);
        assert!(prediction.confidence < 1.0);
    }

    #[test]
    fn test_missing_feature_skips() {
        let mut fv = feature_vector("p1", &[20.5]);
        fv.values.remove("minutes");
        assert!(matches!(
            model(2).predict(&fv).unwrap(),
            ModelOutput::Skip(SkipReason::InsufficientFeatures(_))
        ));
    }
}
