// src/ensemble.rs
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::adapters::default_version;
use crate::models::{ModelOutput, Prediction, SkipReason};

fn default_ensemble_id() -> String {
    "ensemble".to_string()
}

fn default_strong_agreement() -> f64 {
    1.0
}

fn default_disagreement() -> f64 {
    2.0
}

fn default_agreement_bonus() -> f64 {
    1.10
}

fn default_disagreement_penalty() -> f64 {
    0.85
}

fn default_single_source_discount() -> f64 {
    0.8
}

/// Spread thresholds are absolute differences in the predicted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_ensemble_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Static weight per sibling model. Need not sum to 1.
    pub weights: BTreeMap<String, f64>,
    #[serde(default = "default_strong_agreement")]
    pub strong_agreement: f64,
    #[serde(default = "default_disagreement")]
    pub disagreement: f64,
    #[serde(default = "default_agreement_bonus")]
    pub agreement_bonus: f64,
    #[serde(default = "default_disagreement_penalty")]
    pub disagreement_penalty: f64,
    #[serde(default = "default_single_source_discount")]
    pub single_source_discount: f64,
}

impl EnsembleConfig {
    pub fn with_weights(weights: BTreeMap<String, f64>) -> Self {
        Self {
            id: default_ensemble_id(),
            version: default_version(),
            weights,
            strong_agreement: default_strong_agreement(),
            disagreement: default_disagreement(),
            agreement_bonus: default_agreement_bonus(),
            disagreement_penalty: default_disagreement_penalty(),
            single_source_discount: default_single_source_discount(),
        }
    }
}

pub struct EnsembleCombiner {
    config: EnsembleConfig,
}

impl EnsembleCombiner {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn model_id(&self) -> &str {
        &self.config.id
    }

    pub fn model_version(&self) -> &str {
        &self.config.version
    }

    /// Blends sibling outputs. Skipped, failed or unweighted siblings do not contribute.
    pub fn combine(&self, siblings: &BTreeMap<String, ModelOutput>) -> ModelOutput {
        let contributors: Vec<(f64, &Prediction)> = self
            .config
            .weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .filter_map(|(id, w)| siblings.get(id).and_then(|o| o.prediction()).map(|p| (*w, p)))
            .collect();

        match contributors.as_slice() {
            [] => ModelOutput::Skip(SkipReason::NoContributors),
            [(_, only)] => ModelOutput::Predicted(Prediction::new(
                only.predicted_value,
                only.confidence * self.config.single_source_discount,
            )),
            many => {
                let total_weight: f64 = many.iter().map(|(w, _)| w).sum();
                let value = many.iter().map(|(w, p)| w * p.predicted_value).sum::<f64>() / total_weight;
                // Weights shape the value only; agreement adjusts the plain mean confidence.
                let base_confidence =
                    many.iter().map(|(_, p)| p.confidence).sum::<f64>() / many.len() as f64;

                // Max pairwise |difference| is the range.
                let (lo, hi) = many.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, p)| {
                    (lo.min(p.predicted_value), hi.max(p.predicted_value))
                });
                let spread = hi - lo;

                let confidence = if spread < self.config.strong_agreement {
                    (base_confidence * self.config.agreement_bonus).min(1.0)
                } else if spread > self.config.disagreement {
                    base_confidence * self.config.disagreement_penalty
                } else {
                    base_confidence
                };
                debug!(
                    "Ensemble of {} models: value {:.3}, spread {:.3}, confidence {:.3} -> {:.3}",
                    many.len(),
                    value,
                    spread,
                    base_confidence,
                    confidence
                );
                ModelOutput::Predicted(Prediction::new(value, confidence))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicted(value: f64, confidence: f64) -> ModelOutput {
        ModelOutput::Predicted(Prediction::new(value, confidence))
    }

    fn combiner() -> EnsembleCombiner {
        EnsembleCombiner::new(EnsembleConfig::with_weights(BTreeMap::from([
            ("a".to_string(), 1.0),
            ("b".to_string(), 1.0),
            ("c".to_string(), 2.0),
        ])))
    }

    #[test]
    fn test_agreement_raises_confidence() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(20.0, 0.6)),
            ("b".to_string(), predicted(20.5, 0.6)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert!((out.predicted_value - 20.25).abs() < 1e-9);
        assert!(out.confidence > 0.6);
        assert!((out.confidence - 0.66).abs() < 1e-9);
    }

    #[test]
    fn test_disagreement_lowers_confidence() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(18.0, 0.6)),
            ("b".to_string(), predicted(22.0, 0.6)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert!((out.predicted_value - 20.0).abs() < 1e-9);
        assert!(out.confidence < 0.6);
    }

    #[test]
    fn test_agreement_beats_plain_mean_with_unequal_weights() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(20.0, 0.9)),
            ("c".to_string(), predicted(20.5, 0.3)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert!(out.confidence > 0.6);
        assert!((out.confidence - 0.66).abs() < 1e-9);
        // (1 * 20 + 2 * 20.5) / 3
        assert!((out.predicted_value - 61.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_disagreement_below_plain_mean_with_unequal_weights() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(18.0, 0.1)),
            ("c".to_string(), predicted(22.0, 0.9)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert!(out.confidence < 0.5);
        assert!((out.confidence - 0.425).abs() < 1e-9);
    }

    #[test]
    fn test_weights_are_normalised_over_contributors() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(19.0, 0.5)),
            ("b".to_string(), ModelOutput::Skip(SkipReason::FeaturesNotFound)),
            ("c".to_string(), predicted(20.5, 0.8)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        // (1 * 19 + 2 * 20.5) / 3
        assert!((out.predicted_value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_contributor_is_discounted() {
        let siblings = BTreeMap::from([("a".to_string(), predicted(21.0, 0.5))]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert_eq!(out.predicted_value, 21.0);
        assert!((out.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_all_skipped_is_skip() {
        let siblings = BTreeMap::from([
            ("a".to_string(), ModelOutput::Skip(SkipReason::InactiveEntity)),
            ("unweighted".to_string(), predicted(20.0, 0.9)),
        ]);
        assert_eq!(
            combiner().combine(&siblings),
            ModelOutput::Skip(SkipReason::NoContributors)
        );
    }

    #[test]
    fn test_bonus_is_capped_at_one() {
        let siblings = BTreeMap::from([
            ("a".to_string(), predicted(20.0, 0.95)),
            ("b".to_string(), predicted(20.1, 0.95)),
        ]);
        let out = combiner().combine(&siblings).prediction().cloned().unwrap();
        assert_eq!(out.confidence, 1.0);
    }
}
