// src/adapters/boosted.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{default_version, ModelAdapter};
use crate::models::{ModelOutput, Prediction, SkipReason};
use crate::sources::FeatureVector;

/// One node of a regression tree. A missing feature follows `default_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: String,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        #[serde(default)]
        default_left: bool,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Default)]
struct Walk {
    splits: usize,
    missing: usize,
}

impl TreeNode {
    fn evaluate(&self, features: &FeatureVector, walk: &mut Walk) -> f64 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
                default_left,
            } => {
                walk.splits += 1;
                let go_left = match features.get(feature) {
                    Some(v) => v < *threshold,
                    None => {
                        walk.missing += 1;
                        *default_left
                    }
                };
                if go_left {
                    left.evaluate(features, walk)
                } else {
                    right.evaluate(features, walk)
                }
            }
        }
    }
}

fn default_learning_rate() -> f64 {
    1.0
}

fn default_min_coverage() -> f64 {
    0.5
}

/// Additive tree ensemble over a base value. Trees predict residuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedParams {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Feature to start from; `base_score` when unset.
    #[serde(default)]
    pub base_feature: Option<String>,
    #[serde(default)]
    pub base_score: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    pub trees: Vec<TreeNode>,
    /// Minimum share of visited splits whose feature was present.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

pub struct BoostedModel {
    params: BoostedParams,
}

impl BoostedModel {
    pub fn new(params: BoostedParams) -> Self {
        Self { params }
    }
}

impl ModelAdapter for BoostedModel {
    fn model_id(&self) -> &str {
        &self.params.id
    }

    fn model_version(&self) -> &str {
        &self.params.version
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelOutput> {
        let p = &self.params;
        if p.trees.is_empty() {
            bail!("boosted model '{}' has no trees", p.id);
        }

        let base = match &p.base_feature {
            Some(name) => match features.get(name) {
                Some(v) => v,
                None => {
                    return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(format!(
                        "base feature '{}' missing",
                        name
                    ))))
                }
            },
            None => p.base_score,
        };

        let mut walk = Walk::default();
        let residual: f64 = p.trees.iter().map(|t| t.evaluate(features, &mut walk)).sum();

        let coverage = if walk.splits == 0 {
            1.0
        } else {
            1.0 - walk.missing as f64 / walk.splits as f64
        };
        if coverage < p.min_coverage {
            return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(format!(
                "{} of {} split features missing",
                walk.missing, walk.splits
            ))));
        }

        let predicted = base + p.learning_rate * residual;
        if !predicted.is_finite() {
            bail!("boosted model '{}' produced a non-finite value", p.id);
        }
        Ok(ModelOutput::Predicted(Prediction::new(
            predicted,
            0.5 + 0.4 * coverage,
        )))
    }
}
