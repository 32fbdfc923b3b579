// src/adapters/mod.rs
pub mod baseline;
pub mod boosted;
pub mod registry;
pub mod similarity;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ensemble::EnsembleConfig;
use crate::models::ModelOutput;
use crate::sources::FeatureVector;

pub use baseline::{BaselineModel, BaselineParams};
pub use boosted::{BoostedModel, BoostedParams, TreeNode};
pub use registry::{ModelRegistry, RegistryRun};
pub use similarity::{ReferenceProfile, SimilarityModel, SimilarityParams};

/// A scoring model. `Ok(Skip)` is a decision not to predict; `Err` is a failure
/// that the caller isolates from sibling models. Inactive entities never reach `predict`.
pub trait ModelAdapter: Send + Sync {
    fn model_id(&self) -> &str;
    fn model_version(&self) -> &str;
    fn predict(&self, features: &FeatureVector) -> Result<ModelOutput>;
}

pub(crate) fn default_version() -> String {
    "v1".to_string()
}

/// Model configuration as loaded from `MODELS_CONFIG_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    StatisticalBaseline(BaselineParams),
    GradientBoosted(BoostedParams),
    Similarity(SimilarityParams),
    Ensemble(EnsembleConfig),
}

impl ModelSpec {
    pub fn id(&self) -> &str {
        match self {
            ModelSpec::StatisticalBaseline(p) => &p.id,
            ModelSpec::GradientBoosted(p) => &p.id,
            ModelSpec::Similarity(p) => &p.id,
            ModelSpec::Ensemble(c) => &c.id,
        }
    }

    /// The adapter this spec configures; `None` for the ensemble, which the registry wires itself.
    pub fn into_adapter(self) -> Option<Box<dyn ModelAdapter>> {
        match self {
            ModelSpec::StatisticalBaseline(p) => Some(Box::new(BaselineModel::new(p))),
            ModelSpec::GradientBoosted(p) => Some(Box::new(BoostedModel::new(p))),
            ModelSpec::Similarity(p) => Some(Box::new(SimilarityModel::new(p))),
            ModelSpec::Ensemble(_) => None,
        }
    }
}
