// src/adapters/registry.rs
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{
    BaselineParams, BoostedParams, ModelAdapter, ModelSpec, ReferenceProfile, SimilarityParams,
    TreeNode,
};
use crate::ensemble::{EnsembleCombiner, EnsembleConfig};
use crate::error::PipelineError;
use crate::models::{ModelOutput, SkipReason};
use crate::sources::FeatureVector;

/// Every model's answer for one entity. Failed models appear only in `failures`.
#[derive(Debug, Default)]
pub struct RegistryRun {
    pub outputs: BTreeMap<String, ModelOutput>,
    pub versions: BTreeMap<String, String>,
    pub failures: Vec<PipelineError>,
}

pub struct ModelRegistry {
    adapters: Vec<Box<dyn ModelAdapter>>,
    ensemble: Option<EnsembleCombiner>,
}

impl ModelRegistry {
    /// Builds the active model set. An empty `active_ids` activates every spec.
    pub fn from_specs(specs: Vec<ModelSpec>, active_ids: &[String]) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.id().to_string()) {
                bail!("model id '{}' is configured more than once", spec.id());
            }
        }
        for id in active_ids {
            if !seen.contains(id) {
                warn!("Active model '{}' has no configuration; ignoring", id);
            }
        }

        let is_active = |id: &str| active_ids.is_empty() || active_ids.iter().any(|a| a == id);
        let mut adapters: Vec<Box<dyn ModelAdapter>> = Vec::new();
        let mut ensemble_config: Option<EnsembleConfig> = None;

        for spec in specs.into_iter().filter(|s| is_active(s.id())) {
            match spec {
                ModelSpec::Ensemble(c) => {
                    if ensemble_config.is_some() {
                        bail!("only one ensemble may be active");
                    }
                    ensemble_config = Some(c);
                }
                model => adapters.extend(model.into_adapter()),
            }
        }

        let ensemble = match ensemble_config {
            Some(mut config) => {
                let known: HashSet<&str> = adapters.iter().map(|a| a.model_id()).collect();
                config.weights.retain(|id, _| {
                    let keep = known.contains(id.as_str());
                    if !keep {
                        warn!(
                            "Ensemble '{}' weight for inactive model '{}' dropped",
                            config.id, id
                        );
                    }
                    keep
                });
                if config.weights.is_empty() {
                    warn!("Ensemble '{}' has no active siblings; disabled", config.id);
                    None
                } else {
                    Some(EnsembleCombiner::new(config))
                }
            }
            None => None,
        };

        if adapters.is_empty() {
            bail!("no active models configured");
        }
        info!(
            "Model registry: {} adapters [{}]{}",
            adapters.len(),
            adapters.iter().map(|a| a.model_id()).collect::<Vec<_>>().join(", "),
            ensemble
                .as_ref()
                .map(|e| format!(" + ensemble '{}'", e.model_id()))
                .unwrap_or_default()
        );
        Ok(Self { adapters, ensemble })
    }

    /// Specs from a JSON file when a path is given, else the built-in set.
    pub fn load_specs(path: Option<&str>) -> Result<Vec<ModelSpec>> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .context(format!("Failed to read model config {}", path))?;
                let specs: Vec<ModelSpec> = serde_json::from_str(&raw)
                    .context(format!("Failed to parse model config {}", path))?;
                info!("Loaded {} model specs from {}", specs.len(), path);
                Ok(specs)
            }
            None => Ok(Self::default_specs()),
        }
    }

    pub fn default_specs() -> Vec<ModelSpec> {
        let leaf = |value: f64| Box::new(TreeNode::Leaf { value });
        let boosted = BoostedParams {
            id: "gbm_points".to_string(),
            version: "v1".to_string(),
            base_feature: Some("avg_last_10".to_string()),
            base_score: 0.0,
            learning_rate: 1.0,
            trees: vec![
                TreeNode::Split {
                    feature: "minutes".to_string(),
                    threshold: 28.0,
                    left: leaf(-1.5),
                    right: leaf(1.0),
                    default_left: false,
                },
                TreeNode::Split {
                    feature: "opponent_def_rating".to_string(),
                    threshold: 110.0,
                    left: leaf(-0.75),
                    right: leaf(0.75),
                    default_left: true,
                },
            ],
            min_coverage: 0.5,
        };

        let profile = |avg: f64, minutes: f64, outcome: f64| ReferenceProfile {
            label: None,
            values: BTreeMap::from([
                ("avg_last_5".to_string(), avg),
                ("minutes".to_string(), minutes),
            ]),
            outcome,
        };
        let similarity = SimilarityParams {
            id: "similarity_knn".to_string(),
            version: "v1".to_string(),
            features: vec!["avg_last_5".to_string(), "minutes".to_string()],
            scales: BTreeMap::from([("minutes".to_string(), 4.0)]),
            k: 3,
            references: vec![
                profile(8.0, 18.0, 7.5),
                profile(14.0, 26.0, 14.5),
                profile(20.0, 32.0, 20.5),
                profile(26.0, 36.0, 27.0),
                profile(30.0, 38.0, 31.0),
            ],
        };

        let ensemble = EnsembleConfig::with_weights(BTreeMap::from([
            ("stat_baseline".to_string(), 1.0),
            ("gbm_points".to_string(), 1.5),
            ("similarity_knn".to_string(), 0.75),
        ]));

        vec![
            ModelSpec::StatisticalBaseline(BaselineParams::named("stat_baseline")),
            ModelSpec::GradientBoosted(boosted),
            ModelSpec::Similarity(similarity),
            ModelSpec::Ensemble(ensemble),
        ]
    }

    #[cfg(test)]
    pub fn from_adapters(
        adapters: Vec<Box<dyn ModelAdapter>>,
        ensemble: Option<EnsembleConfig>,
    ) -> Self {
        Self {
            adapters,
            ensemble: ensemble.map(EnsembleCombiner::new),
        }
    }

    pub fn ensemble(&self) -> Option<&EnsembleCombiner> {
        self.ensemble.as_ref()
    }

    /// Every model id that writes records, ensemble last.
    pub fn producer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.iter().map(|a| a.model_id().to_string()).collect();
        if let Some(e) = &self.ensemble {
            ids.push(e.model_id().to_string());
        }
        ids
    }

    /// Runs every adapter, isolating errors and panics, then the ensemble over the results.
    /// Inactive entities are skipped for every model without calling it.
    pub fn run_all(&self, features: &FeatureVector) -> RegistryRun {
        let mut run = RegistryRun::default();

        for adapter in &self.adapters {
            let model_id = adapter.model_id().to_string();
            if !features.active {
                run.versions
                    .insert(model_id.clone(), adapter.model_version().to_string());
                run.outputs
                    .insert(model_id, ModelOutput::Skip(SkipReason::InactiveEntity));
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| adapter.predict(features)));
            let message = match outcome {
                Ok(Ok(output)) => {
                    run.versions
                        .insert(model_id.clone(), adapter.model_version().to_string());
                    run.outputs.insert(model_id, output);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(
                "Model '{}' failed for entity {}: {}",
                model_id, features.entity_id, message
            );
            run.failures.push(PipelineError::ModelAdapter {
                model_id,
                entity_id: features.entity_id.clone(),
                message,
            });
        }

        if let Some(ensemble) = &self.ensemble {
            let output = if features.active {
                ensemble.combine(&run.outputs)
            } else {
                ModelOutput::Skip(SkipReason::InactiveEntity)
            };
            run.versions
                .insert(ensemble.model_id().to_string(), ensemble.model_version().to_string());
            run.outputs.insert(ensemble.model_id().to_string(), output);
        }
        run
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
