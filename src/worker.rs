// src/worker.rs
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::ModelRegistry;
use crate::consolidation::{Consolidator, PREDICTION_NAMESPACE};
use crate::models::stats_models::RunMode;
use crate::models::{ModelOutput, PredictionRecord, Recommendation};
use crate::sources::{FeatureLookup, FeatureStore};
use crate::utils::with_timeout;

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub index: usize,
    pub entity_ids: Vec<String>,
}

impl Partition {
    /// Splits the roster into fixed-size slices, in roster order.
    pub fn split(entity_ids: &[String], size: usize) -> Vec<Partition> {
        entity_ids
            .chunks(size.max(1))
            .enumerate()
            .map(|(index, chunk)| Partition {
                index,
                entity_ids: chunk.to_vec(),
            })
            .collect()
    }

    /// Stable across retries, so a retried partition overwrites its own staging batch.
    pub fn batch_id(&self, context_date: NaiveDate, mode: RunMode) -> String {
        let mut sorted = self.entity_ids.clone();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(PREDICTION_NAMESPACE.as_bytes());
        hasher.update(context_date.to_string().as_bytes());
        hasher.update(mode.as_str().as_bytes());
        hasher.update(self.index.to_le_bytes());
        for id in &sorted {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}-p{:04}-{}", context_date, mode.as_str(), self.index, &digest[..16])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerTally {
    pub predicted: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl ProducerTally {
    /// A producer is done for a partition once it answered (value or skip) for some entity.
    /// Per-entity errors count like skips; a producer that only errored is not done.
    pub fn completed(&self) -> bool {
        self.predicted + self.skipped > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Predicted,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReport {
    pub index: usize,
    pub batch_id: String,
    pub staged_records: usize,
    pub entities: BTreeMap<String, EntityOutcome>,
    pub producers: BTreeMap<String, ProducerTally>,
    pub adapter_errors: Vec<String>,
}

/// Stateless: runs every model over a partition and stages the resulting records.
pub struct PredictionWorker {
    features: Arc<dyn FeatureStore>,
    registry: Arc<ModelRegistry>,
    staging: Arc<Consolidator<PredictionRecord>>,
    min_edge: f64,
    call_timeout: Duration,
}

impl PredictionWorker {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        registry: Arc<ModelRegistry>,
        staging: Arc<Consolidator<PredictionRecord>>,
        min_edge: f64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            features,
            registry,
            staging,
            min_edge,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Fails as a whole on a feature fetch or staging error so the coordinator
    /// can retry the partition. Model errors are absorbed and tallied.
    pub async fn run_partition(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
        partition: &Partition,
    ) -> Result<PartitionReport> {
        let start = Instant::now();
        let batch_id = partition.batch_id(context_date, mode);
        let mut records = Vec::new();
        let mut entities = BTreeMap::new();
        let mut adapter_errors = Vec::new();
        let mut producers: BTreeMap<String, ProducerTally> = self
            .registry
            .producer_ids()
            .into_iter()
            .map(|id| (id, ProducerTally::default()))
            .collect();

        for entity_id in &partition.entity_ids {
            let lookup = with_timeout(
                "feature fetch",
                self.call_timeout,
                self.features.get_features(entity_id, context_date),
            )
            .await
            .context(format!("Failed to fetch features for entity {}", entity_id))?;

            let features = match lookup {
                FeatureLookup::Found(fv) => fv,
                FeatureLookup::NotFound => {
                    debug!("No features for entity {} on {}; skipped", entity_id, context_date);
                    for tally in producers.values_mut() {
                        tally.skipped += 1;
                    }
                    entities.insert(entity_id.clone(), EntityOutcome::Skipped);
                    continue;
                }
            };
            if features.thresholds.is_empty() {
                debug!("Entity {} has no posted thresholds; skipped", entity_id);
                for tally in producers.values_mut() {
                    tally.skipped += 1;
                }
                entities.insert(entity_id.clone(), EntityOutcome::Skipped);
                continue;
            }

            let run = self.registry.run_all(&features);
            for failure in run.failures {
                if let crate::error::PipelineError::ModelAdapter { model_id, .. } = &failure {
                    producers.entry(model_id.clone()).or_default().errored += 1;
                }
                adapter_errors.push(failure.to_string());
            }

            let created_at = Utc::now();
            let mut produced_any = false;
            for (model_id, output) in &run.outputs {
                let tally = producers.entry(model_id.clone()).or_default();
                let prediction = match output {
                    ModelOutput::Predicted(p) => p,
                    ModelOutput::Skip(reason) => {
                        debug!("Model {} skipped entity {}: {}", model_id, entity_id, reason);
                        tally.skipped += 1;
                        continue;
                    }
                };
                tally.predicted += 1;
                produced_any = true;
                let version = run
                    .versions
                    .get(model_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                for &threshold in &features.thresholds {
                    records.push(PredictionRecord {
                        entity_id: entity_id.clone(),
                        context_id: features.context_id.clone(),
                        context_date,
                        model_id: model_id.clone(),
                        threshold_value: threshold,
                        predicted_value: prediction.predicted_value,
                        confidence: prediction.confidence,
                        recommendation: Recommendation::from_edge(
                            prediction.predicted_value,
                            threshold,
                            self.min_edge,
                        ),
                        model_version: version.clone(),
                        created_at,
                    });
                }
            }

            entities.insert(
                entity_id.clone(),
                if produced_any {
                    EntityOutcome::Predicted
                } else {
                    EntityOutcome::Skipped
                },
            );
        }

        let staged_records = self.staging.write_staged(&batch_id, &records).await?;
        if !adapter_errors.is_empty() {
            warn!(
                "Partition {} ({}): {} model failures absorbed",
                partition.index,
                batch_id,
                adapter_errors.len()
            );
        }
        info!(
            "Partition {} staged {} records for {} entities as {} in {:.2?}",
            partition.index,
            staged_records,
            partition.entity_ids.len(),
            batch_id,
            start.elapsed()
        );

        Ok(PartitionReport {
            index: partition.index,
            batch_id,
            staged_records,
            entities,
            producers,
            adapter_errors,
        })
    }
}
