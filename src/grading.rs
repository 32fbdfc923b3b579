// src/grading.rs
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::consolidation::{scope_key, Consolidator, GRADING_NAMESPACE};
use crate::models::stats_models::{GradingSummary, RunStatus};
use crate::models::{GradeRecord, PredictionRecord, Recommendation};
use crate::sources::{Outcome, OutcomeSource};
use crate::store::{RecordStore, WriteMode};
use crate::utils::with_timeout;

/// `None` on a push or a PASS.
pub fn evaluate_correctness(
    recommendation: Recommendation,
    threshold: f64,
    actual: f64,
) -> Option<bool> {
    if actual == threshold {
        return None;
    }
    match recommendation {
        Recommendation::Over => Some(actual > threshold),
        Recommendation::Under => Some(actual < threshold),
        Recommendation::Pass => None,
    }
}

/// `None` while the outcome is not settled.
pub fn grade_prediction(
    prediction: &PredictionRecord,
    outcome: Outcome,
    graded_at: DateTime<Utc>,
) -> Option<GradeRecord> {
    let actual_value = match outcome {
        Outcome::NotAvailable => return None,
        Outcome::DidNotParticipate => None,
        Outcome::Final(value) => Some(value),
    };
    let correct = actual_value.and_then(|actual| {
        evaluate_correctness(prediction.recommendation, prediction.threshold_value, actual)
    });
    Some(GradeRecord {
        entity_id: prediction.entity_id.clone(),
        context_id: prediction.context_id.clone(),
        context_date: prediction.context_date,
        model_id: prediction.model_id.clone(),
        threshold_value: prediction.threshold_value,
        recommendation: prediction.recommendation,
        predicted_value: prediction.predicted_value,
        actual_value,
        correct,
        margin: actual_value.map(|actual| actual - prediction.threshold_value),
        graded_at,
    })
}

/// Grades a date's canonical predictions and replaces that date's grades.
pub struct GradingEngine {
    predictions: Arc<dyn RecordStore<PredictionRecord>>,
    outcomes: Arc<dyn OutcomeSource>,
    consolidator: Consolidator<GradeRecord>,
    call_timeout: Duration,
}

impl GradingEngine {
    pub fn new(
        predictions: Arc<dyn RecordStore<PredictionRecord>>,
        outcomes: Arc<dyn OutcomeSource>,
        consolidator: Consolidator<GradeRecord>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            predictions,
            outcomes,
            consolidator,
            call_timeout,
        }
    }

    pub async fn grade(&self, context_date: NaiveDate) -> Result<GradingSummary> {
        let start = Instant::now();
        let predictions = with_timeout(
            "canonical prediction read",
            self.call_timeout,
            self.predictions.load_canonical(context_date),
        )
        .await
        .context(format!("Failed to load predictions for {}", context_date))?;

        let mut summary = GradingSummary {
            context_date,
            status: RunStatus::Running,
            requested: predictions.len(),
            graded: 0,
            correct: 0,
            incorrect: 0,
            ungraded: 0,
            deferred: 0,
            consolidation: None,
            errors: Vec::new(),
        };
        info!(
            "Grading {} predictions for {}",
            predictions.len(),
            context_date
        );

        // Several models and thresholds share one outcome.
        let mut outcome_cache: HashMap<(String, String), Outcome> = HashMap::new();
        let graded_at = Utc::now();
        let mut grades = Vec::with_capacity(predictions.len());

        for prediction in &predictions {
            let cache_key = (prediction.entity_id.clone(), prediction.context_id.clone());
            let outcome = match outcome_cache.get(&cache_key) {
                Some(outcome) => *outcome,
                None => {
                    let outcome = with_timeout(
                        "outcome fetch",
                        self.call_timeout,
                        self.outcomes
                            .get_actual(&prediction.entity_id, &prediction.context_id),
                    )
                    .await
                    .context(format!(
                        "Failed to fetch outcome for entity {} in {}",
                        prediction.entity_id, prediction.context_id
                    ))?;
                    outcome_cache.insert(cache_key, outcome);
                    outcome
                }
            };

            match grade_prediction(prediction, outcome, graded_at) {
                Some(grade) => {
                    match grade.correct {
                        Some(true) => summary.correct += 1,
                        Some(false) => summary.incorrect += 1,
                        None => summary.ungraded += 1,
                    }
                    grades.push(grade);
                }
                None => {
                    debug!(
                        "Outcome for {} in {} not available yet; deferred",
                        prediction.entity_id, prediction.context_id
                    );
                    summary.deferred += 1;
                }
            }
        }
        summary.graded = grades.len();

        if grades.is_empty() {
            info!(
                "No gradable predictions for {} ({} deferred); nothing written",
                context_date, summary.deferred
            );
            summary.status = RunStatus::Succeeded;
            return Ok(summary);
        }

        let batch_id = format!(
            "{}-{}",
            scope_key(GRADING_NAMESPACE, context_date),
            Uuid::new_v4()
        );
        self.consolidator.write_staged(&batch_id, &grades).await?;

        match self
            .consolidator
            .consolidate(context_date, &[batch_id], WriteMode::ReplaceScope)
            .await
        {
            Ok(stats) => {
                summary.status = if stats.is_clean() {
                    RunStatus::Succeeded
                } else {
                    summary.errors.push(format!(
                        "{} duplicate grade keys for {}",
                        stats.duplicate_count, context_date
                    ));
                    RunStatus::Failed
                };
                summary.consolidation = Some(stats);
            }
            Err(e) => {
                error!("Grade consolidation for {} failed: {:?}", context_date, e);
                summary.errors.push(format!("consolidation failed: {:#}", e));
                summary.status = RunStatus::Failed;
            }
        }

        let hit_rate = summary
            .hit_rate()
            .map(|r| format!("{:.1}%", r * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        let log_line = format!(
            "Grading for {} finished {} in {:.2?}: graded={}, correct={}, incorrect={}, ungraded={}, deferred={}, hit rate {}",
            context_date,
            summary.status.as_str(),
            start.elapsed(),
            summary.graded,
            summary.correct,
            summary.incorrect,
            summary.ungraded,
            summary.deferred,
            hit_rate
        );
        if summary.status.is_failure() {
            error!("{}", log_line);
        } else if summary.deferred > 0 {
            warn!("{}", log_line);
        } else {
            info!("{}", log_line);
        }
        Ok(summary)
    }
}
