// src/adapters/baseline.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{default_version, ModelAdapter};
use crate::models::{ModelOutput, Prediction, SkipReason};
use crate::sources::FeatureVector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowWeight {
    pub feature: String,
    pub weight: f64,
}

fn default_windows() -> Vec<WindowWeight> {
    [("avg_last_5", 0.5), ("avg_last_10", 0.3), ("season_avg", 0.2)]
        .into_iter()
        .map(|(feature, weight)| WindowWeight {
            feature: feature.to_string(),
            weight,
        })
        .collect()
}

fn default_games_feature() -> String {
    "games_played".to_string()
}

fn default_spread_feature() -> Option<String> {
    Some("std_last_10".to_string())
}

fn default_min_games() -> f64 {
    5.0
}

fn default_full_sample_games() -> f64 {
    30.0
}

/// Weighted blend of rolling averages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineParams {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowWeight>,
    #[serde(default = "default_games_feature")]
    pub games_feature: String,
    /// Standard deviation feature used for the stability part of confidence.
    #[serde(default = "default_spread_feature")]
    pub spread_feature: Option<String>,
    #[serde(default = "default_min_games")]
    pub min_games: f64,
    /// Sample size at which the sample part of confidence saturates.
    #[serde(default = "default_full_sample_games")]
    pub full_sample_games: f64,
}

impl BaselineParams {
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: default_version(),
            windows: default_windows(),
            games_feature: default_games_feature(),
            spread_feature: default_spread_feature(),
            min_games: default_min_games(),
            full_sample_games: default_full_sample_games(),
        }
    }
}

pub struct BaselineModel {
    params: BaselineParams,
}

impl BaselineModel {
    pub fn new(params: BaselineParams) -> Self {
        Self { params }
    }
}

impl ModelAdapter for BaselineModel {
    fn model_id(&self) -> &str {
        &self.params.id
    }

    fn model_version(&self) -> &str {
        &self.params.version
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelOutput> {
        let p = &self.params;
        if p.windows.iter().any(|w| w.weight < 0.0) || p.full_sample_games <= 0.0 {
            bail!("baseline '{}' is misconfigured", p.id);
        }

        let games = features.get(&p.games_feature).unwrap_or(0.0);
        if games < p.min_games {
            return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(format!(
                "{} games played, need {}",
                games, p.min_games
            ))));
        }

        // Missing windows drop out and the rest are renormalised.
        let (weighted, weight_total) = p
            .windows
            .iter()
            .filter_map(|w| features.get(&w.feature).map(|v| (v * w.weight, w.weight)))
            .fold((0.0, 0.0), |(acc_v, acc_w), (v, w)| (acc_v + v, acc_w + w));
        if weight_total <= 0.0 {
            return Ok(ModelOutput::Skip(SkipReason::InsufficientFeatures(
                "no rolling averages".to_string(),
            )));
        }
        let predicted = weighted / weight_total;

        let sample = (games / p.full_sample_games).min(1.0);
        let stability = match p.spread_feature.as_deref().and_then(|f| features.get(f)) {
            Some(std) if predicted.abs() > f64::EPSILON => 1.0 / (1.0 + (std / predicted).abs()),
            _ => 0.75,
        };
        let confidence = (sample * stability).clamp(0.05, 0.95);

        Ok(ModelOutput::Predicted(Prediction::new(predicted, confidence)))
    }
}
