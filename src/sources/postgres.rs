// src/sources/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::{FeatureLookup, FeatureStore, FeatureVector, Outcome, OutcomeSource, RosterSource};
use crate::utils::db_connect::PgPool;

/// Reads `features.entity_features`, one row per entity and slate date.
pub struct PgFeatureStore {
    pool: PgPool,
}

impl PgFeatureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Numeric members of the JSON object; anything else is ignored.
fn numeric_features(entity_id: &str, raw: JsonValue) -> BTreeMap<String, f64> {
    match raw {
        JsonValue::Object(map) => map
            .into_iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
            .collect(),
        other => {
            warn!(
                "Features for entity {} are not a JSON object ({}); treating as empty",
                entity_id, other
            );
            BTreeMap::new()
        }
    }
}

#[async_trait]
impl FeatureStore for PgFeatureStore {
    async fn get_features(&self, entity_id: &str, context_date: NaiveDate) -> Result<FeatureLookup> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_features")?;
        let row = conn
            .query_opt(
                "SELECT context_id, active, thresholds, features
                 FROM features.entity_features
                 WHERE entity_id = $1 AND context_date = $2",
                &[&entity_id, &context_date],
            )
            .await
            .context(format!("Failed to query features for entity {}", entity_id))?;

        let Some(row) = row else {
            debug!("No features for entity {} on {}", entity_id, context_date);
            return Ok(FeatureLookup::NotFound);
        };

        let raw: JsonValue = row.get("features");
        Ok(FeatureLookup::Found(FeatureVector {
            entity_id: entity_id.to_string(),
            context_id: row.get("context_id"),
            context_date,
            active: row.get("active"),
            thresholds: row.get("thresholds"),
            values: numeric_features(entity_id, raw),
        }))
    }
}

pub struct PgRosterSource {
    pool: PgPool,
}

impl PgRosterSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RosterSource for PgRosterSource {
    async fn list_entities(&self, context_date: NaiveDate) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_entities")?;
        let rows = conn
            .query(
                "SELECT entity_id FROM features.daily_roster WHERE context_date = $1 ORDER BY entity_id",
                &[&context_date],
            )
            .await
            .context(format!("Failed to load roster for {}", context_date))?;
        Ok(rows.iter().map(|row| row.get("entity_id")).collect())
    }
}

pub struct PgOutcomeSource {
    pool: PgPool,
}

impl PgOutcomeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutcomeSource for PgOutcomeSource {
    async fn get_actual(&self, entity_id: &str, context_id: &str) -> Result<Outcome> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_actual")?;
        let row = conn
            .query_opt(
                "SELECT status, actual_value FROM outcomes.entity_results
                 WHERE entity_id = $1 AND context_id = $2",
                &[&entity_id, &context_id],
            )
            .await
            .context(format!(
                "Failed to query outcome for entity {} in {}",
                entity_id, context_id
            ))?;

        let Some(row) = row else {
            return Ok(Outcome::NotAvailable);
        };
        let status: String = row.get("status");
        let actual: Option<f64> = row.get("actual_value");
        Ok(match (status.as_str(), actual) {
            ("final", Some(value)) => Outcome::Final(value),
            ("dnp", _) => Outcome::DidNotParticipate,
            ("final", None) => {
                warn!(
                    "Outcome for {} in {} is final without a value; deferring",
                    entity_id, context_id
                );
                Outcome::NotAvailable
            }
            _ => Outcome::NotAvailable,
        })
    }
}
