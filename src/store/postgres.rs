// src/store/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info};
use std::marker::PhantomData;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, Transaction};

use super::{RecordStore, StoredRecord, WriteMode};
use crate::models::stats_models::DuplicateGroup;
use crate::models::{BusinessKey, GradeRecord, PredictionRecord, ThresholdKey};
use crate::utils::db_connect::PgPool;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// Rows per multi-row VALUES statement; all chunks share one transaction.
const INSERT_CHUNK_SIZE: usize = 1000;

/// Business key columns, shared by every record table.
const KEY_COLUMNS: &[&str] = &["entity_id", "context_id", "model_id", "threshold_key"];

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Creates schemas and tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for ensure_schema")?;
    conn.batch_execute(SCHEMA_SQL)
        .await
        .context("Failed to apply sql/schema.sql")?;
    info!("Database schema verified");
    Ok(())
}

/// Table layout and row mapping for a record kind. `COLUMNS` starts with the
/// four key columns in `KEY_COLUMNS` order.
pub trait PgRecordCodec: StoredRecord {
    const STAGING_TABLE: &'static str;
    const CANONICAL_TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const WRITTEN_AT_COLUMN: &'static str;

    fn push_params(&self, params: &mut Vec<BoxedParam>);

    fn from_row(row: &Row) -> Result<Self>;
}

fn threshold_key_param(value: f64) -> i64 {
    ThresholdKey::from_value(value).0
}

impl PgRecordCodec for PredictionRecord {
    const STAGING_TABLE: &'static str = "predictions.prediction_staging";
    const CANONICAL_TABLE: &'static str = "predictions.player_predictions";
    const COLUMNS: &'static [&'static str] = &[
        "entity_id",
        "context_id",
        "model_id",
        "threshold_key",
        "context_date",
        "threshold_value",
        "predicted_value",
        "confidence",
        "recommendation",
        "model_version",
        "created_at",
    ];
    const WRITTEN_AT_COLUMN: &'static str = "created_at";

    fn push_params(&self, params: &mut Vec<BoxedParam>) {
        params.push(Box::new(self.entity_id.clone()));
        params.push(Box::new(self.context_id.clone()));
        params.push(Box::new(self.model_id.clone()));
        params.push(Box::new(threshold_key_param(self.threshold_value)));
        params.push(Box::new(self.context_date));
        params.push(Box::new(self.threshold_value));
        params.push(Box::new(self.predicted_value));
        params.push(Box::new(self.confidence));
        params.push(Box::new(self.recommendation.as_str().to_string()));
        params.push(Box::new(self.model_version.clone()));
        params.push(Box::new(self.created_at));
    }

    fn from_row(row: &Row) -> Result<Self> {
        let recommendation: String = row.try_get("recommendation")?;
        Ok(PredictionRecord {
            entity_id: row.try_get("entity_id")?,
            context_id: row.try_get("context_id")?,
            context_date: row.try_get("context_date")?,
            model_id: row.try_get("model_id")?,
            threshold_value: row.try_get("threshold_value")?,
            predicted_value: row.try_get("predicted_value")?,
            confidence: row.try_get("confidence")?,
            recommendation: recommendation.parse()?,
            model_version: row.try_get("model_version")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl PgRecordCodec for GradeRecord {
    const STAGING_TABLE: &'static str = "grading.grade_staging";
    const CANONICAL_TABLE: &'static str = "grading.prediction_grades";
    const COLUMNS: &'static [&'static str] = &[
        "entity_id",
        "context_id",
        "model_id",
        "threshold_key",
        "context_date",
        "threshold_value",
        "recommendation",
        "predicted_value",
        "actual_value",
        "correct",
        "margin",
        "graded_at",
    ];
    const WRITTEN_AT_COLUMN: &'static str = "graded_at";

    fn push_params(&self, params: &mut Vec<BoxedParam>) {
        params.push(Box::new(self.entity_id.clone()));
        params.push(Box::new(self.context_id.clone()));
        params.push(Box::new(self.model_id.clone()));
        params.push(Box::new(threshold_key_param(self.threshold_value)));
        params.push(Box::new(self.context_date));
        params.push(Box::new(self.threshold_value));
        params.push(Box::new(self.recommendation.as_str().to_string()));
        params.push(Box::new(self.predicted_value));
        params.push(Box::new(self.actual_value));
        params.push(Box::new(self.correct));
        params.push(Box::new(self.margin));
        params.push(Box::new(self.graded_at));
    }

    fn from_row(row: &Row) -> Result<Self> {
        let recommendation: String = row.try_get("recommendation")?;
        Ok(GradeRecord {
            entity_id: row.try_get("entity_id")?,
            context_id: row.try_get("context_id")?,
            context_date: row.try_get("context_date")?,
            model_id: row.try_get("model_id")?,
            threshold_value: row.try_get("threshold_value")?,
            recommendation: recommendation.parse()?,
            predicted_value: row.try_get("predicted_value")?,
            actual_value: row.try_get("actual_value")?,
            correct: row.try_get("correct")?,
            margin: row.try_get("margin")?,
            graded_at: row.try_get("graded_at")?,
        })
    }
}

/// Staging and canonical tables for one record kind.
pub struct PgRecordStore<R> {
    pool: PgPool,
    _record: PhantomData<fn() -> R>,
}

impl<R: PgRecordCodec> PgRecordStore<R> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _record: PhantomData,
        }
    }
}

/// Multi-row INSERT in chunks. `batch_id` adds a leading staging column.
async fn insert_chunked<R: PgRecordCodec>(
    transaction: &Transaction<'_>,
    table: &str,
    batch_id: Option<&str>,
    records: &[R],
    on_conflict: &str,
) -> Result<u64> {
    let mut columns: Vec<&str> = Vec::with_capacity(R::COLUMNS.len() + 1);
    if batch_id.is_some() {
        columns.push("batch_id");
    }
    columns.extend_from_slice(R::COLUMNS);
    let width = columns.len();

    let mut written = 0u64;
    for chunk in records.chunks(INSERT_CHUNK_SIZE) {
        let mut values_clause_parts = Vec::with_capacity(chunk.len());
        let mut params: Vec<BoxedParam> = Vec::with_capacity(chunk.len() * width);
        let mut param_idx = 1;

        for record in chunk {
            let placeholders: Vec<String> =
                (param_idx..param_idx + width).map(|i| format!("${}", i)).collect();
            values_clause_parts.push(format!("({})", placeholders.join(", ")));
            if let Some(id) = batch_id {
                params.push(Box::new(id.to_string()));
            }
            record.push_params(&mut params);
            param_idx += width;
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {} {}",
            table,
            columns.join(", "),
            values_clause_parts.join(", "),
            on_conflict
        );
        let params_slice: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        written += transaction
            .execute(sql.as_str(), params_slice.as_slice())
            .await
            .map_err(|e| {
                error!("Batch insert into {} failed: {}", table, e);
                e
            })
            .context(format!("Failed to insert {} rows into {}", chunk.len(), table))?;
    }
    Ok(written)
}

fn select_columns<R: PgRecordCodec>() -> String {
    R::COLUMNS.join(", ")
}

#[async_trait]
impl<R: PgRecordCodec> RecordStore<R> for PgRecordStore<R> {
    async fn write_staged(&self, batch_id: &str, records: &[R]) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for write_staged")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start staging transaction")?;

        let cleared = transaction
            .execute(
                format!("DELETE FROM {} WHERE batch_id = $1", R::STAGING_TABLE).as_str(),
                &[&batch_id],
            )
            .await
            .context(format!("Failed to clear staging batch {}", batch_id))?;
        if cleared > 0 {
            debug!("Replaced {} previously staged rows for batch {}", cleared, batch_id);
        }

        insert_chunked(&transaction, R::STAGING_TABLE, Some(batch_id), records, "").await?;
        transaction
            .commit()
            .await
            .context("Failed to commit staging transaction")?;
        Ok(records.len())
    }

    async fn load_staged(&self, batch_ids: &[String]) -> Result<Vec<R>> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_staged")?;
        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id = ANY($1)",
            select_columns::<R>(),
            R::STAGING_TABLE
        );
        let rows = conn
            .query(sql.as_str(), &[&batch_ids])
            .await
            .context(format!("Failed to load staged rows from {}", R::STAGING_TABLE))?;
        rows.iter().map(R::from_row).collect()
    }

    async fn discard_staged(&self, batch_ids: &[String]) -> Result<()> {
        if batch_ids.is_empty() {
            return Ok(());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for discard_staged")?;
        let removed = conn
            .execute(
                format!("DELETE FROM {} WHERE batch_id = ANY($1)", R::STAGING_TABLE).as_str(),
                &[&batch_ids],
            )
            .await
            .context(format!("Failed to discard staging rows from {}", R::STAGING_TABLE))?;
        debug!("Discarded {} staged rows from {}", removed, R::STAGING_TABLE);
        Ok(())
    }

    async fn upsert_canonical(
        &self,
        context_date: NaiveDate,
        records: &[R],
        mode: WriteMode,
    ) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for upsert_canonical")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start consolidation transaction")?;

        if mode == WriteMode::ReplaceScope {
            let deleted = transaction
                .execute(
                    format!("DELETE FROM {} WHERE context_date = $1", R::CANONICAL_TABLE).as_str(),
                    &[&context_date],
                )
                .await
                .context(format!("Failed to clear {} for {}", R::CANONICAL_TABLE, context_date))?;
            debug!("Cleared {} rows from {} for {}", deleted, R::CANONICAL_TABLE, context_date);
        }

        let update_set: Vec<String> = R::COLUMNS
            .iter()
            .filter(|c| !KEY_COLUMNS.contains(*c))
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect();
        let on_conflict = format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            KEY_COLUMNS.join(", "),
            update_set.join(", ")
        );

        let written =
            insert_chunked(&transaction, R::CANONICAL_TABLE, None, records, &on_conflict).await?;
        transaction
            .commit()
            .await
            .context("Failed to commit consolidation transaction")?;

        info!(
            "Upserted {} rows into {} for {} ({:?})",
            written,
            R::CANONICAL_TABLE,
            context_date,
            mode
        );
        Ok(written as usize)
    }

    async fn find_duplicates(&self, context_date: NaiveDate) -> Result<Vec<DuplicateGroup>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for find_duplicates")?;
        let sql = format!(
            "SELECT entity_id, context_id, model_id, threshold_key,
                    COUNT(*) AS copies,
                    array_agg({written} ORDER BY {written}) AS written_at
             FROM {table}
             WHERE context_date = $1
             GROUP BY entity_id, context_id, model_id, threshold_key
             HAVING COUNT(*) > 1
             ORDER BY entity_id, context_id, model_id, threshold_key",
            written = R::WRITTEN_AT_COLUMN,
            table = R::CANONICAL_TABLE
        );
        let rows = conn
            .query(sql.as_str(), &[&context_date])
            .await
            .context(format!("Failed to validate {} for duplicates", R::CANONICAL_TABLE))?;

        rows.iter()
            .map(|row| -> Result<DuplicateGroup> {
                let copies: i64 = row.try_get("copies")?;
                let written_at: Vec<DateTime<Utc>> = row.try_get("written_at")?;
                Ok(DuplicateGroup {
                    key: BusinessKey {
                        entity_id: row.try_get("entity_id")?,
                        context_id: row.try_get("context_id")?,
                        model_id: row.try_get("model_id")?,
                        threshold: ThresholdKey(row.try_get("threshold_key")?),
                    },
                    count: copies as usize,
                    written_at,
                })
            })
            .collect()
    }

    async fn load_canonical(&self, context_date: NaiveDate) -> Result<Vec<R>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_canonical")?;
        let sql = format!(
            "SELECT {} FROM {} WHERE context_date = $1",
            select_columns::<R>(),
            R::CANONICAL_TABLE
        );
        let rows = conn
            .query(sql.as_str(), &[&context_date])
            .await
            .context(format!("Failed to load {} for {}", R::CANONICAL_TABLE, context_date))?;
        rows.iter().map(R::from_row).collect()
    }
}
