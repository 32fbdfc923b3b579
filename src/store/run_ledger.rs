// src/store/run_ledger.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use std::sync::Mutex;

use crate::models::stats_models::{BatchSummary, RunMode, RunStatus};
use crate::utils::db_connect::PgPool;

/// One coordinator invocation, as recorded in `pipeline_state.pipeline_run`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub run_id: String,
    pub context_date: NaiveDate,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn start_run(&self, run_id: &str, context_date: NaiveDate, mode: RunMode) -> Result<()>;

    async fn finish_run(&self, summary: &BatchSummary) -> Result<()>;

    /// Most recent run for the date and mode that ended SUCCEEDED.
    async fn last_completed_run(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
    ) -> Result<Option<PipelineRun>>;
}

pub struct PgRunLedger {
    pool: PgPool,
}

impl PgRunLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLedger for PgRunLedger {
    async fn start_run(&self, run_id: &str, context_date: NaiveDate, mode: RunMode) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for start_run")?;

        const INSERT_SQL: &str = "
            INSERT INTO pipeline_state.pipeline_run (
                id, context_date, mode, status, started_at,
                requested, succeeded, skipped, failed
            )
            VALUES ($1, $2, $3, $4, NOW(), 0, 0, 0, 0)";

        conn.execute(
            INSERT_SQL,
            &[&run_id, &context_date, &mode.as_str(), &RunStatus::Running.as_str()],
        )
        .await
        .context("Failed to insert initial pipeline_run record")?;

        info!("Created pipeline_run record with ID: {}", run_id);
        Ok(())
    }

    async fn finish_run(&self, summary: &BatchSummary) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for finish_run")?;
        let summary_json =
            serde_json::to_value(summary).context("Failed to serialize batch summary")?;

        const UPDATE_SQL: &str = "
            UPDATE pipeline_state.pipeline_run SET
                status = $2, finished_at = NOW(),
                requested = $3, succeeded = $4, skipped = $5, failed = $6,
                summary = $7
            WHERE id = $1";

        conn.execute(
            UPDATE_SQL,
            &[
                &summary.run_id,
                &summary.status.as_str(),
                &(summary.requested as i32),
                &(summary.succeeded as i32),
                &(summary.skipped as i32),
                &(summary.failed as i32),
                &summary_json,
            ],
        )
        .await
        .context(format!("Failed to finalise pipeline_run {}", summary.run_id))?;
        Ok(())
    }

    async fn last_completed_run(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
    ) -> Result<Option<PipelineRun>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for last_completed_run")?;
        let row = conn
            .query_opt(
                "SELECT id, started_at, finished_at
                 FROM pipeline_state.pipeline_run
                 WHERE context_date = $1 AND mode = $2 AND status = $3
                 ORDER BY finished_at DESC NULLS LAST
                 LIMIT 1",
                &[&context_date, &mode.as_str(), &RunStatus::Succeeded.as_str()],
            )
            .await
            .context("Failed to query pipeline_run history")?;

        Ok(row.map(|row| PipelineRun {
            run_id: row.get("id"),
            context_date,
            mode,
            status: RunStatus::Succeeded,
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        }))
    }
}

#[derive(Default)]
pub struct MemoryRunLedger {
    runs: Mutex<Vec<PipelineRun>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn start_run(&self, run_id: &str, context_date: NaiveDate, mode: RunMode) -> Result<()> {
        let mut runs = self.runs.lock().map_err(|_| anyhow!("run ledger mutex poisoned"))?;
        runs.push(PipelineRun {
            run_id: run_id.to_string(),
            context_date,
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        });
        Ok(())
    }

    async fn finish_run(&self, summary: &BatchSummary) -> Result<()> {
        let mut runs = self.runs.lock().map_err(|_| anyhow!("run ledger mutex poisoned"))?;
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == summary.run_id)
            .ok_or_else(|| anyhow!("unknown run {}", summary.run_id))?;
        run.status = summary.status;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn last_completed_run(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
    ) -> Result<Option<PipelineRun>> {
        let runs = self.runs.lock().map_err(|_| anyhow!("run ledger mutex poisoned"))?;
        Ok(runs
            .iter()
            .filter(|r| {
                r.context_date == context_date && r.mode == mode && r.status == RunStatus::Succeeded
            })
            .max_by_key(|r| r.finished_at)
            .cloned())
    }
}
