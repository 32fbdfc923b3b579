use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;
use std::time::Instant;

use predict_lib::adapters::ModelRegistry;
use predict_lib::alerts::build_alert_sink;
use predict_lib::consolidation::{Consolidator, GRADING_NAMESPACE, PREDICTION_NAMESPACE};
use predict_lib::coordinator::{Coordinator, ProducerTable};
use predict_lib::grading::GradingEngine;
use predict_lib::lock::{DistributedLock, LockService, PgLockService};
use predict_lib::models::stats_models::{RunMode, RunStatus};
use predict_lib::models::{GradeRecord, PredictionRecord};
use predict_lib::sources::{
    CachedFeatureStore, FeatureStore, PgFeatureStore, PgOutcomeSource, PgRosterSource,
};
use predict_lib::store::{ensure_schema, PgRecordStore, PgRunLedger, RecordStore};
use predict_lib::utils::config::PipelineConfig;
use predict_lib::utils::db_connect::{connect, get_pool_status, PgPool};
use predict_lib::utils::env::load_env;
use predict_lib::utils::get_memory_usage;
use predict_lib::utils::progress_config::ProgressConfig;
use predict_lib::worker::PredictionWorker;

#[derive(Parser)]
#[command(name = "prediction_pipeline", about = "Multi-model prediction and grading runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score the slate for a date and consolidate the predictions
    Predict {
        /// Slate date (YYYY-MM-DD), today in UTC when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
        /// scheduled | refresh
        #[arg(long, default_value = "scheduled")]
        mode: RunMode,
        /// Re-run a completed date and bypass the consolidation gates
        #[arg(long)]
        force: bool,
    },
    /// Grade a date's consolidated predictions against outcomes
    Grade {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let config = PipelineConfig::from_env();
    config.validate().context("Invalid pipeline configuration")?;
    config.log_config();

    let progress = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress.enabled, progress.detailed
    );

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");
    ensure_schema(&pool)
        .await
        .context("Failed to apply pipeline schema")?;

    let start = Instant::now();
    match cli.command {
        Command::Predict { date, mode, force } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            run_predict(&pool, &config, progress, date, mode, force).await?;
        }
        Command::Grade { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            run_grade(&pool, &config, date).await?;
        }
    }

    let (total, idle, in_use) = get_pool_status(&pool);
    info!(
        "Finished in {:.2?}. Memory: {} MB, DB pool: {} connections ({} idle, {} in use)",
        start.elapsed(),
        get_memory_usage().await,
        total,
        idle,
        in_use
    );
    Ok(())
}

async fn run_predict(
    pool: &PgPool,
    config: &PipelineConfig,
    progress: ProgressConfig,
    date: NaiveDate,
    mode: RunMode,
    force: bool,
) -> Result<()> {
    let alerts = build_alert_sink(config.alert_webhook_url.as_deref(), config.call_timeout);
    let lock_service: Arc<dyn LockService> = Arc::new(PgLockService::new(pool.clone()));

    let specs = ModelRegistry::load_specs(config.models_config_path.as_deref())?;
    let registry = Arc::new(ModelRegistry::from_specs(specs, &config.active_models)?);
    let producers = ProducerTable::load(
        config.producer_table_path.as_deref(),
        &registry.producer_ids(),
    )?;

    let store: Arc<dyn RecordStore<PredictionRecord>> =
        Arc::new(PgRecordStore::<PredictionRecord>::new(pool.clone()));
    let consolidator = Arc::new(Consolidator::new(
        PREDICTION_NAMESPACE,
        store,
        DistributedLock::new(lock_service, config.lock.clone(), config.call_timeout),
        alerts,
        config.call_timeout,
    ));

    let feature_cache = Arc::new(CachedFeatureStore::new(
        Arc::new(PgFeatureStore::new(pool.clone())),
        config.feature_cache_size,
    ));
    let features: Arc<dyn FeatureStore> = feature_cache.clone();
    let worker = Arc::new(PredictionWorker::new(
        features,
        registry,
        consolidator.clone(),
        config.min_edge,
        config.call_timeout,
    ));

    let show_cache_stats = progress.should_show_cache_stats();
    let coordinator = Coordinator::new(
        Arc::new(PgRosterSource::new(pool.clone())),
        worker,
        consolidator,
        Arc::new(PgRunLedger::new(pool.clone())),
        producers,
        config.coordinator.clone(),
        config.call_timeout,
    )
    .with_progress(progress)
    .with_pool_stats(pool.clone());

    let summary = coordinator.run_batch(date, mode, force).await?;

    if show_cache_stats {
        let (hits, misses, cached) = feature_cache.get_stats().await;
        info!(
            "Feature cache: {} hits, {} misses, {} entries",
            hits, misses, cached
        );
    }
    info!(
        "Batch summary:\n{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize batch summary")?
    );

    if summary.status == RunStatus::Failed {
        bail!(
            "Prediction run {} for {} failed: {}",
            summary.run_id,
            date,
            summary.errors.join("; ")
        );
    }
    Ok(())
}

async fn run_grade(pool: &PgPool, config: &PipelineConfig, date: NaiveDate) -> Result<()> {
    let alerts = build_alert_sink(config.alert_webhook_url.as_deref(), config.call_timeout);
    let lock_service: Arc<dyn LockService> = Arc::new(PgLockService::new(pool.clone()));

    let grades: Arc<dyn RecordStore<GradeRecord>> =
        Arc::new(PgRecordStore::<GradeRecord>::new(pool.clone()));
    let consolidator = Consolidator::new(
        GRADING_NAMESPACE,
        grades,
        DistributedLock::new(lock_service, config.lock.clone(), config.call_timeout),
        alerts,
        config.call_timeout,
    );
    let engine = GradingEngine::new(
        Arc::new(PgRecordStore::<PredictionRecord>::new(pool.clone())),
        Arc::new(PgOutcomeSource::new(pool.clone())),
        consolidator,
        config.call_timeout,
    );

    let summary = engine.grade(date).await?;
    info!(
        "Grading summary:\n{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize grading summary")?
    );
    if summary.status.is_failure() {
        bail!("Grading for {} failed: {}", date, summary.errors.join("; "));
    }
    Ok(())
}
