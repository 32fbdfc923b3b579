// src/coordinator/mod.rs
pub mod tracker;
pub mod trigger;

use anyhow::Result;
use chrono::NaiveDate;
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::consolidation::Consolidator;
use crate::error::PipelineError;
use crate::models::stats_models::{BatchSummary, RunMode, RunStatus};
use crate::models::PredictionRecord;
use crate::sources::RosterSource;
use crate::store::{RunLedger, WriteMode};
use crate::utils::config::CoordinatorConfig;
use crate::utils::db_connect::{get_pool_status, PgPool};
use crate::utils::get_memory_usage;
use crate::utils::progress_config::{phase_bar, ProgressConfig};
use crate::utils::with_timeout;
use crate::worker::{Partition, PredictionWorker};

pub use tracker::{CompletionTracker, PartitionState};
pub use trigger::{ExpectedProducer, ProducerTable};

pub struct Coordinator {
    roster: Arc<dyn RosterSource>,
    worker: Arc<PredictionWorker>,
    consolidator: Arc<Consolidator<PredictionRecord>>,
    ledger: Arc<dyn RunLedger>,
    producers: ProducerTable,
    config: CoordinatorConfig,
    call_timeout: Duration,
    progress: ProgressConfig,
    pool: Option<PgPool>,
}

impl Coordinator {
    pub fn new(
        roster: Arc<dyn RosterSource>,
        worker: Arc<PredictionWorker>,
        consolidator: Arc<Consolidator<PredictionRecord>>,
        ledger: Arc<dyn RunLedger>,
        producers: ProducerTable,
        config: CoordinatorConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            roster,
            worker,
            consolidator,
            ledger,
            producers,
            config,
            call_timeout,
            progress: ProgressConfig {
                enabled: false,
                ..ProgressConfig::default()
            },
            pool: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    /// Pool whose usage is shown in progress messages.
    pub fn with_pool_stats(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// One prediction batch for a slate: score every rostered entity, then
    /// consolidate what succeeded if the expected producers are in.
    /// `force` re-runs a completed date/mode and bypasses the consolidation gates.
    pub async fn run_batch(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
        force: bool,
    ) -> Result<BatchSummary> {
        let start = Instant::now();

        if !force {
            let previous = with_timeout(
                "run ledger lookup",
                self.call_timeout,
                self.ledger.last_completed_run(context_date, mode),
            )
            .await?;
            if let Some(run) = previous {
                info!(
                    "{} run for {} already completed as {} at {:?}; skipping (use force to re-run)",
                    mode, context_date, run.run_id, run.finished_at
                );
                return Ok(BatchSummary::empty(
                    &run.run_id,
                    context_date,
                    mode,
                    RunStatus::AlreadyComplete,
                ));
            }
        }

        let run_id = Uuid::new_v4().to_string();
        with_timeout(
            "run ledger start",
            self.call_timeout,
            self.ledger.start_run(&run_id, context_date, mode),
        )
        .await?;
        info!(
            "Starting {} prediction run {} for {}{}",
            mode,
            run_id,
            context_date,
            if force { " (forced)" } else { "" }
        );

        let mut summary = BatchSummary::empty(&run_id, context_date, mode, RunStatus::Running);

        let roster = match with_timeout(
            "roster fetch",
            self.call_timeout,
            self.roster.list_entities(context_date),
        )
        .await
        {
            Ok(roster) => roster,
            Err(e) => {
                error!("Run {}: roster fetch failed: {:?}", run_id, e);
                summary.status = RunStatus::Failed;
                summary.errors.push(format!("roster fetch failed: {:#}", e));
                return self.finish(summary, start).await;
            }
        };

        let mut seen = HashSet::new();
        let entity_ids: Vec<String> = roster
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        summary.requested = entity_ids.len();
        if entity_ids.is_empty() {
            warn!("Run {}: roster for {} is empty; nothing to predict", run_id, context_date);
            summary.status = RunStatus::NoWork;
            return self.finish(summary, start).await;
        }

        let partitions = Partition::split(&entity_ids, self.config.partition_size);
        info!(
            "Run {}: {} entities in {} partitions, {} concurrent workers, producers {:?}",
            run_id,
            entity_ids.len(),
            partitions.len(),
            self.config.max_workers,
            self.worker.registry().producer_ids()
        );

        let tracker = self.dispatch(context_date, mode, partitions).await;

        summary.partitions_total = tracker.total();
        summary.partitions_succeeded = tracker.succeeded_count();
        summary.partitions_failed = tracker.failed_count();
        summary.staged_records = tracker.staged_records();
        let (predicted, skipped) = tracker.entity_counts();
        summary.succeeded = predicted;
        summary.skipped = skipped;
        summary.missing_entities = tracker.missing_entities();
        summary.failed = summary.missing_entities.len();
        summary.errors.extend(tracker.failure_messages());
        for report in tracker.reports() {
            summary.errors.extend(report.adapter_errors.iter().cloned());
        }

        if !summary.missing_entities.is_empty() {
            let err = PipelineError::PartialBatchFailure {
                requested: summary.requested,
                missing_entities: summary.missing_entities.clone(),
            };
            error!("Run {}: {}: {:?}", run_id, err, summary.missing_entities);
            summary.errors.push(err.to_string());
        }

        let decision = self.producers.evaluate(
            mode,
            &tracker.done_producers(),
            self.config.optional_quorum,
        );
        summary.trigger = Some(decision.clone());

        let batch_ids = tracker.succeeded_batch_ids();
        let partial = summary.failed > 0;
        let mut blocked = false;

        if batch_ids.is_empty() {
            warn!("Run {}: no partition succeeded; nothing to consolidate", run_id);
        } else if partial && self.config.block_on_partial_failure && !force {
            warn!(
                "Run {}: {} entities missing and block_on_partial_failure is set; {} staged batches kept",
                run_id,
                summary.failed,
                batch_ids.len()
            );
            blocked = true;
        } else if !decision.is_ready() && !force {
            warn!(
                "Run {}: consolidation trigger not met ({:?}); {} staged batches kept",
                run_id,
                decision,
                batch_ids.len()
            );
            blocked = true;
        } else {
            if !decision.is_ready() {
                warn!("Run {}: trigger not met but forced; consolidating", run_id);
            }
            match self
                .consolidator
                .consolidate(context_date, &batch_ids, WriteMode::Merge)
                .await
            {
                Ok(stats) => summary.consolidation = Some(stats),
                Err(e) => {
                    error!("Run {}: consolidation failed: {:?}", run_id, e);
                    summary.errors.push(format!("consolidation failed: {:#}", e));
                    summary.status = RunStatus::Failed;
                }
            }
        }

        let duplicates = summary
            .consolidation
            .as_ref()
            .map(|s| !s.is_clean())
            .unwrap_or(false);
        let nothing_succeeded = summary.partitions_succeeded == 0;
        summary.status = if summary.status == RunStatus::Failed || duplicates || nothing_succeeded {
            RunStatus::Failed
        } else if blocked {
            RunStatus::Blocked
        } else if partial {
            RunStatus::PartialFailure
        } else if summary.staged_records == 0 {
            warn!(
                "Run {}: every entity was skipped; recording NO_WORK so a later trigger retries",
                run_id
            );
            RunStatus::NoWork
        } else {
            RunStatus::Succeeded
        };

        self.finish(summary, start).await
    }

    /// Runs every partition on the bounded pool with retries. Always returns a tracker
    /// where each partition is either succeeded or failed.
    async fn dispatch(
        &self,
        context_date: NaiveDate,
        mode: RunMode,
        partitions: Vec<Partition>,
    ) -> CompletionTracker {
        let mut tracker = CompletionTracker::new();
        for p in &partitions {
            tracker.register(p.index, p.entity_ids.clone());
        }
        let tracker = Arc::new(Mutex::new(tracker));
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));

        let multi_progress: Option<MultiProgress> = self.progress.create_multi_progress();
        let pb = phase_bar(
            multi_progress.as_ref(),
            partitions.len() as u64,
            "Scoring partitions",
        );
        let status_updater = self.spawn_status_updater(pb.clone(), tracker.clone());

        let mut tasks: Vec<(usize, JoinHandle<()>)> = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let index = partition.index;
            let worker = self.worker.clone();
            let tracker = tracker.clone();
            let semaphore = semaphore.clone();
            let config = self.config.clone();
            let pb = pb.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    tracker
                        .lock()
                        .await
                        .mark_failed(partition.index, 0, "worker pool closed".to_string());
                    return;
                };

                let max_attempts = config.retry.max_retries + 1;
                for attempt in 1..=max_attempts {
                    tracker.lock().await.mark_running(partition.index, attempt);
                    let result = tokio::time::timeout(
                        config.partition_timeout,
                        worker.run_partition(context_date, mode, &partition),
                    )
                    .await;

                    let error = match result {
                        Ok(Ok(report)) => {
                            tracker.lock().await.mark_succeeded(report);
                            pb.inc(1);
                            return;
                        }
                        Ok(Err(e)) => format!("{:#}", e),
                        Err(_) => PipelineError::CallTimeout {
                            operation: format!("partition {}", partition.index),
                            timeout: config.partition_timeout,
                        }
                        .to_string(),
                    };

                    if attempt < max_attempts {
                        let delay = config.retry.delay_for(attempt - 1);
                        warn!(
                            "Partition {} attempt {}/{} failed: {}; retrying in {:?}",
                            partition.index, attempt, max_attempts, error, delay
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(
                            "Partition {} failed after {} attempts: {}",
                            partition.index, attempt, error
                        );
                        tracker
                            .lock()
                            .await
                            .mark_failed(partition.index, attempt, error);
                        pb.inc(1);
                    }
                }
            });
            tasks.push((index, handle));
        }

        let indices: Vec<usize> = tasks.iter().map(|(i, _)| *i).collect();
        let results = join_all(tasks.into_iter().map(|(_, h)| h)).await;
        if let Some(updater) = status_updater {
            updater.abort();
        }

        let mut tracker = match Arc::try_unwrap(tracker) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => std::mem::take(&mut *shared.lock().await),
        };
        for (index, result) in indices.into_iter().zip(results) {
            if let Err(join_err) = result {
                error!("Partition {} task aborted: {}", index, join_err);
                tracker.mark_failed(index, 0, format!("task aborted: {}", join_err));
            }
        }

        pb.finish_with_message(format!(
            "Scored {}/{} partitions",
            tracker.succeeded_count(),
            tracker.total()
        ));
        tracker
    }

    fn spawn_status_updater(
        &self,
        pb: ProgressBar,
        tracker: Arc<Mutex<CompletionTracker>>,
    ) -> Option<JoinHandle<()>> {
        if !self.progress.should_show_detailed() {
            return None;
        }
        let show_memory = self.progress.should_show_memory();
        let pool = self
            .pool
            .clone()
            .filter(|_| self.progress.should_show_db_connection_stats());

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let (succeeded, failed, total) = {
                    let t = tracker.lock().await;
                    (t.succeeded_count(), t.failed_count(), t.total())
                };
                let mut parts = vec![format!("✓{} ❌{} of {}", succeeded, failed, total)];
                if show_memory {
                    parts.push(format!("Mem: {}MB", get_memory_usage().await));
                }
                if let Some(pool) = &pool {
                    let (db_total, db_idle, db_in_use) = get_pool_status(pool);
                    parts.push(format!("DB: {}/{} in use ({} idle)", db_in_use, db_total, db_idle));
                }
                pb.set_message(parts.join(" | "));
            }
        }))
    }

    async fn finish(&self, mut summary: BatchSummary, start: Instant) -> Result<BatchSummary> {
        summary.elapsed_secs = start.elapsed().as_secs_f64();
        if let Err(e) = with_timeout(
            "run ledger finish",
            self.call_timeout,
            self.ledger.finish_run(&summary),
        )
        .await
        {
            warn!("Run {}: failed to record completion: {:?}", summary.run_id, e);
            summary
                .errors
                .push(format!("run ledger update failed: {:#}", e));
        }

        let log_line = format!(
            "Run {} ({} {}) finished {} in {:.2}s: requested={}, succeeded={}, skipped={}, failed={}",
            summary.run_id,
            summary.mode,
            summary.context_date,
            summary.status.as_str(),
            summary.elapsed_secs,
            summary.requested,
            summary.succeeded,
            summary.skipped,
            summary.failed
        );
        match summary.status {
            RunStatus::Failed => error!("{}", log_line),
            RunStatus::Blocked | RunStatus::PartialFailure | RunStatus::NoWork => {
                warn!("{}", log_line)
            }
            _ => info!("{}", log_line),
        }
        Ok(summary)
    }
}
