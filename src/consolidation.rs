// src/consolidation.rs
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::alerts::{AlertSink, Severity};
use crate::error::PipelineError;
use crate::lock::{AcquireOutcome, DistributedLock};
use crate::models::stats_models::ConsolidationStats;
use crate::store::{collapse_by_key, RecordStore, StoredRecord, WriteMode};
use crate::utils::with_timeout;

pub const PREDICTION_NAMESPACE: &str = "predictions";
pub const GRADING_NAMESPACE: &str = "grading";

pub fn scope_key(namespace: &str, context_date: NaiveDate) -> String {
    format!("{}:{}", namespace, context_date.format("%Y-%m-%d"))
}

/// Moves staged batches into the canonical store under the namespace's lock,
/// then checks the date for duplicate business keys before letting go.
pub struct Consolidator<R: StoredRecord> {
    namespace: &'static str,
    store: Arc<dyn RecordStore<R>>,
    lock: DistributedLock,
    alerts: Arc<dyn AlertSink>,
    holder_id: String,
    call_timeout: Duration,
}

impl<R: StoredRecord> Consolidator<R> {
    pub fn new(
        namespace: &'static str,
        store: Arc<dyn RecordStore<R>>,
        lock: DistributedLock,
        alerts: Arc<dyn AlertSink>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            namespace,
            store,
            lock,
            alerts,
            holder_id: format!("{}-{}", namespace, Uuid::new_v4()),
            call_timeout,
        }
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub async fn write_staged(&self, batch_id: &str, records: &[R]) -> Result<usize> {
        with_timeout(
            "staging write",
            self.call_timeout,
            self.store.write_staged(batch_id, records),
        )
        .await
        .context(format!("Failed to stage batch {}", batch_id))
    }

    /// Duplicates do not produce an `Err`: they come back in the stats with the
    /// staging rows kept, and the caller decides the run status.
    pub async fn consolidate(
        &self,
        context_date: NaiveDate,
        batch_ids: &[String],
        mode: WriteMode,
    ) -> Result<ConsolidationStats> {
        let scope = scope_key(self.namespace, context_date);
        let start = Instant::now();

        let guard = match self
            .lock
            .acquire(&scope, &self.holder_id, self.lock.acquire_timeout())
            .await
        {
            AcquireOutcome::Acquired(guard) => {
                debug!(
                    "Holding '{}' until {}",
                    scope,
                    guard.lease().expires_at
                );
                Some(guard)
            }
            AcquireOutcome::TimedOut { waited, attempts } => {
                let err = PipelineError::LockAcquisition {
                    scope_key: scope.clone(),
                    waited,
                };
                error!(
                    "CRITICAL: {} after {} attempts; consolidating without the lock, duplicate validation still runs",
                    err, attempts
                );
                self.alerts.notify(
                    Severity::Critical,
                    &format!("{}; proceeding without lock", err),
                );
                None
            }
        };
        let lock_acquired = guard.is_some();

        let result = self.consolidate_locked(&scope, context_date, batch_ids, mode).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!("Failed to release lock '{}': {:?}", scope, e);
            }
        }

        let mut stats = result?;
        stats.lock_acquired = lock_acquired;
        info!(
            "Consolidation of {} batch(es) into '{}' finished in {:.2?}: staged={}, merged={}, duplicates={}",
            batch_ids.len(),
            scope,
            start.elapsed(),
            stats.staged_count,
            stats.merged_count,
            stats.duplicate_count
        );
        Ok(stats)
    }

    async fn consolidate_locked(
        &self,
        scope: &str,
        context_date: NaiveDate,
        batch_ids: &[String],
        mode: WriteMode,
    ) -> Result<ConsolidationStats> {
        let staged = with_timeout(
            "staging read",
            self.call_timeout,
            self.store.load_staged(batch_ids),
        )
        .await
        .context(format!("Failed to load staged batches for '{}'", scope))?;
        let staged_count = staged.len();

        let (in_scope, foreign): (Vec<R>, Vec<R>) = staged
            .into_iter()
            .partition(|r| r.context_date() == context_date);
        if !foreign.is_empty() {
            warn!(
                "Ignoring {} staged records outside '{}'",
                foreign.len(),
                scope
            );
        }
        let collapsed = collapse_by_key(in_scope);

        let merged_count = if collapsed.is_empty() {
            debug!("Nothing staged for '{}'; canonical store untouched", scope);
            0
        } else {
            with_timeout(
                "canonical upsert",
                self.call_timeout,
                self.store.upsert_canonical(context_date, &collapsed, mode),
            )
            .await
            .context(format!("Failed to upsert canonical records for '{}'", scope))?
        };

        let duplicates = with_timeout(
            "duplicate validation",
            self.call_timeout,
            self.store.find_duplicates(context_date),
        )
        .await
        .context(format!("Failed to validate '{}' for duplicates", scope))?;

        if !duplicates.is_empty() {
            for group in &duplicates {
                error!(
                    "CRITICAL: duplicate key {} appears {} times in '{}' (written at {:?})",
                    group.key, group.count, scope, group.written_at
                );
            }
            let err = PipelineError::ConsolidationDuplicate {
                scope_key: scope.to_string(),
                duplicates: duplicates.clone(),
            };
            self.alerts.notify(
                Severity::Critical,
                &format!("{}; staging batches kept for inspection", err),
            );
            return Ok(ConsolidationStats {
                scope_key: scope.to_string(),
                staged_count,
                merged_count,
                duplicate_count: duplicates.len(),
                duplicates,
                lock_acquired: false,
                staging_discarded: false,
            });
        }

        with_timeout(
            "staging discard",
            self.call_timeout,
            self.store.discard_staged(batch_ids),
        )
        .await
        .context(format!("Failed to discard staging for '{}'", scope))?;

        Ok(ConsolidationStats {
            scope_key: scope.to_string(),
            staged_count,
            merged_count,
            duplicate_count: 0,
            duplicates: Vec::new(),
            lock_acquired: false,
            staging_discarded: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::lock::{LockService, MemoryLockService};
    use crate::models::PredictionRecord;
    use crate::store::MemoryRecordStore;
    use crate::test_support::{fast_lock_config, prediction, test_date};
    use crate::utils::config::LockConfig;

    struct Fixture {
        store: Arc<MemoryRecordStore<PredictionRecord>>,
        locks: Arc<MemoryLockService>,
        alerts: Arc<MemoryAlertSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryRecordStore::new()),
                locks: Arc::new(MemoryLockService::new()),
                alerts: Arc::new(MemoryAlertSink::new()),
            }
        }

        fn consolidator(&self, holder: &str, lock_config: LockConfig) -> Consolidator<PredictionRecord> {
            let lock = DistributedLock::new(self.locks.clone(), lock_config, Duration::from_millis(200));
            Consolidator::new(
                PREDICTION_NAMESPACE,
                self.store.clone(),
                lock,
                self.alerts.clone(),
                Duration::from_millis(200),
            )
            .with_holder_id(holder)
        }
    }

    fn batch(entities: &[&str], value: f64) -> Vec<PredictionRecord> {
        entities
            .iter()
            .map(|e| prediction(e, "stat_baseline", 20.5, value))
            .collect()
    }

    #[test]
    fn test_scope_keys_are_namespaced() {
        assert_eq!(scope_key(PREDICTION_NAMESPACE, test_date()), "predictions:2024-01-15");
        assert_eq!(scope_key(GRADING_NAMESPACE, test_date()), "grading:2024-01-15");
    }

    #[tokio::test]
    async fn test_overlapping_consolidations_leave_one_record_per_key() {
        let fx = Fixture::new();
        let consolidator = fx.consolidator("worker-a", fast_lock_config());

        for (i, value) in [19.0, 21.0, 23.0].into_iter().enumerate() {
            let id = format!("batch-{}", i);
            consolidator
                .write_staged(&id, &batch(&["p1", "p2", "p3"], value))
                .await
                .unwrap();
            let stats = consolidator
                .consolidate(test_date(), &[id], WriteMode::Merge)
                .await
                .unwrap();
            assert!(stats.is_clean());
            assert!(stats.lock_acquired);
            assert!(stats.staging_discarded);
        }

        let canonical = fx.store.load_canonical(test_date()).await.unwrap();
        assert_eq!(canonical.len(), 3);
        assert!(canonical.iter().all(|r| r.predicted_value == 23.0));
        assert!(fx.store.staged_batch_ids().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_consolidations_never_duplicate() {
        let fx = Fixture::new();
        let a = Arc::new(fx.consolidator("worker-a", fast_lock_config()));
        let b = Arc::new(fx.consolidator("worker-b", fast_lock_config()));

        a.write_staged("a", &batch(&["p1", "p2", "p3", "p4"], 20.0)).await.unwrap();
        b.write_staged("b", &batch(&["p3", "p4", "p5"], 22.0)).await.unwrap();

        let (ra, rb) = tokio::join!(
            {
                let a = a.clone();
                async move { a.consolidate(test_date(), &["a".to_string()], WriteMode::Merge).await }
            },
            {
                let b = b.clone();
                async move { b.consolidate(test_date(), &["b".to_string()], WriteMode::Merge).await }
            }
        );
        assert_eq!(ra.unwrap().duplicate_count, 0);
        assert_eq!(rb.unwrap().duplicate_count, 0);
        assert_eq!(fx.store.canonical_len(), 5);
        assert!(fx.store.find_duplicates(test_date()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_consolidations_of_identical_batches_never_duplicate() {
        let fx = Fixture::new();
        let a = Arc::new(fx.consolidator("worker-a", fast_lock_config()));
        let b = Arc::new(fx.consolidator("worker-b", fast_lock_config()));

        let records = batch(&["p1", "p2", "p3"], 21.0);
        a.write_staged("first", &records).await.unwrap();
        b.write_staged("second", &records).await.unwrap();

        let (ra, rb) = tokio::join!(
            {
                let a = a.clone();
                async move { a.consolidate(test_date(), &["first".to_string()], WriteMode::Merge).await }
            },
            {
                let b = b.clone();
                async move { b.consolidate(test_date(), &["second".to_string()], WriteMode::Merge).await }
            }
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.duplicate_count, 0);
        assert_eq!(rb.duplicate_count, 0);
        assert!(ra.lock_acquired && rb.lock_acquired);

        let canonical = fx.store.load_canonical(test_date()).await.unwrap();
        assert_eq!(canonical.len(), 3);
        let mut entities: Vec<_> = canonical.iter().map(|r| r.entity_id.as_str()).collect();
        entities.sort_unstable();
        assert_eq!(entities, vec!["p1", "p2", "p3"]);
        assert!(fx.store.find_duplicates(test_date()).await.unwrap().is_empty());
        assert!(fx.store.staged_batch_ids().is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout_proceeds_and_alerts() {
        let fx = Fixture::new();
        // Someone else holds the scope for longer than we are willing to wait.
        fx.locks
            .try_acquire("predictions:2024-01-15", "stuck", Duration::from_secs(5))
            .await
            .unwrap();

        let impatient = LockConfig {
            ttl: Duration::from_millis(600),
            acquire_timeout: Duration::from_millis(60),
            retry_interval: Duration::from_millis(20),
        };
        let consolidator = fx.consolidator("worker-a", impatient);
        consolidator.write_staged("a", &batch(&["p1", "p2"], 20.0)).await.unwrap();
        let stats = consolidator
            .consolidate(test_date(), &["a".to_string()], WriteMode::Merge)
            .await
            .unwrap();

        assert!(!stats.lock_acquired);
        assert_eq!(stats.merged_count, 2);
        assert_eq!(stats.duplicate_count, 0);
        assert_eq!(fx.alerts.count(Severity::Critical), 1);
        // The other holder's lease is untouched.
        let lease = fx.locks.current("predictions:2024-01-15").await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "stuck");
    }

    #[tokio::test]
    async fn test_duplicates_are_reported_and_staging_kept() {
        let fx = Fixture::new();
        let consolidator = fx.consolidator("worker-a", fast_lock_config());
        fx.store.inject_canonical_unchecked(prediction("p9", "stat_baseline", 20.5, 18.0));
        fx.store.inject_canonical_unchecked(prediction("p9", "stat_baseline", 20.5, 18.5));

        consolidator.write_staged("a", &batch(&["p1"], 20.0)).await.unwrap();
        let stats = consolidator
            .consolidate(test_date(), &["a".to_string()], WriteMode::Merge)
            .await
            .unwrap();

        assert_eq!(stats.duplicate_count, 1);
        assert_eq!(stats.duplicates[0].key.entity_id, "p9");
        assert!(!stats.staging_discarded);
        assert_eq!(fx.store.staged_batch_ids(), vec!["a".to_string()]);
        assert_eq!(fx.alerts.count(Severity::Critical), 1);
        // The lock is released even on the failure path.
        assert!(fx.locks.current("predictions:2024-01-15").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconsolidating_same_batches_is_a_noop() {
        let fx = Fixture::new();
        let consolidator = fx.consolidator("worker-a", fast_lock_config());
        consolidator.write_staged("a", &batch(&["p1", "p2"], 20.0)).await.unwrap();
        consolidator
            .consolidate(test_date(), &["a".to_string()], WriteMode::Merge)
            .await
            .unwrap();
        let before = fx.store.load_canonical(test_date()).await.unwrap();

        let again = consolidator
            .consolidate(test_date(), &["a".to_string()], WriteMode::ReplaceScope)
            .await
            .unwrap();
        assert_eq!(again.staged_count, 0);
        assert_eq!(again.merged_count, 0);
        assert_eq!(fx.store.load_canonical(test_date()).await.unwrap(), before);
    }
}
