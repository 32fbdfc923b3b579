// src/lock/mod.rs
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::utils::config::LockConfig;
use crate::utils::with_timeout;

pub use memory::MemoryLockService;
pub use postgres::PgLockService;

#[derive(Debug, Clone, PartialEq)]
pub struct LockLease {
    pub scope_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Backing store for leases. `try_acquire` must be a single atomic
/// create-if-absent-or-expired write; re-acquiring one's own lease refreshes it.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn try_acquire(
        &self,
        scope_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>>;

    /// Returns whether a lease held by `holder_id` was removed.
    async fn release(&self, scope_key: &str, holder_id: &str) -> Result<bool>;

    async fn current(&self, scope_key: &str) -> Result<Option<LockLease>>;
}

pub enum AcquireOutcome {
    Acquired(LockGuard),
    TimedOut { waited: Duration, attempts: u32 },
}

/// Held lease. Call `release` on normal paths; dropping the guard releases in
/// the background, and the TTL covers a process that dies outright.
pub struct LockGuard {
    lease: LockLease,
    service: Arc<dyn LockService>,
    released: bool,
}

impl LockGuard {
    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let removed = self
            .service
            .release(&self.lease.scope_key, &self.lease.holder_id)
            .await?;
        if removed {
            debug!(
                "Released lock '{}' held by {}",
                self.lease.scope_key, self.lease.holder_id
            );
        } else {
            warn!(
                "Lock '{}' was no longer held by {} at release (expired or taken over)",
                self.lease.scope_key, self.lease.holder_id
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let service = self.service.clone();
        let scope_key = self.lease.scope_key.clone();
        let holder_id = self.lease.holder_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Lock '{}' dropped without explicit release; releasing in background",
                    scope_key
                );
                handle.spawn(async move {
                    if let Err(e) = service.release(&scope_key, &holder_id).await {
                        warn!("Background release of lock '{}' failed: {:?}", scope_key, e);
                    }
                });
            }
            Err(_) => warn!(
                "Lock '{}' dropped outside a runtime; it will expire at {}",
                scope_key, self.lease.expires_at
            ),
        }
    }
}

/// Blocking-with-retry acquisition on top of a `LockService`.
#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    config: LockConfig,
    call_timeout: Duration,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>, config: LockConfig, call_timeout: Duration) -> Self {
        Self {
            service,
            config,
            call_timeout,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    /// Tries until the lease is won or `timeout` would be exceeded by another wait.
    /// Backend errors and call timeouts count as failed attempts.
    pub async fn acquire(&self, scope_key: &str, holder_id: &str, timeout: Duration) -> AcquireOutcome {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = with_timeout(
                "lock acquisition",
                self.call_timeout,
                self.service.try_acquire(scope_key, holder_id, self.config.ttl),
            )
            .await;

            match attempt {
                Ok(Some(lease)) => {
                    info!(
                        "Acquired lock '{}' as {} after {} attempt(s) in {:.2?} (expires {})",
                        scope_key,
                        holder_id,
                        attempts,
                        start.elapsed(),
                        lease.expires_at
                    );
                    return AcquireOutcome::Acquired(LockGuard {
                        lease,
                        service: self.service.clone(),
                        released: false,
                    });
                }
                Ok(None) => debug!(
                    "Lock '{}' busy (attempt {}), retrying in {:?}",
                    scope_key, attempts, self.config.retry_interval
                ),
                Err(e) => warn!(
                    "Lock '{}' acquisition attempt {} failed: {:?}",
                    scope_key, attempts, e
                ),
            }

            let waited = start.elapsed();
            if waited + self.config.retry_interval > timeout {
                return AcquireOutcome::TimedOut { waited, attempts };
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fast_lock_config;

    fn lock_over(service: Arc<MemoryLockService>) -> DistributedLock {
        DistributedLock::new(service, fast_lock_config(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_second_holder_times_out_while_first_holds() {
        let service = Arc::new(MemoryLockService::new());
        let lock = lock_over(service.clone());

        let guard = match lock.acquire("predictions:2024-01-15", "a", Duration::from_secs(1)).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::TimedOut { .. } => panic!("first acquire should succeed"),
        };

        match lock.acquire("predictions:2024-01-15", "b", Duration::from_millis(120)).await {
            AcquireOutcome::TimedOut { attempts, .. } => assert!(attempts >= 2),
            AcquireOutcome::Acquired(_) => panic!("lock must be exclusive"),
        }

        guard.release().await.unwrap();
        assert!(matches!(
            lock.acquire("predictions:2024-01-15", "b", Duration::from_millis(120)).await,
            AcquireOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let lock = lock_over(Arc::new(MemoryLockService::new()));
        let a = lock.acquire("predictions:2024-01-15", "a", Duration::from_millis(50)).await;
        let b = lock.acquire("grading:2024-01-15", "b", Duration::from_millis(50)).await;
        assert!(matches!(a, AcquireOutcome::Acquired(_)));
        assert!(matches!(b, AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let service = Arc::new(MemoryLockService::new());
        let lock = lock_over(service.clone());

        if let AcquireOutcome::Acquired(guard) = lock.acquire("s", "a", Duration::from_millis(50)).await {
            drop(guard);
        } else {
            panic!("acquire failed");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.current("s").await.unwrap().is_none());
    }
}
