// src/lock/memory.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{LockLease, LockService};

/// Process-local lease table with the same expiry semantics as the PostgreSQL service.
#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, LockLease>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(
        &self,
        scope_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)?;
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow!("lock table mutex poisoned"))?;

        if let Some(existing) = leases.get(scope_key) {
            if existing.expires_at > now && existing.holder_id != holder_id {
                return Ok(None);
            }
        }

        let lease = LockLease {
            scope_key: scope_key.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        leases.insert(scope_key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, scope_key: &str, holder_id: &str) -> Result<bool> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow!("lock table mutex poisoned"))?;
        match leases.get(scope_key) {
            Some(lease) if lease.holder_id == holder_id => {
                leases.remove(scope_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, scope_key: &str) -> Result<Option<LockLease>> {
        let leases = self
            .leases
            .lock()
            .map_err(|_| anyhow!("lock table mutex poisoned"))?;
        Ok(leases
            .get(scope_key)
            .filter(|lease| lease.expires_at > Utc::now())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{AcquireOutcome, DistributedLock};
    use crate::test_support::fast_lock_config;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let service = MemoryLockService::new();
        let ttl = Duration::from_millis(50);

        assert!(service.try_acquire("s", "a", ttl).await.unwrap().is_some());
        assert!(service.try_acquire("s", "b", ttl).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let lease = service.try_acquire("s", "b", ttl).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "b");
        // The stale holder cannot release the new holder's lease.
        assert!(!service.release("s", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_refreshes_lease() {
        let service = MemoryLockService::new();
        let first = service
            .try_acquire("s", "a", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = service
            .try_acquire("s", "a", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_abandoned_lock_only_acquirable_after_ttl() {
        let service = Arc::new(MemoryLockService::new());
        let lock = DistributedLock::new(service.clone(), fast_lock_config(), Duration::from_millis(100));

        match lock.acquire("predictions:2024-01-15", "crashed-worker", Duration::from_millis(50)).await {
            // Simulates a holder that dies without running any cleanup.
            AcquireOutcome::Acquired(guard) => std::mem::forget(guard),
            AcquireOutcome::TimedOut { .. } => panic!("initial acquire failed"),
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(service
            .try_acquire("predictions:2024-01-15", "other", Duration::from_millis(600))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(service
            .try_acquire("predictions:2024-01-15", "other", Duration::from_millis(600))
            .await
            .unwrap()
            .is_some());
    }
}
