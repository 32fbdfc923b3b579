// src/lock/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Duration;
use tokio_postgres::Row;

use super::{LockLease, LockService};
use crate::utils::db_connect::PgPool;

/// Leases in `pipeline_state.distributed_locks`. One row per scope key; a row
/// is only overwritten when expired or when its own holder re-acquires.
pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lease_from_row(row: &Row) -> LockLease {
    LockLease {
        scope_key: row.get("scope_key"),
        holder_id: row.get("holder_id"),
        acquired_at: row.get::<_, DateTime<Utc>>("acquired_at"),
        expires_at: row.get::<_, DateTime<Utc>>("expires_at"),
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_acquire(
        &self,
        scope_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lock acquisition")?;

        const ACQUIRE_SQL: &str = "
            INSERT INTO pipeline_state.distributed_locks (scope_key, holder_id, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (scope_key) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE pipeline_state.distributed_locks.expires_at <= NOW()
               OR pipeline_state.distributed_locks.holder_id = EXCLUDED.holder_id
            RETURNING scope_key, holder_id, acquired_at, expires_at";

        let ttl_secs = ttl.as_secs_f64();
        let row = conn
            .query_opt(ACQUIRE_SQL, &[&scope_key, &holder_id, &ttl_secs])
            .await
            .context(format!("Failed to acquire lock '{}'", scope_key))?;

        if row.is_none() {
            debug!("Lock '{}' is held by another live holder", scope_key);
        }
        Ok(row.as_ref().map(lease_from_row))
    }

    async fn release(&self, scope_key: &str, holder_id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lock release")?;
        let removed = conn
            .execute(
                "DELETE FROM pipeline_state.distributed_locks WHERE scope_key = $1 AND holder_id = $2",
                &[&scope_key, &holder_id],
            )
            .await
            .context(format!("Failed to release lock '{}'", scope_key))?;
        Ok(removed > 0)
    }

    async fn current(&self, scope_key: &str) -> Result<Option<LockLease>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lock lookup")?;
        let row = conn
            .query_opt(
                "SELECT scope_key, holder_id, acquired_at, expires_at
                 FROM pipeline_state.distributed_locks
                 WHERE scope_key = $1 AND expires_at > NOW()",
                &[&scope_key],
            )
            .await
            .context(format!("Failed to read lock '{}'", scope_key))?;
        Ok(row.as_ref().map(lease_from_row))
    }
}
