// src/utils/db_connect.rs
use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

use crate::utils::env::env_or;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Connection and pool settings, from `POSTGRES_*` and `DB_POOL_*`.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// At least the worker count plus headroom for consolidation and the ledger.
    pub pool_max_size: u32,
    pub pool_min_idle: u32,
    pub checkout_timeout: Duration,
}

impl DbSettings {
    pub fn from_env() -> Self {
        Self {
            host: env_or("POSTGRES_HOST", "127.0.0.1".to_string()),
            port: env_or("POSTGRES_PORT", 5432u16),
            dbname: env_or("POSTGRES_DB", "dataplatform".to_string()),
            user: env_or("POSTGRES_USER", "postgres".to_string()),
            password: env_or("POSTGRES_PASSWORD", String::new()),
            pool_max_size: env_or("DB_POOL_MAX_SIZE", 20u32),
            pool_min_idle: env_or("DB_POOL_MIN_IDLE", 2u32),
            checkout_timeout: Duration::from_secs(env_or("DB_POOL_CHECKOUT_TIMEOUT_SECS", 15u64)),
        }
    }

    fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .application_name("prediction_pipeline")
            .connect_timeout(Duration::from_secs(10));
        config
    }
}

pub async fn connect() -> Result<PgPool> {
    connect_with(&DbSettings::from_env()).await
}

pub async fn connect_with(settings: &DbSettings) -> Result<PgPool> {
    info!(
        "Connecting to PostgreSQL {}@{}:{}/{} (pool max {}, min idle {})",
        settings.user,
        settings.host,
        settings.port,
        settings.dbname,
        settings.pool_max_size,
        settings.pool_min_idle
    );
    let manager = PostgresConnectionManager::new(settings.pg_config(), NoTls);
    let pool = Pool::builder()
        .max_size(settings.pool_max_size.max(1))
        .min_idle(Some(settings.pool_min_idle.min(settings.pool_max_size)))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(settings.checkout_timeout)
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Connectivity check failed")?;
    drop(conn);
    info!("Database pool ready");
    Ok(pool)
}

/// (connections, idle, in use)
pub fn get_pool_status(pool: &PgPool) -> (u32, u32, u32) {
    let state = pool.state();
    (
        state.connections,
        state.idle_connections,
        state.connections.saturating_sub(state.idle_connections),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_and_overrides() {
        std::env::remove_var("POSTGRES_HOST");
        std::env::set_var("POSTGRES_PORT", "not-a-port");
        std::env::set_var("DB_POOL_MAX_SIZE", "32");

        let settings = DbSettings::from_env();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.pool_max_size, 32);

        std::env::remove_var("POSTGRES_PORT");
        std::env::remove_var("DB_POOL_MAX_SIZE");
    }
}
