// src/utils/config.rs
use log::info;
use once_cell::sync::Lazy;
use rand::Rng;
use std::time::Duration;

use crate::error::PipelineError;
use crate::utils::env::{env_list, env_opt, env_or};

static DEFAULT_MAX_WORKERS: Lazy<usize> = Lazy::new(|| num_cpus::get().clamp(5, 10));

/// Bounded calls made while holding the consolidation lock: load staged, upsert, find duplicates, discard staged.
pub const CRITICAL_SECTION_CALLS: u32 = 4;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease lifetime; must outlast the consolidation critical section.
    pub ttl: Duration,
    /// Ceiling on how long a caller waits for the lock.
    pub acquire_timeout: Duration,
    /// Fixed wait between acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the retry following `attempt` (0-based), with up to 10% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = (exp.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (exp + jitter).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_workers: usize,
    pub partition_size: usize,
    /// Ceiling for one attempt at one partition.
    pub partition_timeout: Duration,
    pub retry: RetryPolicy,
    /// Refuse to consolidate when any partition failed for good.
    pub block_on_partial_failure: bool,
    /// Share of optional producers that must be done for the degraded trigger.
    pub optional_quorum: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: *DEFAULT_MAX_WORKERS,
            partition_size: 25,
            partition_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            block_on_partial_failure: false,
            optional_quorum: 0.6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub lock: LockConfig,
    pub coordinator: CoordinatorConfig,
    /// Per external call (feature fetch, staging write, upsert, ...).
    pub call_timeout: Duration,
    pub min_edge: f64,
    /// Empty means every configured model is active.
    pub active_models: Vec<String>,
    pub models_config_path: Option<String>,
    pub producer_table_path: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub feature_cache_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            coordinator: CoordinatorConfig::default(),
            call_timeout: Duration::from_secs(60),
            min_edge: 0.5,
            active_models: Vec::new(),
            models_config_path: None,
            producer_table_path: None,
            alert_webhook_url: None,
            feature_cache_size: 20_000,
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(env_or(key, default.as_secs()));
        let millis =
            |key: &str, default: Duration| Duration::from_millis(env_or(key, default.as_millis() as u64));

        Self {
            lock: LockConfig {
                ttl: secs("LOCK_TTL_SECS", defaults.lock.ttl),
                acquire_timeout: secs("LOCK_ACQUIRE_TIMEOUT_SECS", defaults.lock.acquire_timeout),
                retry_interval: millis("LOCK_RETRY_INTERVAL_MS", defaults.lock.retry_interval),
            },
            coordinator: CoordinatorConfig {
                max_workers: env_or("MAX_CONCURRENT_PARTITIONS", defaults.coordinator.max_workers),
                partition_size: env_or("PARTITION_SIZE", defaults.coordinator.partition_size),
                partition_timeout: secs(
                    "PARTITION_TIMEOUT_SECS",
                    defaults.coordinator.partition_timeout,
                ),
                retry: RetryPolicy {
                    max_retries: env_or("PARTITION_MAX_RETRIES", defaults.coordinator.retry.max_retries),
                    base_delay: millis("RETRY_BASE_DELAY_MS", defaults.coordinator.retry.base_delay),
                    max_delay: millis("RETRY_MAX_DELAY_MS", defaults.coordinator.retry.max_delay),
                },
                block_on_partial_failure: env_or(
                    "BLOCK_ON_PARTIAL_FAILURE",
                    defaults.coordinator.block_on_partial_failure,
                ),
                optional_quorum: env_or("OPTIONAL_PRODUCER_QUORUM", defaults.coordinator.optional_quorum),
            },
            call_timeout: secs("CALL_TIMEOUT_SECS", defaults.call_timeout),
            min_edge: env_or("MIN_EDGE", defaults.min_edge),
            active_models: env_list("ACTIVE_MODELS"),
            models_config_path: env_opt("MODELS_CONFIG_PATH"),
            producer_table_path: env_opt("PRODUCER_TABLE_PATH"),
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            feature_cache_size: env_or("FEATURE_CACHE_SIZE", defaults.feature_cache_size),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        // The lease is never renewed, so every bounded call in the critical section must fit.
        let critical_section = self.call_timeout.saturating_mul(CRITICAL_SECTION_CALLS);
        if critical_section >= self.lock.ttl {
            return Err(PipelineError::Config(format!(
                "{} calls of up to {:?} ({:?}) must fit inside the lock TTL {:?}",
                CRITICAL_SECTION_CALLS, self.call_timeout, critical_section, self.lock.ttl
            )));
        }
        if self.lock.retry_interval.is_zero() {
            return Err(PipelineError::Config("lock retry interval must be positive".into()));
        }
        if self.coordinator.partition_size == 0 || self.coordinator.max_workers == 0 {
            return Err(PipelineError::Config(
                "partition size and worker count must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.coordinator.optional_quorum) {
            return Err(PipelineError::Config(format!(
                "optional producer quorum {} is outside [0, 1]",
                self.coordinator.optional_quorum
            )));
        }
        if self.min_edge < 0.0 {
            return Err(PipelineError::Config("min edge cannot be negative".into()));
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("Pipeline configuration:");
        info!(
            "   Lock: ttl={:?}, acquire timeout={:?}, retry every {:?}",
            self.lock.ttl, self.lock.acquire_timeout, self.lock.retry_interval
        );
        info!(
            "   Workers: {} concurrent partitions of {} entities, {} retries (base {:?}, cap {:?})",
            self.coordinator.max_workers,
            self.coordinator.partition_size,
            self.coordinator.retry.max_retries,
            self.coordinator.retry.base_delay,
            self.coordinator.retry.max_delay
        );
        info!(
            "   Trigger: optional quorum {:.0}%, block on partial failure: {}",
            self.coordinator.optional_quorum * 100.0,
            self.coordinator.block_on_partial_failure
        );
        info!(
            "   Call timeout {:?}, min edge {}, active models: {}",
            self.call_timeout,
            self.min_edge,
            if self.active_models.is_empty() {
                "all configured".to_string()
            } else {
                self.active_models.join(", ")
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock.ttl, Duration::from_secs(300));
        assert_eq!(config.lock.retry_interval, Duration::from_secs(5));
        assert!((5..=10).contains(&config.coordinator.max_workers));
        assert_eq!(config.coordinator.optional_quorum, 0.6);
    }

    #[test]
    fn test_call_timeout_must_undercut_lock_ttl() {
        let mut config = PipelineConfig::default();
        config.call_timeout = config.lock.ttl;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_whole_critical_section_must_fit_inside_lock_ttl() {
        let mut config = PipelineConfig::default();
        config.lock.ttl = Duration::from_secs(300);
        config.call_timeout = Duration::from_secs(200);
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.call_timeout = Duration::from_secs(75);
        assert!(config.validate().is_err());

        config.call_timeout = Duration::from_secs(60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quorum_out_of_range_is_rejected() {
        let mut config = PipelineConfig::default();
        config.coordinator.optional_quorum = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_config() {
        env::set_var("LOCK_TTL_SECS", "120");
        env::set_var("OPTIONAL_PRODUCER_QUORUM", "0.75");
        env::set_var("ACTIVE_MODELS", "stat_baseline, gbm_points,");
        env::set_var("PARTITION_SIZE", "not-a-number");

        let config = PipelineConfig::from_env();
        assert_eq!(config.lock.ttl, Duration::from_secs(120));
        assert_eq!(config.coordinator.optional_quorum, 0.75);
        assert_eq!(config.active_models, vec!["stat_baseline", "gbm_points"]);
        assert_eq!(config.coordinator.partition_size, 25);

        env::remove_var("LOCK_TTL_SECS");
        env::remove_var("OPTIONAL_PRODUCER_QUORUM");
        env::remove_var("ACTIVE_MODELS");
        env::remove_var("PARTITION_SIZE");
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let second = policy.delay_for(1);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }
}
