// src/utils/progress_config.rs
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::utils::env::env_or;

const BAR_TEMPLATE: &str = "  📊 [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}";
const BAR_CHARS: &str = "█▉▊▋▌▍▎▏  ";

/// Terminal progress for prediction runs. `enabled` gates every other switch.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    /// Live status line (partition counts) under the partition bar.
    pub detailed: bool,
    pub show_memory: bool,
    /// Feature cache hit/miss line at the end of a run.
    pub show_cache_stats: bool,
    pub show_db_connection_stats: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed: true,
            show_memory: true,
            show_cache_stats: true,
            show_db_connection_stats: true,
        }
    }
}

impl ProgressConfig {
    /// `PROGRESS_ENABLED`, `PROGRESS_DETAILED`, `PROGRESS_SHOW_MEMORY`,
    /// `PROGRESS_SHOW_CACHE_STATS`, `PROGRESS_SHOW_DB_STATS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_or("PROGRESS_ENABLED", defaults.enabled),
            detailed: env_or("PROGRESS_DETAILED", defaults.detailed),
            show_memory: env_or("PROGRESS_SHOW_MEMORY", defaults.show_memory),
            show_cache_stats: env_or("PROGRESS_SHOW_CACHE_STATS", defaults.show_cache_stats),
            show_db_connection_stats: env_or(
                "PROGRESS_SHOW_DB_STATS",
                defaults.show_db_connection_stats,
            ),
        }
    }

    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        self.enabled.then(MultiProgress::new)
    }

    pub fn should_show_detailed(&self) -> bool {
        self.enabled && self.detailed
    }

    pub fn should_show_memory(&self) -> bool {
        self.enabled && self.show_memory
    }

    pub fn should_show_cache_stats(&self) -> bool {
        self.enabled && self.show_cache_stats
    }

    pub fn should_show_db_connection_stats(&self) -> bool {
        self.enabled && self.show_db_connection_stats
    }
}

/// Bar for `total` units of work, attached to `multi` when progress is on. Hidden otherwise.
pub fn phase_bar(multi: Option<&MultiProgress>, total: u64, label: &str) -> ProgressBar {
    let Some(mp) = multi else {
        return ProgressBar::hidden();
    };
    let pb = mp.add(ProgressBar::new(total));
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(BAR_CHARS);
    pb.set_style(style);
    pb.set_message(label.to_string());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_everything_on_by_default() {
        let config = ProgressConfig::default();
        assert!(config.should_show_detailed());
        assert!(config.should_show_memory());
        assert!(config.should_show_cache_stats());
        assert!(config.should_show_db_connection_stats());
    }

    #[test]
    fn test_env_overrides_individual_switches() {
        env::set_var("PROGRESS_DETAILED", "false");
        env::set_var("PROGRESS_SHOW_CACHE_STATS", "false");

        let config = ProgressConfig::from_env();
        assert!(config.enabled);
        assert!(!config.should_show_detailed());
        assert!(!config.should_show_cache_stats());
        assert!(config.should_show_memory());

        env::remove_var("PROGRESS_DETAILED");
        env::remove_var("PROGRESS_SHOW_CACHE_STATS");
    }

    #[test]
    fn test_master_switch_turns_everything_off() {
        let config = ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        };
        assert!(!config.should_show_detailed());
        assert!(!config.should_show_memory());
        assert!(!config.should_show_cache_stats());
        assert!(!config.should_show_db_connection_stats());
        assert!(config.create_multi_progress().is_none());
    }

    #[test]
    fn test_phase_bar_is_hidden_without_multi_progress() {
        let pb = phase_bar(None, 10, "partitions");
        assert!(pb.is_hidden());
        pb.inc(3);
        assert_eq!(pb.position(), 3);
    }
}
