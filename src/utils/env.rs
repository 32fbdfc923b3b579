// src/utils/env.rs
use log::{info, warn};
use std::env;
use std::str::FromStr;

/// Loads variables from a `.env` file if one is present. Already-set variables win.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => warn!(
            "No .env file loaded ({}). Proceeding with system environment variables.",
            e
        ),
    }
}

/// Reads and parses an environment variable, falling back to `default` when unset or malformed.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Comma-separated list, blanks dropped.
pub fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
