// src/sources/cache.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use log::info;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{FeatureLookup, FeatureStore};

const DEFAULT_CACHE_SIZE: usize = 20_000;

struct CacheState {
    cache: LruCache<(String, NaiveDate), FeatureLookup>,
    hits: usize,
    misses: usize,
}

/// LRU in front of a feature store. Negative lookups are cached too, since a
/// retried partition asks for the same entities again.
pub struct CachedFeatureStore {
    inner: Arc<dyn FeatureStore>,
    state: Mutex<CacheState>,
}

impl CachedFeatureStore {
    pub fn new(inner: Arc<dyn FeatureStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        info!("Initializing CachedFeatureStore with cache size: {}", capacity);
        Self {
            inner,
            state: Mutex::new(CacheState {
                cache: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// (hits, misses, cached entries)
    pub async fn get_stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.hits, state.misses, state.cache.len())
    }
}

#[async_trait]
impl FeatureStore for CachedFeatureStore {
    async fn get_features(&self, entity_id: &str, context_date: NaiveDate) -> Result<FeatureLookup> {
        let key = (entity_id.to_string(), context_date);
        {
            let mut state = self.state.lock().await;
            if let Some(found) = state.cache.get(&key).cloned() {
                state.hits += 1;
                if state.hits % 1000 == 0 {
                    info!(
                        "Feature cache stats - hits: {}, misses: {}, hit rate: {:.2}%",
                        state.hits,
                        state.misses,
                        (state.hits as f64 / (state.hits + state.misses) as f64) * 100.0
                    );
                }
                return Ok(found);
            }
            state.misses += 1;
        }

        // Fetch outside the lock so concurrent partitions are not serialised.
        let lookup = self
            .inner
            .get_features(entity_id, context_date)
            .await
            .context(format!("Failed to fetch features for entity {}", entity_id))?;

        self.state.lock().await.cache.put(key, lookup.clone());
        Ok(lookup)
    }
}
