//! Caches the model information we get back from the server so we do not hit
//! the REST api before every completion. Entries go stale after a fixed ttl and
//! are only checked when someone reads them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::ModelInfo;

pub const MODEL_INFO_TTL: Duration = Duration::from_secs(5 * 60);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Whoever can answer "what is this model" for a server, returns None on any
/// failure and logs it themselves.
#[async_trait]
pub trait ModelInfoFetcher: Send + Sync {
    async fn fetch_model_info(&self, base_url: &str, model_id: &str) -> Option<ModelInfo>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    info: ModelInfo,
    timestamp: Instant,
}

pub struct ModelInfoCache {
    fetcher: Arc<dyn ModelInfoFetcher>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    // entries are never evicted, one per (base url, model) we were asked about
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ModelInfoCache {
    pub fn new(fetcher: Arc<dyn ModelInfoFetcher>) -> Self {
        Self {
            fetcher,
            clock: Arc::new(SystemClock),
            ttl: MODEL_INFO_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cache_key(base_url: &str, model_id: &str) -> String {
        format!("{}:{}", base_url, model_id)
    }

    /// Returns the cached info while it is fresh, otherwise asks the fetcher.
    /// Failed fetches leave the cache untouched so the next call retries.
    pub async fn resolve(&self, base_url: &str, model_id: &str) -> Option<ModelInfo> {
        let cache_key = Self::cache_key(base_url, model_id);
        if let Some(info) = self.fresh_entry(&cache_key).await {
            debug!(%cache_key, "model info cache hit");
            return Some(info);
        }

        // the lock is not held over the fetch, concurrent misses for the same
        // key will all go to the network
        let info = self.fetcher.fetch_model_info(base_url, model_id).await?;
        let timestamp = self.clock.now();
        self.entries.lock().await.insert(
            cache_key,
            CacheEntry {
                info: info.clone(),
                timestamp,
            },
        );
        Some(info)
    }

    async fn fresh_entry(&self, cache_key: &str) -> Option<ModelInfo> {
        let entries = self.entries.lock().await;
        let entry = entries.get(cache_key)?;
        let age = self.clock.now().saturating_duration_since(entry.timestamp);
        if age < self.ttl {
            Some(entry.info.clone())
        } else {
            None
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
