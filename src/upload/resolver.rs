//! Remote link resolution.
//!
//! The transport layer supplies a [`LinkResolver`] that turns a
//! platform file id into a downloadable link. Calls are slow and fallible.
//! [`CachingLinkResolver`] memoizes successful resolutions for a bounded
//! time, since the same file is often contributed to several sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::Result;
use crate::telemetry;

/// Resolves a platform file id to a remote link.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Resolver name for logs and metrics.
    fn name(&self) -> &str;

    async fn resolve(&self, file_id: &str) -> Result<String>;
}

/// Configuration for [`CachingLinkResolver`].
///
/// ```rust
/// # use keyward::LinkCacheConfig;
/// # use std::time::Duration;
/// let config = LinkCacheConfig::new()
///     .max_entries(1_000)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct LinkCacheConfig {
    /// Maximum cached links. Default: 10,000.
    pub max_entries: u64,
    /// How long a resolved link is reused. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for LinkCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl LinkCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached links.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set how long a resolved link is reused.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Decorator that caches successful resolutions.
///
/// Failures are never cached. Concurrent lookups of the same id may both
/// reach the inner resolver; the later insert wins.
pub struct CachingLinkResolver {
    inner: Arc<dyn LinkResolver>,
    cache: Cache<String, String>,
}

impl CachingLinkResolver {
    pub fn new(inner: Arc<dyn LinkResolver>, config: &LinkCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self { inner, cache }
    }

    /// Drop a cached link, e.g. after the platform reported it stale.
    pub async fn invalidate(&self, file_id: &str) {
        self.cache.invalidate(file_id).await;
    }
}

#[async_trait]
impl LinkResolver for CachingLinkResolver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn resolve(&self, file_id: &str) -> Result<String> {
        if let Some(link) = self.cache.get(file_id).await {
            metrics::counter!(telemetry::LINK_CACHE_HITS_TOTAL).increment(1);
            return Ok(link);
        }
        metrics::counter!(telemetry::LINK_CACHE_MISSES_TOTAL).increment(1);
        let link = self.inner.resolve(file_id).await?;
        self.cache.insert(file_id.to_string(), link.clone()).await;
        Ok(link)
    }
}
