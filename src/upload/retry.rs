//! Retrying link resolution.
//!
//! [`RetryingLinkResolver`] re-issues a resolution after transient failures
//! (see [`is_transient`](crate::KeywardError::is_transient)), sleeping an
//! exponentially growing backoff between calls. A `retry_after` hint from
//! the remote side replaces the backoff for that wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::resolver::LinkResolver;
use crate::Result;
use crate::telemetry;

/// Backoff policy for [`RetryingLinkResolver`].
///
/// ```rust
/// # use keyward::RetryConfig;
/// # use std::time::Duration;
/// let policy = RetryConfig::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(200))
///     .jitter(false);
/// assert_eq!(policy.backoff(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Calls per resolution, the first one included. Default: 3.
    pub max_attempts: u32,
    /// Wait before the first retry; doubles on each further retry.
    /// Default: 250ms.
    pub base_delay: Duration,
    /// Ceiling on any single wait. Default: 10s.
    pub max_delay: Duration,
    /// Randomize each wait between half and all of the backoff.
    /// Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// One call, no retries.
    pub fn disabled() -> Self {
        Self::default().max_attempts(1)
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Un-jittered wait before retry number `retry` (0 = first retry):
    /// `base_delay * 2^retry`, at most `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Actual wait before retry number `retry`, given the remote's hint.
    pub fn delay_before(&self, retry: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint,
            None if self.jitter => self.backoff(retry).mul_f64(0.5 + fastrand::f64() * 0.5),
            None => self.backoff(retry),
        }
    }
}

/// Drive `call` until it succeeds, fails permanently, or runs out of
/// attempts. The last transient error is returned in the latter case.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryConfig,
    resolver: &str,
    call: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0;
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };
        if retry + 1 >= attempts {
            return Err(err);
        }

        let delay = policy.delay_before(retry, err.retry_after());
        metrics::counter!(telemetry::RESOLVER_RETRIES_TOTAL, "resolver" => resolver.to_owned())
            .increment(1);
        warn!(
            resolver,
            retry = retry + 1,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "link resolution failed, retrying"
        );
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

/// [`LinkResolver`] decorator applying a [`RetryConfig`].
///
/// Permanent failures such as
/// [`FileNotFound`](crate::KeywardError::FileNotFound) pass straight through.
pub struct RetryingLinkResolver {
    inner: Arc<dyn LinkResolver>,
    policy: RetryConfig,
}

impl RetryingLinkResolver {
    pub fn new(inner: Arc<dyn LinkResolver>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LinkResolver for RetryingLinkResolver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn resolve(&self, file_id: &str) -> Result<String> {
        with_retry(&self.policy, self.inner.name(), || self.inner.resolve(file_id)).await
    }
}
