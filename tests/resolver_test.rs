//! Tests for the link resolver decorators: retry with backoff, caching,
//! and both stacked under an upload buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keyward::{
    CachingLinkResolver, Contribution, ContributionOutcome, KeywardError, LinkCacheConfig,
    LinkResolver, MediaKind, Result, RetryConfig, RetryingLinkResolver, UploadBuffer,
    UploadConfig, UploadSession,
};
use tokio::time::Instant;

enum Failure {
    Transient,
    RateLimited(Duration),
    NotFound,
}

/// Fails the first `failures` calls, then resolves.
struct FlakyResolver {
    failures: u32,
    kind: Failure,
    calls: AtomicU32,
}

impl FlakyResolver {
    fn new(failures: u32, kind: Failure) -> Arc<Self> {
        Arc::new(Self {
            failures,
            kind,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkResolver for FlakyResolver {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn resolve(&self, file_id: &str) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(match self.kind {
                Failure::Transient => KeywardError::Resolve {
                    file_id: file_id.to_string(),
                    message: "gateway timeout".into(),
                },
                Failure::RateLimited(after) => KeywardError::RemoteRateLimited {
                    retry_after: Some(after),
                },
                Failure::NotFound => KeywardError::FileNotFound(file_id.to_string()),
            });
        }
        Ok(format!("https://files.test/{file_id}"))
    }
}

fn fixed_backoff() -> RetryConfig {
    RetryConfig::new()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .jitter(false)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let inner = FlakyResolver::new(2, Failure::Transient);
    let resolver = RetryingLinkResolver::new(inner.clone(), fixed_backoff());

    let started = Instant::now();
    let link = resolver.resolve("f1").await.unwrap();
    assert_eq!(link, "https://files.test/f1");
    assert_eq!(inner.calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let inner = FlakyResolver::new(u32::MAX, Failure::Transient);
    let resolver = RetryingLinkResolver::new(inner.clone(), fixed_backoff());

    let err = resolver.resolve("f1").await.unwrap_err();
    assert!(matches!(err, KeywardError::Resolve { .. }));
    assert_eq!(inner.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let inner = FlakyResolver::new(1, Failure::NotFound);
    let resolver = RetryingLinkResolver::new(inner.clone(), fixed_backoff());

    assert!(matches!(
        resolver.resolve("f1").await,
        Err(KeywardError::FileNotFound(_))
    ));
    assert_eq!(inner.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_sets_the_delay() {
    let inner = FlakyResolver::new(1, Failure::RateLimited(Duration::from_secs(5)));
    let resolver = RetryingLinkResolver::new(inner.clone(), fixed_backoff());

    let started = Instant::now();
    resolver.resolve("f1").await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn disabled_retry_makes_one_call() {
    let inner = FlakyResolver::new(1, Failure::Transient);
    let resolver = RetryingLinkResolver::new(inner.clone(), RetryConfig::disabled());

    assert!(resolver.resolve("f1").await.is_err());
    assert_eq!(inner.calls(), 1);
}

#[tokio::test]
async fn cache_reuses_successful_resolutions() {
    let inner = FlakyResolver::new(0, Failure::Transient);
    let resolver = CachingLinkResolver::new(inner.clone(), &LinkCacheConfig::new());

    assert_eq!(resolver.resolve("f1").await.unwrap(), "https://files.test/f1");
    assert_eq!(resolver.resolve("f1").await.unwrap(), "https://files.test/f1");
    resolver.resolve("f2").await.unwrap();
    assert_eq!(inner.calls(), 2);

    resolver.invalidate("f1").await;
    resolver.resolve("f1").await.unwrap();
    assert_eq!(inner.calls(), 3);
}

#[tokio::test]
async fn cache_does_not_remember_failures() {
    let inner = FlakyResolver::new(1, Failure::NotFound);
    let resolver = CachingLinkResolver::new(inner.clone(), &LinkCacheConfig::new());

    assert!(resolver.resolve("f1").await.is_err());
    assert!(resolver.resolve("f1").await.is_ok());
    assert_eq!(inner.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn stacked_resolvers_under_upload_buffer() {
    let inner = FlakyResolver::new(1, Failure::Transient);
    let retrying = Arc::new(RetryingLinkResolver::new(inner.clone(), fixed_backoff()));
    let resolver = Arc::new(CachingLinkResolver::new(retrying, &LinkCacheConfig::new()));
    let buffer = UploadBuffer::new(UploadConfig::new(), resolver);

    let first = buffer
        .open(UploadSession::new(1, 1, "merge_pdf", MediaKind::Document))
        .await;
    let second = buffer
        .open(UploadSession::new(2, 1, "merge_pdf", MediaKind::Document))
        .await;
    let file = || Contribution::new("shared", "shared.pdf", MediaKind::Document);

    assert_eq!(
        buffer.contribute(&first, file()).await.unwrap(),
        ContributionOutcome::Appended { position: 0 }
    );
    assert_eq!(
        buffer.contribute(&second, file()).await.unwrap(),
        ContributionOutcome::Appended { position: 0 }
    );
    // one failure, one success, then served from cache
    assert_eq!(inner.calls(), 2);
}
