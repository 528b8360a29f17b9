//! Fixed-window rate limiting.
//!
//! [`FixedWindowRateLimiter`] counts attempts per subject inside a window
//! that starts at the subject's first attempt and runs for a fixed TTL.
//! Activity never extends the window: the backing store is built with TTL
//! refresh disabled on both reads and writes.
//!
//! The limiter owns a [`KeyedTtlStore`] rather than extending one, and the
//! counter is only ever changed through [`attempt`](FixedWindowRateLimiter::attempt),
//! which performs its read-check-increment as a single store operation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{KeyedTtlStore, SetOptions, StoreConfig};
use crate::telemetry;

/// Admissions per subject per window when unset or invalid.
pub const DEFAULT_MAX_ATTEMPT: u32 = 3;

/// Distinct subjects tracked at once when unset or invalid.
pub const DEFAULT_MAX_SUBJECTS: usize = 250;

/// Window length when unset or invalid.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);

/// Configuration for a [`FixedWindowRateLimiter`].
///
/// Zero values are replaced by the defaults when the limiter is built;
/// construction never fails.
///
/// ```rust
/// # use keyward::RateLimiterConfig;
/// # use std::time::Duration;
/// let config = RateLimiterConfig::new()
///     .ttl(Duration::from_secs(2))
///     .max_entries(5)
///     .max_attempt(3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Window length. Default: 60s.
    pub ttl: Duration,
    /// Maximum distinct subjects tracked at once. Default: 250.
    pub max_entries: usize,
    /// Admissions per subject per window. Default: 3.
    pub max_attempt: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_WINDOW,
            max_entries: DEFAULT_MAX_SUBJECTS,
            max_attempt: DEFAULT_MAX_ATTEMPT,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from untrusted raw numbers (milliseconds for `ttl_ms`).
    ///
    /// Absent or non-positive values fall back to the defaults. Values too
    /// large for the field saturate.
    pub fn from_raw(
        ttl_ms: Option<i64>,
        max_entries: Option<i64>,
        max_attempt: Option<i64>,
    ) -> Self {
        Self {
            ttl: positive(ttl_ms, "ttl")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WINDOW),
            max_entries: positive(max_entries, "max")
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
                .unwrap_or(DEFAULT_MAX_SUBJECTS),
            max_attempt: positive(max_attempt, "max_attempt")
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_MAX_ATTEMPT),
        }
    }

    /// Set the window length.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum number of tracked subjects.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set admissions per subject per window.
    pub fn max_attempt(mut self, n: u32) -> Self {
        self.max_attempt = n;
        self
    }

    fn sanitized(self) -> Self {
        let mut config = self;
        if config.ttl.is_zero() {
            warn!(
                default_ms = DEFAULT_WINDOW.as_millis() as u64,
                "invalid rate limit ttl, using default"
            );
            config.ttl = DEFAULT_WINDOW;
        }
        if config.max_entries == 0 {
            warn!(default = DEFAULT_MAX_SUBJECTS, "invalid rate limit max, using default");
            config.max_entries = DEFAULT_MAX_SUBJECTS;
        }
        if config.max_attempt == 0 {
            warn!(default = DEFAULT_MAX_ATTEMPT, "invalid max_attempt, using default");
            config.max_attempt = DEFAULT_MAX_ATTEMPT;
        }
        config
    }
}

fn positive(value: Option<i64>, field: &'static str) -> Option<u64> {
    match value {
        Some(n) if n > 0 => Some(n as u64),
        Some(n) => {
            warn!(field, value = n, "non-positive rate limit setting, using default");
            None
        }
        None => None,
    }
}

enum Decision {
    Admitted,
    Rejected(&'static str),
}

/// Per-subject fixed-window attempt counter.
///
/// ```rust
/// # use keyward::{FixedWindowRateLimiter, RateLimiterConfig};
/// let limiter = FixedWindowRateLimiter::new(RateLimiterConfig::new().max_attempt(2));
/// assert!(limiter.attempt("u1"));
/// assert!(limiter.attempt("u1"));
/// assert!(!limiter.attempt("u1"));
/// ```
pub struct FixedWindowRateLimiter {
    store: KeyedTtlStore<u32>,
    max_attempt: AtomicU32,
}

impl FixedWindowRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let config = config.sanitized();
        let store = KeyedTtlStore::new(
            StoreConfig::new()
                .max_entries(config.max_entries)
                .ttl(config.ttl)
                .update_age_on_get(false)
                .reset_ttl_on_update(false),
        );
        Self {
            store,
            max_attempt: AtomicU32::new(config.max_attempt),
        }
    }

    /// Record an attempt for `subject` and report whether it is admitted.
    ///
    /// New subjects are refused while the limiter tracks `max_entries`
    /// subjects; subjects already in a window are unaffected by capacity.
    /// A rejected attempt leaves the count unchanged.
    pub fn attempt(&self, subject: &str) -> bool {
        let max_attempt = self.max_attempt.load(Ordering::Relaxed);
        let decision = self
            .store
            .compute(subject, SetOptions::new(), |current, at_capacity| match current {
                None if at_capacity => (None, Decision::Rejected("capacity")),
                None => (Some(1), Decision::Admitted),
                Some(&count) if count < max_attempt => (Some(count + 1), Decision::Admitted),
                Some(_) => (None, Decision::Rejected("max_attempt")),
            });

        match decision {
            Decision::Admitted => {
                metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL,
                    "decision" => "admitted",
                    "reason" => "ok",
                )
                .increment(1);
                true
            }
            Decision::Rejected(reason) => {
                metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL,
                    "decision" => "rejected",
                    "reason" => reason,
                )
                .increment(1);
                debug!(subject, reason, "rate limit rejected attempt");
                false
            }
        }
    }

    /// Change admissions per window for all later attempts.
    ///
    /// Non-positive values fall back to [`DEFAULT_MAX_ATTEMPT`]; values above
    /// `u32::MAX` saturate.
    pub fn set_max_attempt(&self, n: i64) {
        let value = if n > 0 {
            u32::try_from(n).unwrap_or(u32::MAX)
        } else {
            warn!(value = n, default = DEFAULT_MAX_ATTEMPT, "invalid max_attempt, using default");
            DEFAULT_MAX_ATTEMPT
        };
        self.max_attempt.store(value, Ordering::Relaxed);
    }

    pub fn max_attempt(&self) -> u32 {
        self.max_attempt.load(Ordering::Relaxed)
    }

    /// Attempts counted for `subject` in its current window.
    pub fn attempts(&self, subject: &str) -> Option<u32> {
        self.store.get(subject)
    }

    /// Time until `subject`'s window closes.
    pub fn remaining_window(&self, subject: &str) -> Option<Duration> {
        self.store.remaining_ttl(subject)
    }

    /// Forget `subject`, starting a fresh window on its next attempt.
    pub fn reset(&self, subject: &str) -> bool {
        self.store.delete(subject)
    }

    /// Number of tracked subjects (including expired, unpurged ones).
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for FixedWindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
