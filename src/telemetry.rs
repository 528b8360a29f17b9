//! Telemetry metric name constants.
//!
//! Centralised metric names for keyward operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `keyward_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `decision`: admission outcome: "admitted" or "rejected"
//! - `reason`: why a request was rejected (e.g. "capacity", "max_attempt")
//! - `outcome`: upload contribution result (e.g. "appended", "conflict")

/// Rate limiter decisions.
///
/// Labels: `decision` ("admitted" | "rejected"), `reason`.
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "keyward_rate_limit_decisions_total";

/// Credits successfully consumed from the daily pool.
pub const CREDITS_CONSUMED_TOTAL: &str = "keyward_credits_consumed_total";

/// Credits returned to the daily pool.
pub const CREDITS_REFUNDED_TOTAL: &str = "keyward_credits_refunded_total";

/// Consumption attempts rejected for insufficient balance.
pub const CREDITS_REJECTED_TOTAL: &str = "keyward_credits_rejected_total";

/// Fast counter minus durable ledger, as of the last reconciliation.
pub const CREDITS_DRIFT: &str = "keyward_credits_drift";

/// Upload contributions by outcome.
///
/// Labels: `outcome`.
pub const UPLOAD_CONTRIBUTIONS_TOTAL: &str = "keyward_upload_contributions_total";

/// Time spent waiting for a per-key lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "keyward_lock_wait_seconds";

/// Link resolver retry attempts (not counting the initial call).
///
/// Labels: `resolver`.
pub const RESOLVER_RETRIES_TOTAL: &str = "keyward_resolver_retries_total";

/// Link cache hits.
pub const LINK_CACHE_HITS_TOTAL: &str = "keyward_link_cache_hits_total";

/// Link cache misses.
pub const LINK_CACHE_MISSES_TOTAL: &str = "keyward_link_cache_misses_total";
