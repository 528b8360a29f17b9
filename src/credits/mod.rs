//! Shared daily credit ledger.
//!
//! Two stores hold today's credits:
//!
//! - the fast [`CounterStore`], the only source consulted for admission.
//!   Consumption is a single conditional decrement and refunds a single
//!   increment, so callers never read-then-write the balance;
//! - the durable [`LedgerStore`], written at initialization and by
//!   [`settle`](SharedCreditLedger::settle), read only by
//!   [`compare_credits_left`](SharedCreditLedger::compare_credits_left).
//!
//! The two can drift after partial failures. Reconciliation reports the
//! drift as a [`CreditAudit`] and a gauge; nothing corrects it inline.
//!
//! # Keys
//!
//! Each day has its own key, `"credits:<YYYY-MM-DD>"` (UTC by default).
//! A day must be initialized with
//! [`init_daily_credits`](SharedCreditLedger::init_daily_credits); consuming
//! against an uninitialized day is refused rather than auto-created.
//!
//! # Reservations
//!
//! [`reserve`](SharedCreditLedger::reserve) wraps a consumption in a
//! [`CreditReservation`] that is either committed or refunded exactly once,
//! and refunds itself if dropped unsettled.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::{JsonFileLedgerStore, default_ledger_path};
pub use memory::{InMemoryCounterStore, InMemoryLedgerStore};
pub use traits::{CounterStore, LedgerStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::telemetry;
use crate::{KeywardError, Result};

/// Daily limit used when `init_daily_credits` gets an invalid value.
pub const DEFAULT_DAILY_LIMIT: i64 = 100;

/// Prefix of day-scoped ledger keys.
pub const DEFAULT_KEY_PREFIX: &str = "credits";

/// How long a day's fast counter key lives after initialization.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(48 * 3600);

/// Configuration for a [`SharedCreditLedger`].
#[derive(Debug, Clone)]
pub struct CreditConfig {
    /// Limit applied when initialization gets an absent or non-positive
    /// value. Default: 100.
    pub fallback_limit: i64,
    /// Key prefix. Default: `"credits"`.
    pub key_prefix: String,
    /// Expiry of the fast counter key. Default: 48 hours.
    pub key_ttl: Duration,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            fallback_limit: DEFAULT_DAILY_LIMIT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_ttl: DEFAULT_KEY_TTL,
        }
    }
}

impl CreditConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback daily limit. Non-positive values keep the default.
    pub fn fallback_limit(mut self, limit: i64) -> Self {
        if limit > 0 {
            self.fallback_limit = limit;
        } else {
            warn!(limit, "invalid fallback credit limit, keeping default");
        }
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_ttl(mut self, ttl: Duration) -> Self {
        self.key_ttl = ttl;
        self
    }
}

/// Result of comparing the fast counter with the durable ledger.
///
/// Missing values read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditAudit {
    pub key: String,
    pub fast_value: i64,
    pub durable_value: i64,
    /// `fast_value - durable_value`.
    pub diff: i64,
    pub equal: bool,
}

impl CreditAudit {
    fn new(key: String, fast_value: i64, durable_value: i64) -> Self {
        let diff = fast_value - durable_value;
        Self {
            key,
            fast_value,
            durable_value,
            diff,
            equal: diff == 0,
        }
    }
}

/// Supplies "today" for key derivation.
pub type DateSource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

fn utc_today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

async fn consume_on(counter: &dyn CounterStore, key: &str, amount: u32) -> Result<bool> {
    if amount == 0 {
        return Ok(true);
    }
    match counter.decr_by_if_sufficient(key, i64::from(amount)).await? {
        Some(balance) => {
            metrics::counter!(telemetry::CREDITS_CONSUMED_TOTAL).increment(u64::from(amount));
            debug!(key, amount, balance, "credits consumed");
            Ok(true)
        }
        None => {
            metrics::counter!(telemetry::CREDITS_REJECTED_TOTAL).increment(1);
            debug!(key, amount, "insufficient credits");
            Ok(false)
        }
    }
}

async fn refund_on(counter: &dyn CounterStore, key: &str, amount: u32) -> Result<i64> {
    let balance = counter.incr_by(key, i64::from(amount)).await?;
    metrics::counter!(telemetry::CREDITS_REFUNDED_TOTAL).increment(u64::from(amount));
    debug!(key, amount, balance, "credits refunded");
    Ok(balance)
}

/// Day-scoped credit pool shared by every request.
pub struct SharedCreditLedger {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    config: CreditConfig,
    today: DateSource,
    settle_lock: Mutex<()>,
}

impl SharedCreditLedger {
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn LedgerStore>,
        config: CreditConfig,
    ) -> Self {
        Self {
            counter,
            ledger,
            config,
            today: Arc::new(utc_today),
            settle_lock: Mutex::new(()),
        }
    }

    /// Ledger over in-process stores.
    pub fn in_memory(config: CreditConfig) -> Self {
        Self::new(
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(InMemoryLedgerStore::new()),
            config,
        )
    }

    /// Replace the wall-clock date source.
    pub fn with_date_source(
        mut self,
        today: impl Fn() -> NaiveDate + Send + Sync + 'static,
    ) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    /// Ledger key for `date`.
    pub fn key_for(&self, date: NaiveDate) -> String {
        format!("{}:{}", self.config.key_prefix, date.format("%Y-%m-%d"))
    }

    /// Ledger key for the current day.
    pub fn key_for_today(&self) -> String {
        self.key_for((self.today)())
    }

    /// Reset today's balance in both stores.
    ///
    /// Absent or non-positive `limit` uses the configured fallback. Returns
    /// the limit applied.
    pub async fn init_daily_credits(&self, limit: Option<i64>) -> Result<i64> {
        let limit = match limit {
            Some(n) if n > 0 => n,
            other => {
                warn!(
                    limit = ?other,
                    fallback = self.config.fallback_limit,
                    "invalid daily credit limit, using fallback"
                );
                self.config.fallback_limit
            }
        };
        let key = self.key_for_today();
        self.counter
            .set(&key, limit, Some(self.config.key_ttl))
            .await?;
        self.ledger.write(&key, limit).await?;
        info!(key = %key, limit, "daily credits initialized");
        Ok(limit)
    }

    /// Take `amount` credits from today's pool.
    ///
    /// Returns `false`, leaving the balance unchanged, when the balance is
    /// insufficient or the day was never initialized.
    pub async fn consume_credits(&self, amount: u32) -> Result<bool> {
        let key = self.key_for_today();
        consume_on(self.counter.as_ref(), &key, amount).await
    }

    /// Return `amount` credits to today's pool. Returns the new balance.
    pub async fn refund_credits(&self, amount: u32) -> Result<i64> {
        let key = self.key_for_today();
        refund_on(self.counter.as_ref(), &key, amount).await
    }

    /// Today's fast balance, `None` if uninitialized.
    pub async fn balance(&self) -> Result<Option<i64>> {
        self.counter.get(&self.key_for_today()).await
    }

    /// Consume `amount` credits behind a settle-once handle.
    ///
    /// Returns `None` when the balance is insufficient.
    pub async fn reserve(&self, amount: u32) -> Result<Option<CreditReservation>> {
        let key = self.key_for_today();
        if !consume_on(self.counter.as_ref(), &key, amount).await? {
            return Ok(None);
        }
        Ok(Some(CreditReservation {
            counter: Arc::clone(&self.counter),
            key,
            amount,
            settled: false,
        }))
    }

    /// Record `amount` credits of completed work in the durable ledger.
    ///
    /// Runs off the admission path, after the work a consumption paid for
    /// has finished. Returns the new durable value.
    pub async fn settle(&self, amount: u32) -> Result<i64> {
        let key = self.key_for_today();
        let _guard = self.settle_lock.lock().await;
        let current = self
            .ledger
            .read(&key)
            .await?
            .ok_or_else(|| KeywardError::CreditsNotInitialized(key.clone()))?;
        let next = current - i64::from(amount);
        if next < 0 {
            warn!(key = %key, current, amount, "durable ledger settled below zero");
        }
        self.ledger.write(&key, next).await?;
        Ok(next)
    }

    /// Compare today's fast balance with the durable ledger.
    ///
    /// Read-only. A non-zero diff is logged and reported, never corrected.
    pub async fn compare_credits_left(&self) -> Result<CreditAudit> {
        let key = self.key_for_today();
        let (fast, durable) =
            futures_util::future::try_join(self.counter.get(&key), self.ledger.read(&key)).await?;
        let audit = CreditAudit::new(key, fast.unwrap_or(0), durable.unwrap_or(0));

        metrics::gauge!(telemetry::CREDITS_DRIFT).set(audit.diff as f64);
        if audit.equal {
            info!(key = %audit.key, value = audit.fast_value, "credit ledger in sync");
        } else {
            warn!(
                key = %audit.key,
                fast = audit.fast_value,
                durable = audit.durable_value,
                diff = audit.diff,
                counter_store = self.counter.name(),
                ledger_store = self.ledger.name(),
                "credit ledger drift detected"
            );
        }
        Ok(audit)
    }
}

/// Credits taken from the pool, pending commit or refund.
///
/// Bound to the day key it was taken from, so a refund after midnight goes
/// back to the right pool. Settles exactly once: [`commit`](Self::commit)
/// keeps the debit, [`refund`](Self::refund) returns it, and dropping an
/// unsettled reservation spawns a refund on the current tokio runtime.
#[must_use = "an unsettled reservation is refunded when dropped"]
pub struct CreditReservation {
    counter: Arc<dyn CounterStore>,
    key: String,
    amount: u32,
    settled: bool,
}

impl CreditReservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn amount(&self) -> u32 {
        self.amount
    }

    /// Keep the debit. Returns the amount committed.
    pub fn commit(mut self) -> u32 {
        self.settled = true;
        self.amount
    }

    /// Return the credits. Returns the new balance.
    ///
    /// The increment runs as its own task on the current tokio runtime, so
    /// dropping this future midway still returns the credits. On error the
    /// credits are not retried, so a failing store can lose a refund but
    /// never apply one twice.
    pub async fn refund(mut self) -> Result<i64> {
        self.settled = true;
        let counter = Arc::clone(&self.counter);
        let key = self.key.clone();
        let amount = self.amount;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return refund_on(counter.as_ref(), &key, amount).await;
        };
        let task = handle.spawn(async move { refund_on(counter.as_ref(), &key, amount).await });
        task.await
            .map_err(|e| KeywardError::store(self.counter.name(), format!("refund task: {e}")))?
    }
}

impl fmt::Debug for CreditReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditReservation")
            .field("key", &self.key)
            .field("amount", &self.amount)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for CreditReservation {
    fn drop(&mut self) {
        if self.settled || self.amount == 0 {
            return;
        }
        let counter = Arc::clone(&self.counter);
        let key = self.key.clone();
        let amount = self.amount;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, amount, "credit reservation dropped unsettled, refunding");
                handle.spawn(async move {
                    if let Err(e) = refund_on(counter.as_ref(), &key, amount).await {
                        error!(
                            key = %key,
                            amount,
                            error = %e,
                            "refund of dropped reservation failed"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    key = %key,
                    amount,
                    "credit reservation dropped outside a runtime, not refunded"
                );
            }
        }
    }
}
