//! Storage collaborators for the credit ledger.
//!
//! The ledger never reads-then-writes the fast counter itself: every
//! mutation goes through a single atomic call on [`CounterStore`], so an
//! implementation backed by a shared external store (e.g. redis `DECRBY`
//! guarded by a script) stays correct across several service instances.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Fast shared counter used on the admission path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Store name for logs and errors.
    fn name(&self) -> &str;

    /// Current value, `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Overwrite the value, optionally expiring the key after `ttl`.
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()>;

    /// Atomically add `amount` and return the new value. A missing key
    /// counts as zero.
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    /// Atomically subtract `amount` only if the current value is at least
    /// `amount`.
    ///
    /// Returns the new value, or `None` (value untouched) when the key is
    /// missing or the balance is insufficient.
    async fn decr_by_if_sufficient(&self, key: &str, amount: i64) -> Result<Option<i64>>;
}

/// Durable ledger consulted only for initialization and audit.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store name for logs and errors.
    fn name(&self) -> &str;

    async fn read(&self, key: &str) -> Result<Option<i64>>;

    async fn write(&self, key: &str, value: i64) -> Result<()>;
}
