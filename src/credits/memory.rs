//! In-process counter and ledger stores.
//!
//! Suitable for single-instance deployments and tests. A multi-instance
//! deployment supplies a [`CounterStore`] backed by a shared external store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{CounterStore, LedgerStore};
use crate::store::{KeyedTtlStore, SetOptions, StoreConfig};
use crate::{KeywardError, Result};

const COUNTER_MAX_KEYS: usize = 10_000;

// Keys written without a TTL effectively never expire.
const COUNTER_DEFAULT_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Counter store on top of [`KeyedTtlStore`].
///
/// Each call is a single atomic store operation. Increments keep the key's
/// existing expiry, matching `INCRBY` semantics.
pub struct InMemoryCounterStore {
    entries: KeyedTtlStore<i64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: KeyedTtlStore::new(
                StoreConfig::new()
                    .max_entries(COUNTER_MAX_KEYS)
                    .ttl(COUNTER_DEFAULT_TTL),
            ),
        }
    }

    /// Time left before `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.entries.remaining_ttl(key)
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.entries.get(key))
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()> {
        let options = match ttl {
            Some(ttl) => SetOptions::new().ttl(ttl),
            None => SetOptions::new(),
        };
        self.entries.set(key, value, options);
        Ok(())
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let (value, refused) =
            self.entries
                .compute(key, SetOptions::new().preserve_ttl(), |current, at_capacity| {
                    let next = current.copied().unwrap_or(0) + amount;
                    (Some(next), (next, current.is_none() && at_capacity))
                });
        if refused {
            return Err(KeywardError::store(self.name(), "counter capacity reached"));
        }
        Ok(value)
    }

    async fn decr_by_if_sufficient(&self, key: &str, amount: i64) -> Result<Option<i64>> {
        Ok(self
            .entries
            .compute(key, SetOptions::new().preserve_ttl(), |current, _| match current {
                Some(&balance) if balance >= amount => {
                    let next = balance - amount;
                    (Some(next), Some(next))
                }
                _ => (None, None),
            }))
    }
}

/// Ledger store held in a map.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    values: RwLock<HashMap<String, i64>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    fn name(&self) -> &str {
        "memory-ledger"
    }

    async fn read(&self, key: &str) -> Result<Option<i64>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).copied())
    }

    async fn write(&self, key: &str, value: i64) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decrement_refuses_insufficient_balance() {
        let store = InMemoryCounterStore::new();
        store.set("k", 5, None).await.unwrap();

        assert_eq!(store.decr_by_if_sufficient("k", 6).await.unwrap(), None);
        assert_eq!(store.get("k").await.unwrap(), Some(5));
        assert_eq!(store.decr_by_if_sufficient("k", 5).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn decrement_of_missing_key_is_refused() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.decr_by_if_sufficient("missing", 1).await.unwrap(), None);
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_creates_missing_key() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.incr_by("k", 3).await.unwrap(), 3);
        assert_eq!(store.incr_by("k", 2).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn key_ttl_survives_increments() {
        let store = InMemoryCounterStore::new();
        store
            .set("k", 1, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.incr_by("k", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ledger_read_write() {
        let ledger = InMemoryLedgerStore::new();
        assert_eq!(ledger.read("k").await.unwrap(), None);
        ledger.write("k", 42).await.unwrap();
        assert_eq!(ledger.read("k").await.unwrap(), Some(42));
    }
}
