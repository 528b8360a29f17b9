//! TTL-expiring keyed store.
//!
//! [`KeyedTtlStore`] maps string keys to values, each entry carrying its own
//! expiry deadline, under a global entry-count ceiling. It is the base
//! primitive for the rate limiter, the in-memory counter store and the
//! upload buffer.
//!
//! # Expiry
//!
//! Expiry is lazy: reads (`get`, `has`, `entries`, `compute`) check the
//! deadline and purge an expired entry on the spot. There is no background
//! sweeper, so [`len()`](KeyedTtlStore::len) may still count entries that
//! have expired but were not read since.
//!
//! # Capacity
//!
//! Updating a live key is always allowed. Inserting a new key when the store
//! is full first drops expired entries, then:
//!
//! - [`set`](KeyedTtlStore::set) evicts the oldest surviving entry
//!   (insertion order, no access-based promotion);
//! - [`try_insert`](KeyedTtlStore::try_insert) and
//!   [`compute`](KeyedTtlStore::compute) refuse the new key instead.
//!
//! # Concurrency
//!
//! Every operation is atomic with respect to the others (internal mutex,
//! never held across an await). Sequences of operations are not; callers
//! that read, await, then write must serialize through
//! [`KeyedMutex`](crate::KeyedMutex).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Default maximum number of distinct keys.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Default time-to-live for new entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Configuration for a [`KeyedTtlStore`].
///
/// ```rust
/// # use keyward::StoreConfig;
/// # use std::time::Duration;
/// let config = StoreConfig::new()
///     .max_entries(1_000)
///     .ttl(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of distinct keys. Default: 500. Zero is treated as 1.
    pub max_entries: usize,
    /// Time-to-live for entries written without an explicit TTL. Default: 60s.
    pub ttl: Duration,
    /// Restart an entry's TTL clock whenever it is read. Default: false.
    pub update_age_on_get: bool,
    /// Restart an entry's TTL clock when an existing key is overwritten.
    /// Default: true. [`SetOptions::preserve_ttl`] overrides this per call.
    pub reset_ttl_on_update: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
            update_age_on_get: false,
            reset_ttl_on_update: true,
        }
    }
}

impl StoreConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of distinct keys.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the default time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Restart the TTL clock on reads.
    pub fn update_age_on_get(mut self, enabled: bool) -> Self {
        self.update_age_on_get = enabled;
        self
    }

    /// Restart the TTL clock when an existing key is overwritten.
    pub fn reset_ttl_on_update(mut self, enabled: bool) -> Self {
        self.reset_ttl_on_update = enabled;
        self
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Keep the existing entry's deadline when overwriting it.
    pub preserve_ttl: bool,
    /// TTL for this write, instead of the store default.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the value without moving the entry's deadline.
    pub fn preserve_ttl(mut self) -> Self {
        self.preserve_ttl = true;
        self
    }

    /// Use a custom TTL for this write.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A snapshot of one stored entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Instant after which the entry is no longer visible.
    pub fn expires_at(&self) -> Instant {
        self.inserted_at + self.ttl
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

struct Slot<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.inserted_at + self.ttl
    }
}

struct Inner<V> {
    entries: HashMap<String, Slot<V>>,
    // insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    /// Look up a key, purging it first if it has expired.
    fn live_slot(&mut self, key: &str, now: Instant) -> Option<&mut Slot<V>> {
        if self.entries.get(key).is_some_and(|s| s.is_expired(now)) {
            self.remove(key);
            debug!(key, "purged expired entry");
            return None;
        }
        self.entries.get_mut(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Whether a new key would exceed `max`, after dropping expired entries.
    fn is_full(&mut self, max: usize, now: Instant) -> bool {
        if self.entries.len() < max {
            return false;
        }
        self.purge_expired(now);
        self.entries.len() >= max
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn insert_new(&mut self, key: String, value: V, ttl: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );
    }
}

/// Thread-safe keyed store with per-entry TTL and a key-count ceiling.
///
/// See the [module docs](self) for expiry and capacity semantics.
pub struct KeyedTtlStore<V> {
    config: StoreConfig,
    inner: Mutex<Inner<V>>,
}

impl<V> KeyedTtlStore<V> {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        let config = StoreConfig {
            max_entries: config.max_entries.max(1),
            ..config
        };
        Self {
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Create a store with the given capacity and default TTL.
    pub fn with_capacity(max_entries: usize, ttl: Duration) -> Self {
        Self::new(StoreConfig::new().max_entries(max_entries).ttl(ttl))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // Critical sections never panic, so a poisoned lock still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_ttl(&self, options: &SetOptions) -> Duration {
        options.ttl.unwrap_or(self.config.ttl)
    }

    /// Write into an existing live slot, honouring TTL options.
    fn overwrite(&self, slot: &mut Slot<V>, value: V, options: &SetOptions, now: Instant) {
        slot.value = value;
        if !options.preserve_ttl && self.config.reset_ttl_on_update {
            slot.inserted_at = now;
            slot.ttl = self.effective_ttl(options);
        }
    }

    /// Whether a live entry exists for `key`.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock().live_slot(key, now).is_some()
    }

    /// Store a value, evicting the oldest entry if a new key hits capacity.
    pub fn set(&self, key: impl Into<String>, value: V, options: SetOptions) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.lock();

        if let Some(slot) = inner.live_slot(&key, now) {
            self.overwrite(slot, value, &options, now);
            return;
        }
        if inner.is_full(self.config.max_entries, now) {
            if let Some(evicted) = inner.evict_oldest() {
                debug!(key = %evicted, "evicted oldest entry at capacity");
            }
        }
        let ttl = self.effective_ttl(&options);
        inner.insert_new(key, value, ttl, now);
    }

    /// Store a value unless it is a new key and the store is full.
    ///
    /// Returns `false` when the write was refused.
    pub fn try_insert(&self, key: impl Into<String>, value: V, options: SetOptions) -> bool {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.lock();

        if let Some(slot) = inner.live_slot(&key, now) {
            self.overwrite(slot, value, &options, now);
            return true;
        }
        if inner.is_full(self.config.max_entries, now) {
            return false;
        }
        let ttl = self.effective_ttl(&options);
        inner.insert_new(key, value, ttl, now);
        true
    }

    /// Atomic read-modify-write of a single key.
    ///
    /// `f` receives the current live value (if any) and whether inserting a
    /// *new* key would be refused for capacity. It returns the value to
    /// store (`None` leaves the entry untouched) and a result passed back to
    /// the caller. A value returned for an absent key while the store is
    /// full is dropped.
    pub fn compute<R, F>(&self, key: &str, options: SetOptions, f: F) -> R
    where
        F: FnOnce(Option<&V>, bool) -> (Option<V>, R),
    {
        let now = Instant::now();
        let mut inner = self.lock();

        let exists = inner.live_slot(key, now).is_some();
        let at_capacity = inner.is_full(self.config.max_entries, now);
        let (next, output) = f(inner.entries.get(key).map(|s| &s.value), at_capacity);

        if let Some(value) = next {
            if let Some(slot) = inner.entries.get_mut(key).filter(|_| exists) {
                self.overwrite(slot, value, &options, now);
            } else if !at_capacity {
                let ttl = self.effective_ttl(&options);
                inner.insert_new(key.to_string(), value, ttl, now);
            } else {
                debug!(key, "compute refused new key at capacity");
            }
        }
        output
    }

    /// Remove a key. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .remove(key)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Time left before `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .live_slot(key, now)
            .map(|slot| (slot.inserted_at + slot.ttl).saturating_duration_since(now))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.lock().purge_expired(now)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl<V: Clone> KeyedTtlStore<V> {
    /// Look up a live value. Expired entries are purged and read as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let update_age = self.config.update_age_on_get;
        let mut inner = self.lock();
        let slot = inner.live_slot(key, now)?;
        if update_age {
            slot.inserted_at = now;
        }
        Some(slot.value.clone())
    }

    /// Full entry snapshot for a live key.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner.live_slot(key, now)?;
        Some(CacheEntry {
            key: key.to_string(),
            value: slot.value.clone(),
            inserted_at: slot.inserted_at,
            ttl: slot.ttl,
        })
    }

    /// All live entries, oldest insertion first.
    pub fn entries(&self) -> Vec<CacheEntry<V>> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.purge_expired(now);
        inner
            .order
            .values()
            .filter_map(|key| {
                inner.entries.get(key).map(|slot| CacheEntry {
                    key: key.clone(),
                    value: slot.value.clone(),
                    inserted_at: slot.inserted_at,
                    ttl: slot.ttl,
                })
            })
            .collect()
    }
}

impl<V> Default for KeyedTtlStore<V> {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
