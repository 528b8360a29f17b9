//! Keyward - concurrency-safe keyed state for multi-user bots
//!
//! This crate coordinates concurrent mutation of small, short-lived,
//! per-key state: upload buffers filled by several contributors, per-user
//! attempt counters, and a shared daily credit pool. Slow network calls
//! routinely happen while a key is held, so every compound update is
//! serialized per key or performed as one atomic store operation.
//!
//! Building blocks, leaf to root:
//!
//! - [`KeyedTtlStore`]: string-keyed values with per-entry TTL and a key
//!   ceiling.
//! - [`KeyedMutex`]: FIFO mutual exclusion per key for async operations.
//! - [`FixedWindowRateLimiter`]: attempt counting over a fixed window.
//! - [`SharedCreditLedger`]: day-scoped credits on a fast counter store,
//!   audited against a durable ledger.
//! - [`UploadBuffer`]: sessions of files collected under a per-key lock
//!   with an optimistic staleness check.
//! - [`AdmissionGate`]: credits plus rate limiting with refund on
//!   rejection.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use keyward::{
//!     Admission, AdmissionGate, CreditConfig, FixedWindowRateLimiter, RateLimiterConfig,
//!     SharedCreditLedger,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> keyward::Result<()> {
//!     let ledger = Arc::new(SharedCreditLedger::in_memory(CreditConfig::new()));
//!     ledger.init_daily_credits(Some(10)).await?;
//!     let limiter = Arc::new(FixedWindowRateLimiter::new(
//!         RateLimiterConfig::new().max_attempt(1),
//!     ));
//!     let gate = AdmissionGate::new(ledger.clone(), limiter);
//!
//!     if let Admission::Admitted(reservation) = gate.admit("user:1", 3).await? {
//!         // ... run the job ...
//!         reservation.commit();
//!     }
//!     assert!(matches!(gate.admit("user:1", 3).await?, Admission::RateLimited));
//!     assert_eq!(ledger.balance().await?, Some(7));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credits;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod lock;
pub mod store;
pub mod telemetry;
pub mod upload;

// Re-export main types at crate root
pub use config::Config;
pub use credits::{
    CounterStore, CreditAudit, CreditConfig, CreditReservation, InMemoryCounterStore,
    InMemoryLedgerStore, JsonFileLedgerStore, LedgerStore, SharedCreditLedger,
};
pub use error::{KeywardError, Result};
pub use gate::{Admission, AdmissionGate};
pub use limiter::{FixedWindowRateLimiter, RateLimiterConfig};
pub use lock::KeyedMutex;
pub use store::{CacheEntry, KeyedTtlStore, SetOptions, StoreConfig};
pub use upload::{
    CachingLinkResolver, Contribution, ContributionOutcome, FileDescriptor, LinkCacheConfig,
    LinkResolver, MediaKind, RetryConfig, RetryingLinkResolver, UploadBuffer, UploadConfig,
    UploadSession, session_key,
};
