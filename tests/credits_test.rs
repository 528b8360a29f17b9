//! Tests for [`SharedCreditLedger`] and [`CreditReservation`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use keyward::{
    CounterStore, CreditConfig, InMemoryCounterStore, InMemoryLedgerStore, JsonFileLedgerStore,
    KeywardError, LedgerStore, Result, SharedCreditLedger,
};

fn march(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn ledger_on(day: u32) -> SharedCreditLedger {
    SharedCreditLedger::in_memory(CreditConfig::new()).with_date_source(move || march(day))
}

/// Wait for spawned refund tasks to land.
async fn settle_background() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn daily_pool_scenario() {
    let ledger = ledger_on(9);
    assert_eq!(ledger.init_daily_credits(Some(100)).await.unwrap(), 100);

    assert!(ledger.consume_credits(30).await.unwrap());
    assert!(!ledger.consume_credits(80).await.unwrap());
    assert_eq!(ledger.balance().await.unwrap(), Some(70));
    assert_eq!(ledger.refund_credits(30).await.unwrap(), 100);
    assert!(ledger.consume_credits(100).await.unwrap());
    assert!(!ledger.consume_credits(1).await.unwrap());
    assert_eq!(ledger.balance().await.unwrap(), Some(0));
}

#[tokio::test]
async fn init_falls_back_on_invalid_limit() {
    let ledger = SharedCreditLedger::in_memory(CreditConfig::new().fallback_limit(25))
        .with_date_source(|| march(9));
    assert_eq!(ledger.init_daily_credits(Some(0)).await.unwrap(), 25);
    assert_eq!(ledger.init_daily_credits(Some(-10)).await.unwrap(), 25);
    assert_eq!(ledger.init_daily_credits(None).await.unwrap(), 25);
    assert_eq!(ledger.balance().await.unwrap(), Some(25));
}

#[tokio::test]
async fn init_resets_balance() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();
    ledger.consume_credits(7).await.unwrap();
    ledger.init_daily_credits(Some(10)).await.unwrap();
    assert_eq!(ledger.balance().await.unwrap(), Some(10));
}

#[tokio::test]
async fn uninitialized_day_refuses_consumption() {
    let ledger = ledger_on(9);
    assert!(!ledger.consume_credits(1).await.unwrap());
    assert_eq!(ledger.balance().await.unwrap(), None);
}

#[tokio::test]
async fn refund_restores_balance() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();
    assert!(ledger.consume_credits(4).await.unwrap());
    assert_eq!(ledger.refund_credits(4).await.unwrap(), 10);
}

#[tokio::test]
async fn days_have_separate_pools() {
    let day = Arc::new(AtomicU32::new(9));
    let clock = Arc::clone(&day);
    let ledger = SharedCreditLedger::in_memory(CreditConfig::new())
        .with_date_source(move || march(clock.load(Ordering::SeqCst)));

    ledger.init_daily_credits(Some(5)).await.unwrap();
    assert!(ledger.consume_credits(5).await.unwrap());
    assert_eq!(ledger.key_for_today(), "credits:2024-03-09");

    day.store(10, Ordering::SeqCst);
    assert_eq!(ledger.key_for_today(), "credits:2024-03-10");
    assert!(!ledger.consume_credits(1).await.unwrap());
    ledger.init_daily_credits(Some(5)).await.unwrap();
    assert!(ledger.consume_credits(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_overdraw() {
    let ledger = Arc::new(ledger_on(9));
    ledger.init_daily_credits(Some(100)).await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.consume_credits(3).await.unwrap() })
        })
        .collect();

    let mut granted = 0;
    for h in handles {
        if h.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 33);
    assert_eq!(ledger.balance().await.unwrap(), Some(1));
}

#[tokio::test]
async fn compare_reports_drift_until_settled() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(100)).await.unwrap();

    let audit = ledger.compare_credits_left().await.unwrap();
    assert!(audit.equal);
    assert_eq!(audit.key, "credits:2024-03-09");

    ledger.consume_credits(30).await.unwrap();
    let audit = ledger.compare_credits_left().await.unwrap();
    assert_eq!(audit.fast_value, 70);
    assert_eq!(audit.durable_value, 100);
    assert_eq!(audit.diff, -30);
    assert!(!audit.equal);

    assert_eq!(ledger.settle(30).await.unwrap(), 70);
    assert!(ledger.compare_credits_left().await.unwrap().equal);
}

#[tokio::test]
async fn compare_treats_missing_values_as_zero() {
    let ledger = ledger_on(9);
    let audit = ledger.compare_credits_left().await.unwrap();
    assert_eq!((audit.fast_value, audit.durable_value), (0, 0));
    assert!(audit.equal);
}

#[tokio::test]
async fn compare_does_not_modify_either_store() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(50)).await.unwrap();
    ledger.consume_credits(20).await.unwrap();
    ledger.compare_credits_left().await.unwrap();
    ledger.compare_credits_left().await.unwrap();
    assert_eq!(ledger.balance().await.unwrap(), Some(30));
    assert_eq!(ledger.compare_credits_left().await.unwrap().durable_value, 50);
}

#[tokio::test]
async fn settle_on_uninitialized_day_is_an_error() {
    let ledger = ledger_on(9);
    let err = ledger.settle(1).await.unwrap_err();
    assert!(matches!(err, KeywardError::CreditsNotInitialized(key) if key == "credits:2024-03-09"));
}

#[tokio::test]
async fn audit_serializes_to_json() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();
    let audit = ledger.compare_credits_left().await.unwrap();
    let json = serde_json::to_value(&audit).unwrap();
    assert_eq!(json["key"], "credits:2024-03-09");
    assert_eq!(json["diff"], 0);
    assert_eq!(json["equal"], true);
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn reservation_commit_keeps_debit() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();

    let reservation = ledger.reserve(4).await.unwrap().unwrap();
    assert_eq!(reservation.amount(), 4);
    assert_eq!(reservation.key(), "credits:2024-03-09");
    assert_eq!(reservation.commit(), 4);
    settle_background().await;
    assert_eq!(ledger.balance().await.unwrap(), Some(6));
}

#[tokio::test]
async fn reservation_refund_returns_credits_once() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();

    let reservation = ledger.reserve(4).await.unwrap().unwrap();
    assert_eq!(reservation.refund().await.unwrap(), 10);
    settle_background().await;
    assert_eq!(ledger.balance().await.unwrap(), Some(10));
}

#[tokio::test]
async fn dropped_reservation_refunds_itself() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(10)).await.unwrap();

    let reservation = ledger.reserve(4).await.unwrap();
    assert_eq!(ledger.balance().await.unwrap(), Some(6));
    drop(reservation);
    settle_background().await;
    assert_eq!(ledger.balance().await.unwrap(), Some(10));
}

#[tokio::test]
async fn insufficient_balance_yields_no_reservation() {
    let ledger = ledger_on(9);
    ledger.init_daily_credits(Some(3)).await.unwrap();
    assert!(ledger.reserve(4).await.unwrap().is_none());
    assert_eq!(ledger.balance().await.unwrap(), Some(3));
}

#[tokio::test]
async fn reservation_refunds_to_the_day_it_was_taken_from() {
    let day = Arc::new(AtomicU32::new(9));
    let clock = Arc::clone(&day);
    let ledger = SharedCreditLedger::in_memory(CreditConfig::new())
        .with_date_source(move || march(clock.load(Ordering::SeqCst)));
    ledger.init_daily_credits(Some(10)).await.unwrap();

    let reservation = ledger.reserve(4).await.unwrap().unwrap();
    day.store(10, Ordering::SeqCst);
    ledger.init_daily_credits(Some(10)).await.unwrap();

    reservation.refund().await.unwrap();
    assert_eq!(ledger.balance().await.unwrap(), Some(10));
    day.store(9, Ordering::SeqCst);
    assert_eq!(ledger.balance().await.unwrap(), Some(10));
}

// ============================================================================
// Stores
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fast_counter_key_expires_after_configured_ttl() {
    let counter = Arc::new(InMemoryCounterStore::new());
    let ledger = SharedCreditLedger::new(
        counter.clone(),
        Arc::new(InMemoryLedgerStore::new()),
        CreditConfig::new().key_ttl(Duration::from_secs(3600)),
    )
    .with_date_source(|| march(9));
    ledger.init_daily_credits(Some(10)).await.unwrap();
    assert!(ledger.consume_credits(1).await.unwrap());
    assert_eq!(
        counter.remaining_ttl("credits:2024-03-09"),
        Some(Duration::from_secs(3600))
    );

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(ledger.balance().await.unwrap(), None);
}

#[tokio::test]
async fn json_file_ledger_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");

    let ledger = SharedCreditLedger::new(
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(JsonFileLedgerStore::new(&path)),
        CreditConfig::new(),
    )
    .with_date_source(|| march(9));
    ledger.init_daily_credits(Some(40)).await.unwrap();
    ledger.consume_credits(15).await.unwrap();
    ledger.settle(15).await.unwrap();

    let reopened = JsonFileLedgerStore::new(&path);
    assert_eq!(reopened.read("credits:2024-03-09").await.unwrap(), Some(25));
    assert!(ledger.compare_credits_left().await.unwrap().equal);
}

struct FailingCounter;

#[async_trait]
impl CounterStore for FailingCounter {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<i64>> {
        Err(unavailable())
    }

    async fn set(&self, _key: &str, _value: i64, _ttl: Option<Duration>) -> Result<()> {
        Err(unavailable())
    }

    async fn incr_by(&self, _key: &str, _amount: i64) -> Result<i64> {
        Err(unavailable())
    }

    async fn decr_by_if_sufficient(&self, _key: &str, _amount: i64) -> Result<Option<i64>> {
        Err(unavailable())
    }
}

fn unavailable() -> KeywardError {
    KeywardError::Store {
        store: "failing".into(),
        message: "connection refused".into(),
    }
}

#[tokio::test]
async fn counter_failures_are_errors_not_rejections() {
    let ledger = SharedCreditLedger::new(
        Arc::new(FailingCounter),
        Arc::new(InMemoryLedgerStore::new()),
        CreditConfig::new(),
    );
    assert!(matches!(
        ledger.consume_credits(1).await,
        Err(KeywardError::Store { .. })
    ));
    assert!(ledger.reserve(1).await.is_err());
    assert!(ledger.compare_credits_left().await.is_err());
}
