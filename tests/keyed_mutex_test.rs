//! Tests for [`KeyedMutex`]: per-key FIFO exclusion, cross-key
//! independence, release on failure, and lock table cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use keyward::{KeyedMutex, KeywardError, Result};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn completion_order_matches_admission_order() {
    for _ in 0..10 {
        let locks = KeyedMutex::new();
        let completed = Arc::new(Mutex::new(Vec::new()));

        let mut ids: Vec<usize> = (0..20).collect();
        fastrand::shuffle(&mut ids);

        let mut handles = Vec::new();
        for &id in &ids {
            let completed = Arc::clone(&completed);
            let delay = Duration::from_millis(fastrand::u64(0..50));
            let fut = locks.with_lock("same-key", move || async move {
                tokio::time::sleep(delay).await;
                completed.lock().unwrap().push(id);
            });
            handles.push(tokio::spawn(fut));
        }
        // let the spawned tasks start in whatever order the scheduler picks
        fastrand::shuffle(&mut handles);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*completed.lock().unwrap(), ids);
        assert_eq!(locks.active_keys(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_operations_never_overlap() {
    let locks = KeyedMutex::new();
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..32)
        .map(|_| {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            tokio::spawn(locks.with_lock("k", move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..3))).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }))
        })
        .collect();
    for r in join_all(futures).await {
        r.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn different_keys_run_concurrently() {
    let locks = KeyedMutex::new();
    let started = Instant::now();

    let windows = join_all(["a", "b"].into_iter().map(|key| {
        locks.with_lock(key, || async {
            let begin = Instant::now();
            tokio::time::sleep(Duration::from_secs(1)).await;
            (begin, Instant::now())
        })
    }))
    .await;

    let (a_begin, a_end) = windows[0];
    let (b_begin, b_end) = windows[1];
    // in-flight windows overlap
    assert!(a_begin < b_end && b_begin < a_end);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn failing_operation_releases_key() {
    let locks = KeyedMutex::new();

    let failing = locks.with_lock("k", || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<(), _>(KeywardError::Resolve {
            file_id: "f1".into(),
            message: "boom".into(),
        })
    });
    let next = locks.with_lock("k", || async { Ok::<_, KeywardError>(5) });

    let (first, second): (Result<()>, Result<i32>) = tokio::join!(failing, next);
    assert!(matches!(first, Err(KeywardError::Resolve { .. })));
    assert_eq!(second.unwrap(), 5);
    assert!(!locks.is_locked("k"));
}

#[tokio::test]
async fn panicking_operation_releases_key() {
    let locks = KeyedMutex::new();

    let panicked = tokio::spawn(locks.with_lock("k", || async {
        panic!("operation blew up");
    }))
    .await;
    assert!(panicked.is_err());

    let value = locks.with_lock("k", || async { 1 }).await;
    assert_eq!(value, 1);
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_holder_hands_lock_to_next_waiter() {
    let locks = KeyedMutex::new();

    let holder = tokio::spawn(locks.with_lock("k", || async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }));
    let waiter = tokio::spawn(locks.with_lock("k", || async { "ran" }));
    tokio::task::yield_now().await;
    assert_eq!(locks.queued("k"), 1);

    holder.abort();
    assert_eq!(waiter.await.unwrap(), "ran");
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test]
async fn lock_table_does_not_grow_with_inactive_keys() {
    let locks = KeyedMutex::new();
    let futures: Vec<_> = (0..1_000)
        .map(|i| locks.with_lock(&format!("user:{i}"), || async {}))
        .collect();
    assert_eq!(locks.active_keys(), 1_000);

    join_all(futures).await;
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn clones_share_the_lock_table() {
    let locks = KeyedMutex::new();
    let other = locks.clone();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o1 = Arc::clone(&order);
    let first = locks.with_lock("k", move || async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        o1.lock().unwrap().push(1);
    });
    let o2 = Arc::clone(&order);
    let second = other.with_lock("k", move || async move {
        o2.lock().unwrap().push(2);
    });
    tokio::join!(second, first);

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}
