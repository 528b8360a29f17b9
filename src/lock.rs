//! Per-key asynchronous mutual exclusion.
//!
//! [`KeyedMutex`] runs async operations one at a time per key, in the order
//! they were admitted, while operations on different keys proceed
//! independently.
//!
//! # Lock table
//!
//! The table maps a key to the FIFO queue of operations waiting behind the
//! one currently running. A key is present iff an operation is running or
//! queued for it; the last operation out removes the entry, so inactive
//! keys never accumulate.
//!
//! # Release
//!
//! Each admitted operation owns a ticket whose `Drop` hands the lock to the
//! next live waiter. Success, `Err` returns, panics and dropped futures all
//! go through the same path, so a failing operation never wedges its key.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::telemetry;

#[derive(Default)]
struct KeyQueue {
    waiters: VecDeque<oneshot::Sender<()>>,
}

type LockTable = HashMap<String, KeyQueue>;

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand the key to the next waiter still listening, or drop the key.
fn release(table: &mut LockTable, key: &str) {
    let Some(queue) = table.get_mut(key) else {
        return;
    };
    while let Some(waiter) = queue.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            trace!(key, "lock handed to next waiter");
            return;
        }
    }
    table.remove(key);
    trace!(key, "lock released, key removed");
}

enum TicketState {
    Waiting(oneshot::Receiver<()>),
    Held,
    Released,
}

/// One admitted operation's claim on a key.
struct Ticket {
    table: Arc<Mutex<LockTable>>,
    key: String,
    state: TicketState,
}

impl Ticket {
    async fn acquire(&mut self) {
        if let TicketState::Waiting(rx) = &mut self.state {
            // The sender is only dropped after a successful send or when the
            // whole table goes away, so either way the key is ours now.
            let _ = rx.await;
            self.state = TicketState::Held;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let state = mem::replace(&mut self.state, TicketState::Released);
        let mut table = lock_table(&self.table);
        match state {
            TicketState::Held => release(&mut table, &self.key),
            TicketState::Waiting(mut rx) => {
                // Granted while we were being dropped: pass it on. Otherwise
                // closing the receiver under the table lock makes the
                // releaser skip this slot.
                if rx.try_recv().is_ok() {
                    release(&mut table, &self.key);
                }
                drop(rx);
            }
            TicketState::Released => {}
        }
    }
}

/// Serializes async operations per key.
///
/// Cloning is cheap and clones share the same lock table.
///
/// ```rust
/// # use keyward::KeyedMutex;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let locks = KeyedMutex::new();
/// let value = locks.with_lock("user:42", || async { 7 }).await;
/// assert_eq!(value, 7);
/// assert_eq!(locks.active_keys(), 0);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct KeyedMutex {
    table: Arc<Mutex<LockTable>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn admit(&self, key: &str) -> Ticket {
        let mut table = lock_table(&self.table);
        let state = match table.get_mut(key) {
            Some(queue) => {
                let (tx, rx) = oneshot::channel();
                queue.waiters.push_back(tx);
                TicketState::Waiting(rx)
            }
            None => {
                table.insert(key.to_string(), KeyQueue::default());
                TicketState::Held
            }
        };
        Ticket {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            state,
        }
    }

    /// Run `operation` with exclusive access to `key`.
    ///
    /// The operation is admitted when this method is called, not when the
    /// returned future is first polled, so calls made in sequence run in
    /// that sequence even if their futures are polled in another order.
    /// Its output, including any `Err`, is returned unchanged.
    pub fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        operation: F,
    ) -> impl Future<Output = T> + use<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut ticket = self.admit(key);
        async move {
            let started = Instant::now();
            ticket.acquire().await;
            metrics::histogram!(telemetry::LOCK_WAIT_SECONDS)
                .record(started.elapsed().as_secs_f64());
            let output = operation().await;
            drop(ticket);
            output
        }
    }

    /// Whether an operation is running or queued for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        lock_table(&self.table).contains_key(key)
    }

    /// Number of operations waiting behind the running one for `key`.
    pub fn queued(&self, key: &str) -> usize {
        lock_table(&self.table)
            .get(key)
            .map_or(0, |queue| queue.waiters.len())
    }

    /// Number of keys with a running or queued operation.
    pub fn active_keys(&self) -> usize {
        lock_table(&self.table).len()
    }
}
