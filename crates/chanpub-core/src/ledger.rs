//! Idempotency ledger.
//!
//! Maps a caller-chosen key to the outcome of the first attempt made under
//! that key. While the first attempt is in flight, later claims for the same
//! key wait for its outcome instead of executing again. Committed outcomes are
//! replayed until they expire.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::watch;
use tokio::time::Instant;

pub struct IdempotencyLedger<T> {
    inner: Arc<LedgerInner<T>>,
}

impl<T> Clone for IdempotencyLedger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct LedgerInner<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

enum Entry<T> {
    InFlight(watch::Receiver<Option<T>>),
    Done { outcome: T, expires_at: Instant },
}

/// Result of claiming a key.
pub enum Claim<T> {
    /// The caller owns the attempt and must resolve the guard.
    Owner(LedgerGuard<T>),
    /// An earlier attempt already committed this outcome.
    Replay(T),
    /// Another attempt is running; await its outcome.
    InFlight(InFlightWait<T>),
}

impl<T: Clone + Send + Sync + 'static> IdempotencyLedger<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                ttl,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn claim(&self, key: &str) -> Claim<T> {
        let mut entries = self.inner.lock();
        let now = Instant::now();
        entries.retain(|_, e| !matches!(e, Entry::Done { expires_at, .. } if *expires_at <= now));

        match entries.get(key) {
            Some(Entry::Done { outcome, .. }) => Claim::Replay(outcome.clone()),
            Some(Entry::InFlight(rx)) => Claim::InFlight(InFlightWait { rx: rx.clone() }),
            None => {
                let (tx, rx) = watch::channel(None);
                entries.insert(key.to_string(), Entry::InFlight(rx));
                Claim::Owner(LedgerGuard {
                    key: key.to_string(),
                    inner: self.inner.clone(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Drop a committed outcome so the next claim starts over.
    pub fn forget(&self, key: &str) {
        let mut entries = self.inner.lock();
        if matches!(entries.get(key), Some(Entry::Done { .. })) {
            entries.remove(key);
        }
    }

    /// Committed, unexpired outcome for `key`.
    pub fn lookup(&self, key: &str) -> Option<T> {
        let entries = self.inner.lock();
        match entries.get(key) {
            Some(Entry::Done {
                outcome,
                expires_at,
            }) if *expires_at > Instant::now() => Some(outcome.clone()),
            _ => None,
        }
    }
}

impl<T> LedgerInner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        // The map stays consistent even if a holder panicked mid-call.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ownership of an in-flight attempt.
///
/// Dropping the guard without resolving it frees the key and wakes waiters
/// with no outcome.
pub struct LedgerGuard<T> {
    key: String,
    inner: Arc<LedgerInner<T>>,
    tx: Option<watch::Sender<Option<T>>>,
}

impl<T: Clone> LedgerGuard<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record the outcome for replay until the TTL elapses and wake waiters.
    pub fn commit(mut self, outcome: T) {
        let expires_at = Instant::now() + self.inner.ttl;
        self.inner.lock().insert(
            self.key.clone(),
            Entry::Done {
                outcome: outcome.clone(),
                expires_at,
            },
        );
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }

    /// Hand the outcome to current waiters but forget the key, so a later
    /// claim starts a fresh attempt.
    pub fn release(mut self, outcome: T) {
        self.inner.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<T> Drop for LedgerGuard<T> {
    fn drop(&mut self) {
        if self.tx.take().is_some() {
            let mut entries = self.inner.lock();
            if matches!(entries.get(&self.key), Some(Entry::InFlight(_))) {
                entries.remove(&self.key);
            }
        }
    }
}

pub struct InFlightWait<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> InFlightWait<T> {
    /// Outcome of the owning attempt, or `None` if it was abandoned.
    pub async fn outcome(mut self) -> Option<T> {
        loop {
            if let Some(v) = self.rx.borrow_and_update().clone() {
                return Some(v);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}
