//! Keyed concurrency limits.
//!
//! `LimitMap` maps string keys (here: `host:port`) to reference-counted
//! semaphores so an unbounded key space cannot leak memory: an entry appears
//! on the first acquire for its key and evaporates when the last holder
//! releases. The per-key capacity travels with each acquire, so callers need
//! no host pre-configuration; the first acquire for a key wins the capacity.

mod semaphore;

pub use semaphore::Semaphore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Entry {
    sem: Arc<Semaphore>,
    // Acquires minus releases for this key. Mutated only under the map lock.
    refs: usize,
}

/// Map of refcounted semaphores keyed by string.
///
/// Lock discipline: the map lock is held only across map operations and is
/// never held across a semaphore wait. Each semaphore's counter lives under
/// its own lock.
pub struct LimitMap {
    limits: Mutex<HashMap<String, Entry>>,
    outstanding: AtomicUsize,
    all_done: Notify,
}

/// Slot held on one key of a [`LimitMap`]; releases on drop.
///
/// Dropping (rather than an explicit call) is what makes the per-host slot
/// safe under cancellation: when an outer deadline drops the future mid
/// round-trip, the slot still comes back.
pub struct LimitGuard<'a> {
    map: &'a LimitMap,
    key: String,
}

impl Drop for LimitGuard<'_> {
    fn drop(&mut self) {
        self.map.release(&self.key);
    }
}

impl LimitMap {
    pub fn new() -> Self {
        LimitMap {
            limits: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            all_done: Notify::new(),
        }
    }

    /// Acquires a slot on `key`, creating the semaphore with capacity `max`
    /// if the key is new. Suspends while the key is at capacity.
    ///
    /// The capacity of an existing entry is not changed: the first acquire
    /// for a key decides it.
    ///
    /// Cancellation-safe: a caller dropped while still waiting for the slot
    /// leaves no refcount behind.
    pub async fn acquire(&self, key: &str, max: u32) -> LimitGuard<'_> {
        let sem = {
            let mut limits = self.limits.lock().unwrap();
            let entry = limits
                .entry(key.to_string())
                .or_insert_with(|| Entry {
                    sem: Arc::new(Semaphore::new(max)),
                    refs: 0,
                });
            entry.refs += 1;
            Arc::clone(&entry.sem)
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        // Undoes the bookkeeping above if this future is dropped before the
        // semaphore admits us (e.g. an outer fetch deadline fires while we
        // queue behind the per-host cap).
        struct PendingAcquire<'a> {
            map: &'a LimitMap,
            key: &'a str,
            armed: bool,
        }
        impl Drop for PendingAcquire<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.map.abandon(self.key);
                }
            }
        }
        let mut pending = PendingAcquire {
            map: self,
            key,
            armed: true,
        };

        let count = sem.acquire().await;
        debug_assert!(count >= 1 && count <= sem.max());
        pending.armed = false;

        LimitGuard {
            map: self,
            key: key.to_string(),
        }
    }

    /// Reverses the map half of an acquire that never got its slot.
    fn abandon(&self, key: &str) {
        {
            let mut limits = self.limits.lock().unwrap();
            if let Some(entry) = limits.get_mut(key) {
                entry.refs -= 1;
                if entry.refs == 0 {
                    limits.remove(key);
                }
            }
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.all_done.notify_waiters();
        }
    }

    /// Releases a slot on `key` and wakes one waiter for that key.
    ///
    /// # Panics
    ///
    /// Panics if `key` has no live entry — a release without a matching
    /// acquire.
    fn release(&self, key: &str) {
        let sem = {
            let mut limits = self.limits.lock().unwrap();
            let entry = limits.get_mut(key).unwrap_or_else(|| {
                panic!("LimitMap: release for key {key:?} without acquire")
            });
            entry.refs -= 1;
            let sem = Arc::clone(&entry.sem);
            if entry.refs == 0 {
                limits.remove(key);
            }
            sem
        };
        sem.release();

        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.all_done.notify_waiters();
        }
    }

    /// Waits until every prior acquire has been matched by a release.
    pub async fn wait(&self) {
        loop {
            let notified = self.all_done.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of `(key count, total current holders)` for observability.
    pub fn size(&self) -> (usize, u32) {
        let limits = self.limits.lock().unwrap();
        let total = limits.values().map(|e| e.sem.value()).sum();
        (limits.len(), total)
    }
}

impl Default for LimitMap {
    fn default() -> Self {
        Self::new()
    }
}
