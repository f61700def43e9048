//! Counting semaphore with wake-one signaling.
//!
//! `acquire` suspends the task until the holder count is below the maximum;
//! `release` decrements and wakes exactly one waiter. Over-release is a
//! programming error and panics rather than being papered over.

use std::sync::Mutex;

use tokio::sync::Notify;

/// A counting semaphore tracking how many holders are active.
///
/// Invariant: `0 <= value <= max` at every observable moment. The counter is
/// protected by the semaphore's own lock; waiters park on a `Notify` and
/// re-check the predicate on every wakeup, so a stolen or spurious wakeup can
/// never push `value` past `max`.
pub struct Semaphore {
    max: u32,
    value: Mutex<u32>,
    wait: Notify,
}

impl Semaphore {
    pub fn new(max: u32) -> Self {
        Semaphore {
            max,
            value: Mutex::new(0),
            wait: Notify::new(),
        }
    }

    /// Maximum number of concurrent holders.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Current holder count.
    pub fn value(&self) -> u32 {
        *self.value.lock().unwrap()
    }

    /// Waits until the holder count is below `max`, increments it, and
    /// returns the new count.
    ///
    /// Fairness is wake-one only; under sustained contention an unlucky
    /// waiter may starve.
    pub async fn acquire(&self) -> u32 {
        loop {
            // The notified future must be created before the counter check:
            // a release between the check and the await would otherwise be
            // lost and the waiter would park forever.
            let notified = self.wait.notified();
            {
                let mut value = self.value.lock().unwrap();
                if *value < self.max {
                    *value += 1;
                    return *value;
                }
            }
            notified.await;
        }
    }

    /// Decrements the holder count and wakes one waiter.
    ///
    /// # Panics
    ///
    /// Panics if called when the count is already zero: a release without a
    /// matching acquire is a logic bug in the caller, not a runtime condition.
    pub fn release(&self) -> u32 {
        let mut value = self.value.lock().unwrap();
        if *value == 0 {
            panic!("Semaphore release without acquire");
        }
        *value -= 1;
        self.wait.notify_one();
        *value
    }
}
