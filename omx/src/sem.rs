// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Counting semaphore bridging the vendor callback thread and blocking callers.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct Counter {
    count: usize,
    torn_down: bool,
}

/// A counting wait/signal primitive.
///
/// [`Semaphore::up`] is called from the component's callback thread,
/// [`Semaphore::down`] from pipeline threads waiting for an asynchronous
/// completion. A semaphore can be torn down, which wakes every waiter with
/// [`Error::Cancelled`] instead of a completion.
#[derive(Debug, Default)]
pub struct Semaphore {
    counter: Mutex<Counter>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counter> {
        // The counter is a plain integer, so a poisoned lock still holds a
        // consistent value.
        self.counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until the count is positive, then decrements it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the semaphore is, or becomes, torn down
    /// while waiting.
    pub fn down(&self) -> Result<()> {
        let mut counter = self.lock();
        loop {
            if counter.torn_down {
                return Err(Error::Cancelled);
            }
            if counter.count > 0 {
                counter.count -= 1;
                return Ok(());
            }
            counter = self
                .cond
                .wait(counter)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Increments the count and wakes one waiter.
    pub fn up(&self) {
        let mut counter = self.lock();
        counter.count += 1;
        self.cond.notify_one();
    }

    /// Forces every current and future [`Semaphore::down`] to fail with
    /// [`Error::Cancelled`].
    pub fn tear_down(&self) {
        let mut counter = self.lock();
        counter.torn_down = true;
        self.cond.notify_all();
    }

    /// Clears the count and the tear-down flag so the semaphore can be reused
    /// for a new component lifetime.
    pub fn reset(&self) {
        let mut counter = self.lock();
        counter.count = 0;
        counter.torn_down = false;
    }

    /// Current count, for diagnostics.
    pub fn count(&self) -> usize {
        self.lock().count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn up_before_down_does_not_block() {
        let sem = Semaphore::new();
        sem.up();
        sem.up();
        assert_eq!(sem.count(), 2);
        sem.down().unwrap();
        sem.down().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn down_waits_for_up_from_another_thread() {
        let sem = Arc::new(Semaphore::new());
        let signaller = {
            let sem = sem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sem.up();
            })
        };
        sem.down().unwrap();
        signaller.join().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn tear_down_wakes_all_waiters() {
        let sem = Arc::new(Semaphore::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.down())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sem.tear_down();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
        }
    }

    #[test]
    fn reset_makes_semaphore_usable_again() {
        let sem = Semaphore::new();
        sem.up();
        sem.tear_down();
        assert!(sem.down().is_err());
        sem.reset();
        sem.up();
        assert!(sem.down().is_ok());
    }
}
