// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// The mutex is never held while user code runs, so it cannot be poisoned by
/// a panicking task. Poisoning therefore indicates a bug in this crate, and
/// the methods below panic in that case.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Atomically releases the given guard and blocks until notified, then
    /// re-locks the status. Spurious wake-ups are possible, so callers must
    /// re-check their condition.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.condvar.wait(guard).unwrap()
    }

    /// Modifies the status and notifies one waiting thread.
    pub fn update_and_notify_one<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_one();
        result
    }

    /// Modifies the status and notifies all waiting threads.
    pub fn update_and_notify_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_all();
        result
    }

    /// Notifies one waiting thread without modifying the status.
    ///
    /// The mutex is acquired and released before notifying, so that a thread
    /// that checked its condition under the lock and is about to wait can't
    /// miss this notification.
    pub fn notify_one(&self) {
        drop(self.lock());
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn status_update_and_read() {
        let status = Status::new(1);
        assert_eq!(status.update_and_notify_one(|x| std::mem::replace(x, 2)), 1);
        assert_eq!(*status.lock(), 2);
        status.update_and_notify_all(|x| *x += 40);
        assert_eq!(*status.lock(), 42);
    }

    #[test]
    fn status_wakes_waiters() {
        const NUM_THREADS: usize = 4;

        let status = Status::new(false);
        let barrier = Barrier::new(NUM_THREADS + 1);
        std::thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                s.spawn(|| {
                    barrier.wait();
                    let mut guard = status.lock();
                    while !*guard {
                        guard = status.wait(guard);
                    }
                });
            }
            barrier.wait();
            status.update_and_notify_all(|ready| *ready = true);
        });
        assert!(*status.lock());
    }
}
