// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared overflow queue, where idle worker threads wait for work.

use super::util::Status;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Outcome of [`SharedQueue::pop_or_wait()`].
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeue<T> {
    /// An item was dequeued.
    Item(T),
    /// The queue is empty but some other queue has work to steal.
    Steal,
    /// The queue is empty, nothing is left to steal and the queue is stopping.
    Stopped,
}

/// Items and stop flag, guarded by the mutex.
struct QueueState<T> {
    items: VecDeque<T>,
    stopping: bool,
}

/// A FIFO queue guarded by a mutex, paired with a condition variable on which
/// idle consumers wait.
pub struct SharedQueue<T> {
    state: Status<QueueState<T>>,
    /// Number of consumers blocked in [`pop_or_wait()`](Self::pop_or_wait).
    num_sleeping: CachePadded<AtomicUsize>,
}

impl<T> SharedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Status::new(QueueState {
                items: VecDeque::new(),
                stopping: false,
            }),
            num_sleeping: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueues an item and wakes up one waiting consumer.
    pub fn push(&self, item: T) {
        self.state
            .update_and_notify_one(|state| state.items.push_back(item));
    }

    /// Wakes up one waiting consumer, if any, so that it re-checks for work.
    ///
    /// This is meant to be called after publishing work elsewhere (e.g. in a
    /// work-stealing queue), such that the `has_other_work` predicate passed
    /// to [`pop_or_wait()`](Self::pop_or_wait) now returns true.
    pub fn wake_one(&self) {
        // Pairs with the fence in `pop_or_wait()`: either the consumer sees the
        // published work, or we see that it is about to sleep.
        fence(Ordering::SeqCst);
        if self.num_sleeping.load(Ordering::Relaxed) != 0 {
            self.state.notify_one();
        }
    }

    /// Dequeues an item. If the queue is empty, either returns
    /// [`Dequeue::Steal`] when `has_other_work` returns true, or
    /// [`Dequeue::Stopped`] if [`stop()`](Self::stop) was called, or blocks
    /// until one of these conditions changes.
    pub fn pop_or_wait(&self, mut has_other_work: impl FnMut() -> bool) -> Dequeue<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Dequeue::Item(item);
            }

            self.num_sleeping.fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);

            let outcome = if has_other_work() {
                Some(Dequeue::Steal)
            } else if state.stopping {
                Some(Dequeue::Stopped)
            } else {
                None
            };
            if outcome.is_none() {
                state = self.state.wait(state);
            }

            self.num_sleeping.fetch_sub(1, Ordering::Relaxed);
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Marks the queue as stopping and wakes up all the waiting consumers.
    ///
    /// Items can still be pushed and dequeued afterwards, but consumers that
    /// find nothing to do get [`Dequeue::Stopped`] instead of blocking.
    pub fn stop(&self) {
        self.state
            .update_and_notify_all(|state| state.stopping = true);
    }

    /// Removes all the remaining items.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Returns the number of consumers currently blocked waiting for work.
    #[cfg(test)]
    fn num_sleeping(&self) -> usize {
        self.num_sleeping.load(Ordering::SeqCst)
    }
}
