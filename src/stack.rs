// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A lock-free LIFO stack.

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::{Backoff, CachePadded};
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;

/// A concurrent last-in-first-out container.
///
/// All methods take `&self`, so a stack can be shared between threads (for
/// example behind an [`Arc`](std::sync::Arc)) and used concurrently.
pub trait Stack<T> {
    /// Pushes an item on top of the stack. This always succeeds.
    fn push(&self, item: T);

    /// Pops the item on top of the stack, i.e. the most recently pushed item
    /// that hasn't been popped yet. Returns [`None`] if the stack is empty.
    fn try_pop(&self) -> Option<T>;

    /// Returns the number of items currently in the stack.
    fn count(&self) -> usize;
}

/// A lock-free stack, also known as a Treiber stack.
///
/// Pushing and popping only use compare-and-exchange operations on the head
/// pointer: no thread ever blocks another one, and under contention at least
/// one of the competing threads makes progress. Popped nodes are reclaimed
/// with epoch-based garbage collection, which prevents the ABA problem.
///
/// The number of items is recorded in each node at push time, so that
/// [`count()`](Stack::count) reads it atomically together with the head
/// pointer. The result is therefore exact at the point where the head was
/// loaded, not an approximation.
///
/// ```
/// # use spindle::{LockFreeStack, Stack};
/// let stack = LockFreeStack::new();
/// stack.push('A');
/// stack.push('B');
/// stack.push('C');
/// assert_eq!(stack.count(), 3);
///
/// assert_eq!(stack.try_pop(), Some('C'));
/// assert_eq!(stack.try_pop(), Some('B'));
/// assert_eq!(stack.try_pop(), Some('A'));
/// assert_eq!(stack.try_pop(), None);
/// assert_eq!(stack.count(), 0);
/// ```
pub struct LockFreeStack<T> {
    head: CachePadded<Atomic<Node<T>>>,
}

struct Node<T> {
    /// Moved out by the thread that successfully pops this node.
    value: ManuallyDrop<T>,
    /// Number of items in the stack when this node is the head.
    len: usize,
    next: Atomic<Node<T>>,
}

// SAFETY: Values are moved into the stack by `push()` and out of it by
// `try_pop()`, and a value is never accessed by reference from two threads.
// Sending the stack or sharing it between threads therefore only requires the
// values to be sendable.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
// SAFETY: See the `Send` implementation.
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Returns whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard).is_null()
    }

    fn push_item(&self, item: T) {
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(item),
            len: 1,
            next: Atomic::null(),
        });

        let guard = &epoch::pin();
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: The head is protected by the guard, so it isn't reclaimed
            // even if another thread pops it concurrently.
            node.len = unsafe { head.as_ref() }.map_or(0, |head| head.len) + 1;
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Acquire, guard)
            {
                Ok(_) => return,
                Err(e) => {
                    // Retry against the head that made the exchange fail.
                    head = e.current;
                    node = e.new;
                    backoff.spin();
                }
            }
        }
    }

    fn pop_item(&self) -> Option<T> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: The head is protected by the guard.
            let head_ref = unsafe { head.as_ref() }?;
            let next = head_ref.next.load(Ordering::Relaxed, guard);

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                // SAFETY:
                // - Only the thread that unlinked the node reads its value, and only once.
                // - The node is destroyed after all threads pinned at this point unpin.
                //   Destroying it doesn't drop the value because it's a `ManuallyDrop`.
                unsafe {
                    let value = std::ptr::read(&head_ref.value);
                    guard.defer_destroy(head);
                    return Some(ManuallyDrop::into_inner(value));
                }
            }
            backoff.spin();
        }
    }

    fn len(&self) -> usize {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: The head is protected by the guard.
        unsafe { head.as_ref() }.map_or(0, |head| head.len)
    }
}

impl<T> Stack<T> for LockFreeStack<T> {
    fn push(&self, item: T) {
        self.push_item(item)
    }

    fn try_pop(&self) -> Option<T> {
        self.pop_item()
    }

    fn count(&self) -> usize {
        self.len()
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for LockFreeStack<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push_item(item);
        }
    }
}

impl<T> FromIterator<T> for LockFreeStack<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("count", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        // SAFETY: We have exclusive access to the stack, so no other thread can
        // observe the nodes anymore.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let mut node = current.into_owned();
                current = node.next.load(Ordering::Relaxed, guard);
                ManuallyDrop::drop(&mut node.value);
            }
        }
    }
}
