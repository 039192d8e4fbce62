// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Work-stealing double-ended queue, following the Chase-Lev algorithm with
//! the memory orderings of Lê et al., "Correct and Efficient Work-Stealing for
//! Weak Memory Models" (PPoPP 2013).

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

/// Minimum capacity of a queue buffer.
const MIN_CAPACITY: usize = 16;

/// Circular buffer of item slots. Each slot points to a boxed item, so that a
/// thief can speculatively read a slot that the owner concurrently rewrites
/// without causing a data race.
struct Buffer<T> {
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot at the given logical index.
    fn at(&self, index: isize) -> &AtomicPtr<T> {
        &self.slots[index as usize & (self.slots.len() - 1)]
    }
}

/// State shared between the owner and the thieves of a queue.
struct Inner<T> {
    /// Index of the next item to steal.
    top: CachePadded<AtomicIsize>,
    /// Index one past the last item pushed by the owner.
    bottom: CachePadded<AtomicIsize>,
    /// Current buffer. Only the owner replaces it.
    buffer: CachePadded<Atomic<Buffer<T>>>,
    _items: PhantomData<Box<T>>,
}

// SAFETY: Items are moved in by the owner and moved out by exactly one of the
// owner or a thief (as arbitrated by the compare-exchange on `top`). Items are
// never accessed by reference from several threads, so sharing the queue only
// requires the items to be sendable.
unsafe impl<T: Send> Send for Inner<T> {}
// SAFETY: See the `Send` implementation.
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        let top = self.top.load(Ordering::Acquire);
        let bottom = self.bottom.load(Ordering::Acquire);
        // The owner transiently decrements `bottom` below `top` when popping from an
        // empty queue.
        bottom.saturating_sub(top).max(0) as usize
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        let bottom = *self.bottom.get_mut();
        // SAFETY: We have exclusive access to the queue. Slots in `top..bottom`
        // contain items that were neither popped nor stolen.
        unsafe {
            let guard = epoch::unprotected();
            let buffer = self.buffer.load(Ordering::Relaxed, guard);
            for index in top..bottom {
                let item = buffer.deref().at(index).load(Ordering::Relaxed);
                drop(Box::from_raw(item));
            }
            drop(buffer.into_owned());
        }
    }
}

/// The owner side of a work-stealing queue.
///
/// The owner pushes and pops items at the bottom of the queue, in LIFO order.
/// Other threads steal items from the top of the queue, in FIFO order, via
/// [`Stealer`]s obtained from [`stealer()`](Self::stealer).
///
/// This type is [`Send`] but not [`Sync`]: only one thread at a time can
/// act as the owner.
pub struct LocalQueue<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// A handle to steal items from the top of a [`LocalQueue`].
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> LocalQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Creates an empty queue whose initial buffer holds at least `capacity`
    /// items. The buffer grows whenever it is full.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicIsize::new(0)),
                bottom: CachePadded::new(AtomicIsize::new(0)),
                buffer: CachePadded::new(Atomic::new(Buffer::new(capacity))),
                _items: PhantomData,
            }),
            _not_sync: PhantomData,
        }
    }

    /// Returns a new handle to steal from this queue.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Returns whether the queue is empty. This is only a snapshot.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the number of items in the queue. This is only a snapshot.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Loads the current buffer.
    ///
    /// Only the owner replaces the buffer, so the owner doesn't need to be
    /// pinned to read it.
    fn buffer(&self) -> Shared<'_, Buffer<T>> {
        // SAFETY: The buffer is only retired by `grow()`, which is only called by the
        // owner (i.e. not concurrently with this function).
        unsafe {
            self.inner
                .buffer
                .load(Ordering::Relaxed, epoch::unprotected())
        }
    }

    /// Pushes an item at the bottom of the queue.
    pub fn local_push(&self, item: T) {
        let bottom = self.inner.bottom.load(Ordering::Relaxed);
        let top = self.inner.top.load(Ordering::Acquire);

        let mut buffer = self.buffer();
        // SAFETY: The buffer is valid as long as the owner doesn't retire it.
        let capacity = unsafe { buffer.deref() }.capacity();
        if bottom - top >= capacity as isize {
            self.grow(top, bottom, capacity * 2);
            buffer = self.buffer();
        }

        let item = Box::into_raw(Box::new(item));
        // SAFETY: See above.
        unsafe { buffer.deref() }
            .at(bottom)
            .store(item, Ordering::Relaxed);

        // Publish the item to thieves.
        fence(Ordering::Release);
        self.inner.bottom.store(bottom + 1, Ordering::Relaxed);
    }

    /// Pops the item at the bottom of the queue, i.e. the most recently pushed
    /// item. Returns [`None`] if the queue is empty or if a thief concurrently
    /// stole the last item.
    pub fn local_pop(&self) -> Option<T> {
        let bottom = self.inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer();
        self.inner.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.inner.top.load(Ordering::Relaxed);

        if top > bottom {
            // Empty queue.
            self.inner.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: The buffer is valid as long as the owner doesn't retire it.
        let item = unsafe { buffer.deref() }.at(bottom).load(Ordering::Relaxed);
        if top == bottom {
            // Last item: race against thieves for it.
            let won = self
                .inner
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.inner.bottom.store(bottom + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }

        // SAFETY: This slot was filled by `local_push()`, and we are the only one to
        // claim it: either thieves can't reach it (`top < bottom`), or we won the race
        // on `top`.
        Some(*unsafe { Box::from_raw(item) })
    }

    /// Replaces the buffer by a buffer of the given capacity, containing the
    /// same items.
    #[cold]
    fn grow(&self, top: isize, bottom: isize, capacity: usize) {
        let guard = &epoch::pin();
        let old = self.inner.buffer.load(Ordering::Relaxed, guard);
        let new = Buffer::new(capacity);
        for index in top..bottom {
            // SAFETY: The old buffer is still valid, we are the owner.
            let item = unsafe { old.deref() }.at(index).load(Ordering::Relaxed);
            new.at(index).store(item, Ordering::Relaxed);
        }

        let new = Owned::new(new).into_shared(guard);
        self.inner.buffer.store(new, Ordering::Release);
        // SAFETY: Thieves that loaded the old buffer are pinned, so it is destroyed only
        // once they are done with it. Destroying a buffer doesn't touch the items.
        unsafe {
            guard.defer_destroy(old);
        }
        guard.flush();
    }
}

impl<T> Default for LocalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stealer<T> {
    /// Returns whether the queue is empty. This is only a snapshot, useful as a
    /// hint to choose which queue to steal from.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the number of items in the queue. This is only a snapshot.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Steals the item at the top of the queue, i.e. the least recently pushed
    /// item. Returns [`None`] if the queue is empty or if another thread
    /// concurrently claimed the item.
    pub fn try_steal(&self) -> Option<T> {
        let top = self.inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.inner.bottom.load(Ordering::Acquire);
        if top >= bottom {
            return None;
        }

        let guard = &epoch::pin();
        let buffer = self.inner.buffer.load(Ordering::Acquire, guard);
        // SAFETY: The buffer is protected by the guard.
        let item = unsafe { buffer.deref() }.at(top).load(Ordering::Relaxed);

        self.inner
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .ok()?;

        // SAFETY: Winning the race on `top` gives us exclusive ownership of the item at
        // index `top`. The owner never overwrites this slot before `top` moves past it,
        // because it grows the buffer instead of wrapping around onto live items.
        Some(*unsafe { Box::from_raw(item) })
    }
}
