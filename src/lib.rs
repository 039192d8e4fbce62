// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod core;
mod macros;
mod stack;

pub use crate::core::{
    CpuPinningPolicy, LocalQueue, PoolHandle, Stealer, ThreadCount, ThreadPool,
    ThreadPoolBuilder,
};
pub use stack::{LockFreeStack, Stack};

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::ThreadId;
    use std::time::Duration;

    const NUM_TASKS: u64 = if cfg!(miri) { 100 } else { 1000 };

    fn pool_with_threads(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
            local_queue_capacity: 16,
        }
        .build()
    }

    #[test]
    fn test_increment_tasks() {
        let thread_pool = pool_with_threads(4);
        let handle = thread_pool.handle();
        let accumulator = Arc::new(AtomicU64::new(0));
        for _ in 0..NUM_TASKS {
            let accumulator = accumulator.clone();
            thread_pool.submit(move || {
                accumulator.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(thread_pool);

        assert_eq!(accumulator.load(Ordering::SeqCst), NUM_TASKS);
        assert_eq!(handle.tasks_processed_count(), NUM_TASKS);
        assert_eq!(handle.tasks_panicked_count(), 0);
    }

    #[test]
    fn test_processed_count_is_monotonic() {
        let thread_pool = pool_with_threads(4);
        for _ in 0..NUM_TASKS {
            thread_pool.submit(|| ());
        }
        let mut last = 0;
        while last < NUM_TASKS {
            let count = thread_pool.tasks_processed_count();
            assert!(count >= last);
            assert!(count <= NUM_TASKS);
            last = count;
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_idle_workers_wake_up() {
        let thread_pool = pool_with_threads(4);
        // Let all the workers go to sleep.
        std::thread::sleep(Duration::from_millis(50));

        let (sender, receiver) = mpsc::channel();
        thread_pool.submit(move || sender.send(42).unwrap());
        assert_eq!(receiver.recv_timeout(Duration::from_secs(10)), Ok(42));

        // Same after another idle period.
        std::thread::sleep(Duration::from_millis(50));
        let (sender, receiver) = mpsc::channel();
        let handle = thread_pool.handle();
        thread_pool.submit(move || {
            // Submitted from a worker: goes to its local queue.
            handle.submit(move || sender.send(43).unwrap());
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(10)), Ok(43));
    }

    #[test]
    fn test_concurrent_external_submitters() {
        const NUM_SUBMITTERS: usize = 4;

        let thread_pool = pool_with_threads(4);
        let handle = thread_pool.handle();
        let accumulator = Arc::new(AtomicU64::new(0));
        std::thread::scope(|s| {
            for _ in 0..NUM_SUBMITTERS {
                s.spawn(|| {
                    for i in 0..NUM_TASKS {
                        let accumulator = accumulator.clone();
                        thread_pool.submit(move || {
                            accumulator.fetch_add(i, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        drop(thread_pool);

        let expected = NUM_SUBMITTERS as u64 * NUM_TASKS * (NUM_TASKS - 1) / 2;
        assert_eq!(accumulator.load(Ordering::SeqCst), expected);
        assert_eq!(
            handle.tasks_processed_count(),
            NUM_SUBMITTERS as u64 * NUM_TASKS
        );
    }

    #[test]
    fn test_recursive_submission_runs_each_task_once() {
        const FANOUT: usize = 4;
        const DEPTH: u32 = if cfg!(miri) { 3 } else { 5 };
        // Number of nodes in a complete tree of the given fanout and depth.
        let num_nodes = (FANOUT.pow(DEPTH + 1) - 1) / (FANOUT - 1);

        let thread_pool = pool_with_threads(4);
        let handle = thread_pool.handle();
        let visited: Arc<Vec<AtomicBool>> =
            Arc::new((0..num_nodes).map(|_| AtomicBool::new(false)).collect());

        fn visit(handle: PoolHandle, visited: Arc<Vec<AtomicBool>>, node: usize) {
            let already_visited = visited[node].swap(true, Ordering::SeqCst);
            assert!(!already_visited, "Node {node} ran twice");
            for child in (FANOUT * node + 1)..=(FANOUT * node + FANOUT) {
                if child < visited.len() {
                    let handle_clone = handle.clone();
                    let visited = visited.clone();
                    handle.submit(move || visit(handle_clone, visited, child));
                }
            }
        }

        {
            let handle = handle.clone();
            let visited = visited.clone();
            thread_pool.submit(move || visit(handle, visited, 0));
        }
        drop(thread_pool);

        assert!(visited.iter().all(|v| v.load(Ordering::SeqCst)));
        assert_eq!(handle.tasks_processed_count(), num_nodes as u64);
        assert_eq!(handle.tasks_panicked_count(), 0);
    }

    #[test]
    fn test_panicking_tasks_dont_kill_workers() {
        let thread_pool = pool_with_threads(2);
        let handle = thread_pool.handle();
        let accumulator = Arc::new(AtomicU64::new(0));
        for i in 0..NUM_TASKS {
            let accumulator = accumulator.clone();
            thread_pool.submit(move || {
                if i % 3 == 0 {
                    panic!("arithmetic panic");
                }
                accumulator.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(thread_pool);

        let num_panics = NUM_TASKS.div_ceil(3);
        assert_eq!(handle.tasks_processed_count(), NUM_TASKS);
        assert_eq!(handle.tasks_panicked_count(), num_panics);
        assert_eq!(accumulator.load(Ordering::SeqCst), NUM_TASKS - num_panics);
    }

    #[test]
    fn test_drop_runs_pending_tasks() {
        let thread_pool = pool_with_threads(1);
        let handle = thread_pool.handle();
        let accumulator = Arc::new(AtomicU64::new(0));

        // Block the only worker until all the tasks are submitted.
        let (sender, receiver) = mpsc::channel::<()>();
        thread_pool.submit(move || receiver.recv().unwrap());
        for _ in 0..NUM_TASKS {
            let accumulator = accumulator.clone();
            thread_pool.submit(move || {
                accumulator.fetch_add(1, Ordering::SeqCst);
            });
        }
        sender.send(()).unwrap();
        drop(thread_pool);

        assert_eq!(accumulator.load(Ordering::SeqCst), NUM_TASKS);
        assert_eq!(handle.tasks_processed_count(), NUM_TASKS + 1);
    }

    #[test]
    fn test_submit_after_drop_is_dropped() {
        let thread_pool = pool_with_threads(2);
        let handle = thread_pool.handle();
        drop(thread_pool);

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            handle.submit(move || ran.store(true, Ordering::SeqCst));
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(handle.tasks_processed_count(), 0);
    }

    #[cfg(not(miri))]
    #[test]
    fn test_idle_workers_steal_from_busy_worker() {
        const NUM_CHILDREN: usize = 200;

        let thread_pool = pool_with_threads(4);
        let handle = thread_pool.handle();
        let threads: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));

        {
            let handle = handle.clone();
            let threads = threads.clone();
            // A single task floods its worker's local queue.
            thread_pool.submit(move || {
                for _ in 0..NUM_CHILDREN {
                    let threads = threads.clone();
                    handle.submit(move || {
                        threads
                            .lock()
                            .unwrap()
                            .insert(std::thread::current().id());
                        std::thread::sleep(Duration::from_millis(1));
                    });
                }
            });
        }
        drop(thread_pool);

        assert_eq!(handle.tasks_processed_count(), NUM_CHILDREN as u64 + 1);
        assert!(threads.lock().unwrap().len() > 1);
    }

    #[test]
    fn test_stack_shared_with_pool() {
        let thread_pool = pool_with_threads(4);
        let stack = Arc::new(LockFreeStack::new());
        for i in 0..NUM_TASKS {
            let stack = stack.clone();
            thread_pool.submit(move || stack.push(i));
        }
        drop(thread_pool);

        assert_eq!(stack.count(), NUM_TASKS as usize);
        let mut values = std::iter::from_fn(|| stack.try_pop()).collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, (0..NUM_TASKS).collect::<Vec<_>>());
        assert_eq!(stack.count(), 0);
    }
}
