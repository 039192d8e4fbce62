// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[1_000, 10_000, 100_000];

/// Baseline benchmarks using a [`Mutex`](std::sync::Mutex)-protected vector
/// as a stack.
mod mutex {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use std::sync::Mutex;

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn push_pop<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let stack = Mutex::new(Vec::new());
        let per_thread = len / NUM_THREADS;
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            std::thread::scope(|s| {
                for _ in 0..NUM_THREADS {
                    s.spawn(|| {
                        for i in 0..per_thread {
                            stack.lock().unwrap().push(black_box(i));
                        }
                        for _ in 0..per_thread {
                            black_box(stack.lock().unwrap().pop());
                        }
                    });
                }
            })
        });
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn spawn<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        let sum = AtomicU64::new(0);
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            thread_pool.scope(|s| {
                for i in 0..len as u64 {
                    let sum = &sum;
                    s.spawn(move |_| {
                        sum.fetch_add(black_box(i), Ordering::Relaxed);
                    });
                }
            })
        });
    }
}

/// Benchmarks using Spindle.
mod spindle {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use spindle::{CpuPinningPolicy, LockFreeStack, Stack, ThreadCount, ThreadPoolBuilder};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn push_pop<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let stack = LockFreeStack::new();
        let per_thread = len / NUM_THREADS;
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            std::thread::scope(|s| {
                for _ in 0..NUM_THREADS {
                    s.spawn(|| {
                        for i in 0..per_thread {
                            stack.push(black_box(i));
                        }
                        for _ in 0..per_thread {
                            black_box(stack.try_pop());
                        }
                    });
                }
            })
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn spawn<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            local_queue_capacity: 64,
        }
        .build();
        let sum = Arc::new(AtomicU64::new(0));
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            let start = thread_pool.tasks_processed_count();
            for i in 0..len as u64 {
                let sum = sum.clone();
                thread_pool.submit(move || {
                    sum.fetch_add(black_box(i), Ordering::Relaxed);
                });
            }
            while thread_pool.tasks_processed_count() - start < len as u64 {
                std::hint::spin_loop();
            }
        });
    }
}
