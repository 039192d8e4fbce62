// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run scenarios of tasks on the thread pool.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use spindle::{
    CpuPinningPolicy, LockFreeStack, PoolHandle, Stack, ThreadCount, ThreadPoolBuilder,
};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let thread_pool = ThreadPoolBuilder {
        num_threads: match (cli.num_threads, cli.oversubscribe) {
            (Some(num_threads), _) => ThreadCount::Count(num_threads),
            (None, Some(factor)) => ThreadCount::Oversubscribe(factor),
            (None, None) => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_threads {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
        local_queue_capacity: cli.local_queue_capacity,
    }
    .build();
    let handle = thread_pool.handle();
    println!("Spawned {} worker threads", thread_pool.num_threads());

    let start = Instant::now();
    match cli.scenario {
        Scenario::Flat => {
            let sum = Arc::new(AtomicU64::new(0));
            for i in 0..cli.num_tasks {
                let sum = sum.clone();
                thread_pool.submit(move || {
                    sum.fetch_add(black_box(i), Ordering::Relaxed);
                });
            }
            drop(thread_pool);
            println!("sum = {}", sum.load(Ordering::Relaxed));
        }
        Scenario::Tree => {
            let leaves = Arc::new(AtomicU64::new(0));
            {
                let handle = handle.clone();
                let leaves = leaves.clone();
                let num_tasks = cli.num_tasks;
                thread_pool.submit(move || split(handle, leaves, 0, num_tasks));
            }
            drop(thread_pool);
            println!("leaves = {}", leaves.load(Ordering::Relaxed));
        }
        Scenario::Stack => {
            let stack = Arc::new(LockFreeStack::new());
            let popped = Arc::new(AtomicU64::new(0));
            let mut rng = ChaCha12Rng::seed_from_u64(42);
            for i in 0..cli.num_tasks {
                let stack = stack.clone();
                let popped = popped.clone();
                if rng.random_bool(0.5) {
                    thread_pool.submit(move || stack.push(i));
                } else {
                    thread_pool.submit(move || {
                        if stack.try_pop().is_some() {
                            popped.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            }
            drop(thread_pool);
            println!(
                "popped = {}, remaining = {}",
                popped.load(Ordering::Relaxed),
                stack.count()
            );
        }
    }

    println!(
        "Processed {} tasks ({} panicked) in {:?}",
        handle.tasks_processed_count(),
        handle.tasks_panicked_count(),
        start.elapsed()
    );
}

/// Recursively splits the range `[start, end)` in halves, submitting one task
/// per half from within the pool, until ranges contain a single item.
fn split(handle: PoolHandle, leaves: Arc<AtomicU64>, start: u64, end: u64) {
    if end - start <= 1 {
        leaves.fetch_add(end - start, Ordering::Relaxed);
        return;
    }
    let mid = start + (end - start) / 2;
    for (start, end) in [(start, mid), (mid, end)] {
        let handle_clone = handle.clone();
        let leaves = leaves.clone();
        handle.submit(move || split(handle_clone, leaves, start, end));
    }
}

/// CLI tool to run scenarios of tasks on the thread pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,
    /// Multiple of the available parallelism to spawn. Ignored if
    /// `--num-threads` is set.
    #[arg(long)]
    oversubscribe: Option<NonZeroUsize>,
    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_threads: bool,
    /// Initial capacity of each worker's local queue.
    #[arg(long, default_value_t = 64)]
    local_queue_capacity: usize,
    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,
    /// Number of tasks (or leaves of the task tree).
    #[arg(long, default_value_t = 1_000_000)]
    num_tasks: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Submit independent tasks from the main thread.
    Flat,
    /// Recursively split a range into tasks submitted from the workers.
    Tree,
    /// Push to and pop from a shared lock-free stack.
    Stack,
}
