// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool executing short-lived tasks with work stealing.

use super::deque::{LocalQueue, Stealer};
use super::sync::{Dequeue, SharedQueue};
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::{Backoff, CachePadded};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::RefCell;
use std::num::NonZeroUsize;
#[cfg(feature = "log_parallelism")]
use std::ops::AddAssign;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(feature = "log_parallelism")]
use std::sync::Mutex;
use std::thread::JoinHandle;

/// A unit of work executed by the thread pool.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given multiple of [`std::thread::available_parallelism()`].
    /// Oversubscribing keeps the CPUs busy while some tasks block on I/O.
    Oversubscribe(NonZeroUsize),
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => available_parallelism(),
            ThreadCount::Oversubscribe(factor) => available_parallelism()
                .checked_mul(factor)
                .expect("Oversubscribed thread count overflows usize"),
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

fn available_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().expect("Getting the available parallelism failed")
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs. Worker `i` is pinned to CPU
    /// `i % available_parallelism`.
    pub cpu_pinning: CpuPinningPolicy,
    /// Initial capacity of each worker's local queue. Local queues grow as
    /// needed.
    pub local_queue_capacity: usize,
}

impl Default for ThreadPoolBuilder {
    /// Twice as many threads as the available parallelism, no CPU pinning.
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::Oversubscribe(NonZeroUsize::new(2).unwrap()),
            cpu_pinning: CpuPinningPolicy::No,
            local_queue_capacity: 64,
        }
    }
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// Panics if a worker thread cannot be spawned. See
    /// [`try_build()`](Self::try_build) for a non-panicking variant.
    ///
    /// ```
    /// # use spindle::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// # use std::sync::Arc;
    /// let thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     local_queue_capacity: 64,
    /// }
    /// .build();
    ///
    /// let sum = Arc::new(AtomicU64::new(0));
    /// for i in 1..=10 {
    ///     let sum = sum.clone();
    ///     thread_pool.submit(move || {
    ///         sum.fetch_add(i, Ordering::Relaxed);
    ///     });
    /// }
    ///
    /// // Dropping the pool waits for all the submitted tasks.
    /// drop(thread_pool);
    /// assert_eq!(sum.load(Ordering::Relaxed), 5 * 11);
    /// ```
    pub fn build(&self) -> ThreadPool {
        self.try_build()
            .unwrap_or_else(|e| panic!("Failed to spawn a worker thread: {e}"))
    }

    /// Spawns a thread pool, returning an error if a worker thread cannot be
    /// spawned.
    ///
    /// Panics if [`CpuPinningPolicy::Always`] is requested and pinning isn't
    /// supported on this platform.
    pub fn try_build(&self) -> std::io::Result<ThreadPool> {
        ThreadPool::new(self)
    }
}

/// A thread pool that executes submitted tasks on a fixed set of worker
/// threads.
///
/// Each worker owns a local queue. Tasks submitted from within a worker go to
/// that worker's local queue, other tasks go to a shared queue. Idle workers
/// first drain their local queue, then the shared queue, and then steal from
/// the other workers' local queues.
///
/// Dropping the pool waits until all the submitted tasks have run, and then
/// joins the worker threads.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Handle to submit tasks.
    handle: PoolHandle,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// A cloneable handle to submit tasks to a [`ThreadPool`], for example from
/// within tasks.
///
/// Tasks submitted after the pool is dropped are dropped without running.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<SharedContext>,
}

/// Context shared between the pool and all the worker threads.
struct SharedContext {
    /// Overflow queue for tasks submitted from outside the workers.
    overflow: SharedQueue<Task>,
    /// Handles to steal from the local queue of each worker, indexed by worker.
    stealers: Box<[Stealer<Task>]>,
    /// Number of task executions, including those that panicked.
    tasks_processed: CachePadded<AtomicU64>,
    /// Number of task executions that panicked.
    tasks_panicked: CachePadded<AtomicU64>,
    /// Statistics accumulated by the workers that exited.
    #[cfg(feature = "log_parallelism")]
    stats: Mutex<WorkStealingStats>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> std::io::Result<Self> {
        let num_threads: usize = builder.num_threads.count().into();
        let cpu_pinning = builder.cpu_pinning;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }
        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        let num_cpus: usize = available_parallelism().into();

        let queues = (0..num_threads)
            .map(|_| LocalQueue::with_capacity(builder.local_queue_capacity))
            .collect::<Vec<_>>();
        let shared = Arc::new(SharedContext {
            overflow: SharedQueue::new(),
            stealers: queues.iter().map(LocalQueue::stealer).collect(),
            tasks_processed: CachePadded::new(AtomicU64::new(0)),
            tasks_panicked: CachePadded::new(AtomicU64::new(0)),
            #[cfg(feature = "log_parallelism")]
            stats: Mutex::new(WorkStealingStats::default()),
        });

        let mut pool = ThreadPool {
            threads: Vec::with_capacity(num_threads),
            handle: PoolHandle {
                shared: shared.clone(),
            },
        };
        for (id, queue) in queues.into_iter().enumerate() {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("spindle-worker-{id}"))
                .spawn(move || {
                    #[cfg(all(
                        not(miri),
                        any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        )
                    ))]
                    pin_current_thread(id, id % num_cpus, cpu_pinning);

                    let context = WorkerContext {
                        id,
                        queue: Rc::new(queue),
                        shared,
                        #[cfg(feature = "log_parallelism")]
                        stats: WorkStealingStats::default(),
                    };
                    context.run()
                });
            match handle {
                Ok(handle) => pool.threads.push(WorkerThreadHandle { handle }),
                Err(e) => {
                    log_error!("[main thread] Failed to spawn thread {id}: {e}");
                    // Dropping the pool stops and joins the threads spawned so far. Their
                    // stealers stay valid, as the queues are reference-counted.
                    return Err(e);
                }
            }
        }
        log_debug!("[main thread] Spawned {num_threads} threads");

        Ok(pool)
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.threads
            .len()
            .try_into()
            .expect("A thread pool has at least one thread")
    }

    /// Returns a handle to submit tasks to this pool, which can be moved into
    /// tasks.
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Submits a task to run on this pool. See [`PoolHandle::submit()`].
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.submit(task)
    }

    /// Returns the number of tasks executed so far. See
    /// [`PoolHandle::tasks_processed_count()`].
    pub fn tasks_processed_count(&self) -> u64 {
        self.handle.tasks_processed_count()
    }

    /// Returns the number of tasks that panicked so far.
    pub fn tasks_panicked_count(&self) -> u64 {
        self.handle.tasks_panicked_count()
    }
}

impl Drop for ThreadPool {
    /// Waits for the submitted tasks to run, and joins all the threads in the
    /// pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying threads to finish...");
        self.handle.shared.overflow.stop();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");

        // Only tasks submitted by other threads while the workers were exiting can
        // remain here.
        let leftover = self.handle.shared.overflow.drain();
        if !leftover.is_empty() {
            log_warn!(
                "[main thread] Dropping {} task(s) submitted during shutdown",
                leftover.len()
            );
        }

        #[cfg(feature = "log_parallelism")]
        self.handle.shared.print_statistics();
    }
}

impl PoolHandle {
    /// Submits a task to run on the pool.
    ///
    /// If called from a worker thread of this pool (i.e. from within a task),
    /// the task is pushed to that worker's local queue. Otherwise it is pushed
    /// to the pool's shared queue and an idle worker is woken up.
    ///
    /// This never rejects a task and never waits for it to run. If the task
    /// panics, the panic is caught and counted in
    /// [`tasks_panicked_count()`](Self::tasks_panicked_count), and the worker
    /// thread continues with the next task.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let task: Task = Box::new(task);
        match CurrentWorker::try_push_local(&self.shared, task) {
            Ok(()) => self.shared.overflow.wake_one(),
            Err(task) => self.shared.overflow.push(task),
        }
    }

    /// Returns the number of tasks executed so far, including tasks that
    /// panicked. This is monotonically non-decreasing.
    pub fn tasks_processed_count(&self) -> u64 {
        self.shared.tasks_processed.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks that panicked so far.
    pub fn tasks_panicked_count(&self) -> u64 {
        self.shared.tasks_panicked.load(Ordering::SeqCst)
    }
}

impl SharedContext {
    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        let stats = self.stats.lock().unwrap();
        log_info!("Work-stealing statistics:");
        log_info!("- local_pops: {}", stats.local_pops);
        log_info!("- shared_pops: {}", stats.shared_pops);
        log_info!("- thefts: {}", stats.thefts);
        log_info!("- failed_thefts: {}", stats.failed_thefts);
        log_info!("- waits: {}", stats.waits);
        log_info!("- panics: {}", self.tasks_panicked.load(Ordering::SeqCst));
    }
}

thread_local! {
    /// The worker running on this thread, if any.
    static CURRENT_WORKER: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

/// Entry of [`CURRENT_WORKER`], identifying the local queue and pool of the
/// worker running on this thread.
struct CurrentWorker {
    /// Identity of the pool the worker belongs to.
    pool: *const SharedContext,
    queue: Rc<LocalQueue<Task>>,
}

impl CurrentWorker {
    /// Pushes the task to the current worker's local queue, if this thread is
    /// a worker of the given pool. Otherwise gives the task back.
    fn try_push_local(pool: &Arc<SharedContext>, task: Task) -> Result<(), Task> {
        // Thread-local storage may already be destroyed if this is called from a
        // thread-local destructor, in which case this thread isn't a worker anymore.
        let mut task = Some(task);
        let pushed = CURRENT_WORKER
            .try_with(|current| match &*current.borrow() {
                Some(current) if std::ptr::eq(current.pool, Arc::as_ptr(pool)) => {
                    if let Some(task) = task.take() {
                        current.queue.local_push(task);
                    }
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        match task {
            Some(task) if !pushed => Err(task),
            _ => Ok(()),
        }
    }
}

/// Scoped setter for [`CURRENT_WORKER`], for the duration of a worker's run
/// loop.
struct ScopedCurrentWorker {
    prev: Option<CurrentWorker>,
}

impl ScopedCurrentWorker {
    fn new(current: CurrentWorker) -> Self {
        let prev = CURRENT_WORKER.with(|cell| cell.replace(Some(current)));
        Self { prev }
    }
}

impl Drop for ScopedCurrentWorker {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_WORKER.with(|cell| {
            *cell.borrow_mut() = prev;
        });
    }
}

/// Context object owned by a worker thread.
struct WorkerContext {
    /// Thread index.
    id: usize,
    /// Local queue of this worker. Shared with [`CURRENT_WORKER`].
    queue: Rc<LocalQueue<Task>>,
    /// Context shared with the pool and the other workers.
    shared: Arc<SharedContext>,
    /// Local work-stealing statistics.
    #[cfg(feature = "log_parallelism")]
    stats: WorkStealingStats,
}

impl WorkerContext {
    /// Main function run by this thread.
    #[allow(unused_mut)]
    fn run(mut self) {
        let _current = ScopedCurrentWorker::new(CurrentWorker {
            pool: Arc::as_ptr(&self.shared),
            queue: self.queue.clone(),
        });
        log_debug!("[thread {}] Started", self.id);

        let backoff = Backoff::new();
        loop {
            // First, drain the local queue.
            if let Some(task) = self.queue.local_pop() {
                #[cfg(feature = "log_parallelism")]
                {
                    self.stats.local_pops += 1;
                }
                self.execute(task);
                backoff.reset();
                continue;
            }

            // Then, take work from the shared queue, or wait for some.
            let outcome = self.shared.overflow.pop_or_wait(|| {
                #[cfg(feature = "log_parallelism")]
                {
                    self.stats.waits += 1;
                }
                peers_have_work(&self.shared.stealers, self.id)
            });
            match outcome {
                Dequeue::Item(task) => {
                    #[cfg(feature = "log_parallelism")]
                    {
                        self.stats.shared_pops += 1;
                    }
                    self.queue.local_push(task);
                    backoff.reset();
                    continue;
                }
                Dequeue::Stopped => break,
                Dequeue::Steal => (),
            }

            // Lastly, steal from another worker.
            match self.steal() {
                Some(task) => {
                    self.queue.local_push(task);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }

        log_debug!("[thread {}] Finished", self.id);
        #[cfg(feature = "log_parallelism")]
        {
            *self.shared.stats.lock().unwrap() += &self.stats;
        }
    }

    /// Runs a task, catching any panic.
    fn execute(&self, task: Task) {
        let result = catch_unwind(AssertUnwindSafe(task));
        self.shared.tasks_processed.fetch_add(1, Ordering::SeqCst);
        if let Err(_payload) = result {
            self.shared.tasks_panicked.fetch_add(1, Ordering::SeqCst);
            log_error!(
                "[thread {}] A task panicked: {}",
                self.id,
                panic_message(&*_payload)
            );
        }
    }

    /// Attempts to steal a task from the other workers, scanning them in
    /// round-robin order starting after this worker.
    fn steal(&mut self) -> Option<Task> {
        let num_threads = self.shared.stealers.len();
        for offset in 1..num_threads {
            let victim = (self.id + offset) % num_threads;
            let stealer = &self.shared.stealers[victim];
            if stealer.is_empty() {
                continue;
            }
            match stealer.try_steal() {
                Some(task) => {
                    #[cfg(feature = "log_parallelism")]
                    {
                        self.stats.thefts += 1;
                        log_trace!("[thread {}] Stole a task from thread {victim}", self.id);
                    }
                    return Some(task);
                }
                None => {
                    #[cfg(feature = "log_parallelism")]
                    {
                        self.stats.failed_thefts += 1;
                    }
                }
            }
        }
        None
    }
}

/// Returns whether the local queue of a worker other than `id` is observably
/// non-empty.
fn peers_have_work(stealers: &[Stealer<Task>], id: usize) -> bool {
    stealers
        .iter()
        .enumerate()
        .any(|(i, stealer)| i != id && !stealer.is_empty())
}

/// Extracts the message of a panic payload, for logging.
#[cfg(feature = "log")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string payload>"
    }
}

/// Pins the current thread to the given CPU, according to the given policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(cpu) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{cpu}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(cpu) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{cpu}");
            }
        }
    }
}

/// Counters of how each worker obtained its tasks.
#[cfg(feature = "log_parallelism")]
#[derive(Default)]
struct WorkStealingStats {
    /// Number of tasks popped from the worker's own local queue.
    local_pops: u64,
    /// Number of tasks dequeued from the shared queue.
    shared_pops: u64,
    /// Number of tasks stolen from another worker.
    thefts: u64,
    /// Number of steal attempts that lost a race with another thread.
    failed_thefts: u64,
    /// Number of times the worker checked for work before possibly waiting.
    waits: u64,
}

#[cfg(feature = "log_parallelism")]
impl AddAssign<&WorkStealingStats> for WorkStealingStats {
    fn add_assign(&mut self, other: &WorkStealingStats) {
        self.local_pops += other.local_pops;
        self.shared_pops += other.shared_pops;
        self.thefts += other.thefts;
        self.failed_thefts += other.failed_thefts;
        self.waits += other.waits;
    }
}
