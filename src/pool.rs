//! The task pool: worker threads, the fiber scheduler loop, and the
//! submit/wait facade.
//!
//! # How a wait works
//!
//! Each worker thread is converted into a *thread fiber* anchor and then
//! spends its whole life inside *worker fibers* running [`worker_fiber_main`].
//! When a task (or any code on a worker) waits on an unfinished counter, the
//! calling fiber builds a wait record on its own stack, parks a pointer to
//! it in the thread's single-slot mailbox, and switches to a replacement
//! fiber (recycled from the thread's MRU cache when possible). The
//! replacement publishes the record into the pool-wide waiting registry as
//! its very first act, which guarantees the record is not visible to other
//! workers until its fiber is truly suspended. Whichever worker later
//! observes the awaited counter finished resumes the parked fiber and
//! becomes the "released" fiber the waker hands back to its MRU cache.
//!
//! # What may live on a worker fiber's stack
//!
//! Fibers are destroyed without unwinding, and the scheduler destroys
//! worker fibers parked at two points: the post-resume point in
//! [`resume_or_requeue`] and the shutdown handoff. The loop therefore keeps
//! nothing but `Copy` values alive across those points -- in particular no
//! `Arc`, no pool handle. Suspensions inside a *task* body (a nested wait)
//! are exempt: a recorded waiter is always resumed before its pool shuts
//! down, so those frames complete normally.

use crate::counter::{CounterHandle, TaskCounter};
use crate::fatal;
use crate::mpmc_queue::MpmcQueue;
use crate::mru_cache::MruCache;
use crate::os::{self, AffinityMask, ThreadPriority};
use crate::priority_queue::TaskPriorityQueue;
use crate::task::{Task, TaskContext, TaskPriority, TaskQueued};
use crate::thread_context::{ThreadContextScope, WORKER_THREAD_TAG};
use fiber::Fiber;
use log::{error, info};
use parking_lot::Mutex;
use static_assertions::const_assert;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Dimension of the per-worker fiber and counter MRU caches.
pub(crate) const MRU_CACHE_DIM: usize = 32;
/// Default per-priority-level queue capacity. Enqueue overflow is fatal,
/// so this is part of the contract with callers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
/// Default worker fiber stack size.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

const_assert!(MRU_CACHE_DIM.is_power_of_two());
const_assert!(DEFAULT_QUEUE_CAPACITY.is_power_of_two());

/// The one recoverable failure surface of a pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn a worker thread for pool \"{pool}\"")]
    Spawn {
        pool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pool \"{0}\" is already started")]
    AlreadyStarted(String),
}

/// Construction parameters for a [`TaskPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub name: String,
    pub worker_count: usize,
    pub thread_priority: ThreadPriority,
    /// Per-worker CPU pinning; worker `i` uses entry `i`. Missing entries
    /// leave the worker unpinned.
    pub affinities: Vec<AffinityMask>,
    /// Capacity of each priority level (and of the waiting registry).
    pub queue_capacity: usize,
    pub stack_size: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, worker_count: usize) -> PoolConfig {
        assert!(worker_count > 0, "a pool needs at least one worker");
        PoolConfig {
            name: name.into(),
            worker_count,
            thread_priority: ThreadPriority::Normal,
            affinities: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn thread_priority(mut self, priority: ThreadPriority) -> PoolConfig {
        self.thread_priority = priority;
        self
    }

    pub fn affinities(mut self, affinities: Vec<AffinityMask>) -> PoolConfig {
        self.affinities = affinities;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> PoolConfig {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "queue capacity must be a power of two >= 2"
        );
        self.queue_capacity = capacity;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> PoolConfig {
        self.stack_size = stack_size;
        self
    }
}

/// Point-in-time scheduler counters, mostly interesting to tests and
/// profiling overlays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Counter acquisitions served from the submitting thread's MRU cache,
    /// attributed to the pool submitted to. The cache itself is per thread
    /// and shared across pools, so a submission to pool B from one of pool
    /// A's workers is tallied here on B while the cached counter came from
    /// (and returns to) A's worker thread.
    pub counter_cache_hits: usize,
    /// Counter acquisitions that had to allocate; attributed like
    /// [`counter_cache_hits`](PoolStats::counter_cache_hits).
    pub counter_cache_misses: usize,
    pub fibers_created: usize,
    pub fibers_released: usize,
}

impl PoolStats {
    /// Saturating: the two tallies are sampled independently, so a reader
    /// racing a release can transiently observe more released than created.
    pub fn fibers_outstanding(&self) -> usize {
        self.fibers_created.saturating_sub(self.fibers_released)
    }
}

/// Creates and recycles the pool's worker fibers.
///
/// All fibers share the same entry and stack size; the entry finds its pool
/// through the thread-local task context, so the factory itself stays free
/// of back-references. The created/released tallies double as the leak
/// check: a factory must account for every fiber before it is dropped.
struct FiberFactory {
    stack_size: usize,
    entry: fn(Fiber),
    created: AtomicUsize,
    released: AtomicUsize,
}

impl FiberFactory {
    fn new(stack_size: usize, entry: fn(Fiber)) -> FiberFactory {
        FiberFactory {
            stack_size,
            entry,
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    fn create(&self) -> Fiber {
        self.created.fetch_add(1, Ordering::Relaxed);
        Fiber::new(self.stack_size, self.entry)
    }

    fn release(&self, fiber: Fiber) {
        self.released.fetch_add(1, Ordering::Relaxed);
        unsafe {
            fiber.destroy();
        }
    }

    fn outstanding(&self) -> usize {
        self.created
            .load(Ordering::Relaxed)
            .saturating_sub(self.released.load(Ordering::Relaxed))
    }
}

impl Drop for FiberFactory {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.outstanding(),
            0,
            "fiber factory dropped with outstanding fibers"
        );
    }
}

/// A wait episode, allocated on the preempted fiber's stack.
///
/// Valid exactly as long as that fiber stays suspended; the waiting
/// registry passes these around by pointer and never owns them. `released`
/// is written (by the resuming worker) at most once, strictly before the
/// preempted fiber runs again, with SeqCst fences on both sides of the
/// handoff.
struct FiberQueued {
    preempted: Fiber,
    counter: *const TaskCounter,
    released: Option<Fiber>,
}

#[derive(Clone, Copy)]
struct WaiterRef(NonNull<FiberQueued>);

// The record a WaiterRef points to lives on a suspended fiber's stack and
// is handed from the waiter to exactly one resuming worker at a time.
unsafe impl Send for WaiterRef {}

/// Thread-local scheduler state of one worker (or of a host thread using
/// the counter cache).
struct TaskThreadContext {
    worker_index: Option<usize>,
    pool: Option<TaskPool>,
    /// Single-slot mailbox: set between a wait arming itself and the
    /// replacement fiber publishing the record at its loop top.
    waiting_for: Option<WaiterRef>,
    /// Single-slot mailbox: the fiber the worker loop was last running on,
    /// stashed for the thread fiber to release during teardown.
    fiber_to_release: Option<Fiber>,
    fiber_cache: MruCache<Fiber, MRU_CACHE_DIM>,
    counter_cache: MruCache<Arc<TaskCounter>, MRU_CACHE_DIM>,
}

impl TaskThreadContext {
    fn new() -> TaskThreadContext {
        TaskThreadContext {
            worker_index: None,
            pool: None,
            waiting_for: None,
            fiber_to_release: None,
            fiber_cache: MruCache::new(),
            counter_cache: MruCache::new(),
        }
    }
}

impl Drop for TaskThreadContext {
    fn drop(&mut self) {
        debug_assert!(self.waiting_for.is_none());
        debug_assert!(self.fiber_to_release.is_none());
        debug_assert!(
            self.fiber_cache.is_empty(),
            "thread exited with cached fibers; they would leak"
        );
        // Host threads park recycled counters here until they die; workers
        // drained theirs during scope teardown.
        while self.counter_cache.get().is_some() {}
    }
}

thread_local! {
    static TASK_CTX: RefCell<TaskThreadContext> = RefCell::new(TaskThreadContext::new());
}

/// Runs `f` with the calling thread's task context.
///
/// The borrow lasts for `f` only: `f` must not switch fibers, call back
/// into the pool, or otherwise re-enter this function.
fn with_task_ctx<R>(f: impl FnOnce(&mut TaskThreadContext) -> R) -> R {
    TASK_CTX.with(|ctx| f(&mut ctx.borrow_mut()))
}

struct PoolInner {
    config: PoolConfig,
    /// Workers exit when this is set *and* a poll finds no work.
    signal_exit: AtomicBool,
    queue: TaskPriorityQueue,
    /// Registry of parked waiters; same capacity as one queue level.
    waiting: MpmcQueue<WaiterRef>,
    fibers: FiberFactory,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    counter_cache_hits: AtomicUsize,
    counter_cache_misses: AtomicUsize,
}

/// A priority-ordered, fiber-scheduled task pool.
///
/// `TaskPool` is a cheap cloneable handle; all clones address the same
/// workers and queues. See the crate docs for the scheduling model.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    pub fn new(config: PoolConfig) -> TaskPool {
        assert!(config.worker_count > 0, "a pool needs at least one worker");
        assert!(
            config.queue_capacity >= 2 && config.queue_capacity.is_power_of_two(),
            "queue capacity must be a power of two >= 2"
        );
        TaskPool {
            inner: Arc::new(PoolInner {
                signal_exit: AtomicBool::new(true),
                queue: TaskPriorityQueue::with_capacity(config.queue_capacity),
                waiting: MpmcQueue::with_capacity(config.queue_capacity),
                fibers: FiberFactory::new(config.stack_size, worker_fiber_main),
                threads: Mutex::new(Vec::new()),
                counter_cache_hits: AtomicUsize::new(0),
                counter_cache_misses: AtomicUsize::new(0),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn worker_count(&self) -> usize {
        self.inner.config.worker_count
    }

    /// Per-priority-level queue capacity; exceeding it at submit time is
    /// fatal, so callers sizing workloads should read this.
    pub fn queue_capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn is_started(&self) -> bool {
        !self.inner.signal_exit.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            counter_cache_hits: self.inner.counter_cache_hits.load(Ordering::Relaxed),
            counter_cache_misses: self.inner.counter_cache_misses.load(Ordering::Relaxed),
            fibers_created: self.inner.fibers.created.load(Ordering::Relaxed),
            fibers_released: self.inner.fibers.released.load(Ordering::Relaxed),
        }
    }

    /// Spawns the worker threads. A pool can be started again after
    /// [`shutdown`](TaskPool::shutdown).
    pub fn start(&self) -> Result<(), PoolError> {
        let mut threads = self.inner.threads.lock();
        if !threads.is_empty() {
            return Err(PoolError::AlreadyStarted(self.name().to_owned()));
        }

        info!(
            "[tasks] starting pool \"{}\" with {} workers",
            self.name(),
            self.worker_count()
        );
        self.inner.signal_exit.store(false, Ordering::SeqCst);

        for worker_index in 0..self.worker_count() {
            let pool = self.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}/worker#{}", self.name(), worker_index))
                .spawn(move || worker_thread_main(pool, worker_index));

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    // Roll back the workers that did come up.
                    self.inner.signal_exit.store(true, Ordering::SeqCst);
                    for handle in threads.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn {
                        pool: self.name().to_owned(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Signals the workers and joins them.
    ///
    /// Outstanding tasks always complete first: workers only observe the
    /// exit signal on a poll that found both queues empty.
    pub fn shutdown(&self) {
        let mut threads = self.inner.threads.lock();
        assert!(
            !threads.is_empty(),
            "shutdown of pool \"{}\" which is not started",
            self.name()
        );

        info!(
            "[tasks] stopping pool \"{}\" with {} workers",
            self.name(),
            self.worker_count()
        );
        self.inner.signal_exit.store(true, Ordering::SeqCst);

        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!("[tasks] a worker thread of pool \"{}\" panicked", self.name());
            }
        }

        assert!(
            self.inner.queue.is_empty(),
            "pool \"{}\" shut down with queued tasks",
            self.name()
        );
        assert!(
            self.inner.waiting.is_empty(),
            "pool \"{}\" shut down with parked waiters",
            self.name()
        );
    }

    /// Submits a batch sharing one completion counter and returns its
    /// handle. Every task runs exactly once, at `priority`.
    pub fn submit(&self, tasks: &[Task], priority: TaskPriority) -> CounterHandle {
        let counter = self.acquire_counter(tasks.len());
        self.enqueue_batch(tasks, Some(&counter), priority);
        CounterHandle(counter)
    }

    /// Detached submission: no counter, nothing to wait on.
    pub fn run(&self, tasks: &[Task], priority: TaskPriority) {
        if tasks.is_empty() {
            fatal!("[tasks] empty batch submitted to pool \"{}\"", self.name());
        }
        self.enqueue_batch(tasks, None, priority);
    }

    /// Blocks until `counter` finishes and recycles it.
    ///
    /// On a worker this does not block the thread: the calling fiber is
    /// parked and the worker keeps draining queues on a replacement fiber.
    /// Off the workers it spins with an OS yield.
    pub fn wait(&self, counter: CounterHandle) {
        let counter = counter.0;

        if !counter.finished() {
            let on_worker = with_task_ctx(|ctx| ctx.pool.is_some());
            if on_worker {
                wait_on_worker(&counter);
            } else {
                while !counter.finished() {
                    thread::yield_now();
                }
            }
        }

        debug_assert!(counter.finished());
        // Recycle through this thread's MRU; an evicted oldest entry just
        // drops (it is finished by construction).
        let evicted = with_task_ctx(|ctx| ctx.counter_cache.release(counter));
        drop(evicted);
    }

    pub fn submit_and_wait(&self, tasks: &[Task], priority: TaskPriority) {
        let counter = self.submit(tasks, priority);
        self.wait(counter);
    }

    fn acquire_counter(&self, count: usize) -> Arc<TaskCounter> {
        if count == 0 {
            fatal!("[tasks] empty batch submitted to pool \"{}\"", self.name());
        }

        match with_task_ctx(|ctx| ctx.counter_cache.get()) {
            Some(counter) => {
                self.inner.counter_cache_hits.fetch_add(1, Ordering::Relaxed);
                counter.reset(count);
                counter
            }
            None => {
                self.inner
                    .counter_cache_misses
                    .fetch_add(1, Ordering::Relaxed);
                Arc::new(TaskCounter::new(count))
            }
        }
    }

    fn enqueue_batch(
        &self,
        tasks: &[Task],
        counter: Option<&Arc<TaskCounter>>,
        priority: TaskPriority,
    ) {
        if self.inner.signal_exit.load(Ordering::SeqCst) {
            fatal!(
                "[tasks] submit to pool \"{}\" which is not started",
                self.name()
            );
        }

        for task in tasks {
            let queued = TaskQueued {
                task: task.clone(),
                counter: counter.cloned(),
            };
            if self.inner.queue.push(queued, priority).is_err() {
                fatal!(
                    "[tasks] priority queue overflow in pool \"{}\" at {:?} (capacity {})",
                    self.name(),
                    priority,
                    self.queue_capacity()
                );
            }
        }
    }
}

/// RAII start/shutdown bracket for one pool.
pub struct PoolScope<'a> {
    pool: &'a TaskPool,
}

impl<'a> PoolScope<'a> {
    pub fn new(pool: &'a TaskPool) -> Result<PoolScope<'a>, PoolError> {
        pool.start()?;
        Ok(PoolScope { pool })
    }
}

impl Drop for PoolScope<'_> {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// The worker path of [`TaskPool::wait`]: park the calling fiber, hand the
/// thread a replacement, reclaim the released fiber once resumed.
///
/// All fiber traffic goes through the *hosting* worker's pool (from the
/// thread context), not the facade the wait was called on: the replacement
/// must run the host pool's loop, and the released fiber must return to the
/// factory that created it. The two coincide except when a task waits on a
/// counter submitted to a different pool, which is allowed.
fn wait_on_worker(counter: &Arc<TaskCounter>) {
    let host = with_task_ctx(|ctx| ctx.pool.clone()).expect("wait_on_worker off a worker thread");
    let running = fiber::current().expect("worker thread without a running fiber");

    let mut record = FiberQueued {
        preempted: running,
        counter: Arc::as_ptr(counter),
        released: None,
    };

    let replacement = with_task_ctx(|ctx| {
        debug_assert!(
            ctx.waiting_for.is_none(),
            "nested wait arming while a record is already pending"
        );
        ctx.waiting_for = Some(WaiterRef(NonNull::from(&mut record)));
        ctx.fiber_cache.get()
    })
    .unwrap_or_else(|| host.inner.fibers.create());

    fence(Ordering::SeqCst);
    unsafe {
        replacement.resume();
    }

    // A worker observed the counter finished and switched back to us; we
    // may be on a different OS thread of the same pool now.
    debug_assert!(counter.finished());
    debug_assert_eq!(Some(record.preempted), fiber::current());
    debug_assert!(with_task_ctx(|ctx| ctx.waiting_for.is_none()));

    let released = record
        .released
        .take()
        .expect("wait resumed without a released fiber");
    debug_assert_ne!(released, record.preempted);

    // The fiber that ran in our stead is reusable; cache it on the thread
    // we woke up on.
    if let Some(evicted) = with_task_ctx(|ctx| ctx.fiber_cache.release(released)) {
        host.inner.fibers.release(evicted);
    }
}

/// OS-thread body of one worker.
fn worker_thread_main(pool: TaskPool, worker_index: usize) {
    let name = format!("{}/worker#{}", pool.name(), worker_index);
    let _thread_context = ThreadContextScope::new(&name, WORKER_THREAD_TAG);

    os::apply_thread_priority(pool.inner.config.thread_priority);
    if let Some(mask) = pool.inner.config.affinities.get(worker_index).copied() {
        os::apply_thread_affinity(mask);
    }

    info!(
        "[tasks] starting worker #{} of pool \"{}\"",
        worker_index,
        pool.name()
    );

    let thread_fiber = fiber::init();
    with_task_ctx(|ctx| {
        debug_assert!(ctx.pool.is_none() && ctx.worker_index.is_none());
        debug_assert!(ctx.fiber_cache.is_empty() && ctx.counter_cache.is_empty());
        ctx.pool = Some(pool.clone());
        ctx.worker_index = Some(worker_index);
    });

    // The first worker fiber; control only returns here once the loop has
    // seen the exit signal and switched back to the thread fiber.
    let first = pool.inner.fibers.create();
    unsafe {
        first.resume();
    }
    debug_assert_eq!(fiber::current(), Some(thread_fiber));

    info!(
        "[tasks] stopping worker #{} of pool \"{}\"",
        worker_index,
        pool.name()
    );

    // The loop stashed the fiber it exited on.
    let to_release = match with_task_ctx(|ctx| ctx.fiber_to_release.take()) {
        Some(fiber) => fiber,
        None => fatal!(
            "[tasks] worker #{} of pool \"{}\" returned without an exit fiber",
            worker_index,
            pool.name()
        ),
    };
    pool.inner.fibers.release(to_release);

    // Drain the MRU caches: fibers back to the factory, counters dropped.
    with_task_ctx(|ctx| {
        debug_assert!(ctx.waiting_for.is_none());
        while let Some(cached) = ctx.fiber_cache.get() {
            pool.inner.fibers.release(cached);
        }
        ctx.fiber_cache.clear_assume_empty();
        while ctx.counter_cache.get().is_some() {}
        ctx.counter_cache.clear_assume_empty();
        ctx.pool = None;
        ctx.worker_index = None;
    });

    fiber::shutdown();
}

/// Entry of every worker fiber: the scheduler main loop.
fn worker_fiber_main(_resumed_from: Fiber) {
    // The pool is addressed through a raw pointer re-derived from the
    // thread context instead of an owned handle: this fiber's stack may be
    // freed without unwinding, and the pool outlives its fibers by
    // construction (shutdown joins the workers, teardown destroys the
    // fibers, only then can the last handle drop).
    let inner = with_task_ctx(|ctx| {
        let pool = ctx.pool.as_ref().expect("worker fiber outside a pool thread");
        Arc::as_ptr(&pool.inner)
    });
    let inner = unsafe { &*inner };

    // If a wait armed this fiber as its replacement, its record becomes
    // publishable exactly now -- the waiter is suspended.
    publish_waiting_record(inner, false);

    loop {
        debug_assert!(with_task_ctx(|ctx| ctx.waiting_for.is_none()));

        let mut progress = false;

        if let Some(queued) = inner.queue.pop() {
            run_task(queued);
            progress = true;
        }

        if let Some(record) = inner.waiting.pop() {
            resume_or_requeue(inner, record);
            progress = true;
        }

        if !progress {
            if inner.signal_exit.load(Ordering::SeqCst) {
                break;
            }
            thread::yield_now();
        }
    }

    // Shutdown: hand this fiber to the thread scope for release and leave
    // through the thread fiber. Control never comes back here.
    let thread_fiber = fiber::thread_fiber().expect("worker thread lost its thread fiber");
    let running = fiber::current().expect("worker fiber without a current fiber");
    debug_assert_ne!(running, thread_fiber);
    with_task_ctx(|ctx| {
        debug_assert!(ctx.fiber_to_release.is_none());
        ctx.fiber_to_release = Some(running);
    });
    fence(Ordering::SeqCst);
    unsafe {
        thread_fiber.resume();
    }
    unreachable!("worker fiber resumed after its shutdown handoff");
}

/// Moves the thread's pending wait record (if any) into the waiting
/// registry. `must_exist` is set on the resume path, where the fiber was
/// necessarily handed out as a replacement by a wait that armed one.
fn publish_waiting_record(inner: &PoolInner, must_exist: bool) {
    match with_task_ctx(|ctx| ctx.waiting_for.take()) {
        Some(record) => {
            if inner.waiting.push(record).is_err() {
                fatal!(
                    "[tasks] waiting-fiber registry overflow in pool \"{}\" (capacity {})",
                    inner.config.name,
                    inner.waiting.capacity()
                );
            }
        }
        None if must_exist => fatal!(
            "[tasks] worker fiber resumed without a pending wait record in pool \"{}\"",
            inner.config.name
        ),
        None => {}
    }
}

/// Runs one dequeued task under a panic guard and completes its batch.
fn run_task(queued: TaskQueued) {
    let TaskQueued { task, counter } = queued;

    {
        let (pool, worker_index) = with_task_ctx(|ctx| (ctx.pool.clone(), ctx.worker_index));
        let pool = pool.expect("task running outside a pool thread");
        let worker_index = worker_index.expect("task running outside a worker");

        let context = TaskContext::new(pool, worker_index);
        if panic::catch_unwind(AssertUnwindSafe(|| task.invoke(&context))).is_err() {
            error!(
                "[tasks] task panicked on worker #{} of pool \"{}\"; its batch still completes",
                worker_index,
                context.pool().name()
            );
        }
    }

    // Every control path decrements, including the panic path above;
    // a batch must never hang on a failed task.
    if let Some(counter) = counter {
        counter.decrement();
    }
}

/// Services one parked waiter: resume it if its counter finished, otherwise
/// put the record back for a later pass.
fn resume_or_requeue(inner: &PoolInner, record: WaiterRef) {
    // The record lives on the preempted fiber's stack and is valid while
    // that fiber stays suspended; the counter it points to is kept alive by
    // the waiter's frame.
    let rec = record.0.as_ptr();
    let finished = unsafe { (*(*rec).counter).finished() };

    if finished {
        let preempted = unsafe {
            debug_assert!((*rec).released.is_none());
            let running = fiber::current().expect("worker fiber without a current fiber");
            debug_assert_ne!(running, (*rec).preempted);
            (*rec).released = Some(running);
            (*rec).preempted
        };

        fence(Ordering::SeqCst);
        unsafe {
            preempted.resume();
        }

        // Only `Copy` locals are live here: this fiber may sit suspended at
        // the resume above for a long time and may be destroyed there.
        //
        // When control does come back, this fiber was handed out as a
        // replacement by a wait on some thread of this pool; that wait
        // armed its record just before resuming us, so publishing is
        // mandatory now.
        publish_waiting_record(inner, true);
    } else if inner.waiting.push(record).is_err() {
        fatal!(
            "[tasks] waiting-fiber registry overflow in pool \"{}\" (capacity {})",
            inner.config.name,
            inner.waiting.capacity()
        );
    }
}
