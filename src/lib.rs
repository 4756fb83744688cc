//! A fiber-based task pool.
//!
//! Work is submitted to a [`TaskPool`] in batches of [`Task`]s at a
//! [`TaskPriority`]; each batch shares one completion counter. The
//! distinguishing feature is the wait path: waiting on a counter from
//! inside a task does not block the worker thread. The calling fiber is
//! parked, the thread switches to a replacement fiber and keeps draining
//! queues, and the parked fiber is resumed by whichever worker later
//! observes the counter finished -- possibly on a different thread.
//!
//! # Scheduling work
//!
//! ```
//! use taskpool::{PoolConfig, Task, TaskPool, TaskPriority};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = TaskPool::new(PoolConfig::new("demo", 2));
//! pool.start().unwrap();
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! let tasks: Vec<Task> = (0..8)
//!     .map(|_| {
//!         let hits = Arc::clone(&hits);
//!         Task::new(move |_| {
//!             hits.fetch_add(1, Ordering::Relaxed);
//!         })
//!     })
//!     .collect();
//!
//! pool.submit_and_wait(&tasks, TaskPriority::Normal);
//! assert_eq!(hits.load(Ordering::Relaxed), 8);
//!
//! pool.shutdown();
//! ```
//!
//! Tasks fan out sub-work through their [`TaskContext`]: submitting and
//! then waiting from inside a task is the intended way to express
//! dependencies, and it keeps every worker busy while the waiter is parked.
//!
//! # Global pools
//!
//! [`registry::start_all_pools`] brings up the three process-wide pools
//! (General, IO, LowPriority) with machine-derived worker counts, thread
//! priorities and core pinning; [`async_work`], [`async_io`] and
//! [`async_low_priority`] are fire-and-forget shortcuts into them.
//!
//! # Fatal conditions
//!
//! The scheduler surfaces no recoverable errors past [`TaskPool::start`].
//! Queue overflow, submitting to a stopped pool, or an empty batch are
//! process-configuration bugs by contract: they log a diagnostic naming the
//! pool and abort. Panicking *tasks* are contained -- the panic is caught
//! at the task boundary, logged, and the batch still completes.

/// Logs a scheduler-fatal diagnostic and aborts the process.
///
/// Used for the conditions the scheduler cannot recover from or hand back
/// to the caller (see the crate docs); unwinding instead is not an option
/// inside a worker fiber.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}
pub(crate) use fatal;

mod counter;
pub mod mpmc_queue;
pub mod mru_cache;
mod os;
mod pool;
mod priority_queue;
pub mod registry;
mod task;
pub mod thread_context;

pub use self::counter::CounterHandle;
pub use self::os::{AffinityMask, ThreadPriority};
pub use self::pool::{
    PoolConfig, PoolError, PoolScope, PoolStats, TaskPool, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_STACK_SIZE,
};
pub use self::registry::{
    async_io, async_low_priority, async_work, shutdown_all_pools, start_all_pools, RegistryScope,
};
pub use self::task::{Task, TaskContext, TaskPriority};
