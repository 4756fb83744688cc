//! The process-wide pool set: General, IO and LowPriority.
//!
//! Instead of module-level singletons the three pools live in one value
//! behind an explicit [`start_all_pools`] / [`shutdown_all_pools`] bracket,
//! which keeps initialization order out of the picture. Submission helpers
//! look the set up on every call and fail fatally outside the bracket.
//!
//! Worker counts follow the machine: General takes most cores, IO is held
//! to one or two workers so seeks stay sequential, and LowPriority gets a
//! single background worker. Workers are pinned to cores so kernel
//! rescheduling does not ripple work across the machine; the default
//! layout keeps core 0 (and 1) for the OS, IO and the main thread. The
//! masks are recommendations validated against the cores that actually
//! exist -- on a small machine pinning silently degrades to "unpinned".

use crate::counter::CounterHandle;
use crate::fatal;
use crate::os::{AffinityMask, ThreadPriority};
use crate::pool::{PoolConfig, PoolError, TaskPool};
use crate::task::{Task, TaskPriority};
use crate::thread_context;
use parking_lot::RwLock;

struct PoolSet {
    general: TaskPool,
    io: TaskPool,
    low_priority: TaskPool,
}

static POOLS: RwLock<Option<PoolSet>> = RwLock::new(None);

fn hardware_concurrency() -> usize {
    crate::os::cpu_count()
}

fn general_worker_count(hw: usize) -> usize {
    hw.saturating_sub(2).clamp(2, 10)
}

fn io_worker_count(hw: usize) -> usize {
    hw.saturating_sub(general_worker_count(hw)).clamp(1, 2)
}

/// General workers spread over cores 3..=12 (indices 2..=11), one each.
fn general_affinities(count: usize) -> Vec<AffinityMask> {
    (0..count as u32).map(|i| AffinityMask::core(2 + i)).collect()
}

/// IO workers share the first two cores and may hop between them.
fn io_affinities(count: usize) -> Vec<AffinityMask> {
    let shared = AffinityMask::core(0).union(AffinityMask::core(1));
    vec![shared; count]
}

/// The background worker may run anywhere but core 0.
fn low_priority_affinities() -> Vec<AffinityMask> {
    vec![AffinityMask::all_except(0)]
}

/// Brings up the three process pools, in order General, IO, LowPriority.
///
/// Expected to run on the main thread during application bootstrap; also
/// registers the main thread's context. Calling it twice without an
/// intervening [`shutdown_all_pools`] panics.
pub fn start_all_pools() -> Result<(), PoolError> {
    thread_context::init_main_thread();

    let mut pools = POOLS.write();
    assert!(
        pools.is_none(),
        "start_all_pools() called while the pools are already up"
    );

    let hw = hardware_concurrency();
    let general_count = general_worker_count(hw);
    let io_count = io_worker_count(hw);

    let general = TaskPool::new(
        PoolConfig::new("general", general_count)
            .thread_priority(ThreadPriority::Normal)
            .affinities(general_affinities(general_count)),
    );
    general.start()?;

    let io = TaskPool::new(
        PoolConfig::new("io", io_count)
            .thread_priority(ThreadPriority::BelowNormal)
            .affinities(io_affinities(io_count)),
    );
    if let Err(error) = io.start() {
        general.shutdown();
        return Err(error);
    }

    let low_priority = TaskPool::new(
        PoolConfig::new("low_priority", 1)
            .thread_priority(ThreadPriority::Lowest)
            .affinities(low_priority_affinities()),
    );
    if let Err(error) = low_priority.start() {
        io.shutdown();
        general.shutdown();
        return Err(error);
    }

    *pools = Some(PoolSet {
        general,
        io,
        low_priority,
    });
    Ok(())
}

/// Tears the process pools down in reverse creation order, draining each.
pub fn shutdown_all_pools() {
    let set = POOLS
        .write()
        .take()
        .expect("shutdown_all_pools() without start_all_pools()");

    set.low_priority.shutdown();
    set.io.shutdown();
    set.general.shutdown();
}

/// RAII bracket around [`start_all_pools`] / [`shutdown_all_pools`].
pub struct RegistryScope(());

impl RegistryScope {
    pub fn new() -> Result<RegistryScope, PoolError> {
        start_all_pools()?;
        Ok(RegistryScope(()))
    }
}

impl Drop for RegistryScope {
    fn drop(&mut self) {
        shutdown_all_pools();
    }
}

fn pool(select: fn(&PoolSet) -> &TaskPool) -> TaskPool {
    match &*POOLS.read() {
        Some(set) => select(set).clone(),
        None => fatal!("[tasks] the process task pools are not started"),
    }
}

/// The compute pool most work belongs on.
pub fn general() -> TaskPool {
    pool(|set| &set.general)
}

/// The pool for blocking file/socket work.
pub fn io() -> TaskPool {
    pool(|set| &set.io)
}

/// The background pool for work nobody is waiting on.
pub fn low_priority() -> TaskPool {
    pool(|set| &set.low_priority)
}

pub fn submit_general(tasks: &[Task], priority: TaskPriority) -> CounterHandle {
    general().submit(tasks, priority)
}

pub fn submit_io(tasks: &[Task], priority: TaskPriority) -> CounterHandle {
    io().submit(tasks, priority)
}

pub fn submit_low_priority(tasks: &[Task], priority: TaskPriority) -> CounterHandle {
    low_priority().submit(tasks, priority)
}

/// Fire-and-forget a single task on the General pool.
pub fn async_work(task: Task, priority: TaskPriority) {
    general().run(&[task], priority);
}

/// Fire-and-forget a single task on the IO pool.
pub fn async_io(task: Task, priority: TaskPriority) {
    io().run(&[task], priority);
}

/// Fire-and-forget a single task on the LowPriority pool.
pub fn async_low_priority(task: Task, priority: TaskPriority) {
    low_priority().run(&[task], priority);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_clamps() {
        assert_eq!(general_worker_count(1), 2);
        assert_eq!(general_worker_count(4), 2);
        assert_eq!(general_worker_count(8), 6);
        assert_eq!(general_worker_count(16), 10);
        assert_eq!(general_worker_count(64), 10);

        assert_eq!(io_worker_count(1), 1);
        assert_eq!(io_worker_count(4), 2);
        assert_eq!(io_worker_count(16), 2);
    }

    #[test]
    fn affinity_layouts() {
        let general = general_affinities(3);
        assert_eq!(general, vec![
            AffinityMask::core(2),
            AffinityMask::core(3),
            AffinityMask::core(4),
        ]);

        let io = io_affinities(2);
        assert_eq!(io[0], io[1]);
        assert_eq!(io[0], AffinityMask::core(0).union(AffinityMask::core(1)));

        assert_eq!(low_priority_affinities()[0], AffinityMask::all_except(0));
    }
}
