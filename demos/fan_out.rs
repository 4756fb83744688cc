//! Brings up the process pools and runs a small dependency tree: one parent
//! per pool-worker fans out a sub-batch and waits on it without blocking
//! its worker thread.
//!
//!     cargo run --example fan_out

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use taskpool::{registry, Task, TaskPriority};

const PARENTS: usize = 16;
const CHILDREN: usize = 32;

fn main() {
    env_logger::init();
    registry::start_all_pools().expect("failed to start the task pools");

    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let parents: Vec<Task> = (0..PARENTS)
        .map(|parent| {
            let completed = Arc::clone(&completed);
            Task::new(move |ctx| {
                let children: Vec<Task> = (0..CHILDREN)
                    .map(|child| {
                        let completed = Arc::clone(&completed);
                        Task::new(move |_| {
                            // Pretend to do a little work.
                            std::hint::black_box(parent * CHILDREN + child);
                            completed.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();

                // Parks this fiber; the worker keeps running other parents.
                ctx.pool().submit_and_wait(&children, TaskPriority::Normal);
                completed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    let counter = registry::submit_general(&parents, TaskPriority::High);
    registry::general().wait(counter);

    println!(
        "{} tasks ({} parents x {} children) in {:?} on {} workers",
        completed.load(Ordering::Relaxed),
        PARENTS,
        CHILDREN,
        started.elapsed(),
        registry::general().worker_count(),
    );

    registry::shutdown_all_pools();
}
