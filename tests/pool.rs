//! End-to-end scheduler tests.
//!
//! Where the behavior under test allows it, these run on a single worker so
//! ordering assertions are deterministic instead of timing-based.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use taskpool::{registry, thread_context, PoolConfig, Task, TaskPool, TaskPriority};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_pool(name: &str, workers: usize) -> TaskPool {
    TaskPool::new(PoolConfig::new(name, workers).queue_capacity(1024))
}

fn spin_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

/// A task that parks its worker until released, so tests can pile work up
/// behind a deliberately stalled pool.
fn gate_task(entered: &Arc<AtomicBool>, release: &Arc<AtomicBool>) -> Task {
    let entered = Arc::clone(entered);
    let release = Arc::clone(release);
    Task::new(move |_| {
        entered.store(true, Ordering::Release);
        while !release.load(Ordering::Acquire) {
            thread::yield_now();
        }
    })
}

#[test]
fn fifo_within_one_priority_level() {
    init_logger();
    let pool = small_pool("fifo", 1);
    pool.start().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Task> = (0..500)
        .map(|i| {
            let log = Arc::clone(&log);
            Task::new(move |_| log.lock().push(i))
        })
        .collect();

    pool.submit_and_wait(&tasks, TaskPriority::Normal);

    // One worker dispatches a level strictly in submission order.
    assert_eq!(*log.lock(), (0..500).collect::<Vec<_>>());

    pool.shutdown();
}

#[test]
fn strict_priority_across_levels() {
    init_logger();
    let pool = small_pool("priority", 1);
    pool.start().unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    pool.run(&[gate_task(&entered, &release)], TaskPriority::Normal);
    spin_until(Duration::from_secs(10), || entered.load(Ordering::Acquire));

    // The worker is stalled inside the gate; everything below queues up.
    let log = Arc::new(Mutex::new(Vec::new()));
    let low_tasks: Vec<Task> = (0..20)
        .map(|i| {
            let log = Arc::clone(&log);
            Task::new(move |_| log.lock().push(format!("low:{}", i)))
        })
        .collect();
    let low = pool.submit(&low_tasks, TaskPriority::Low);

    let high_log = Arc::clone(&log);
    let high = pool.submit(
        &[Task::new(move |_| high_log.lock().push("high".to_owned()))],
        TaskPriority::High,
    );

    release.store(true, Ordering::Release);
    pool.wait(high);
    pool.wait(low);

    let log = log.lock();
    assert_eq!(log.len(), 21);
    // The later-submitted High task overtook every queued Low task.
    assert_eq!(log[0], "high");
    assert_eq!(log[1], "low:0");

    pool.shutdown();
}

#[test]
fn waiting_inside_a_task_does_not_block_the_worker() {
    init_logger();
    let pool = small_pool("coop", 1);
    pool.start().unwrap();

    let events: Arc<Mutex<Vec<(String, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
    let push = |events: &Arc<Mutex<Vec<(String, ThreadId)>>>, tag: &str| {
        events.lock().push((tag.to_owned(), thread::current().id()));
    };

    let outer_events = Arc::clone(&events);
    let outer = Task::new(move |ctx| {
        push(&outer_events, "outer:begin");

        // A sibling queued behind the sub-batch: with only one worker it
        // can only run if the wait below releases the thread.
        let sibling_events = Arc::clone(&outer_events);
        ctx.pool().run(
            &[Task::new(move |_| push(&sibling_events, "sibling"))],
            TaskPriority::Normal,
        );

        let sub_events = Arc::clone(&outer_events);
        ctx.pool().submit_and_wait(
            &[Task::new(move |_| push(&sub_events, "sub"))],
            TaskPriority::Normal,
        );

        push(&outer_events, "outer:end");
    });

    pool.submit_and_wait(&[outer], TaskPriority::Normal);

    let events = events.lock();
    let tags: Vec<&str> = events.iter().map(|(tag, _)| tag.as_str()).collect();
    assert_eq!(tags, vec!["outer:begin", "sibling", "sub", "outer:end"]);

    // Everything ran on the single worker thread, including the work that
    // executed while `outer` was parked.
    let worker = events[0].1;
    assert!(events.iter().all(|(_, id)| *id == worker));
    assert_ne!(worker, thread::current().id());

    pool.shutdown();
}

#[test]
fn shutdown_drains_outstanding_tasks() {
    init_logger();
    let pool = small_pool("drain", 2);
    pool.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let task_done = Arc::clone(&done);
    pool.run(
        &[Task::new(move |_| {
            thread::sleep(Duration::from_millis(100));
            task_done.store(true, Ordering::Release);
        })],
        TaskPriority::Normal,
    );

    // Workers only observe the exit signal on an empty poll, so shutdown
    // returns strictly after the sleeper completed.
    pool.shutdown();
    assert!(done.load(Ordering::Acquire));
}

#[test]
fn counters_recycle_through_the_mru_cache() {
    init_logger();
    let pool = small_pool("recycle", 2);
    pool.start().unwrap();

    let tasks: Vec<Task> = (0..2).map(|_| Task::new(|_| {})).collect();
    for _ in 0..300 {
        pool.submit_and_wait(&tasks, TaskPriority::Normal);
    }

    // Same submitting thread throughout: the first submission allocates,
    // every later one reuses the counter it released.
    let stats = pool.stats();
    assert_eq!(stats.counter_cache_misses, 1);
    assert_eq!(stats.counter_cache_hits, 299);

    pool.shutdown();
}

#[test]
fn nested_waits_overflow_the_fiber_cache_without_leaking() {
    const DEPTH: usize = 36;

    init_logger();
    let pool = TaskPool::new(
        PoolConfig::new("nested", 1)
            .queue_capacity(256)
            .stack_size(256 * 1024),
    );
    pool.start().unwrap();

    fn nested(depth: usize, reached: Arc<AtomicUsize>) -> Task {
        Task::new(move |ctx| {
            reached.fetch_add(1, Ordering::Relaxed);
            if depth > 0 {
                ctx.pool().submit_and_wait(
                    &[nested(depth - 1, Arc::clone(&reached))],
                    TaskPriority::Normal,
                );
            }
        })
    }

    let reached = Arc::new(AtomicUsize::new(0));
    pool.submit_and_wait(&[nested(DEPTH, Arc::clone(&reached))], TaskPriority::Normal);
    assert_eq!(reached.load(Ordering::Relaxed), DEPTH + 1);

    // The descent parked DEPTH fibers at once, which is more than the MRU
    // cache holds; the overflow must have gone back to the factory.
    let stats = pool.stats();
    assert!(stats.fibers_created > DEPTH, "stats: {:?}", stats);
    assert!(stats.fibers_released >= DEPTH - 32, "stats: {:?}", stats);

    pool.shutdown();
    // Worker teardown accounts for every fiber ever created.
    assert_eq!(pool.stats().fibers_outstanding(), 0);
}

#[test]
fn queue_accepts_capacity_minus_one_while_stalled() {
    init_logger();
    let pool = TaskPool::new(PoolConfig::new("capacity", 1).queue_capacity(64));
    pool.start().unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    pool.run(&[gate_task(&entered, &release)], TaskPriority::Normal);
    spin_until(Duration::from_secs(10), || entered.load(Ordering::Acquire));

    // The worker is parked in the gate, so nothing drains Normal while we
    // fill it to capacity - 1. Overflow would abort the process.
    let hits = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..63)
        .map(|_| {
            let hits = Arc::clone(&hits);
            Task::new(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    let counter = pool.submit(&tasks, TaskPriority::Normal);

    release.store(true, Ordering::Release);
    pool.wait(counter);
    assert_eq!(hits.load(Ordering::Relaxed), 63);

    pool.shutdown();
}

#[test]
fn wait_on_finished_counter_returns_immediately() {
    init_logger();
    let pool = small_pool("fastpath", 1);
    pool.start().unwrap();

    let counter = pool.submit(&[Task::new(|_| {})], TaskPriority::Normal);
    spin_until(Duration::from_secs(10), || counter.finished());
    pool.wait(counter);

    pool.shutdown();
}

#[test]
fn pool_restarts_after_shutdown() {
    init_logger();
    let pool = small_pool("restart", 1);

    for round in 0..2 {
        pool.start().unwrap();
        assert!(pool.is_started());

        let hits = Arc::new(AtomicUsize::new(0));
        let task_hits = Arc::clone(&hits);
        pool.submit_and_wait(
            &[Task::new(move |_| {
                task_hits.fetch_add(1, Ordering::Relaxed);
            })],
            TaskPriority::Normal,
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1, "round {}", round);

        pool.shutdown();
        assert!(!pool.is_started());
    }
}

#[test]
fn detached_batches_complete_before_shutdown() {
    init_logger();
    let pool = small_pool("detached", 2);

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let _scope = taskpool::PoolScope::new(&pool).unwrap();
        let tasks: Vec<Task> = (0..16)
            .map(|_| {
                let hits = Arc::clone(&hits);
                Task::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        pool.run(&tasks, TaskPriority::Low);
    }

    assert_eq!(hits.load(Ordering::Relaxed), 16);
}

#[test]
fn dropping_the_handle_detaches_the_batch() {
    init_logger();
    let pool = small_pool("detach-handle", 2);
    pool.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let task_hits = Arc::clone(&hits);
    let counter = pool.submit(
        &[Task::new(move |_| {
            task_hits.fetch_add(1, Ordering::Relaxed);
        })],
        TaskPriority::Normal,
    );
    drop(counter);

    spin_until(Duration::from_secs(10), || hits.load(Ordering::Relaxed) == 1);
    pool.shutdown();
}

#[test]
fn a_panicking_task_still_completes_its_batch() {
    init_logger();
    let pool = small_pool("panicky", 1);
    pool.start().unwrap();

    let survivor = Arc::new(AtomicBool::new(false));
    let task_survivor = Arc::clone(&survivor);
    let tasks = vec![
        Task::new(|_| panic!("deliberate task failure")),
        Task::new(move |_| task_survivor.store(true, Ordering::Release)),
    ];
    // Returns at all only if the panicking task still decremented.
    pool.submit_and_wait(&tasks, TaskPriority::Normal);
    assert!(survivor.load(Ordering::Acquire));

    // The worker survives the panic and keeps scheduling.
    let after = Arc::new(AtomicBool::new(false));
    let task_after = Arc::clone(&after);
    pool.submit_and_wait(
        &[Task::new(move |_| task_after.store(true, Ordering::Release))],
        TaskPriority::Normal,
    );
    assert!(after.load(Ordering::Acquire));

    pool.shutdown();
}

#[test]
fn tasks_see_their_worker_identity() {
    init_logger();
    let pool = small_pool("named", 1);
    pool.start().unwrap();

    type Seen = (String, usize, usize, String);
    let seen: Arc<Mutex<Option<Seen>>> = Arc::new(Mutex::new(None));
    let task_seen = Arc::clone(&seen);
    pool.submit_and_wait(
        &[Task::new(move |ctx| {
            let context = thread_context::current();
            *task_seen.lock() = Some((
                context.name().to_owned(),
                context.tag(),
                ctx.worker_index(),
                ctx.pool().name().to_owned(),
            ));
        })],
        TaskPriority::Normal,
    );

    let (name, tag, worker_index, pool_name) = seen.lock().take().unwrap();
    assert_eq!(name, "named/worker#0");
    assert_eq!(tag, thread_context::WORKER_THREAD_TAG);
    assert_eq!(worker_index, 0);
    assert_eq!(pool_name, "named");

    pool.shutdown();
}

#[test]
fn global_pools_bracket_and_shortcuts() {
    init_logger();
    registry::start_all_pools().unwrap();
    assert!(thread_context::is_main_thread());
    assert_eq!(
        thread_context::current().tag(),
        thread_context::MAIN_THREAD_TAG
    );

    // Fire-and-forget shortcut onto General.
    let detached = Arc::new(AtomicUsize::new(0));
    let task_detached = Arc::clone(&detached);
    registry::async_work(
        Task::new(move |_| {
            task_detached.fetch_add(1, Ordering::Relaxed);
        }),
        TaskPriority::Normal,
    );

    // Counted submissions onto each pool.
    let hits = Arc::new(AtomicUsize::new(0));
    let make_tasks = |count: usize| -> Vec<Task> {
        (0..count)
            .map(|_| {
                let hits = Arc::clone(&hits);
                Task::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect()
    };

    let general = registry::submit_general(&make_tasks(4), TaskPriority::Normal);
    registry::general().wait(general);

    let io = registry::submit_io(&make_tasks(2), TaskPriority::Normal);
    registry::io().wait(io);

    let low = registry::submit_low_priority(&make_tasks(1), TaskPriority::Low);
    registry::low_priority().wait(low);

    assert_eq!(hits.load(Ordering::Relaxed), 7);

    // A General task may submit to IO and wait; its worker keeps serving
    // General work on a replacement fiber meanwhile.
    let crossed = Arc::new(AtomicBool::new(false));
    let task_crossed = Arc::clone(&crossed);
    let outer = Task::new(move |_| {
        let inner_crossed = Arc::clone(&task_crossed);
        let counter = registry::submit_io(
            &[Task::new(move |_| inner_crossed.store(true, Ordering::Release))],
            TaskPriority::Normal,
        );
        registry::io().wait(counter);
    });
    registry::general().submit_and_wait(&[outer], TaskPriority::Normal);
    assert!(crossed.load(Ordering::Acquire));

    spin_until(Duration::from_secs(10), || {
        detached.load(Ordering::Relaxed) == 1
    });

    registry::shutdown_all_pools();
}
