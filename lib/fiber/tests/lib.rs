use fiber::Fiber;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn basic_usage() {
    let fiber = Fiber::new(64 * 1024, |suspended: Fiber| {
        unsafe {
            suspended.resume();
        }
        unreachable!("fiber resumed after its final switch");
    });

    let released = unsafe { fiber.resume() };
    assert_eq!(released, fiber);

    unsafe {
        fiber.destroy();
    }
}

#[test]
fn thread_fiber_identity() {
    let thread = fiber::init();
    assert_eq!(fiber::current(), Some(thread));
    assert_eq!(fiber::thread_fiber(), Some(thread));

    let observed = Arc::new(AtomicUsize::new(0));
    let in_fiber = Arc::clone(&observed);
    let fiber = Fiber::new(64 * 1024, move |suspended: Fiber| {
        // Inside the fiber the thread anchor is unchanged, but the running
        // fiber is us.
        assert_eq!(fiber::thread_fiber(), Some(suspended));
        assert_ne!(fiber::current(), Some(suspended));
        in_fiber.store(1, Ordering::SeqCst);
        unsafe {
            suspended.resume();
        }
        unreachable!();
    });

    unsafe {
        fiber.resume();
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(fiber::current(), Some(thread));

    unsafe {
        fiber.destroy();
    }
}

#[test]
fn resume_returns_into_suspended_frame() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let fiber_log = Arc::clone(&log);
    let fiber = Fiber::new(64 * 1024, move |prev: Fiber| {
        fiber_log.lock().unwrap().push("first");
        let prev = unsafe { prev.resume() };
        // Resumed a second time: execution continues right here.
        fiber_log.lock().unwrap().push("second");
        unsafe {
            prev.resume();
        }
        unreachable!();
    });

    log.lock().unwrap().push("main:0");
    unsafe {
        fiber.resume();
    }
    log.lock().unwrap().push("main:1");
    unsafe {
        fiber.resume();
    }
    log.lock().unwrap().push("main:2");

    assert_eq!(
        *log.lock().unwrap(),
        vec!["main:0", "first", "main:1", "second", "main:2"]
    );

    unsafe {
        fiber.destroy();
    }
}

#[test]
fn destroy_without_running() {
    // A fiber that was never resumed still owns its entry closure; dropping
    // it must not leak or invoke the entry.
    let ran = Arc::new(AtomicUsize::new(0));
    let in_fiber = Arc::clone(&ran);
    let fiber = Fiber::new(64 * 1024, move |_: Fiber| {
        in_fiber.store(1, Ordering::SeqCst);
        unreachable!();
    });

    unsafe {
        fiber.destroy();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
