//! Per-thread identity: a name, a tag and the OS thread id.
//!
//! The main thread registers itself once at process start; worker threads
//! register through a [`ThreadContextScope`] for their lifetime. Threads
//! that never registered still get a usable (synthesized) context, so
//! logging call sites don't have to care.

use std::cell::RefCell;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

pub const MAIN_THREAD_TAG: usize = 0;
pub const WORKER_THREAD_TAG: usize = 1;
/// Threads that never registered a context (user threads calling into the
/// pools, test harness threads, ...).
pub const EXTERNAL_THREAD_TAG: usize = 2;

/// Names longer than this are truncated on registration.
pub const THREAD_NAME_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct ThreadContext {
    name: String,
    tag: usize,
    id: ThreadId,
}

impl ThreadContext {
    fn new(name: &str, tag: usize) -> ThreadContext {
        let mut name = name.to_owned();
        if name.len() > THREAD_NAME_CAPACITY {
            let mut end = THREAD_NAME_CAPACITY;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }
        ThreadContext {
            name,
            tag,
            id: thread::current().id(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> usize {
        self.tag
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<ThreadContext>> = RefCell::new(None);
}

static MAIN_THREAD: OnceLock<ThreadId> = OnceLock::new();

/// Registers the calling thread as the process main thread.
///
/// Idempotent on the same thread; the first caller wins. Called by
/// `registry::start_all_pools()`, which is expected to run on the main
/// thread during bootstrap.
pub fn init_main_thread() {
    let id = thread::current().id();
    let registered = *MAIN_THREAD.get_or_init(|| id);
    if registered != id {
        log::warn!("init_main_thread() called again from a different thread; keeping the first");
        return;
    }

    CONTEXT.with(|context| {
        let mut context = context.borrow_mut();
        if context.is_none() {
            *context = Some(ThreadContext::new("main", MAIN_THREAD_TAG));
        }
    });
}

/// True on the thread that called [`init_main_thread`] first.
pub fn is_main_thread() -> bool {
    MAIN_THREAD.get() == Some(&thread::current().id())
}

/// A read-only view of the calling thread's context.
///
/// Unregistered threads get a context synthesized from the std thread name
/// with [`EXTERNAL_THREAD_TAG`].
pub fn current() -> ThreadContext {
    CONTEXT.with(|context| {
        let mut context = context.borrow_mut();
        context
            .get_or_insert_with(|| {
                let std_thread = thread::current();
                let name = std_thread.name().unwrap_or("<unnamed>");
                let tag = if is_main_thread() {
                    MAIN_THREAD_TAG
                } else {
                    EXTERNAL_THREAD_TAG
                };
                ThreadContext::new(name, tag)
            })
            .clone()
    })
}

/// Entry/exit bracket registering a spawned thread's context for the
/// thread's lifetime.
pub struct ThreadContextScope(());

impl ThreadContextScope {
    pub fn new(name: &str, tag: usize) -> ThreadContextScope {
        CONTEXT.with(|context| {
            let mut context = context.borrow_mut();
            debug_assert!(
                context.is_none(),
                "thread context registered twice on one thread"
            );
            *context = Some(ThreadContext::new(name, tag));
        });
        ThreadContextScope(())
    }
}

impl Drop for ThreadContextScope {
    fn drop(&mut self) {
        CONTEXT.with(|context| {
            *context.borrow_mut() = None;
        });
    }
}
