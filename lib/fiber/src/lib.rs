//! A library for creating and switching between fibers.
//!
//! Fibers are threads that must be manually scheduled by the client
//! application, as opposed to OS threads which are scheduled preemptively by
//! the kernel. Each fiber has its own stack and yields its time on the
//! system thread to another fiber only at explicit switch points. This
//! library is meant to be the base for a fiber-pool scheduler in which a
//! set of worker fibers cooperatively drain work queues.
//!
//! # Fibers and Threads
//!
//! Fibers run on top of system threads, with exactly one fiber running per
//! thread at a time. Before a thread can run fibers it must be converted
//! into one with [`init`]; the resulting *thread fiber* is the anchor the
//! thread falls back to and lives until [`shutdown`]. Once a fiber has been
//! suspended it can be resumed on any thread of the process, not just the
//! one it last ran on, so thread-affine state (`Rc`, lock guards, raw
//! pointers into TLS) must never be held across a switch.
//!
//! # Unsafety
//!
//! Switching fibers moves stack-owned data between threads and transfers
//! control in a way the borrow checker cannot see, so [`Fiber::resume`] and
//! [`Fiber::destroy`] are unsafe. The cardinal rules: never resume a fiber
//! that is already running, never resume the same suspended fiber from two
//! threads, and never destroy a fiber that will run again. A fiber's entry
//! function must not return; a fiber terminates only by switching away for
//! the last time, after which its owner destroys it.

use std::cell::Cell;
use std::fmt;
use std::process;

#[cfg(target_os = "linux")]
#[path = "platform/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "platform/windows.rs"]
mod platform;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("fiber: no backend for this target");

use platform::PlatformId;

pub(crate) type EntryFn = Box<dyn FnOnce(Fiber) + Send + 'static>;

/// Stacks smaller than this are rounded up by [`Fiber::new`].
pub const MIN_STACK_SIZE: usize = 32 * 1024;

thread_local! {
    /// The anchor fiber this thread was converted into by `init()`.
    static THREAD: Cell<Option<PlatformId>> = Cell::new(None);
    /// The fiber currently executing on this thread.
    static CURRENT: Cell<Option<PlatformId>> = Cell::new(None);
    /// The fiber that was executing just before the last switch on this
    /// thread. Read by the resumed side to learn who yielded to it.
    static PREV: Cell<Option<PlatformId>> = Cell::new(None);
}

/// A handle to a fiber with its own stack and execution state.
///
/// Handles are plain copyable identifiers; creating, resuming and
/// destroying the underlying context are separate concerns, which lets a
/// scheduler stash handles in wait records and recycling caches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fiber(PlatformId);

// A `Fiber` wraps a raw pointer, so it isn't `Send`/`Sync` by default.
// Moving handles between threads is the whole point -- a suspended fiber is
// resumed on whichever thread picks it up -- and the handle can't be used
// for anything dangerous without `unsafe`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:p})", self.0)
    }
}

/// Converts the current thread into its thread fiber, making it safe to
/// resume fibers from this thread.
///
/// Idempotent: calling `init()` on an already-converted thread returns the
/// existing thread fiber.
pub fn init() -> Fiber {
    if let Some(existing) = THREAD.with(|t| t.get()) {
        return Fiber(existing);
    }

    let id = platform::init_thread();
    THREAD.with(|t| t.set(Some(id)));
    CURRENT.with(|c| c.set(Some(id)));
    Fiber(id)
}

/// Tears down the thread fiber created by [`init`].
///
/// Must be called with the thread fiber running (i.e. not from inside some
/// other fiber), and no fiber may be resumed from this thread afterwards.
pub fn shutdown() {
    let thread = THREAD
        .with(|t| t.take())
        .expect("fiber::shutdown() on a thread that was never initialized");
    let current = CURRENT.with(|c| c.take());
    assert_eq!(
        current,
        Some(thread),
        "fiber::shutdown() must run on the thread fiber"
    );
    PREV.with(|p| p.set(None));

    unsafe {
        platform::destroy_thread(thread);
    }
}

/// Returns the fiber currently executing on this thread, or `None` if the
/// thread has not been initialized for fiber use.
pub fn current() -> Option<Fiber> {
    CURRENT.with(|c| c.get()).map(Fiber)
}

/// Returns this thread's anchor fiber, or `None` before [`init`].
pub fn thread_fiber() -> Option<Fiber> {
    THREAD.with(|t| t.get()).map(Fiber)
}

impl Fiber {
    /// Creates a suspended fiber that will run `entry` once resumed.
    ///
    /// `entry` receives the handle of the fiber that was running just
    /// before the first switch into the new fiber. It must never return;
    /// returning from a fiber's entry aborts the process, because there is
    /// no caller to return to. A fiber ends its life by resuming another
    /// fiber for the last time, leaving its owner to [`destroy`] it.
    ///
    /// [`destroy`]: Fiber::destroy
    pub fn new<F>(stack_size: usize, entry: F) -> Fiber
    where
        F: FnOnce(Fiber) + Send + 'static,
    {
        let stack_size = stack_size.max(MIN_STACK_SIZE);
        Fiber(platform::create_fiber(stack_size, Box::new(entry)))
    }

    /// Suspends the current fiber and makes `self` active in its place.
    ///
    /// Returns once another fiber switches back to the caller, yielding the
    /// handle of the fiber that was running immediately before the switch
    /// back. Initializes the thread on first use.
    ///
    /// # Safety
    ///
    /// `self` must be suspended (or never started) and must not be resumed
    /// concurrently from another thread. Nothing thread-affine may be live
    /// across this call: the caller may wake up on a different OS thread.
    pub unsafe fn resume(self) -> Fiber {
        let prev = match CURRENT.with(|c| c.get()) {
            Some(id) => id,
            None => init().0,
        };
        assert_ne!(prev, self.0, "a fiber cannot resume itself");

        CURRENT.with(|c| c.set(Some(self.0)));
        PREV.with(|p| p.set(Some(prev)));

        platform::switch(prev, self.0);

        // This is explicitly a different scope than before the switch. No
        // assumption made earlier still holds -- not even which OS thread
        // we are on -- so only the freshly-read thread-locals are used.
        {
            let prev = PREV
                .with(|p| p.get())
                .expect("PREV unset after a fiber switch");
            Fiber(prev)
        }
    }

    /// Releases the fiber's stack and context.
    ///
    /// # Safety
    ///
    /// `self` must not be running on any thread and must never be resumed
    /// again. Destroying a suspended fiber does not unwind its stack, so
    /// any values still owned by frames on that stack are leaked; schedulers
    /// must only destroy fibers parked at points that hold nothing.
    pub unsafe fn destroy(self) {
        debug_assert_ne!(Some(self), current(), "destroying the running fiber");
        debug_assert_ne!(
            Some(self),
            thread_fiber(),
            "destroying the thread fiber; use fiber::shutdown()"
        );
        platform::destroy_fiber(self.0);
    }
}

/// Shared first-entry path for all platform trampolines. `CURRENT` and
/// `PREV` were set by the `resume()` that switched here.
pub(crate) fn fiber_main() -> ! {
    let this = CURRENT
        .with(|c| c.get())
        .expect("fiber entered with no CURRENT set");
    let prev = PREV
        .with(|p| p.get())
        .expect("fiber entered with no PREV set");

    let entry = unsafe { platform::take_entry(this) };
    entry(Fiber(prev));

    // There is no frame to return into below a fiber entry; falling off the
    // end here means the scheduler above lost track of this fiber.
    log::error!("fiber entry returned instead of switching away");
    process::abort();
}
