//! Batch completion counters.

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Counts the unfinished tasks of one submitted batch.
///
/// The submitter initializes it to the batch size, every completing task
/// decrements it once, and the (single) waiter polls [`finished`]. Counters
/// are recycled through the per-thread MRU cache via [`reset`], which makes
/// a reused counter indistinguishable from a fresh one.
///
/// [`finished`]: TaskCounter::finished
/// [`reset`]: TaskCounter::reset
pub struct TaskCounter {
    count: AtomicIsize,
}

impl TaskCounter {
    pub(crate) fn new(count: usize) -> TaskCounter {
        assert!(count > 0, "task counter initialized to zero");
        TaskCounter {
            count: AtomicIsize::new(count as isize),
        }
    }

    /// Marks one task of the batch complete.
    pub(crate) fn decrement(&self) {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "task counter decremented past zero");
    }

    /// True once every task of the batch has decremented.
    pub fn finished(&self) -> bool {
        let count = self.count.load(Ordering::Acquire);
        debug_assert!(count >= 0);
        count == 0
    }

    /// Re-arms a finished counter for a new batch of `count` tasks.
    pub(crate) fn reset(&self, count: usize) {
        debug_assert!(self.finished(), "reset of an unfinished task counter");
        assert!(count > 0, "task counter reset to zero");
        self.count.store(count as isize, Ordering::Release);
    }
}

impl Drop for TaskCounter {
    fn drop(&mut self) {
        debug_assert!(
            self.finished(),
            "task counter dropped while tasks are outstanding"
        );
    }
}

impl fmt::Debug for TaskCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCounter")
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

/// The completion token handed out by [`TaskPool::submit`].
///
/// Move it into [`TaskPool::wait`] to suspend until the batch finishes, or
/// drop it to detach: every queued task holds its own reference to the
/// counter, so a detached batch still runs and completes safely.
///
/// [`TaskPool::submit`]: crate::TaskPool::submit
/// [`TaskPool::wait`]: crate::TaskPool::wait
#[derive(Debug)]
pub struct CounterHandle(pub(crate) Arc<TaskCounter>);

impl CounterHandle {
    /// Non-blocking completion probe.
    pub fn finished(&self) -> bool {
        self.0.finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_to_finished() {
        let counter = TaskCounter::new(3);
        assert!(!counter.finished());
        counter.decrement();
        counter.decrement();
        assert!(!counter.finished());
        counter.decrement();
        assert!(counter.finished());
    }

    #[test]
    fn reset_rearms() {
        let counter = TaskCounter::new(1);
        counter.decrement();
        assert!(counter.finished());

        counter.reset(2);
        assert!(!counter.finished());
        counter.decrement();
        counter.decrement();
        assert!(counter.finished());
    }
}
