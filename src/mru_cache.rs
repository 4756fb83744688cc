//! Small per-thread most-recently-used cache.
//!
//! Sits in the wait/resume hot path to recycle fibers and counters without
//! touching the allocator or any shared structure. The cache is a circular
//! buffer indexed by two monotonically moving cursors: releases stack up at
//! the head, acquisitions pop the head (most recent first), and an overflow
//! evicts the oldest entry at the tail for the caller to dispose of.
//!
//! A cache belongs to exactly one thread. Debug builds remember the owning
//! thread and assert on every access; there is no synchronization here at
//! all.

pub struct MruCache<T, const N: usize> {
    head: usize,
    tail: usize,
    slots: [Option<T>; N],
    #[cfg(debug_assertions)]
    owner: std::thread::ThreadId,
}

impl<T, const N: usize> MruCache<T, N> {
    pub fn new() -> MruCache<T, N> {
        assert!(
            N >= 2 && N.is_power_of_two(),
            "MRU cache dimension must be a power of two >= 2"
        );
        MruCache {
            head: 0,
            tail: 0,
            slots: std::array::from_fn(|_| None),
            #[cfg(debug_assertions)]
            owner: std::thread::current().id(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    /// Takes the most recently released entry, if any.
    pub fn get(&mut self) -> Option<T> {
        self.check_owner();

        if self.head == self.tail {
            return None;
        }

        self.head -= 1;
        let value = self.slots[self.head & (N - 1)].take();
        debug_assert!(value.is_some());
        value
    }

    /// Stores `value` as the most recent entry.
    ///
    /// When the cache is full the oldest entry is evicted and returned; the
    /// caller must dispose of it (the cache never destroys entries itself).
    pub fn release(&mut self, value: T) -> Option<T> {
        self.check_owner();
        debug_assert!(self.head - self.tail <= N);

        let evicted = if self.head - self.tail == N {
            let evicted = self.slots[self.tail & (N - 1)].take();
            self.tail += 1;
            debug_assert!(evicted.is_some());
            evicted
        } else {
            None
        };

        debug_assert!(self.slots[self.head & (N - 1)].is_none());
        self.slots[self.head & (N - 1)] = Some(value);
        self.head += 1;

        evicted
    }

    /// Resets the cursors after the owner has drained every entry.
    pub fn clear_assume_empty(&mut self) {
        self.check_owner();
        debug_assert!(
            self.slots.iter().all(Option::is_none),
            "MRU cache cleared while entries are still cached"
        );
        self.head = 0;
        self.tail = 0;
    }

    #[cfg(debug_assertions)]
    fn check_owner(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.owner,
            "MRU cache accessed from a thread that does not own it"
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_owner(&self) {}
}

impl<T, const N: usize> Default for MruCache<T, N> {
    fn default() -> MruCache<T, N> {
        MruCache::new()
    }
}
