//! Bounded multi-producer multi-consumer queue.
//!
//! Dmitry Vyukov's bounded MPMC ring:
//! http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue
//!
//! Each slot carries a sequence counter that encodes whether the slot is
//! ready for the next producer or the next consumer; producers and
//! consumers race on their own cursor with a weak CAS and never touch each
//! other's. Both operations fail fast instead of blocking: `push` hands the
//! value back when the ring is full, `pop` returns `None` when it is empty.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct MpmcQueue<T> {
    buffer: Box<[CachePadded<Slot<T>>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// The queue hands each value from exactly one producer to exactly one
// consumer; no `&T` is ever shared between threads.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a queue with room for `capacity` elements.
    ///
    /// `capacity` must be a power of two >= 2; the sequence scheme relies
    /// on the cursor wrapping being a multiple of the ring size.
    pub fn with_capacity(capacity: usize) -> MpmcQueue<T> {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "MPMC queue capacity must be a power of two >= 2, got {}",
            capacity
        );

        let buffer = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    sequence: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect();

        MpmcQueue {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// True when no element is currently published.
    ///
    /// Observed from two relaxed loads; callers that need a stable answer
    /// must provide their own quiescence (e.g. after workers have joined).
    pub fn is_empty(&self) -> bool {
        self.enqueue_pos.load(Ordering::Relaxed) == self.dequeue_pos.load(Ordering::Relaxed)
    }

    /// Publishes `value`, or returns it when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos) as isize;

            if dif == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if dif < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Takes the oldest published element, or `None` when the queue is
    /// empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if dif == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "MPMC queue dropped while not empty");
        // Unconsumed elements still need their destructors in case the
        // owner is unwinding past the emptiness contract.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = MpmcQueue::with_capacity(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_when_full() {
        let queue = MpmcQueue::with_capacity(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.push(99), Err(99));

        assert_eq!(queue.pop(), Some(0));
        queue.push(99).unwrap();

        for expected in [1, 2, 3, 99] {
            assert_eq!(queue.pop(), Some(expected));
        }
    }

    #[test]
    fn cursor_wraparound() {
        let queue = MpmcQueue::with_capacity(4);
        for round in 0..100 {
            for i in 0..3 {
                queue.push(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(queue.pop(), Some(round * 10 + i));
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn drops_non_copy_values() {
        let queue = MpmcQueue::with_capacity(4);
        queue.push(String::from("left over")).unwrap();
        assert_eq!(queue.pop().as_deref(), Some("left over"));
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PER_PRODUCER: usize = 10_000;
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;

        let queue = Arc::new(MpmcQueue::with_capacity(128));
        let total = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let popped = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 1..=PER_PRODUCER {
                    let mut value = i;
                    loop {
                        match queue.push(value) {
                            Ok(()) => break,
                            Err(rejected) => {
                                value = rejected;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let total = Arc::clone(&total);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || {
                while popped.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                    if let Some(value) = queue.pop() {
                        total.fetch_add(value, Ordering::Relaxed);
                        popped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = PRODUCERS * (PER_PRODUCER * (PER_PRODUCER + 1) / 2);
        assert_eq!(total.load(Ordering::Relaxed), expected);
        assert!(queue.is_empty());
    }
}
