//! Priority-banked task queue.

use crate::mpmc_queue::MpmcQueue;
use crate::task::{TaskPriority, TaskQueued};

/// One bounded MPMC queue per priority level.
///
/// Capacity is per level, not total. Dequeue scans levels highest-first and
/// takes the first hit, which gives strict priority across levels and FIFO
/// within one. `is_empty` reads the levels one after another, so a
/// transient "not empty" across a concurrent mutation is possible; callers
/// needing certainty must quiesce the producers first.
pub(crate) struct TaskPriorityQueue {
    by_priority: [MpmcQueue<TaskQueued>; TaskPriority::COUNT],
}

impl TaskPriorityQueue {
    pub fn with_capacity(capacity: usize) -> TaskPriorityQueue {
        TaskPriorityQueue {
            by_priority: std::array::from_fn(|_| MpmcQueue::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.by_priority[0].capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.by_priority.iter().all(MpmcQueue::is_empty)
    }

    pub fn push(&self, task: TaskQueued, priority: TaskPriority) -> Result<(), TaskQueued> {
        self.by_priority[priority as usize].push(task)
    }

    pub fn pop(&self) -> Option<TaskQueued> {
        self.by_priority.iter().find_map(MpmcQueue::pop)
    }
}
