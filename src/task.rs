//! Tasks and their priorities.

use crate::counter::TaskCounter;
use crate::pool::TaskPool;
use std::fmt;
use std::sync::Arc;

/// Scheduling priority of a submitted batch.
///
/// Levels are strict: a pool's workers fully drain a level before touching
/// the one below it, so a `Low` task can be overtaken by any number of
/// later, higher-priority submissions. Within one level dispatch is FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TaskPriority {
    Highest,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    pub const COUNT: usize = 4;

    /// All levels, highest first; the dequeue scan order.
    pub const ALL: [TaskPriority; TaskPriority::COUNT] = [
        TaskPriority::Highest,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

/// What a running task gets to see of its surroundings.
pub struct TaskContext {
    pool: TaskPool,
    worker_index: usize,
}

impl TaskContext {
    pub(crate) fn new(pool: TaskPool, worker_index: usize) -> TaskContext {
        TaskContext { pool, worker_index }
    }

    /// The pool this task is executing on. Submitting (and waiting) from
    /// here is the supported way to fan out sub-work.
    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Index of the worker thread running this task.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }
}

/// An erased unit of work.
///
/// Tasks are copied by value into the scheduling queues, so the callable is
/// reference-counted and must own (or reference externally-lived) data. A
/// task must not outlive its pool.
#[derive(Clone)]
pub struct Task(Arc<dyn Fn(&TaskContext) + Send + Sync + 'static>);

impl Task {
    pub fn new<F>(body: F) -> Task
    where
        F: Fn(&TaskContext) + Send + Sync + 'static,
    {
        Task(Arc::new(body))
    }

    pub(crate) fn invoke(&self, context: &TaskContext) {
        (self.0)(context);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:p})", Arc::as_ptr(&self.0))
    }
}

/// A task as it sits in a pool's priority queue, paired with the completion
/// counter of its batch (`None` for detached submissions).
pub(crate) struct TaskQueued {
    pub task: Task,
    pub counter: Option<Arc<TaskCounter>>,
}
