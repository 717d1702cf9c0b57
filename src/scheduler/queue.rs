//! Task records and the affinity-aware run queue
//!
//! The queue itself is a plain FIFO; the scheduler wraps it in its single
//! lock together with the lifecycle state, so nothing here synchronizes.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::worker::WorkerId;
use crate::fiber::Fiber;

/// Which workers may run a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// First available worker
    #[default]
    Any,
    /// Only the given worker
    Worker(WorkerId),
}

impl Affinity {
    /// Whether `worker` may dequeue a task with this affinity
    pub fn admits(&self, worker: WorkerId) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Worker(pinned) => *pinned == worker,
        }
    }
}

impl From<WorkerId> for Affinity {
    fn from(worker: WorkerId) -> Self {
        Affinity::Worker(worker)
    }
}

/// The work carried by a task
pub enum Runnable {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a callable on a scheduler-provided fiber
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// One unit of schedulable work plus its affinity
pub struct Task {
    runnable: Runnable,
    affinity: Affinity,
    id: usize,
}

impl Task {
    fn with_runnable(runnable: Runnable) -> Self {
        static TASK_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

        Self {
            runnable,
            affinity: Affinity::Any,
            id: TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Create a task that runs `work` on a fresh or recycled fiber
    pub fn call<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_runnable(Runnable::Call(Box::new(work)))
    }

    /// Create a task that resumes `fiber`
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self::with_runnable(Runnable::Fiber(fiber))
    }

    /// Restrict the task to the given affinity
    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// Pin the task to one worker
    pub fn pinned(self, worker: WorkerId) -> Self {
        self.with_affinity(Affinity::Worker(worker))
    }

    /// Get task ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get task affinity
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Whether the task wraps an existing fiber
    pub fn is_fiber(&self) -> bool {
        matches!(self.runnable, Runnable::Fiber(_))
    }

    pub(crate) fn as_fiber(&self) -> Option<&Arc<Fiber>> {
        match &self.runnable {
            Runnable::Fiber(fiber) => Some(fiber),
            Runnable::Call(_) => None,
        }
    }

    pub(crate) fn into_runnable(self) -> Runnable {
        self.runnable
    }

    /// Create a dummy task for testing
    #[cfg(test)]
    pub fn dummy() -> Self {
        Self::call(|| {})
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.runnable {
            Runnable::Fiber(fiber) => format!("{}", fiber.id()),
            Runnable::Call(_) => "callable".to_string(),
        };
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("runnable", &kind)
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// FIFO of tasks, scanned in order for the first one a worker may take
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    /// Take the oldest task `worker` is allowed to run.
    ///
    /// Tasks pinned to other workers keep their positions.
    pub fn pop_for(&mut self, worker: WorkerId) -> Option<Task> {
        let index = self
            .tasks
            .iter()
            .position(|task| task.affinity.admits(worker))?;
        self.tasks.remove(index)
    }

    /// Drop every queued task, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.tasks.len();
        for task in self.tasks.drain(..) {
            if let Some(fiber) = task.as_fiber() {
                fiber.release_queue();
            }
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
