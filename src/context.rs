//! Per-thread execution context
//!
//! Every OS thread carries one `ThreadContext` in native thread-local storage.
//! It records the fiber currently executing on the thread, the scheduler and
//! worker slot the thread belongs to (if any), and the thread's logical name.
//! Only the owning thread ever touches its context, so no locking is needed.

use std::cell::RefCell;
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::scheduler::{Handle, WorkerId};

#[derive(Default)]
struct ThreadContext {
    fiber: Option<Arc<Fiber>>,
    scheduler: Option<Handle>,
    worker: Option<WorkerId>,
    name: Option<String>,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

/// Fiber currently executing on this thread
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.borrow().fiber.clone())
}

/// Install `fiber` as the current fiber and hand back the previous one.
///
/// The borrow is released before returning; callers switch stacks afterwards.
pub(crate) fn replace_fiber(fiber: Option<Arc<Fiber>>) -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().fiber, fiber))
}

impl ThreadContext {
    /// Forget a binding whose scheduler was dropped, possibly on another thread
    fn prune(&mut self) {
        if self.scheduler.as_ref().is_some_and(Handle::is_released) {
            self.scheduler = None;
            self.worker = None;
        }
    }
}

/// Scheduler the calling thread works for
pub(crate) fn current_scheduler() -> Option<Handle> {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.prune();
        ctx.scheduler.clone()
    })
}

/// Worker slot of the calling thread
pub(crate) fn current_worker() -> Option<WorkerId> {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.prune();
        ctx.worker
    })
}

/// Bind the calling thread to a scheduler without entering a worker loop.
///
/// Used by use-caller schedulers on their constructing thread.
pub(crate) fn bind_scheduler(handle: Handle, worker: WorkerId) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.scheduler = Some(handle);
        ctx.worker = Some(worker);
    });
}

/// Remove the binding installed by [`bind_scheduler`] if it still points at `handle`.
pub(crate) fn unbind_scheduler(handle: &Handle) {
    let _ = CONTEXT.try_with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.scheduler.as_ref().is_some_and(|h| h.same_scheduler(handle)) {
            ctx.scheduler = None;
            ctx.worker = None;
        }
    });
}

/// Restores the previous scheduler binding when a worker loop ends
pub(crate) struct WorkerGuard {
    scheduler: Option<Handle>,
    worker: Option<WorkerId>,
}

/// Mark the calling thread as running the worker loop of `handle` in slot `worker`.
pub(crate) fn enter_worker(handle: Handle, worker: WorkerId) -> WorkerGuard {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        WorkerGuard {
            scheduler: ctx.scheduler.replace(handle),
            worker: ctx.worker.replace(worker),
        }
    })
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let scheduler = self.scheduler.take();
        let worker = self.worker.take();
        let _ = CONTEXT.try_with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            ctx.scheduler = scheduler;
            ctx.worker = worker;
        });
    }
}

/// Logical name of the calling thread, if one was assigned
pub(crate) fn thread_name() -> Option<String> {
    CONTEXT.with(|ctx| ctx.borrow().name.clone())
}

pub(crate) fn set_thread_name(name: &str) {
    CONTEXT.with(|ctx| ctx.borrow_mut().name = Some(name.to_string()));
}
