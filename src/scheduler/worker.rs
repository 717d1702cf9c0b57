//! Worker loop
//!
//! Every worker, spawned or running on the caller's root fiber, executes
//! [`run`]: take the next task this worker may run, resume its fiber, put
//! the fiber back if it yielded, and fall back to the idle fiber when the
//! queue has nothing for it. The loop ends once the idle fiber observes that
//! stopping has begun and all work has drained.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::core::{Handle, Shared};
use super::queue::{Runnable, Task};
use crate::context;
use crate::error::Error;
use crate::fiber::{Fiber, FiberState};
use crate::thread::Thread;

/// Identity of a worker slot within one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// Get the numeric ID
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker slot of the calling thread, if it runs a scheduler loop
pub fn current_worker() -> Option<WorkerId> {
    context::current_worker()
}

/// Broken scheduler invariants inside the loop have no caller to report to.
///
/// Unwinding only this worker would leave its in-flight task counted forever
/// and `stop()` waiting on it, so the whole process goes down.
fn fatal(err: Error) -> ! {
    log::error!("{}: {}", Thread::current_name(), err);
    eprintln!("fatal: {}: {}", Thread::current_name(), err);
    std::process::abort()
}

/// Main worker loop
pub(crate) fn run(shared: &Arc<Shared>, worker: WorkerId) {
    let _context = context::enter_worker(Handle::new(Arc::clone(shared)), worker);

    #[cfg(target_os = "linux")]
    if shared.config().enable_cpu_affinity {
        set_cpu_affinity(worker.as_usize() % num_cpus::get());
    }

    log::debug!("{} entering loop as {}", Thread::current_name(), worker);

    let idle = Fiber::with_stack_size(idle_loop(Arc::clone(shared)), shared.config().stack_size)
        .unwrap_or_else(|e| fatal(e));
    let mut recycled: Option<Arc<Fiber>> = None;

    loop {
        if let Some(task) = shared.next_task(worker) {
            execute(shared, task, &mut recycled);
            continue;
        }

        if idle.is_terminal() {
            break;
        }
        shared.enter_idle();
        let outcome = idle.resume();
        shared.leave_idle();
        match outcome {
            Ok(state) if state.is_terminal() => break,
            Ok(_) => {}
            Err(e) => fatal(e),
        }
    }

    log::debug!("{} leaving loop as {}", Thread::current_name(), worker);
}

/// Body of the per-worker idle fiber
fn idle_loop(shared: Arc<Shared>) -> impl FnOnce() + Send + 'static {
    move || {
        let timeout = Duration::from_millis(shared.config().park_timeout_ms);
        while !shared.is_drained() {
            shared.tickler().idle(timeout);
            if Fiber::yield_now().is_err() {
                break;
            }
        }
    }
}

/// Resume one task's fiber and hand the outcome back to the scheduler.
///
/// The fiber keeps its queue slot while this worker drives it, so a yielded
/// fiber is requeued here exactly once, with the task's original affinity.
fn execute(shared: &Shared, task: Task, recycled: &mut Option<Arc<Fiber>>) {
    let affinity = task.affinity();
    let (fiber, from_call) = match task.into_runnable() {
        Runnable::Fiber(fiber) => (fiber, false),
        Runnable::Call(work) => (fiber_for_call(shared, recycled.take(), work), true),
    };

    let state = match fiber.resume_if_idle() {
        Ok(Some(state)) => state,
        Ok(None) => {
            // Resumed directly by code outside the scheduler; that resumer
            // owns the fiber until it yields.
            log::warn!(
                "dropping queue entry of {}: running outside the scheduler",
                fiber.id()
            );
            fiber.release_queue();
            shared.finish(None, None);
            return;
        }
        Err(e) => {
            log::warn!("skipping {}: {}", fiber.id(), e);
            fiber.release_queue();
            shared.finish(None, None);
            return;
        }
    };

    match state {
        FiberState::Hold | FiberState::Ready => {
            fiber.mark_ready();
            shared.finish(Some(Task::fiber(fiber).with_affinity(affinity)), Some(state));
        }
        FiberState::Term | FiberState::Except => {
            fiber.release_queue();
            if from_call {
                *recycled = Some(fiber);
            }
            shared.finish(None, Some(state));
        }
        FiberState::Init | FiberState::Exec => fatal(Error::invariant(format!(
            "{} returned to the scheduler in state {}",
            fiber.id(),
            state
        ))),
    }
}

/// Reuse the worker's last finished callable fiber when nobody else holds it
fn fiber_for_call(
    shared: &Shared,
    recycled: Option<Arc<Fiber>>,
    work: Box<dyn FnOnce() + Send + 'static>,
) -> Arc<Fiber> {
    let fiber = match recycled {
        Some(fiber) if Arc::strong_count(&fiber) == 1 && fiber.is_terminal() => {
            fiber.reset(work).unwrap_or_else(|e| fatal(e));
            fiber
        }
        _ => Fiber::with_stack_size(work, shared.config().stack_size).unwrap_or_else(|e| fatal(e)),
    };
    // Nobody else can see this fiber yet, so the slot is always free.
    fiber.claim_queue();
    fiber
}

/// Set CPU affinity for the current thread (Linux only)
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_cpu_affinity(cpu: usize) {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    // SAFETY: `set` is a zeroed, properly sized cpu_set_t owned by this frame.
    let rc = unsafe {
        let mut set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);
        sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set)
    };
    if rc != 0 {
        log::warn!("{} could not be pinned to cpu {}", Thread::current_name(), cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
        assert_eq!(WorkerId(3).as_usize(), 3);
    }

    #[test]
    fn test_current_worker_outside_scheduler() {
        assert_eq!(current_worker(), None);
    }

    #[test]
    fn test_callable_fibers_are_recycled() {
        let scheduler = Scheduler::new(1, false, "recycle").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            let seen = Arc::clone(&seen);
            scheduler
                .spawn(move || {
                    seen.lock().push(crate::fiber::current_id());
                })
                .unwrap();
        }
        scheduler.start().unwrap();
        scheduler.stop().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|id| *id == seen[0]));
    }

    #[test]
    fn test_yielding_callable_gets_another_turn() {
        let scheduler = Scheduler::new(1, false, "requeue").unwrap();
        let turns = Arc::new(AtomicUsize::new(0));
        let turns_clone = Arc::clone(&turns);
        scheduler
            .spawn(move || {
                for _ in 0..3 {
                    turns_clone.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now().unwrap();
                }
                turns_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.start().unwrap();
        scheduler.stop().unwrap();
        assert_eq!(turns.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.stats().tasks_completed, 1);
    }

    #[test]
    fn test_worker_reports_its_identity() {
        let scheduler = Scheduler::with_config(SchedulerConfig {
            threads: 2,
            name: "ident".to_string(),
            ..Default::default()
        })
        .unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        scheduler
            .spawn_on(WorkerId(1), move || {
                *seen_clone.lock() = Some((current_worker(), Thread::current_name()));
            })
            .unwrap();

        scheduler.start().unwrap();
        scheduler.stop().unwrap();
        assert_eq!(
            seen.lock().take(),
            Some((Some(WorkerId(1)), "ident_1".to_string()))
        );
    }
}
