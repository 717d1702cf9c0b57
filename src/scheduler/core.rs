//! Scheduler coordination
//!
//! Owns the worker threads and the shared task queue, and drives the
//! `Created → Started → Stopping → Stopped` lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use super::queue::{Affinity, Task, TaskQueue};
use super::tickle::{ParkTickle, Tickle};
use super::worker::{self, WorkerId};
use crate::context;
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberState};
use crate::thread::Thread;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers, including the caller thread in use-caller mode
    pub threads: usize,
    /// Run one worker on the constructing thread instead of spawning it
    pub use_caller: bool,
    /// Scheduler name; worker threads are named `{name}_{index}`
    pub name: String,
    /// Stack size in bytes for fibers the scheduler creates
    pub stack_size: usize,
    /// Longest an idle worker parks before re-checking the queue
    pub park_timeout_ms: u64,
    /// Pin worker `i` to CPU `i % ncpu` (Linux only)
    pub enable_cpu_affinity: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            use_caller: false,
            name: "scheduler".to_string(),
            stack_size: fiber::default_stack_size(),
            park_timeout_ms: 10,
            enable_cpu_affinity: false,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::config("scheduler needs at least one thread"));
        }
        if self.stack_size < fiber::MIN_STACK_SIZE {
            return Err(Error::config(format!(
                "fiber stack size {} is below the minimum of {} bytes",
                self.stack_size,
                fiber::MIN_STACK_SIZE
            )));
        }
        if self.park_timeout_ms == 0 {
            return Err(Error::config("park timeout must be positive"));
        }
        Ok(())
    }
}

/// Lifecycle of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// Constructed; tasks may be queued but nothing runs yet
    Created,
    /// Workers are running
    Started,
    /// `stop()` began; queued and in-flight work is draining
    Stopping,
    /// All workers joined
    Stopped,
}

impl SchedulerState {
    /// Whether new work is refused
    pub fn is_stopping(self) -> bool {
        matches!(self, SchedulerState::Stopping | SchedulerState::Stopped)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Created => "CREATED",
            SchedulerState::Started => "STARTED",
            SchedulerState::Stopping => "STOPPING",
            SchedulerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `schedule`
    pub tasks_scheduled: usize,
    /// Task fibers that reached `Term` or `Except`
    pub tasks_completed: usize,
    /// Task fibers that ended in `Except`
    pub fibers_faulted: usize,
    /// Workers currently running a task
    pub active_workers: usize,
    /// Workers currently sitting in their idle fiber
    pub idle_workers: usize,
}

#[derive(Default)]
struct StatsInternal {
    tasks_scheduled: AtomicUsize,
    tasks_completed: AtomicUsize,
    fibers_faulted: AtomicUsize,
}

/// Everything guarded by the scheduler lock
struct Locked {
    queue: TaskQueue,
    state: SchedulerState,
    /// Tasks popped but not yet finished
    active: usize,
}

/// State shared by the scheduler handle and its workers
pub(crate) struct Shared {
    config: SchedulerConfig,
    locked: Mutex<Locked>,
    tickle: Arc<dyn Tickle>,
    idle_workers: AtomicUsize,
    stats: StatsInternal,
    /// The owning `Scheduler` was dropped; thread bindings to it are stale
    released: AtomicBool,
}

impl Shared {
    pub(super) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(super) fn tickler(&self) -> &dyn Tickle {
        self.tickle.as_ref()
    }

    fn state(&self) -> SchedulerState {
        self.locked.lock().state
    }

    fn check(&self, task: &Task) -> Result<()> {
        if let Affinity::Worker(id) = task.affinity() {
            if id.as_usize() >= self.config.threads {
                return Err(Error::UnknownWorker {
                    id: id.as_usize(),
                    workers: self.config.threads,
                });
            }
        }
        if let Some(fiber) = task.as_fiber() {
            if fiber.is_terminal() {
                return Err(Error::invariant(format!(
                    "cannot schedule {} in state {}",
                    fiber.id(),
                    fiber.state()
                )));
            }
        }
        Ok(())
    }

    /// Validate and enqueue `tasks` under one lock acquisition.
    ///
    /// A fiber that already holds a queue slot is coalesced, not duplicated.
    fn submit(&self, tasks: Vec<Task>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        for task in &tasks {
            self.check(task)?;
        }

        let mut accepted = 0;
        let mut pinned = false;
        let mut locked = self.locked.lock();
        if locked.state.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        let was_empty = locked.queue.is_empty();
        for task in tasks {
            if let Some(fiber) = task.as_fiber() {
                // Already queued, or running under a worker that requeues it
                // when it yields: one queue entry per fiber.
                if !fiber.claim_queue() {
                    continue;
                }
                fiber.mark_ready();
            }
            pinned |= task.affinity() != Affinity::Any;
            locked.queue.push(task);
            accepted += 1;
        }
        drop(locked);

        if accepted == 0 {
            return Ok(());
        }
        self.stats.tasks_scheduled.fetch_add(accepted, Ordering::Relaxed);

        // A pinned task must reach one particular worker, so wake every
        // idle worker rather than an arbitrary one.
        let idle = self.idle_workers.load(Ordering::Acquire);
        let wakeups = if pinned {
            idle.max(1)
        } else if was_empty || idle > 0 {
            1
        } else {
            0
        };
        for _ in 0..wakeups {
            self.tickle.tickle();
        }
        Ok(())
    }

    /// Take the next task `worker` may run and count it as in flight
    pub(super) fn next_task(&self, worker: WorkerId) -> Option<Task> {
        let mut locked = self.locked.lock();
        let task = locked.queue.pop_for(worker);
        if task.is_some() {
            locked.active += 1;
        }
        let leftovers = task.is_some() && !locked.queue.is_empty();
        drop(locked);

        if leftovers && self.idle_workers.load(Ordering::Acquire) > 0 {
            self.tickle.tickle();
        }
        task
    }

    /// Retire an in-flight task, optionally putting a fiber back in the queue.
    ///
    /// The requeue and the in-flight decrement happen under one lock so that
    /// no worker can observe an empty queue with nothing in flight in between.
    pub(super) fn finish(&self, requeue: Option<Task>, outcome: Option<FiberState>) {
        match outcome {
            Some(FiberState::Term) => {
                self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(FiberState::Except) => {
                self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.fibers_faulted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let requeued = requeue.is_some();
        let mut locked = self.locked.lock();
        if let Some(task) = requeue {
            locked.queue.push(task);
        }
        locked.active -= 1;
        let drained =
            locked.state.is_stopping() && locked.queue.is_empty() && locked.active == 0;
        drop(locked);

        if drained {
            self.tickle_all();
        } else if requeued && self.idle_workers.load(Ordering::Acquire) > 0 {
            self.tickle.tickle();
        }
    }

    /// Stopping has begun and nothing is left to run anywhere
    pub(super) fn is_drained(&self) -> bool {
        let locked = self.locked.lock();
        locked.state.is_stopping() && locked.queue.is_empty() && locked.active == 0
    }

    pub(super) fn enter_idle(&self) {
        self.idle_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn leave_idle(&self) {
        self.idle_workers.fetch_sub(1, Ordering::AcqRel);
    }

    fn tickle_all(&self) {
        for _ in 0..self.config.threads {
            self.tickle.tickle();
        }
    }

    fn stats(&self) -> SchedulerStats {
        let active = self.locked.lock().active;
        SchedulerStats {
            tasks_scheduled: self.stats.tasks_scheduled.load(Ordering::Relaxed),
            tasks_completed: self.stats.tasks_completed.load(Ordering::Relaxed),
            fibers_faulted: self.stats.fibers_faulted.load(Ordering::Relaxed),
            active_workers: active,
            idle_workers: self.idle_workers.load(Ordering::Acquire),
        }
    }
}

/// Cloneable submission handle to a scheduler
///
/// Handed to code running on worker threads through [`Scheduler::current`].
/// A handle never keeps workers alive; it only shares the task queue.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn same_scheduler(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether the `Scheduler` behind this handle has been dropped
    pub(crate) fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Whether `stop()` has begun
    pub fn is_stopping(&self) -> bool {
        self.state().is_stopping()
    }

    /// Enqueue a task
    pub fn schedule(&self, task: Task) -> Result<()> {
        self.shared.submit(vec![task])
    }

    /// Enqueue many tasks under one lock acquisition
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.submit(tasks.into_iter().collect())
    }

    /// Run `work` on any worker
    pub fn spawn<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(work))
    }

    /// Run `work` on the given worker only
    pub fn spawn_on<F>(&self, worker: WorkerId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(work).pinned(worker))
    }

    /// Queue an existing fiber for resumption
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, affinity: Affinity) -> Result<()> {
        self.schedule(Task::fiber(fiber).with_affinity(affinity))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Cooperative fiber scheduler backed by a fixed pool of worker threads
pub struct Scheduler {
    handle: Handle,
    threads: Mutex<Vec<Thread>>,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
    /// Runs the worker loop on the constructing thread in use-caller mode
    root_fiber: Option<Arc<Fiber>>,
    caller: Option<ThreadId>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<Self> {
        Self::with_config(SchedulerConfig {
            threads,
            use_caller,
            name: name.into(),
            ..Default::default()
        })
    }

    /// Create a scheduler from a full configuration
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        let tickle = Arc::new(ParkTickle::with_limit(config.threads));
        Self::with_tickle(config, tickle)
    }

    /// Create a scheduler with a custom wake strategy
    pub fn with_tickle(config: SchedulerConfig, tickle: Arc<dyn Tickle>) -> Result<Self> {
        config.validate()?;

        if config.use_caller && context::current_scheduler().is_some() {
            return Err(Error::invariant(
                "calling thread already belongs to a scheduler",
            ));
        }

        let shared = Arc::new(Shared {
            locked: Mutex::new(Locked {
                queue: TaskQueue::new(),
                state: SchedulerState::Created,
                active: 0,
            }),
            tickle,
            idle_workers: AtomicUsize::new(0),
            stats: StatsInternal::default(),
            released: AtomicBool::new(false),
            config,
        });
        let handle = Handle::new(shared);

        let (root_fiber, caller) = if handle.shared.config.use_caller {
            let root_shared = Arc::clone(&handle.shared);
            let root = Fiber::with_stack_size(
                move || worker::run(&root_shared, WorkerId(0)),
                handle.shared.config.stack_size,
            )?;
            context::bind_scheduler(handle.clone(), WorkerId(0));
            Thread::set_current_name(&handle.shared.config.name);
            (Some(root), Some(std::thread::current().id()))
        } else {
            (None, None)
        };

        Ok(Self {
            handle,
            threads: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            root_fiber,
            caller,
        })
    }

    /// Scheduler the calling thread works for
    pub fn current() -> Option<Handle> {
        context::current_scheduler()
    }

    /// Submission handle that can be cloned into tasks
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.handle.state()
    }

    /// Number of workers, including the caller thread in use-caller mode
    pub fn thread_count(&self) -> usize {
        self.handle.shared.config.threads
    }

    /// Identities of every worker, usable as task affinities
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.thread_count()).map(WorkerId).collect()
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.handle.shared.stats()
    }

    /// Whether any worker is parked in its idle fiber
    pub fn has_idle_workers(&self) -> bool {
        self.handle.shared.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Enqueue a task; never blocks
    pub fn schedule(&self, task: Task) -> Result<()> {
        self.handle.schedule(task)
    }

    /// Enqueue many tasks under one lock acquisition
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        self.handle.schedule_batch(tasks)
    }

    /// Run `work` on any worker
    pub fn spawn<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(work)
    }

    /// Run `work` on the given worker only
    pub fn spawn_on<F>(&self, worker: WorkerId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_on(worker, work)
    }

    /// Queue an existing fiber for resumption
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, affinity: Affinity) -> Result<()> {
        self.handle.schedule_fiber(fiber, affinity)
    }

    /// Spawn the worker threads. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> Result<()> {
        let shared = &self.handle.shared;
        {
            let mut locked = shared.locked.lock();
            match locked.state {
                SchedulerState::Created => locked.state = SchedulerState::Started,
                SchedulerState::Started => return Ok(()),
                SchedulerState::Stopping | SchedulerState::Stopped => {
                    return Err(Error::ShuttingDown)
                }
            }
        }

        let first = usize::from(shared.config.use_caller);
        let mut threads = self.threads.lock();
        for index in first..shared.config.threads {
            let id = WorkerId(index);
            let worker_shared = Arc::clone(shared);
            let name = format!("{}_{}", shared.config.name, index);
            match Thread::spawn(id, name, move || worker::run(&worker_shared, id)) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    log::error!("scheduler {} failed to start: {}", shared.config.name, e);
                    drop(threads);
                    self.abandon();
                    let _ = self.join_workers();
                    shared.locked.lock().state = SchedulerState::Stopped;
                    return Err(e);
                }
            }
        }

        log::info!(
            "scheduler {} started with {} workers ({} spawned)",
            shared.config.name,
            shared.config.threads,
            threads.len()
        );
        Ok(())
    }

    /// Stop accepting work, let queued and in-flight work drain, and join
    /// every worker.
    ///
    /// In use-caller mode this must be called from the constructing thread,
    /// which runs its share of the remaining work before returning. Calling
    /// `stop` on a scheduler that was never started starts it first so that
    /// queued tasks still run. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        if let Some(current) = context::current_scheduler() {
            if current.same_scheduler(&self.handle) {
                let on_caller = self.caller == Some(std::thread::current().id());
                if !on_caller || context::current_fiber().is_some() {
                    return Err(Error::invariant(format!(
                        "scheduler {} cannot be stopped from one of its own fibers",
                        self.name()
                    )));
                }
            }
        }
        if let Some(caller) = self.caller {
            if caller != std::thread::current().id() {
                return Err(Error::invariant(format!(
                    "use-caller scheduler {} must be stopped from the thread that created it",
                    self.name()
                )));
            }
        }

        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            SchedulerState::Stopped => return Ok(()),
            SchedulerState::Created => self.start_locked()?,
            SchedulerState::Started | SchedulerState::Stopping => {}
        }

        let shared = &self.handle.shared;
        shared.locked.lock().state = SchedulerState::Stopping;
        log::info!("scheduler {} stopping", shared.config.name);

        let spawned = self.threads.lock().len();
        for _ in 0..spawned {
            shared.tickle.tickle();
        }
        if self.root_fiber.is_some() {
            shared.tickle.tickle();
        }

        let mut result = Ok(());
        if let Some(root) = &self.root_fiber {
            result = self.run_root(root);
        }
        let joined = self.join_workers();
        if result.is_ok() {
            result = joined;
        }

        shared.locked.lock().state = SchedulerState::Stopped;
        log::info!("scheduler {} stopped", shared.config.name);
        result
    }

    /// Drive the caller's share of the work until everything has drained
    fn run_root(&self, root: &Arc<Fiber>) -> Result<()> {
        if root.is_terminal() {
            return Ok(());
        }
        match root.resume()? {
            FiberState::Term => Ok(()),
            FiberState::Except => Err(Error::WorkerPanicked {
                name: self.name().to_string(),
            }),
            state => Err(Error::invariant(format!(
                "root fiber of {} left the worker loop in state {}",
                self.name(),
                state
            ))),
        }
    }

    fn join_workers(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        let mut result = Ok(());
        for thread in threads.iter_mut() {
            if let Err(e) = thread.join() {
                log::error!("{}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Force the scheduler into `Stopping`, discarding queued work, so that
    /// spawned workers exit on their own.
    fn abandon(&self) {
        let shared = &self.handle.shared;
        let mut locked = shared.locked.lock();
        locked.state = SchedulerState::Stopping;
        let discarded = locked.queue.clear();
        drop(locked);
        if discarded > 0 {
            log::warn!(
                "scheduler {} discarded {} queued tasks",
                shared.config.name,
                discarded
            );
        }
        shared.tickle_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // The constructing thread may be another thread; it drops its binding
        // lazily once it sees this flag.
        self.handle.shared.released.store(true, Ordering::Release);
        context::unbind_scheduler(&self.handle);

        let state = self.state();
        match state {
            SchedulerState::Created | SchedulerState::Stopped => {}
            SchedulerState::Started | SchedulerState::Stopping => {
                self.abandon();
                log::error!("scheduler {} dropped while {}", self.name(), state);
                if !std::thread::panicking() {
                    panic!("scheduler {} dropped while {}", self.name(), state);
                }
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.handle.shared;
        let (state, queued, active) = {
            let locked = shared.locked.lock();
            (locked.state, locked.queue.len(), locked.active)
        };
        f.debug_struct("Scheduler")
            .field("name", &shared.config.name)
            .field("state", &state)
            .field("threads", &shared.config.threads)
            .field("use_caller", &shared.config.use_caller)
            .field("queued", &queued)
            .field("active", &active)
            .field("idle", &shared.idle_workers.load(Ordering::Acquire))
            .finish()
    }
}
