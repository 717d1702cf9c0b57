//! Stackful fibers
//!
//! A [`Fiber`] owns a private call stack and an entry closure. Resuming a fiber
//! switches the calling thread onto that stack until the fiber yields or its
//! entry closure returns; either way control comes back to the resumer.
//!
//! The raw context switch is provided by the `generator` crate and never leaks
//! out of this module: everything else in the crate sees only `resume`,
//! `yield_now` and the fiber's [`FiberState`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use generator::{Generator, Gn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::context;
use crate::error::{Error, Result};

/// Stack size used when neither the caller nor the environment picks one
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack a fiber may be created with
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Environment variable overriding the default fiber stack size (bytes)
pub const STACK_SIZE_ENV: &str = "RUST_FIBERS_STACK_SIZE";

static CONFIGURED_STACK_SIZE: Lazy<usize> = Lazy::new(|| {
    let raw = match std::env::var(STACK_SIZE_ENV) {
        Ok(raw) => raw,
        Err(_) => return DEFAULT_STACK_SIZE,
    };
    match raw.trim().parse::<usize>() {
        Ok(size) if size >= MIN_STACK_SIZE => size,
        _ => {
            log::warn!(
                "ignoring {}={:?}, using {} bytes",
                STACK_SIZE_ENV,
                raw,
                DEFAULT_STACK_SIZE
            );
            DEFAULT_STACK_SIZE
        }
    }
});

/// Default fiber stack size in bytes, honoring `RUST_FIBERS_STACK_SIZE`
pub fn default_stack_size() -> usize {
    *CONFIGURED_STACK_SIZE
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

/// Unique identifier of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Lifecycle state of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Created, never run
    Init = 0,
    /// Queued on a scheduler, waiting to be resumed
    Ready = 1,
    /// Running on some thread
    Exec = 2,
    /// Yielded, resumable
    Hold = 3,
    /// Entry closure returned
    Term = 4,
    /// Entry closure panicked
    Except = 5,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }

    /// `Term` or `Except`
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Whether `resume` accepts a fiber in this state
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(name)
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the fiber handle and the code running on its stack
struct Status {
    state: AtomicU8,
    fault: Mutex<Option<String>>,
}

impl Status {
    fn get(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A stackful, cooperatively scheduled execution context
pub struct Fiber {
    id: FiberId,
    stack_size: usize,
    status: Arc<Status>,
    /// Set while the fiber sits in a run queue or is being driven by a worker
    queued: AtomicBool,
    /// Saved execution context. Locked for the whole time the fiber runs.
    context: Mutex<Generator<'static, (), ()>>,
}

impl Fiber {
    /// Create a fiber with the default stack size
    pub fn new<F>(entry: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(entry), default_stack_size())
    }

    /// Create a fiber with an explicit stack size in bytes
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::config(format!(
                "fiber stack size {} is below the minimum of {} bytes",
                stack_size, MIN_STACK_SIZE
            )));
        }
        Ok(Self::build(Box::new(entry), stack_size))
    }

    fn build(entry: Entry, stack_size: usize) -> Arc<Self> {
        let id = FiberId::next();
        let status = Arc::new(Status {
            state: AtomicU8::new(FiberState::Init as u8),
            fault: Mutex::new(None),
        });
        let context = Gn::<()>::new_opt(
            stack_words(stack_size),
            fiber_main(id, Arc::clone(&status), entry),
        );
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        Arc::new(Fiber {
            id,
            stack_size,
            status,
            queued: AtomicBool::new(false),
            context: Mutex::new(context),
        })
    }

    /// Fiber currently executing on the calling thread
    pub fn current() -> Option<Arc<Fiber>> {
        context::current_fiber()
    }

    /// Number of fibers alive in the process
    pub fn live_count() -> usize {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// Get the fiber ID
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> FiberState {
        self.status.get()
    }

    /// Stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Panic message captured when the fiber ended in `Except`
    pub fn fault(&self) -> Option<String> {
        self.status.fault.lock().clone()
    }

    /// Whether the fiber has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Switch the calling thread onto this fiber until it yields or finishes.
    ///
    /// Returns the state the fiber left itself in: `Hold` after a yield,
    /// `Term` or `Except` once the entry closure is done.
    pub fn resume(self: &Arc<Self>) -> Result<FiberState> {
        self.resume_if_idle()?
            .ok_or_else(|| Error::invariant(format!("{} is already executing", self.id)))
    }

    /// Like [`Fiber::resume`], but `Ok(None)` when some other context is
    /// still running the fiber.
    ///
    /// The state check and the context lock are taken together, so a fiber
    /// that has marked itself `Hold` but not yet switched back counts as busy.
    pub(crate) fn resume_if_idle(self: &Arc<Self>) -> Result<Option<FiberState>> {
        let mut saved = match self.context.try_lock() {
            Some(saved) => saved,
            None => return Ok(None),
        };

        let state = self.state();
        if state == FiberState::Exec {
            return Ok(None);
        }
        if !state.is_resumable() {
            return Err(Error::invariant(format!(
                "cannot resume {} in state {}",
                self.id, state
            )));
        }

        self.status.set(FiberState::Exec);
        let previous = context::replace_fiber(Some(Arc::clone(self)));
        saved.resume();
        context::replace_fiber(previous);
        drop(saved);

        Ok(Some(self.state()))
    }

    /// Give control back to whoever resumed the current fiber.
    ///
    /// The fiber is left in `Hold` and continues from here on its next resume.
    pub fn yield_now() -> Result<()> {
        let fiber = context::current_fiber().ok_or(Error::NotInFiber)?;
        fiber.status.set(FiberState::Hold);
        drop(fiber);
        generator::yield_with(());
        Ok(())
    }

    /// Install a new entry closure, reusing the stack of a finished fiber
    pub fn reset<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut saved = self
            .context
            .try_lock()
            .ok_or_else(|| Error::invariant(format!("cannot reset {} while it executes", self.id)))?;

        let state = self.state();
        let main = fiber_main(self.id, Arc::clone(&self.status), Box::new(entry));
        match state {
            FiberState::Term | FiberState::Except => saved.init_code(main),
            FiberState::Init => *saved = Gn::<()>::new_opt(stack_words(self.stack_size), main),
            _ => {
                return Err(Error::invariant(format!(
                    "cannot reset {} in state {}",
                    self.id, state
                )))
            }
        }

        *self.status.fault.lock() = None;
        self.status.set(FiberState::Init);
        Ok(())
    }

    /// Take the fiber's single run-queue slot. `false` means a queue entry
    /// already exists or a worker is driving the fiber and will requeue it.
    pub(crate) fn claim_queue(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give the run-queue slot back
    pub(crate) fn release_queue(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Mark a held fiber as queued. Terminal or running fibers are left alone.
    pub(crate) fn mark_ready(&self) {
        let _ = self.status.state.compare_exchange(
            FiberState::Hold as u8,
            FiberState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if !state.is_terminal() && state != FiberState::Init {
            log::debug!("{} dropped in state {}", self.id, state);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// ID of the fiber running on this thread, 0 outside of any fiber
pub fn current_id() -> u64 {
    context::current_fiber().map_or(0, |fiber| fiber.id.as_u64())
}

/// Wrap the user entry so that completion and faults land in `status`
fn fiber_main(id: FiberId, status: Arc<Status>, entry: Entry) -> impl FnOnce() + Send + 'static {
    move || match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => status.set(FiberState::Term),
        Err(payload) => {
            // Cancellation unwinds through here when a held fiber is dropped.
            if payload.is::<generator::Error>() {
                panic::resume_unwind(payload);
            }
            let message = panic_message(payload.as_ref());
            log::error!("{} faulted: {}", id, message);
            *status.fault.lock() = Some(message);
            status.set(FiberState::Except);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// `generator` sizes stacks in machine words
fn stack_words(bytes: usize) -> usize {
    let word = std::mem::size_of::<usize>();
    (bytes + word - 1) / word
}
