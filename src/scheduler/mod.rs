//! M:N fiber scheduler
//!
//! This module multiplexes fibers onto a fixed pool of OS worker threads.
//! Tasks go into one shared FIFO; each worker takes the oldest task it is
//! allowed to run (honoring per-task worker affinity) and resumes its fiber.

pub mod core;
pub mod queue;
pub mod tickle;
pub mod worker;

pub use self::core::{Handle, Scheduler, SchedulerConfig, SchedulerState, SchedulerStats};
pub use queue::{Affinity, Runnable, Task};
pub use tickle::{ParkTickle, SpinTickle, Tickle};
pub use worker::{current_worker, WorkerId};
