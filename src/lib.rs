//! # rust-fibers
//!
//! Cooperative, stackful fibers multiplexed onto a fixed pool of OS worker threads.
//!
//! ## Features
//!
//! - **Fibers**: resumable execution contexts with their own stacks; a fiber
//!   runs until it yields or returns, never preempted
//! - **Scheduler**: a thread pool draining one FIFO of tasks, each task either
//!   an existing fiber or a callable wrapped into a fiber
//! - **Affinity**: tasks can be pinned to one worker to confine
//!   thread-sensitive resources
//! - **Graceful shutdown**: `stop()` refuses new work, lets everything queued or
//!   in flight drain, then joins the workers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_fibers::prelude::*;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(4, false, "app").unwrap();
//! scheduler.start().unwrap();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..100 {
//!     let counter = Arc::clone(&counter);
//!     scheduler.spawn(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!         Fiber::yield_now().unwrap();
//!     }).unwrap();
//! }
//!
//! scheduler.stop().unwrap();
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod context;
pub mod error;
pub mod fiber;
pub mod scheduler;
pub mod thread;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fiber::{Fiber, FiberId, FiberState};
    pub use crate::scheduler::{
        current_worker, Affinity, Handle, Scheduler, SchedulerConfig, SchedulerState, Task,
        WorkerId,
    };
}

pub use prelude::*;
