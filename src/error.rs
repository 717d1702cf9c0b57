//! Error types for rust-fibers
//!
//! This module provides error handling types used throughout the library.

use thiserror::Error;

/// Main error type for fiber and scheduler operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The scheduler or fiber was configured with unusable values
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration
        reason: String,
    },

    /// A caller broke a fiber or scheduler invariant
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        /// Which invariant was broken
        reason: String,
    },

    /// A fiber operation was attempted outside of any fiber
    #[error("Not running inside a fiber")]
    NotInFiber,

    /// The scheduler no longer accepts work
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// A task was pinned to a worker the scheduler does not have
    #[error("Unknown worker {id} (scheduler has {workers} workers)")]
    UnknownWorker {
        /// Requested worker index
        id: usize,
        /// Number of workers owned by the scheduler
        workers: usize,
    },

    /// Spawning an OS thread failed
    #[error("Failed to spawn worker thread: {reason}")]
    SpawnError {
        /// Reason reported by the OS
        reason: String,
    },

    /// A worker thread panicked outside of any fiber
    #[error("Worker thread {name} panicked")]
    WorkerPanicked {
        /// Name of the worker thread
        name: String,
    },
}

impl Error {
    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        Error::InvariantViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::config("threads must be positive").to_string(),
            "Invalid configuration: threads must be positive"
        );
        assert_eq!(
            Error::UnknownWorker { id: 7, workers: 4 }.to_string(),
            "Unknown worker 7 (scheduler has 4 workers)"
        );
    }
}
