//! OS thread wrapper used by the scheduler
//!
//! A [`Thread`] is a named OS thread tagged with the worker slot it serves.
//! Besides the std name given at spawn time, each thread keeps a logical name
//! in its per-thread context so that threads the scheduler did not spawn (the
//! caller thread in use-caller mode) can be renamed too.

use std::thread::{self as std_thread, JoinHandle};

use crate::context;
use crate::error::{Error, Result};
use crate::scheduler::WorkerId;

/// A named worker thread
pub struct Thread {
    id: WorkerId,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Start a thread running `entry`
    pub fn spawn<F>(id: WorkerId, name: impl Into<String>, entry: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let thread_name = name.clone();

        let handle = std_thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                context::set_thread_name(&thread_name);
                entry();
            })
            .map_err(|e| Error::SpawnError {
                reason: format!("{}: {}", name, e),
            })?;

        Ok(Self {
            id,
            name,
            handle: Some(handle),
        })
    }

    /// Worker slot this thread serves
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread's entry point has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the thread to exit. Joining twice is a no-op.
    pub fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::WorkerPanicked {
                name: self.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Logical name of the calling thread
    pub fn current_name() -> String {
        context::thread_name()
            .or_else(|| std_thread::current().name().map(str::to_string))
            .unwrap_or_else(|| "unnamed".to_string())
    }

    /// Rename the calling thread for logging purposes
    pub fn set_current_name(name: &str) {
        context::set_thread_name(name);
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_and_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let mut thread = Thread::spawn(WorkerId(3), "test_3", move || {
            assert_eq!(Thread::current_name(), "test_3");
            assert_eq!(std_thread::current().name(), Some("test_3"));
            ran_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(thread.id(), WorkerId(3));
        assert_eq!(thread.name(), "test_3");
        thread.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(thread.is_finished());

        // second join is harmless
        thread.join().unwrap();
    }

    #[test]
    fn test_join_reports_panic() {
        let mut thread = Thread::spawn(WorkerId(0), "doomed", || panic!("worker died")).unwrap();
        assert_eq!(
            thread.join().unwrap_err(),
            Error::WorkerPanicked {
                name: "doomed".to_string()
            }
        );
    }

    #[test]
    fn test_rename_current_thread() {
        std_thread::spawn(|| {
            Thread::set_current_name("renamed");
            assert_eq!(Thread::current_name(), "renamed");
        })
        .join()
        .unwrap();
    }
}
