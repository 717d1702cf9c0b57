//! Wake strategies for idle workers
//!
//! A worker with nothing to run sits in its idle fiber and calls
//! [`Tickle::idle`]; producers call [`Tickle::tickle`] to prompt one idle worker
//! to look at the queue again. The scheduler holds the strategy behind an
//! `Arc<dyn Tickle>`, so callers can plug in their own (an I/O reactor would
//! wake its poller here, for example).

use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Wake-up signalling between producers and idle workers
pub trait Tickle: Send + Sync {
    /// Prompt one idle worker to re-check the task queue
    fn tickle(&self);

    /// Block the calling idle worker until tickled or `timeout` elapses
    fn idle(&self, timeout: Duration);
}

/// Parks idle workers on a condition variable.
///
/// Each tickle leaves a permit behind, so a tickle that lands before the
/// worker starts waiting is not lost. Permits are capped at `limit`, which
/// the scheduler sets to its worker count.
#[derive(Debug)]
pub struct ParkTickle {
    permits: Mutex<usize>,
    limit: usize,
    condvar: Condvar,
}

impl Default for ParkTickle {
    fn default() -> Self {
        Self::with_limit(num_cpus::get())
    }
}

impl ParkTickle {
    /// Create a strategy with no pending permits, capped at the CPU count
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strategy holding at most `limit` pending permits
    pub fn with_limit(limit: usize) -> Self {
        Self {
            permits: Mutex::new(0),
            limit: limit.max(1),
            condvar: Condvar::new(),
        }
    }

    /// Number of tickles not yet consumed by an idle worker
    pub fn pending(&self) -> usize {
        *self.permits.lock()
    }
}

impl Tickle for ParkTickle {
    fn tickle(&self) {
        let mut permits = self.permits.lock();
        if *permits < self.limit {
            *permits += 1;
        }
        drop(permits);
        self.condvar.notify_one();
    }

    fn idle(&self, timeout: Duration) {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            let _timeout = self.condvar.wait_for(&mut permits, timeout);
        }
        if *permits > 0 {
            *permits -= 1;
        }
    }
}

/// Never blocks: idle workers spin with exponential backoff and poll again.
///
/// Lowest wake-up latency at the cost of burning CPU while idle.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinTickle;

impl Tickle for SpinTickle {
    fn tickle(&self) {}

    fn idle(&self, _timeout: Duration) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_idle_times_out_without_tickle() {
        let tickle = ParkTickle::new();
        let start = Instant::now();
        tickle.idle(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_early_tickle_is_not_lost() {
        let tickle = ParkTickle::new();
        tickle.tickle();
        assert_eq!(tickle.pending(), 1);

        let start = Instant::now();
        tickle.idle(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(tickle.pending(), 0);
    }

    #[test]
    fn test_permits_are_capped() {
        let tickle = ParkTickle::with_limit(3);
        for _ in 0..100 {
            tickle.tickle();
        }
        assert_eq!(tickle.pending(), 3);

        for _ in 0..3 {
            tickle.idle(Duration::from_secs(5));
        }
        assert_eq!(tickle.pending(), 0);

        let start = Instant::now();
        tickle.idle(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_tickle_wakes_parked_worker() {
        let tickle = Arc::new(ParkTickle::new());
        let waiter = Arc::clone(&tickle);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            waiter.idle(Duration::from_secs(10));
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(20));
        tickle.tickle();
        let waited = handle.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_spin_tickle_returns_promptly() {
        let start = Instant::now();
        SpinTickle.idle(Duration::from_secs(10));
        SpinTickle.tickle();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
