//! Common test harness for rust-fibers integration tests
//!
//! Installs a capturing logger once per test binary so tests can assert on
//! what the library reported, plus small polling helpers.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static RECORDS: Lazy<Mutex<Vec<(Level, String)>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        RECORDS
            .lock()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Initialize the test environment once
static INIT: Once = Once::new();

/// Install the capturing logger (idempotent)
pub fn init_test_env() {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

/// Number of captured records at `level` whose message contains `needle`
pub fn count_logs(level: Level, needle: &str) -> usize {
    RECORDS
        .lock()
        .iter()
        .filter(|(lvl, message)| *lvl == level && message.contains(needle))
        .count()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
