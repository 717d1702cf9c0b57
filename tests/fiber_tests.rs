//! Fiber lifecycle tests
//!
//! Exercise fibers on their own, without a scheduler driving them.

mod common;

use log::Level;
use rust_fibers::fiber::current_id;
use rust_fibers::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_fiber_yielding_n_times_is_resumed_n_plus_one_times() {
    for yields in [0usize, 1, 5, 32] {
        let segments = Arc::new(AtomicUsize::new(0));
        let segments_clone = Arc::clone(&segments);
        let fiber = Fiber::new(move || {
            segments_clone.fetch_add(1, Ordering::SeqCst);
            for _ in 0..yields {
                Fiber::yield_now().unwrap();
                segments_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut resumes = 0;
        while !fiber.is_terminal() {
            fiber.resume().unwrap();
            resumes += 1;
        }

        assert_eq!(resumes, yields + 1);
        assert_eq!(segments.load(Ordering::SeqCst), yields + 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }
}

#[test]
fn test_fault_is_logged_exactly_once() {
    common::init_test_env();

    let fiber = Fiber::new(|| panic!("fiber fault under test"));
    let needle = format!("{} faulted", fiber.id());

    assert_eq!(fiber.resume().unwrap(), FiberState::Except);
    assert_eq!(fiber.fault().as_deref(), Some("fiber fault under test"));
    assert_eq!(common::count_logs(Level::Error, &needle), 1);

    // A second resume is refused and does not log the fault again.
    assert!(matches!(
        fiber.resume(),
        Err(Error::InvariantViolation { .. })
    ));
    assert_eq!(common::count_logs(Level::Error, &needle), 1);
}

#[test]
fn test_fault_after_yield() {
    let fiber = Fiber::new(|| {
        Fiber::yield_now().unwrap();
        let values: Vec<u32> = Vec::new();
        let _ = values[3];
    });

    assert_eq!(fiber.resume().unwrap(), FiberState::Hold);
    assert_eq!(fiber.resume().unwrap(), FiberState::Except);
    assert!(fiber.fault().unwrap().contains("index out of bounds"));
}

#[test]
fn test_current_follows_nesting() {
    let outer_seen = Arc::new(AtomicUsize::new(0));
    let inner_seen = Arc::new(AtomicUsize::new(0));
    let after_inner = Arc::new(AtomicUsize::new(0));

    let inner_slot = Arc::clone(&inner_seen);
    let inner = Fiber::new(move || {
        inner_slot.store(current_id() as usize, Ordering::SeqCst);
    });
    let inner_id = inner.id();

    let outer_slot = Arc::clone(&outer_seen);
    let after_slot = Arc::clone(&after_inner);
    let outer = Fiber::new(move || {
        outer_slot.store(current_id() as usize, Ordering::SeqCst);
        inner.resume().unwrap();
        after_slot.store(current_id() as usize, Ordering::SeqCst);
    });
    let outer_id = outer.id();

    outer.resume().unwrap();
    assert_eq!(outer_seen.load(Ordering::SeqCst) as u64, outer_id.as_u64());
    assert_eq!(inner_seen.load(Ordering::SeqCst) as u64, inner_id.as_u64());
    assert_eq!(after_inner.load(Ordering::SeqCst) as u64, outer_id.as_u64());
    assert_eq!(current_id(), 0);
}

#[test]
fn test_fiber_resumed_from_several_threads() {
    let hops = 4;
    let threads_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&threads_seen);
    let fiber = Fiber::new(move || {
        for _ in 0..hops {
            seen.lock().push(std::thread::current().id());
            Fiber::yield_now().unwrap();
        }
    });

    for _ in 0..hops {
        let fiber = Arc::clone(&fiber);
        let state = std::thread::spawn(move || fiber.resume().unwrap())
            .join()
            .unwrap();
        assert_eq!(state, FiberState::Hold);
    }
    assert_eq!(fiber.resume().unwrap(), FiberState::Term);

    let seen = threads_seen.lock();
    assert_eq!(seen.len(), hops);
    for (i, id) in seen.iter().enumerate() {
        assert!(seen[i + 1..].iter().all(|other| other != id));
    }
}

#[test]
fn test_dropping_held_fiber_unwinds_its_stack() {
    struct Flag(Arc<AtomicUsize>);
    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let dropped = Arc::new(AtomicUsize::new(0));
    let flag = Flag(Arc::clone(&dropped));
    let fiber = Fiber::new(move || {
        let _flag = flag;
        Fiber::yield_now().unwrap();
        unreachable!("a dropped fiber is never resumed");
    });

    assert_eq!(fiber.resume().unwrap(), FiberState::Hold);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    drop(fiber);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_yield_outside_fiber_is_an_error() {
    assert_eq!(Fiber::yield_now(), Err(Error::NotInFiber));
}
