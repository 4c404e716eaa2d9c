//! Fiber life-cycle: resume/yield round-trips, reset, panic containment.

use std::sync::{Arc, Mutex};

use weft::fiber::{self, Fiber, State};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The log a fiber body appends to, shared with the driving thread.
type Trace = Arc<Mutex<Vec<&'static str>>>;

#[test]
fn three_resumes_run_a_twice_yielding_fiber_to_completion() {
    init_logging();
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let body_trace = trace.clone();

    let f = Fiber::new(
        move || {
            body_trace.lock().unwrap().push("begin");
            fiber::yield_to_hold();
            body_trace.lock().unwrap().push("middle");
            fiber::yield_to_hold();
            body_trace.lock().unwrap().push("end");
        },
        0,
        false,
    )
    .unwrap();

    assert_eq!(f.state(), State::Init);
    f.resume();
    assert_eq!(f.state(), State::Hold);
    assert_eq!(*trace.lock().unwrap(), vec!["begin"]);

    f.resume();
    assert_eq!(*trace.lock().unwrap(), vec!["begin", "middle"]);

    f.resume();
    assert_eq!(*trace.lock().unwrap(), vec!["begin", "middle", "end"]);
    assert_eq!(f.state(), State::Term);
}

#[test]
fn yielding_k_times_needs_exactly_k_plus_one_resumes() {
    init_logging();
    let k = 5;
    let f = Fiber::new(
        move || {
            for _ in 0..k {
                fiber::yield_to_hold();
            }
        },
        0,
        false,
    )
    .unwrap();

    for _ in 0..k {
        f.resume();
        assert_eq!(f.state(), State::Hold);
    }
    f.resume();
    assert_eq!(f.state(), State::Term);
}

#[test]
fn yield_to_ready_leaves_the_fiber_runnable() {
    init_logging();
    let f = Fiber::new(fiber::yield_to_ready, 0, false).unwrap();
    f.resume();
    assert_eq!(f.state(), State::Ready);
    f.resume();
    assert_eq!(f.state(), State::Term);
}

#[test]
fn reset_reuses_the_stack_for_a_new_callback() {
    init_logging();
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    let t = trace.clone();
    let f = Fiber::new(move || t.lock().unwrap().push("first"), 0, false).unwrap();
    f.resume();
    assert_eq!(f.state(), State::Term);

    let t = trace.clone();
    f.reset(move || t.lock().unwrap().push("second"));
    assert_eq!(f.state(), State::Init);
    f.resume();
    assert_eq!(f.state(), State::Term);

    assert_eq!(*trace.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn a_panicking_fiber_is_contained_in_except_state() {
    init_logging();
    let f = Fiber::new(|| panic!("on purpose"), 0, false).unwrap();
    // The panic must not unwind into this (the resumer's) stack.
    f.resume();
    assert_eq!(f.state(), State::Except);

    // An except fiber is reusable like a terminated one.
    f.reset(|| {});
    f.resume();
    assert_eq!(f.state(), State::Term);
}

#[test]
fn fiber_ids_are_unique_and_root_is_zero() {
    init_logging();
    assert_eq!(fiber::fiber_id(), 0, "off-fiber code reports id 0");
    let a = Fiber::new(|| {}, 0, false).unwrap();
    let b = Fiber::new(|| {}, 0, false).unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), 0);

    let seen = Arc::new(Mutex::new(0u64));
    let s = seen.clone();
    let c = Fiber::new(move || *s.lock().unwrap() = fiber::fiber_id(), 0, false).unwrap();
    c.resume();
    assert_eq!(*seen.lock().unwrap(), c.id());

    a.resume();
    b.resume();
}

#[test]
fn total_fibers_counts_live_fibers() {
    init_logging();
    // The counter is process-wide and other tests run concurrently, so only
    // the lower bound is stable.
    let before = fiber::total_fibers();
    let fibers: Vec<_> = (0..8).map(|_| Fiber::new(|| {}, 0, false).unwrap()).collect();
    assert!(fiber::total_fibers() >= before + 8);
    for f in &fibers {
        f.resume();
    }
}

#[test]
fn custom_stack_size_is_honored() {
    init_logging();
    // A fiber with a small stack still runs; a recursive body would fault
    // into the guard page instead of corrupting memory.
    let f = Fiber::new(|| {}, 16 * 1024, false).unwrap();
    f.resume();
    assert_eq!(f.state(), State::Term);
}

#[test]
#[should_panic(expected = "resumed in state")]
fn resuming_a_completed_fiber_is_a_precondition_violation() {
    init_logging();
    let f = Fiber::new(|| {}, 0, false).unwrap();
    f.resume();
    assert_eq!(f.state(), State::Term);
    f.resume();
}

#[test]
fn default_stack_size_comes_from_config() {
    init_logging();
    // Creating a fiber with stack_size 0 registers and consults the
    // fiber.stack_size variable.
    let f = Fiber::new(|| {}, 0, false).unwrap();
    f.resume();
    let var = weft::config::Config::lookup::<u32>("fiber.stack_size", 0, "fiber stack size");
    assert_eq!(var.value(), 128 * 1024);
}

#[test]
fn fibers_run_on_several_threads_independently() {
    init_logging();
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(std::thread::spawn(|| {
            let trace: Trace = Arc::new(Mutex::new(Vec::new()));
            let t = trace.clone();
            let f = Fiber::new(
                move || {
                    t.lock().unwrap().push("in");
                    fiber::yield_to_hold();
                    t.lock().unwrap().push("out");
                },
                0,
                false,
            )
            .unwrap();
            f.resume();
            f.resume();
            assert_eq!(*trace.lock().unwrap(), vec!["in", "out"]);
            assert_eq!(f.state(), State::Term);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
