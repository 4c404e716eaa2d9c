//! Scheduler behavior: draining, ordering, pinning, shutdown.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use weft::fiber::{self, Fiber};
use weft::scheduler::{Scheduler, Task};
use weft::util;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A task that re-schedules itself until a shared counter runs out.
fn countdown(sched: Arc<Scheduler>, counter: Arc<AtomicI32>) {
    thread::sleep(Duration::from_millis(1));
    if counter.fetch_sub(1, Ordering::SeqCst) > 1 {
        let next = sched.clone();
        let c = counter.clone();
        sched.schedule(Task::callback(move || countdown(next, c)));
    }
}

#[test]
fn self_rescheduling_task_drains_before_stop_returns() {
    init_logging();
    let sched = Scheduler::new(3, false, "countdown");
    sched.start();

    let counter = Arc::new(AtomicI32::new(5));
    sched.schedule(Task::callback({
        let sched = sched.clone();
        let counter = counter.clone();
        move || countdown(sched, counter)
    }));

    sched.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn bulk_schedule_preserves_order_on_a_caller_only_scheduler() {
    init_logging();
    let sched = Scheduler::new(1, true, "bulk");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Task> = (1..=3)
        .map(|id| {
            let order = order.clone();
            Task::callback(move || order.lock().unwrap().push(id))
        })
        .collect();
    sched.schedule_bulk(tasks);

    // No spawned workers: the caller's dispatch fiber drains during stop.
    sched.stop();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn tasks_pinned_to_one_thread_run_there_in_fifo_order() {
    init_logging();
    let sched = Scheduler::new(2, false, "pinned");
    sched.start();
    let target = sched.thread_ids()[0];

    let runs = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Task> = (0..16)
        .map(|i| {
            let runs = runs.clone();
            Task::callback(move || {
                runs.lock().unwrap().push((i, util::thread_id()));
                // Give the other worker a chance to steal out of order if
                // pinning were broken.
                thread::sleep(Duration::from_millis(1));
            })
            .pin(target)
        })
        .collect();
    sched.schedule_bulk(tasks);
    sched.stop();

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 16);
    for (expected, &(i, tid)) in runs.iter().enumerate() {
        assert_eq!(tid, target, "task {} ran on a foreign thread", i);
        assert_eq!(i, expected as i32, "pinned tasks reordered");
    }
}

#[test]
fn scheduled_fibers_resume_until_completion() {
    init_logging();
    let sched = Scheduler::new(2, false, "fibers");
    sched.start();

    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    let f = Fiber::new(
        move || {
            s.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
            s.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
    )
    .unwrap();
    sched.schedule(Task::from(f));
    sched.stop();

    // yield_to_ready re-queued the fiber, so both halves ran.
    assert_eq!(steps.load(Ordering::SeqCst), 2);
}

#[test]
fn a_panicking_task_does_not_take_down_its_worker() {
    init_logging();
    let sched = Scheduler::new(1, false, "panicky");
    sched.start();

    let ran_after = Arc::new(AtomicUsize::new(0));
    sched.schedule(Task::callback(|| panic!("task failure")));
    let r = ran_after.clone();
    sched.schedule(Task::callback(move || {
        r.fetch_add(1, Ordering::SeqCst);
    }));
    sched.stop();

    assert_eq!(ran_after.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_joins_every_worker() {
    init_logging();
    let sched = Scheduler::new(4, false, "joiners");
    sched.start();
    assert_eq!(sched.thread_ids().len(), 4);

    let hits = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..32)
        .map(|_| {
            let hits = hits.clone();
            Task::callback(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    sched.schedule_bulk(tasks);
    sched.stop();

    // Everything enqueued before stop ran, and stop returned only after the
    // workers exited, so no further increments can happen.
    assert_eq!(hits.load(Ordering::SeqCst), 32);
    let settled = hits.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(hits.load(Ordering::SeqCst), settled);
}

#[test]
fn switch_to_moves_a_fiber_onto_the_requested_worker() {
    init_logging();
    let sched = Scheduler::new(2, false, "switcher");
    sched.start();
    let ids = sched.thread_ids();
    let (a, b) = (ids[0], ids[1]);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let o = observed.clone();
    let s = sched.clone();
    sched.schedule(Task::callback(move || {
        let here = util::thread_id();
        let target = if here == a { b } else { a };
        s.switch_to(Some(target));
        o.lock().unwrap().push((target, util::thread_id()));
    }));
    sched.stop();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 1);
    let (target, landed_on) = observed[0];
    assert_eq!(landed_on, target, "fiber resumed on the wrong thread");
}

#[test]
fn use_caller_scheduler_mixes_caller_and_workers() {
    init_logging();
    let sched = Scheduler::new(3, true, "mixed");
    sched.start();
    // Two spawned workers plus the caller.
    assert_eq!(sched.thread_ids().len(), 3);

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let hits = hits.clone();
        sched.schedule(Task::callback(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 8);
}
