//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads and a FIFO queue of tasks,
//! where a task is either a fiber handle or a bare callback, optionally
//! pinned to a specific worker thread. Workers drain the queue, switching
//! onto fiber stacks to run them; when the queue is empty they resume a
//! per-worker *idle fiber* whose behavior (and the wake-up signal,
//! [`SchedulerExt::tickle`]) is provided by the installed extension — the
//! I/O reactor in practice, a plain yield loop by default.
//!
//! With `use_caller` the constructing thread itself joins the worker set:
//! a dedicated *dispatch fiber* hosting the run loop is created on that
//! thread, and [`Scheduler::stop`] drives it to drain the remaining work.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, State};
use crate::util;

/// OS thread id, as returned by `gettid`.
pub type Pid = libc::pid_t;

/// A boxed task body.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Scheduler bound to this thread (workers and `use_caller` threads).
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = RefCell::new(None);
    /// The fiber hosting this thread's run loop; worker fibers yield back to
    /// it. On plain workers this is the thread root fiber itself.
    static DISPATCH: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH.with(|d| d.borrow().clone())
}

fn set_dispatch_fiber(fiber: Option<Arc<Fiber>>) {
    DISPATCH.with(|d| *d.borrow_mut() = fiber);
}

fn bind_thread(sched: Weak<Scheduler>) {
    SCHEDULER.with(|s| *s.borrow_mut() = Some(sched));
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// A scheduler queue entry: a fiber or a callback, plus an optional thread
/// pin.
pub struct Task {
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
    thread: Option<Pid>,
}

impl Task {
    /// Wraps a plain function into a task.
    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        Task {
            fiber: None,
            cb: Some(Box::new(f)),
            thread: None,
        }
    }

    /// Restricts the task to one worker thread. Tasks pinned to the same
    /// thread execute in FIFO order relative to each other.
    pub fn pin(mut self, thread: Pid) -> Self {
        self.thread = Some(thread);
        self
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task {
            fiber: Some(fiber),
            cb: None,
            thread: None,
        }
    }
}

impl From<Callback> for Task {
    fn from(cb: Callback) -> Self {
        Task {
            fiber: None,
            cb: Some(cb),
            thread: None,
        }
    }
}

/// What the run loop actually executes after dequeueing.
enum Job {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

////////////////////////////////////////////////////////////////////////////////
// SchedulerExt
////////////////////////////////////////////////////////////////////////////////

/// Extension hooks of the scheduler, installed once by a subsystem that
/// embeds it (the I/O reactor). The base behaviors apply while no extension
/// is installed: `tickle` is a logged no-op, `idle` yields in a loop, and
/// `stopping` is the base condition (stop requested, queue empty, no active
/// workers).
pub trait SchedulerExt: Send + Sync {
    /// Out-of-band wake-up of an idle worker.
    fn tickle(&self);

    /// Body of the per-worker idle fiber; returns once the scheduler may
    /// stop.
    fn idle(&self);

    /// Full stop condition; extensions AND their own clauses into the base
    /// one.
    fn stopping(&self) -> bool;

    /// Downcast accessor for the I/O reactor, when the extension is one.
    fn io_manager(&self) -> Option<Arc<crate::io::IoManager>> {
        None
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_ids: Mutex<Vec<Pid>>,
    /// Number of spawned workers; excludes the caller thread.
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Set by `stop`; workers keep draining until the full stop condition
    /// holds.
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    /// Thread id of the caller in `use_caller` mode, -1 otherwise.
    root_thread: Pid,
    /// The caller-hosted dispatch fiber (`use_caller` only).
    dispatch: Mutex<Option<Arc<Fiber>>>,
    ext: OnceCell<Weak<dyn SchedulerExt>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread is counted as one of the
    /// workers: a dispatch fiber is set up on it and [`stop`](Self::stop)
    /// later drives that fiber to participate in draining the queue.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_thread = -1;
            let mut thread_ids = Vec::new();
            let mut dispatch = None;

            if use_caller {
                // Materialize the caller's root fiber before any switching.
                fiber::current();
                thread_count -= 1;

                assert!(
                    Scheduler::current().is_none(),
                    "thread already runs a scheduler"
                );
                bind_thread(weak.clone());

                let w = weak.clone();
                let f = Fiber::new(
                    move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                    true,
                )
                .expect("failed to allocate the dispatch fiber");
                set_dispatch_fiber(Some(f.clone()));
                root_thread = util::thread_id();
                thread_ids.push(root_thread);
                dispatch = Some(f);
            }

            Scheduler {
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(thread_ids),
                thread_count,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_thread,
                dispatch: Mutex::new(dispatch),
                ext: OnceCell::new(),
            }
        })
    }

    /// The scheduler bound to the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of the worker threads (including the caller in `use_caller`
    /// mode), available once [`start`](Self::start) returned.
    pub fn thread_ids(&self) -> Vec<Pid> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Spawns the worker threads. Safe to call once per lifetime; a second
    /// call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        if !self.stop_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        assert!(threads.is_empty());

        // Collect worker thread ids before returning so that callers may pin
        // tasks right away.
        let (tx, rx) = mpsc::channel();
        for i in 0..self.thread_count {
            let sched = self.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || {
                    let _ = tx.send(util::thread_id());
                    drop(tx);
                    sched.run();
                })
                .expect("failed to spawn a worker thread");
            threads.push(handle);
        }
        drop(tx);
        let mut ids = self.thread_ids.lock().unwrap();
        for _ in 0..self.thread_count {
            ids.push(rx.recv().expect("worker died before reporting its id"));
        }
    }

    /// Requests shutdown, wakes every worker and joins them.
    ///
    /// Every task enqueued before the call that can legally run is drained
    /// first; in `use_caller` mode the caller's dispatch fiber runs the loop
    /// itself until the queue is empty. Tasks submitted after shutdown began
    /// are best-effort, and a task pinned to a worker that already exited is
    /// dropped.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        let dispatch = self.dispatch.lock().unwrap().clone();
        if let Some(d) = &dispatch {
            if self.thread_count == 0
                && matches!(d.state(), State::Term | State::Init)
            {
                info!("scheduler {} stopped", self.name);
                self.stop_requested.store(true, Ordering::SeqCst);
                if self.stopping() {
                    return;
                }
            }
        }

        let bound_here = Scheduler::current()
            .map_or(false, |s| std::ptr::eq(Arc::as_ptr(&s), self));
        if self.root_thread != -1 {
            assert!(
                bound_here,
                "a use_caller scheduler must be stopped from its constructing thread"
            );
        } else {
            assert!(!bound_here, "stop called from inside a worker of this scheduler");
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if let Some(d) = dispatch {
            self.tickle();
            if !self.stopping() {
                d.call();
            }
        }

        let threads = mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }

    /// Pushes one task; wakes a worker if the queue was empty.
    pub fn schedule(&self, task: impl Into<Task>) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task.into());
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Appends a batch of tasks under a single lock acquisition, preserving
    /// their order; wakes a worker once if the queue went non-empty.
    pub fn schedule_bulk(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks);
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Moves the current fiber onto the given worker thread (any thread of
    /// this scheduler when `None`). No-op when already there.
    pub fn switch_to(&self, thread: Option<Pid>) {
        if let Some(cur) = Scheduler::current() {
            if std::ptr::eq(Arc::as_ptr(&cur), self) {
                match thread {
                    None => return,
                    Some(t) if t == util::thread_id() => return,
                    Some(_) => {}
                }
            }
        }
        let mut task = Task::from(fiber::current());
        task.thread = thread;
        self.schedule(task);
        fiber::yield_to_hold();
    }

    pub(crate) fn install_ext(&self, ext: Weak<dyn SchedulerExt>) {
        if self.ext.set(ext).is_err() {
            panic!("scheduler extension installed twice");
        }
    }

    pub(crate) fn ext(&self) -> Option<Arc<dyn SchedulerExt>> {
        self.ext.get().and_then(Weak::upgrade)
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Base stop condition: shutdown requested, nothing queued, nobody
    /// running a task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    fn stopping(&self) -> bool {
        match self.ext() {
            Some(ext) => ext.stopping(),
            None => self.base_stopping(),
        }
    }

    fn tickle(&self) {
        match self.ext() {
            Some(ext) => ext.tickle(),
            None => debug!("tickle"),
        }
    }

    /// Default idle body: spin-yield until the stop condition holds.
    fn base_idle(&self) {
        debug!("idle");
        while !self.stopping() {
            fiber::yield_to_hold();
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Run loop
    ////////////////////////////////////////////////////////////////////////

    /// Per-worker dispatch loop. Runs on worker threads directly and inside
    /// the caller's dispatch fiber in `use_caller` mode.
    fn run(self: &Arc<Self>) {
        debug!("scheduler {} run", self.name);
        bind_thread(Arc::downgrade(self));
        let tid = util::thread_id();

        if tid != self.root_thread {
            // A plain worker fuses the thread root fiber and the dispatch
            // fiber into one.
            set_dispatch_fiber(Some(fiber::current()));
        }

        let sched = self.clone();
        let idle_fiber = Fiber::new(
            move || match sched.ext() {
                Some(ext) => ext.idle(),
                None => sched.base_idle(),
            },
            0,
            false,
        )
        .expect("failed to allocate the idle fiber");
        // Reused across bare callbacks to avoid a stack allocation per task.
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut job = None;
            let mut tickle_me = false;
            let mut is_active = false;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut idx = 0;
                while idx < queue.len() {
                    // Leave tasks pinned to other threads in place, but make
                    // sure somebody else wakes up for them.
                    if let Some(pin) = queue[idx].thread {
                        if pin != tid {
                            tickle_me = true;
                            idx += 1;
                            continue;
                        }
                    }
                    // A fiber still running on another thread is not
                    // re-entrant; skip until it yields.
                    if let Some(f) = &queue[idx].fiber {
                        if f.state() == State::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    let task = queue.remove(idx).expect("index checked above");
                    debug_assert!(task.fiber.is_some() || task.cb.is_some());
                    job = Some(match task.fiber {
                        Some(f) => Job::Fiber(f),
                        None => Job::Call(task.cb.expect("empty task")),
                    });
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                    break;
                }
                // Still something queued behind the selected task.
                tickle_me = tickle_me || (job.is_some() && idx < queue.len());
            }
            if tickle_me {
                self.tickle();
            }

            // Terminal fibers in the queue are dropped, not resumed.
            let terminal = matches!(
                &job,
                Some(Job::Fiber(f)) if matches!(f.state(), State::Term | State::Except)
            );
            if terminal {
                job = None;
            }

            match job {
                Some(Job::Fiber(f)) => {
                    f.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    // Every suspension path records Hold/Ready before
                    // switching away, and an event may already have handed
                    // the fiber to another worker; only Ready is ours to act
                    // on.
                    if f.state() == State::Ready {
                        self.schedule(Task::from(f));
                    }
                }
                Some(Job::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0, false)
                            .expect("failed to allocate a callback fiber"),
                    };
                    f.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        State::Ready => self.schedule(Task::from(f)),
                        // Finished: keep the fiber around for the next
                        // callback.
                        State::Term | State::Except => cb_fiber = Some(f),
                        // Suspended awaiting an event; whoever armed the
                        // wait owns the handle now.
                        _ => {}
                    }
                }
                None => {
                    if is_active {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    if idle_fiber.state() == State::Term {
                        info!("scheduler {} idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("active", &self.active_threads.load(Ordering::SeqCst))
            .field("idle", &self.idle_threads.load(Ordering::SeqCst))
            .field("stopping", &self.stop_requested.load(Ordering::SeqCst))
            .field("thread_ids", &*self.thread_ids.lock().unwrap())
            .finish()
    }
}
