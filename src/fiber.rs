//! Cooperative multitasking primitives.
//!
//! A [`Fiber`] is a stackful coroutine: a callback running on its own private
//! stack, with an explicitly saved machine context. Resuming a fiber switches
//! the calling thread onto that stack; the fiber runs until it yields
//! ([`yield_to_hold`], [`yield_to_ready`]) or its callback returns. Context
//! switching is entirely in user space, so a fiber that never yields keeps
//! its thread.
//!
//! Two fibers per thread are distinguished:
//! - the *thread root fiber*, a synthetic fiber wrapping the thread's
//!   original stack, materialized lazily by [`current`];
//! - the *dispatch fiber*, which executes a scheduler's run loop and is the
//!   resume target of ordinary worker fibers.
//!
//! On a scheduler worker thread the two are one and the same. A fiber created
//! with `run_in_caller` yields back to the thread root fiber instead of the
//! dispatch fiber; the scheduler uses this for the dispatch fiber itself when
//! it is hosted on an already-existing thread.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error};
use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::Result;

mod stack;
use stack::Stack;

static FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> =
    Lazy::new(|| Config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size"));

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The synthetic fiber wrapping this thread's original stack.
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Life-cycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Suspended, waiting for an external wakeup (event, timer, explicit
    /// re-schedule).
    Hold,
    /// Executing on some thread right now.
    Exec,
    /// The callback returned.
    Term,
    /// Suspended, ready to run again.
    Ready,
    /// The callback panicked.
    Except,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Term,
            4 => State::Ready,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }

    /// A fiber in a terminal state may be reset or dropped.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Init | State::Term | State::Except)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful coroutine.
///
/// Handles are shared (`Arc<Fiber>`): the scheduler queue, per-fd event slots
/// and the thread-local "current fiber" all hold clones of the same handle.
/// A fiber is `Exec` on at most one thread at any instant, and every state
/// transition happens either on that thread or before the first resume; all
/// interior mutability below relies on that single-owner discipline.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: UnsafeCell<libc::ucontext_t>,
    stack: Option<Stack>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    run_in_caller: bool,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a suspended fiber around `cb`.
    ///
    /// `stack_size == 0` uses the `fiber.stack_size` config value. With
    /// `run_in_caller` the fiber returns control to the thread root fiber
    /// instead of the dispatch fiber when it yields or finishes.
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_caller: bool,
    ) -> Result<Arc<Fiber>> {
        let size = if stack_size != 0 {
            stack_size
        } else {
            STACK_SIZE.value() as usize
        };
        let fiber = Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: Some(Stack::new(size)?),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            run_in_caller,
        });
        unsafe { fiber.init_context() };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!("fiber created id={}", fiber.id);
        Ok(fiber)
    }

    /// The thread root fiber: no private stack, permanently `Exec`.
    fn new_root() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: 0,
            state: AtomicU8::new(State::Exec as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: None,
            cb: UnsafeCell::new(None),
            run_in_caller: false,
        });
        // The context becomes meaningful the first time another fiber saves
        // into it during a switch; getcontext just keeps it well-formed.
        let rc = unsafe { libc::getcontext(fiber.ctx.get()) };
        assert_eq!(rc, 0, "getcontext failed: {}", io::Error::last_os_error());
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!("thread root fiber created");
        fiber
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Re-arms a finished fiber with a new callback, reusing its stack.
    ///
    /// The state must be `Init`, `Term` or `Except`; the fiber goes back to
    /// `Init`.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        assert!(self.stack.is_some(), "cannot reset the thread root fiber");
        let state = self.state();
        assert!(
            state.is_terminal(),
            "fiber {} reset in state {:?}",
            self.id,
            state
        );
        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            self.init_context();
        }
        self.set_state(State::Init);
    }

    /// Switches the calling thread onto this fiber's stack, saving the
    /// caller's continuation in the dispatch fiber (or, off-scheduler, the
    /// thread root fiber). Returns when the fiber yields or finishes.
    pub fn resume(self: &Arc<Self>) {
        let from = resume_target();
        self.switch_from(&from);
    }

    /// Like [`resume`](Self::resume), but saves the caller's continuation in
    /// the thread root fiber. Used to drive a `run_in_caller` dispatch fiber
    /// from the thread that constructed the scheduler.
    pub fn call(self: &Arc<Self>) {
        let from = ensure_root();
        self.switch_from(&from);
    }

    fn switch_from(self: &Arc<Self>, from: &Fiber) {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Ready | State::Hold),
            "fiber {} resumed in state {:?}",
            self.id,
            state
        );
        set_current(self.clone());
        self.set_state(State::Exec);
        let rc = unsafe { libc::swapcontext(from.ctx.get(), self.ctx.get()) };
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }

    /// Returns control to the dispatch fiber (or the thread root fiber when
    /// no scheduler is bound). The caller's state must already be updated.
    fn swap_out(&self) {
        let to = resume_target();
        let to_ctx: *const libc::ucontext_t = to.ctx.get();
        // The thread-local keeps the target alive across the switch; holding
        // an extra strong reference here would never be released on the
        // terminal path.
        set_current(to);
        let rc = unsafe { libc::swapcontext(self.ctx.get(), to_ctx) };
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }

    /// Returns control to the thread root fiber.
    fn back(&self) {
        let to = ensure_root();
        let to_ctx: *const libc::ucontext_t = to.ctx.get();
        set_current(to);
        let rc = unsafe { libc::swapcontext(self.ctx.get(), to_ctx) };
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }

    /// Points the saved context at the entry trampoline on this fiber's own
    /// stack.
    unsafe fn init_context(&self) {
        let ctx = self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            panic!("getcontext failed: {}", io::Error::last_os_error());
        }
        let stack = self
            .stack
            .as_ref()
            .expect("init_context on the thread root fiber");
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.size();
        let entry: extern "C" fn() = if self.run_in_caller {
            caller_fiber_entry
        } else {
            fiber_entry
        };
        libc::makecontext(ctx, entry, 0);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                state.is_terminal(),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        }
        debug!("fiber dropped id={} total={}", self.id, total_fibers());
    }
}

////////////////////////////////////////////////////////////////////////////////
// Entry trampolines
////////////////////////////////////////////////////////////////////////////////

/// Entry of an ordinary fiber; the final switch targets the dispatch fiber.
extern "C" fn fiber_entry() {
    let raw = invoke_callback();
    unsafe { (*raw).swap_out() };
    unreachable!("fiber resumed after completion");
}

/// Entry of a `run_in_caller` fiber; the final switch targets the thread
/// root fiber.
extern "C" fn caller_fiber_entry() {
    let raw = invoke_callback();
    unsafe { (*raw).back() };
    unreachable!("fiber resumed after completion");
}

/// Runs the fiber callback, records the terminal state and releases the
/// trampoline's own strong handle. Panics are stopped here: they must not
/// unwind into the resumer's stack.
fn invoke_callback() -> *const Fiber {
    let cur = current();
    let cb = unsafe { (*cur.cb.get()).take() }.expect("fiber entered without a callback");
    match panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(State::Term),
        Err(payload) => {
            cur.set_state(State::Except);
            error!(
                "fiber panicked: {} fiber_id={}\n{}",
                panic_message(&*payload),
                cur.id,
                Backtrace::force_capture()
            );
        }
    }
    // Mirror the resumer side: only the raw pointer survives past this point,
    // the queue/slot/resumer handles own the fiber from here on.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    raw
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local accessors
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on this thread.
///
/// On first use from a plain thread this materializes the thread root fiber,
/// making the thread's original stack resumable like any other fiber.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    ensure_root()
}

/// Id of the current fiber, `0` when the thread has no fiber yet (the thread
/// root fiber also has id `0`).
pub fn fiber_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
}

/// Number of live fibers in the process, thread root fibers included.
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Suspends the current fiber in `Ready` state: it stays runnable and the
/// scheduler will re-queue it.
pub fn yield_to_ready() {
    let cur = current();
    assert_eq!(cur.state(), State::Exec, "yield outside a running fiber");
    cur.set_state(State::Ready);
    cur.swap_out();
}

/// Suspends the current fiber in `Hold` state: it runs again only after an
/// event, timer or explicit re-schedule wakes it.
pub fn yield_to_hold() {
    let cur = current();
    assert_eq!(cur.state(), State::Exec, "yield outside a running fiber");
    cur.set_state(State::Hold);
    cur.swap_out();
}

/// Suspends the current fiber for at least `dur` when a reactor drives this
/// thread; off the runtime it degrades to a blocking thread sleep.
pub fn sleep(dur: std::time::Duration) {
    match crate::io::IoManager::current() {
        Some(io) => io.sleep(dur),
        None => std::thread::sleep(dur),
    }
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// The thread root fiber, created on first use.
pub(crate) fn ensure_root() -> Arc<Fiber> {
    THREAD_ROOT.with(|root| {
        let existing = root.borrow().clone();
        match existing {
            Some(f) => f,
            None => {
                let f = Fiber::new_root();
                *root.borrow_mut() = Some(f.clone());
                set_current(f.clone());
                f
            }
        }
    })
}

/// Where a yielding fiber hands control: the scheduler's dispatch fiber if
/// one is bound on this thread, the thread root fiber otherwise.
fn resume_target() -> Arc<Fiber> {
    crate::scheduler::dispatch_fiber().unwrap_or_else(ensure_root)
}
