//! Event-driven I/O reactor.
//!
//! [`IoManager`] extends the [`Scheduler`] with file-descriptor readiness:
//! it owns an epoll instance, a table of per-fd continuation slots and a
//! [`TimerManager`], and replaces the scheduler's idle behavior with an
//! `epoll_wait` bounded by the next timer deadline. Arming an event stores a
//! callback — or the currently running fiber — which is pushed back onto the
//! scheduler queue when the descriptor becomes ready, a timer cancels the
//! wait, or the registration is torn down.
//!
//! A self-pipe registered edge-triggered serves as the tickle signal: writing
//! one byte unblocks a worker parked in `epoll_wait`.
//!
//! Shut the reactor down with [`stop`](Scheduler::stop) (through `Deref`)
//! before dropping the last handle; workers parked in the wait wake up within
//! the 3 second idle timeout even if the tickle write is lost.

use std::io;
use std::mem;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info};

use crate::fiber::{self, Fiber, State};
use crate::scheduler::{Callback, Scheduler, SchedulerExt, Task};
use crate::timer::{Timer, TimerManager};
use crate::Result;

/// Longest single `epoll_wait`, so that stop requests are noticed even when
/// the tickle byte is lost to a race.
const MAX_TIMEOUT_MS: u64 = 3000;
/// Readiness batch size per wait.
const MAX_EVENTS: usize = 256;
/// Initial size of the fd table.
const INITIAL_FD_SLOTS: usize = 32;

bitflags! {
    /// Readiness interest on a file descriptor. The bit values coincide with
    /// the epoll ones, so the set converts to and from `epoll_event.events`
    /// directly.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

////////////////////////////////////////////////////////////////////////////////
// FdContext
////////////////////////////////////////////////////////////////////////////////

/// Continuation slot of one event kind on one descriptor.
struct EventContext {
    /// Scheduler the continuation will be pushed to; recorded at arm time.
    scheduler: Option<Weak<Scheduler>>,
    /// The suspended fiber to wake. The slot holds the owning handle while
    /// the fiber waits; triggering transfers ownership to the queue.
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
}

impl EventContext {
    const EMPTY: EventContext = EventContext {
        scheduler: None,
        fiber: None,
        cb: None,
    };

    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        *self = EventContext::EMPTY;
    }
}

/// Armed-event mask plus the two continuation slots. Invariant: a bit is set
/// in `events` exactly when the matching slot holds a continuation.
struct FdState {
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per file-descriptor record; the table index is the fd itself.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            state: Mutex::new(FdState {
                events: Event::empty(),
                read: EventContext::EMPTY,
                write: EventContext::EMPTY,
            }),
        }
    }

    fn slot<'a>(state: &'a mut FdState, event: Event) -> &'a mut EventContext {
        if event == Event::READ {
            &mut state.read
        } else if event == Event::WRITE {
            &mut state.write
        } else {
            panic!("invalid event {:?}", event);
        }
    }

    /// Disarms `event` and pushes its continuation onto the recorded
    /// scheduler (falling back to the reactor's own).
    fn trigger(&self, state: &mut FdState, event: Event, fallback: &Arc<Scheduler>) {
        assert!(
            state.events.contains(event),
            "triggering unarmed event {:?} on fd {}",
            event,
            self.fd
        );
        state.events.remove(event);
        let slot = FdContext::slot(state, event);
        let sched = slot
            .scheduler
            .take()
            .and_then(|weak| weak.upgrade())
            .unwrap_or_else(|| fallback.clone());
        if let Some(cb) = slot.cb.take() {
            sched.schedule(Task::from(cb));
        } else if let Some(f) = slot.fiber.take() {
            sched.schedule(Task::from(f));
        }
        debug_assert!(slot.is_empty());
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

pub struct IoManager {
    me: Weak<IoManager>,
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe: `[read end, write end]`. The read end is non-blocking and
    /// watched edge-triggered.
    tickle_fds: [RawFd; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Armed (fd, event) pairs with a stored continuation.
    pending_events: AtomicUsize,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl IoManager {
    /// Creates the reactor and starts its scheduler immediately.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut tickle_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }

        let init = (|| -> Result<()> {
            // Non-blocking read end: the idle loop drains it to EAGAIN on
            // every edge.
            if unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
                return Err(io::Error::last_os_error().into());
            }
            let mut ev: libc::epoll_event = unsafe { mem::zeroed() };
            ev.events = libc::EPOLLIN as u32 | libc::EPOLLET as u32;
            ev.u64 = tickle_fds[0] as u64;
            if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) } != 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        })();
        if let Err(err) = init {
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(err);
        }

        let scheduler = Scheduler::new(threads, use_caller, name);
        let io = Arc::new_cyclic(|me| IoManager {
            me: me.clone(),
            scheduler,
            timers: TimerManager::new(),
            epfd,
            tickle_fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });

        // A timer that becomes the new earliest deadline must shorten the
        // wait already in flight.
        let weak = io.me.clone();
        io.timers.set_front_notify(Box::new(move || {
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        }));
        io.scheduler
            .install_ext(Arc::downgrade(&io) as Weak<dyn SchedulerExt>);

        io.resize_contexts(INITIAL_FD_SLOTS);
        io.scheduler.start();
        Ok(io)
    }

    /// The reactor driving the calling thread's scheduler, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current()?.ext()?.io_manager()
    }

    /// Number of armed (fd, event) pairs still waiting for delivery.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    ////////////////////////////////////////////////////////////////////////
    // Event registration
    ////////////////////////////////////////////////////////////////////////

    /// Arms `event` on `fd` and stores the continuation: `cb` if given, the
    /// currently running fiber otherwise (which the triggering side will
    /// make runnable again).
    ///
    /// Arming an event that is already armed on the same fd is a programmer
    /// error and panics. An epoll failure is logged and returned; nothing is
    /// stored.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "invalid event {:?}",
            event
        );
        let fd_ctx = self.fd_context(fd, true).expect("fd table grows on demand");
        let mut state = fd_ctx.state.lock().unwrap();
        assert!(
            !state.events.contains(event),
            "event {:?} already armed on fd {}",
            event,
            fd
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(op, fd, state.events | event)?;

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events.insert(event);
        let slot = FdContext::slot(&mut state, event);
        debug_assert!(slot.is_empty());

        // Off-scheduler callers (arming from a plain thread) fall back to
        // this reactor's own scheduler.
        slot.scheduler = Some(match Scheduler::current() {
            Some(sched) => Arc::downgrade(&sched),
            None => Arc::downgrade(&self.scheduler),
        });
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let cur = fiber::current();
                assert_eq!(
                    cur.state(),
                    State::Exec,
                    "add_event without a callback requires a running fiber"
                );
                slot.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Disarms `event` on `fd` and discards its continuation without running
    /// it. Returns `false` if the event was not armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.fd_context(fd, false) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        FdContext::slot(&mut state, event).clear();
        true
    }

    /// Disarms `event` on `fd` and triggers its continuation exactly once,
    /// as if the readiness had arrived. This is the timeout path: the caller
    /// decided the wait is over.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.fd_context(fd, false) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }

        fd_ctx.trigger(&mut state, event, &self.scheduler);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Removes `fd` from the reactor entirely, triggering both continuations
    /// if armed. After this returns no readiness can be delivered for the fd
    /// until a new [`add_event`](Self::add_event).
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let fd_ctx = match self.fd_context(fd, false) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if state.events.is_empty() {
            return false;
        }

        if self
            .epoll_update(libc::EPOLL_CTL_DEL, fd, Event::empty())
            .is_err()
        {
            return false;
        }

        if state.events.contains(Event::READ) {
            fd_ctx.trigger(&mut state, Event::READ, &self.scheduler);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            fd_ctx.trigger(&mut state, Event::WRITE, &self.scheduler);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(state.events.is_empty());
        true
    }

    ////////////////////////////////////////////////////////////////////////
    // Timers
    ////////////////////////////////////////////////////////////////////////

    /// See [`TimerManager::add_timer`].
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Suspends the current fiber for at least `dur`, without blocking the
    /// worker thread.
    pub fn sleep(&self, dur: Duration) {
        let cur = fiber::current();
        assert_eq!(cur.state(), State::Exec, "sleep outside a running fiber");
        let sched = self.scheduler.clone();
        // The timer body is a Fn; the one-shot hand-off lives in a Mutex.
        let target = Mutex::new(Some(cur));
        self.timers.add_timer(
            dur.as_millis() as u64,
            move || {
                if let Some(f) = target.lock().unwrap().take() {
                    sched.schedule(Task::from(f));
                }
            },
            false,
        );
        fiber::yield_to_hold();
    }

    ////////////////////////////////////////////////////////////////////////
    // Fd table
    ////////////////////////////////////////////////////////////////////////

    /// Looks up the per-fd record, growing the table geometrically when
    /// arming a descriptor beyond its current size.
    fn fd_context(&self, fd: RawFd, grow: bool) -> Option<Arc<FdContext>> {
        assert!(fd >= 0, "negative fd {}", fd);
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read().unwrap();
            if idx < contexts.len() {
                return Some(contexts[idx].clone());
            }
        }
        if !grow {
            return None;
        }
        let mut contexts = self.fd_contexts.write().unwrap();
        // Re-check: a concurrent grower may have won the write lock.
        if idx >= contexts.len() {
            let target = (idx + idx / 2).max(idx + 1);
            Self::resize_locked(&mut contexts, target);
        }
        Some(contexts[idx].clone())
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write().unwrap();
        Self::resize_locked(&mut contexts, size);
    }

    fn resize_locked(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
        let start = contexts.len();
        contexts.extend((start..size).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
    }

    ////////////////////////////////////////////////////////////////////////
    // Epoll plumbing
    ////////////////////////////////////////////////////////////////////////

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, events: Event) -> Result<()> {
        let bits = events.bits() | libc::EPOLLET as u32;
        let mut ev: libc::epoll_event = unsafe { mem::zeroed() };
        ev.events = bits;
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            error!(
                "epoll_ctl({}, {}, fd={}, events={:#x}) failed: {}",
                self.epfd,
                op_name(op),
                fd,
                bits,
                err
            );
            return Err(err.into());
        }
        Ok(())
    }

    /// Replacement idle body: park in `epoll_wait` until readiness, a due
    /// timer or a tickle, push the resulting work onto the queue and yield
    /// back to the dispatch loop.
    fn idle_loop(&self) {
        debug!("idle");
        let mut events = vec![unsafe { mem::zeroed::<libc::epoll_event>() }; MAX_EVENTS];

        loop {
            let next_timeout = self.timers.next_timeout();
            if next_timeout.is_none()
                && self.pending_events.load(Ordering::SeqCst) == 0
                && self.scheduler.base_stopping()
            {
                info!("scheduler {} idle stopping exit", self.scheduler.name());
                break;
            }

            let ready = loop {
                let timeout_ms = next_timeout.map_or(MAX_TIMEOUT_MS, |ms| ms.min(MAX_TIMEOUT_MS));
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout_ms as libc::c_int,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("epoll_wait({}) failed: {}", self.epfd, err);
                return;
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                self.scheduler.schedule_bulk(
                    expired
                        .into_iter()
                        .map(|cb| Task::callback(move || (*cb)())),
                );
            }

            for i in 0..ready {
                // Copy out: the struct is packed, fields must not be
                // borrowed in place.
                let ev = events[i];
                let revents = ev.events;
                let fd = ev.u64 as RawFd;

                if fd == self.tickle_fds[0] {
                    // Edge-triggered: drain every pending byte or the next
                    // tickle is lost.
                    let mut dummy = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            dummy.as_mut_ptr() as *mut libc::c_void,
                            dummy.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let fd_ctx = match self.fd_context(fd, false) {
                    Some(ctx) => ctx,
                    None => continue,
                };
                let mut state = fd_ctx.state.lock().unwrap();

                // An error or hang-up must wake whoever is waiting, whatever
                // they were waiting for.
                let mut bits = revents;
                if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    bits |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & state.events.bits();
                }
                let real = Event::from_bits_truncate(bits) & state.events;
                if real.is_empty() {
                    continue;
                }

                let left = state.events - real;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(op, fd_ctx.fd, left).is_err() {
                    continue;
                }

                if real.contains(Event::READ) {
                    fd_ctx.trigger(&mut state, Event::READ, &self.scheduler);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::WRITE) {
                    fd_ctx.trigger(&mut state, Event::WRITE, &self.scheduler);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let the dispatch loop drain whatever was just scheduled; it
            // re-enters idle when it runs out of work.
            fiber::yield_to_hold();
        }
    }
}

impl SchedulerExt for IoManager {
    /// Wakes a parked worker by writing one byte into the self-pipe. Skipped
    /// when no worker is idle — a running worker rechecks the queue anyway.
    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let rc = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        assert_eq!(rc, 1, "tickle write failed: {}", io::Error::last_os_error());
    }

    fn idle(&self) {
        self.idle_loop();
    }

    /// The reactor may stop only when, on top of the base condition, no
    /// timer is outstanding and no event is armed.
    fn stopping(&self) -> bool {
        self.timers.next_timeout().is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping()
    }

    fn io_manager(&self) -> Option<Arc<IoManager>> {
        self.me.upgrade()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}
