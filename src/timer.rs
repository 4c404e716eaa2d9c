//! Deadline-ordered timers.
//!
//! A [`TimerManager`] keeps timers sorted by `(deadline, insertion order)`
//! over the monotonic millisecond clock. It does not run anything by itself:
//! the owner polls [`next_timeout`](TimerManager::next_timeout) to size its
//! wait and extracts due callbacks with
//! [`list_expired`](TimerManager::list_expired). The I/O reactor installs a
//! front-insert notifier so that a timer becoming the new earliest deadline
//! shortens an already-running wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// A timer body; recurring timers invoke it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Backward clock jumps larger than this window expire everything once.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

struct TimerInner {
    /// Period in milliseconds; also the initial delay.
    period_ms: AtomicU64,
    /// Absolute deadline on the monotonic clock.
    deadline_ms: AtomicU64,
    recurring: bool,
    /// Insertion tiebreak for equal deadlines.
    seq: u64,
    /// Taken on cancellation and on one-shot expiry.
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerSet>,
}

impl TimerInner {
    fn key(&self) -> TimerKey {
        (self.deadline_ms.load(Ordering::SeqCst), self.seq)
    }
}

type TimerKey = (u64, u64);

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Unschedules the timer. Returns `false` if it already fired (one-shot)
    /// or was cancelled before.
    pub fn cancel(&self) -> bool {
        let set = match self.inner.manager.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        let mut cb = self.inner.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&self.inner.key());
        true
    }

    /// Pushes the deadline to `now + period` without changing the period.
    pub fn refresh(&self) -> bool {
        let set = match self.inner.manager.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        if self.inner.cb.lock().unwrap().is_none() {
            return false;
        }
        timers.remove(&self.inner.key());
        let deadline = clock::monotonic_ms() + self.inner.period_ms.load(Ordering::SeqCst);
        self.inner.deadline_ms.store(deadline, Ordering::SeqCst);
        timers.insert(self.inner.key(), self.inner.clone());
        true
    }

    /// Changes the period to `ms` and re-indexes the timer. With `from_now`
    /// the new deadline is `now + ms`, otherwise the original start point is
    /// preserved.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.inner.period_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let set = match self.inner.manager.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let at_front;
        {
            let mut timers = set.timers.write().unwrap();
            if self.inner.cb.lock().unwrap().is_none() {
                return false;
            }
            timers.remove(&self.inner.key());
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                self.inner.deadline_ms.load(Ordering::SeqCst)
                    - self.inner.period_ms.load(Ordering::SeqCst)
            };
            self.inner.period_ms.store(ms, Ordering::SeqCst);
            self.inner.deadline_ms.store(start + ms, Ordering::SeqCst);
            at_front = set.insert_locked(&mut timers, self.inner.clone());
        }
        if at_front {
            set.notify_front();
        }
        true
    }
}

////////////////////////////////////////////////////////////////////////////////
// TimerManager
////////////////////////////////////////////////////////////////////////////////

/// Shared core; `Timer` handles hold a weak reference back into it.
struct TimerSet {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerInner>>>,
    /// Coalesces front-insert notifications until the next timeout query.
    tickled: AtomicBool,
    /// Last observed clock reading, for rollback detection.
    previous_ms: AtomicU64,
    next_seq: AtomicU64,
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerSet {
    /// Caller must hold the write lock. Returns whether the new timer became
    /// the earliest one and a notification is due.
    fn insert_locked(
        &self,
        timers: &mut BTreeMap<TimerKey, Arc<TimerInner>>,
        inner: Arc<TimerInner>,
    ) -> bool {
        let key = inner.key();
        timers.insert(key, inner);
        let at_front = timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    fn notify_front(&self) {
        if let Some(f) = self.on_front.get() {
            f();
        }
    }

    /// A clock running more than an hour behind the previous sample means
    /// the system clock was set back; report it so pending timers are not
    /// stalled indefinitely.
    fn detect_clock_rollover(&self, now_ms: u64) -> bool {
        let previous = self.previous_ms.swap(now_ms, Ordering::SeqCst);
        now_ms < previous.saturating_sub(ROLLOVER_WINDOW_MS)
    }
}

pub struct TimerManager {
    set: Arc<TimerSet>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            set: Arc::new(TimerSet {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(clock::monotonic_ms()),
                next_seq: AtomicU64::new(0),
                on_front: OnceCell::new(),
            }),
        }
    }

    /// Installs the front-insert notifier (the reactor's `tickle`).
    pub(crate) fn set_front_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        if self.set.on_front.set(f).is_err() {
            panic!("timer front notifier installed twice");
        }
    }

    /// Schedules `cb` to run in `ms` milliseconds, and every `ms` thereafter
    /// when `recurring`.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_inner(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs while
    /// the witness is still alive; an expired witness silently drops the
    /// firing.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer_inner(
            ms,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    fn add_timer_inner(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let inner = Arc::new(TimerInner {
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(clock::monotonic_ms() + ms),
            recurring,
            seq: self.set.next_seq.fetch_add(1, Ordering::Relaxed),
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(&self.set),
        });
        let at_front = {
            let mut timers = self.set.timers.write().unwrap();
            self.set.insert_locked(&mut timers, inner.clone())
        };
        if at_front {
            self.set.notify_front();
        }
        Timer { inner }
    }

    /// Milliseconds until the earliest deadline: `Some(0)` when already due,
    /// `None` when no timer is scheduled.
    pub fn next_timeout(&self) -> Option<u64> {
        self.set.tickled.store(false, Ordering::SeqCst);
        let timers = self.set.timers.read().unwrap();
        let (&(deadline, _), _) = timers.iter().next()?;
        Some(deadline.saturating_sub(clock::monotonic_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.set.timers.read().unwrap().is_empty()
    }

    /// Extracts every due callback, in non-decreasing deadline order with
    /// ties in insertion order. Non-recurring timers are consumed; recurring
    /// ones are re-armed at `now + period`.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now_ms = clock::monotonic_ms();
        let mut cbs = Vec::new();
        {
            let timers = self.set.timers.read().unwrap();
            if timers.is_empty() {
                return cbs;
            }
        }

        let mut timers = self.set.timers.write().unwrap();
        self.set.tickled.store(false, Ordering::SeqCst);
        let rollover = self.set.detect_clock_rollover(now_ms);
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now_ms => {}
                _ => return cbs,
            }
        }

        // Everything at or before `now` expires; on rollover, everything.
        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            let keep = timers.split_off(&(now_ms + 1, 0));
            std::mem::replace(&mut *timers, keep)
        };

        for (_, inner) in expired {
            let cb = {
                let mut slot = inner.cb.lock().unwrap();
                if inner.recurring {
                    slot.clone()
                } else {
                    slot.take()
                }
            };
            let cb = match cb {
                Some(cb) => cb,
                None => continue,
            };
            if inner.recurring {
                inner
                    .deadline_ms
                    .store(now_ms + inner.period_ms.load(Ordering::SeqCst), Ordering::SeqCst);
                timers.insert(inner.key(), inner.clone());
            }
            cbs.push(cb);
        }
        cbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fired_counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn expiry_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(0u64, 2), (0, 3), (0, 4)].iter().copied() {
            let order = order.clone();
            mgr.add_timer(ms, move || order.lock().unwrap().push(tag), false);
        }
        // Equal deadlines tie-break by insertion order.
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 3);
        for cb in &cbs {
            (**cb)();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 4]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn future_timers_stay_scheduled() {
        let mgr = TimerManager::new();
        let (count, cb) = fired_counter();
        mgr.add_timer(60_000, cb, false);
        assert!(mgr.list_expired().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let next = mgr.next_timeout().unwrap();
        assert!(next > 50_000 && next <= 60_000);
    }

    #[test]
    fn cancel_is_final() {
        let mgr = TimerManager::new();
        let (count, cb) = fired_counter();
        let timer = mgr.add_timer(0, cb, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        for cb in mgr.list_expired() {
            (*cb)();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn recurring_timer_rearms() {
        let mgr = TimerManager::new();
        let (count, cb) = fired_counter();
        let timer = mgr.add_timer(0, cb, true);
        for cb in mgr.list_expired() {
            (*cb)();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer(), "recurring timer must be re-armed");
        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn reset_reindexes() {
        let mgr = TimerManager::new();
        let (_count, cb) = fired_counter();
        let timer = mgr.add_timer(60_000, cb, false);
        assert!(timer.reset(10, true));
        assert!(mgr.next_timeout().unwrap() <= 10);
        assert!(timer.cancel());
    }

    #[test]
    fn refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let (_count, cb) = fired_counter();
        let timer = mgr.add_timer(1_000, cb, false);
        assert!(timer.refresh());
        let next = mgr.next_timeout().unwrap();
        assert!(next > 900 && next <= 1_000);
    }

    #[test]
    fn clock_rollback_expires_everything_once() {
        let mgr = TimerManager::new();
        let (count, cb) = fired_counter();
        mgr.add_timer(600_000, cb, false);

        // Pretend the previous sample was far in the future: the next reading
        // looks like a backward jump of well over an hour.
        mgr.set
            .previous_ms
            .store(clock::monotonic_ms() + 2 * ROLLOVER_WINDOW_MS, Ordering::SeqCst);

        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            (*cb)();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Exactly once: the set is drained and the clock looks sane again.
        assert!(mgr.list_expired().is_empty());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn condition_timer_drops_with_witness() {
        let mgr = TimerManager::new();
        let (count, cb) = fired_counter();
        let witness = Arc::new(());
        mgr.add_condition_timer(0, cb, Arc::downgrade(&witness), false);
        drop(witness);
        for cb in mgr.list_expired() {
            (*cb)();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
