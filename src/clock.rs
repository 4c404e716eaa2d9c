//! Time readings derived from the POSIX `clock_gettime` family.
//!
//! The runtime keeps all deadlines on the monotonic clock: it is unaffected
//! by administrative clock changes, which makes it the right base for
//! timeouts (see [`crate::timer`] for what happens when the *previous*
//! samples turn out to have come from a clock that jumped).

use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

/// The monotonic time since some unspecified start point.
#[inline]
pub fn monotonic() -> Duration {
    read(libc::CLOCK_MONOTONIC)
}

/// The monotonic time in whole milliseconds. This is the clock the timer set
/// keys its deadlines on.
#[inline]
pub fn monotonic_ms() -> u64 {
    monotonic().as_millis() as u64
}

/// The wall clock time since the epoch, as set by the administrator.
#[inline]
pub fn realtime() -> Duration {
    read(libc::CLOCK_REALTIME)
}

fn read(clock: libc::clockid_t) -> Duration {
    unsafe {
        let mut timespec = MaybeUninit::<libc::timespec>::zeroed().assume_init();
        if libc::clock_gettime(clock, &mut timespec) != 0 {
            let err = io::Error::last_os_error();
            panic!("failed to read the clock: {}", err);
        }
        Duration::new(timespec.tv_sec as u64, timespec.tv_nsec as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backward() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
    }
}
