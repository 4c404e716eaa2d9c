//! Small OS helpers.

use std::cell::Cell;

/// The kernel thread id of the calling thread (`gettid`), cached per thread.
///
/// Unlike `std::thread::ThreadId` this is the id the kernel reports in tools
/// like `top`, and the value scheduler task pins are matched against.
pub fn thread_id() -> libc::pid_t {
    thread_local! {
        static TID: Cell<libc::pid_t> = Cell::new(-1);
    }
    TID.with(|tid| {
        let mut id = tid.get();
        if id == -1 {
            id = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            tid.set(id);
        }
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_per_thread() {
        assert_eq!(thread_id(), thread_id());
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
