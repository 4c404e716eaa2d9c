//! Fiber stack allocation.
//!
//! Stacks are anonymous `mmap` regions with a `PROT_NONE` guard page at the
//! low end, so that an overflow faults instead of silently corrupting a
//! neighbouring allocation. The usable area is rounded up to the page size
//! and returned to the OS on drop.

use std::io;
use std::ptr;

pub(crate) struct Stack {
    base: *mut u8,
    mmap_len: usize,
    size: usize,
}

impl Stack {
    /// Maps a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = (size.max(page) + page - 1) & !(page - 1);
        let mmap_len = size + page;

        unsafe {
            // Reserve the whole region inaccessible first, then open up
            // everything above the guard page.
            let base = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // If mprotect fails the mapping is released by Drop.
            let stack = Stack {
                base: base as *mut u8,
                mmap_len,
                size,
            };
            if libc::mprotect(
                stack.base.add(page) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(stack)
        }
    }

    /// Lowest usable address, right above the guard page.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.mmap_len - self.size) }
    }

    /// Usable stack size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(rc, 0);
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(page.is_power_of_two());
    page
}
