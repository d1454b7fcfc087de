// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine stacks.
//!
//! Each stack is an anonymous private mapping. The lowest page is left
//! `PROT_NONE` so that running off the end faults instead of scribbling
//! over a neighbouring allocation.

use std::ptr;

/// Required alignment of the initial stack pointer.
pub const STACK_ALIGN: usize = 16;

/// Owned execution stack for one conjury.
#[derive(Debug)]
pub struct Stack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

impl Stack {
    /// Map `size` usable bytes plus alignment slack and a guard page.
    ///
    /// Panics if the kernel refuses the mapping.
    pub fn new(size: usize) -> Self {
        let page = page_size();
        let usable = round_up(size.max(page) + STACK_ALIGN, page);
        let len = usable + page;

        // SAFETY: anonymous private mapping; no fd or address hint involved.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!(
                "failed to allocate {} byte conjury stack: {}",
                len,
                std::io::Error::last_os_error()
            );
        }

        // SAFETY: `base` is the start of the mapping we just created.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            panic!("failed to protect conjury stack guard page: {}", err);
        }

        Self {
            base: base as *mut u8,
            len,
            guard: page,
        }
    }

    /// Usable bytes between the guard page and the top.
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: guard < len, stays inside the mapping.
        unsafe { self.base.add(self.guard) }
    }

    /// One past the highest usable address.
    pub fn end(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the mapping.
        unsafe { self.base.add(self.len) }
    }

    /// Initial stack pointer for a fresh context.
    pub fn start(&self) -> *mut u8 {
        align_stack(self.end() as usize) as *mut u8
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping owned exclusively by self.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Align `top` down to `STACK_ALIGN` and step back one word, so the first
/// frame sees the same layout as after a `call`.
pub fn align_stack(top: usize) -> usize {
    (top & !(STACK_ALIGN - 1)) - std::mem::size_of::<usize>()
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}
