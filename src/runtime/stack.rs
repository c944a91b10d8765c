//! Guard-paged fiber stacks.

use std::num::NonZeroUsize;
use std::{ffi, io, mem, ptr};

const PAGE_SIZE: usize = 4096;

#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
}

impl Stack {
    /// Allocates a general purpose stack.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using guard pages.
    pub(super) fn new(guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        assert_eq!(page_size, PAGE_SIZE);

        let length = Self::length(guard_pages, usable_pages);

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
        };

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard_pages.get() * PAGE_SIZE, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }

    /// Reclaims a stack previously leaked with [Stack::into_base].
    ///
    /// # Safety
    /// [base] must come from [Stack::into_base] of a stack with the same page counts.
    pub(super) unsafe fn from_base(base: *mut u8, guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> Self {
        let length = Self::length(guard_pages, usable_pages);
        Stack {
            pointer: base.sub(length),
            length,
        }
    }

    /// Upper address of the usable memory, ownership is handed to the caller.
    pub(super) fn into_base(self) -> *mut u8 {
        let base = self.base();
        mem::forget(self);
        base
    }

    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }

    fn length(guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> usize {
        (guard_pages.get() + usable_pages.get()) * PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn survives_round_trip_through_base() {
        let pages = NonZeroUsize::new(2).unwrap();
        let base = Stack::new(NonZeroUsize::MIN, pages).unwrap().into_base();

        let stack = unsafe { Stack::from_base(base, NonZeroUsize::MIN, pages) };

        assert_eq!(stack.base(), base);
    }

    #[test]
    #[ignore = "aborts process"]
    fn overflow() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(PAGE_SIZE + 1);
            pointer.write(123);
        }
    }
}
