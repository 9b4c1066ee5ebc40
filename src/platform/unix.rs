//! Unix virtual memory implementation using mmap/mprotect/munmap.

use core::ffi::{c_int, c_void};

const PROT_NONE: c_int = 0x0;
const PROT_READ: c_int = 0x1;
const PROT_WRITE: c_int = 0x2;
const MAP_PRIVATE: c_int = 0x02;
const MAP_FIXED: c_int = 0x10;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const MAP_ANONYMOUS: c_int = 0x20;
    } else {
        const MAP_ANONYMOUS: c_int = 0x1000;
    }
}

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> c_int;

    fn mprotect(addr: *mut c_void, len: usize, prot: c_int) -> c_int;

    fn getpagesize() -> c_int;

    fn pthread_atfork(
        prepare: extern "C" fn(),
        parent: extern "C" fn(),
        child: extern "C" fn(),
    ) -> c_int;
}

/// Reserve address space with no access permissions.
pub unsafe fn reserve(size: usize) -> *mut u8 {
    let p = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == MAP_FAILED {
        return core::ptr::null_mut();
    }
    p.cast()
}

/// Replace a range with a fresh inaccessible mapping.
pub unsafe fn map_fixed(ptr: *mut u8, size: usize) -> bool {
    let p = unsafe {
        mmap(
            ptr.cast(),
            size,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
            -1,
            0,
        )
    };
    p == ptr.cast()
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) -> bool {
    unsafe { munmap(ptr.cast(), size) == 0 }
}

pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
    unsafe { mprotect(ptr.cast(), size, PROT_READ | PROT_WRITE) == 0 }
}

pub unsafe fn protect_ro(ptr: *mut u8, size: usize) -> bool {
    unsafe { mprotect(ptr.cast(), size, PROT_READ) == 0 }
}

pub fn page_size() -> usize {
    unsafe { getpagesize() as usize }
}

pub fn at_fork(prepare: extern "C" fn(), parent: extern "C" fn(), child: extern "C" fn()) -> bool {
    unsafe { pthread_atfork(prepare, parent, child) == 0 }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const MREMAP_MAYMOVE: c_int = 1;
        const MREMAP_FIXED: c_int = 2;

        unsafe extern "C" {
            fn mremap(
                old_address: *mut c_void,
                old_size: usize,
                new_size: usize,
                flags: c_int,
                new_address: *mut c_void,
            ) -> *mut c_void;

            fn getrandom(buf: *mut c_void, buflen: usize, flags: u32) -> isize;
        }

        /// Move the mappings backing `[old, old + old_size)` to `new`
        /// without copying the pages.
        pub unsafe fn remap_fixed(
            old: *mut u8,
            old_size: usize,
            new: *mut u8,
            new_size: usize,
        ) -> bool {
            let p = unsafe {
                mremap(
                    old.cast(),
                    old_size,
                    new_size,
                    MREMAP_MAYMOVE | MREMAP_FIXED,
                    new.cast(),
                )
            };
            p == new.cast()
        }

        pub fn random_bytes(buf: &mut [u8]) -> bool {
            let mut filled = 0;
            while filled < buf.len() {
                let n = unsafe {
                    getrandom(
                        buf[filled..].as_mut_ptr().cast(),
                        buf.len() - filled,
                        0,
                    )
                };
                if n < 0 {
                    return false;
                }
                filled += n as usize;
            }
            true
        }
    } else {
        unsafe extern "C" {
            fn getentropy(buf: *mut c_void, buflen: usize) -> c_int;
        }

        /// No portable way to move mappings; callers fall back to copying.
        pub unsafe fn remap_fixed(
            _old: *mut u8,
            _old_size: usize,
            _new: *mut u8,
            _new_size: usize,
        ) -> bool {
            false
        }

        pub fn random_bytes(buf: &mut [u8]) -> bool {
            // getentropy caps each request at 256 bytes
            for chunk in buf.chunks_mut(256) {
                if unsafe { getentropy(chunk.as_mut_ptr().cast(), chunk.len()) } != 0 {
                    return false;
                }
            }
            true
        }
    }
}
