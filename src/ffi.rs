//! C ABI entry points.
//!
//! With the `ffi` feature the allocator exports `rhmalloc_`-prefixed
//! functions. The `c-abi` feature additionally exports the standard libc
//! entry point names plus the historical compatibility stubs, so a
//! staticlib build can serve as the process malloc, and registers an early
//! initialization constructor so fork handlers and root sealing happen as
//! soon as possible.

use crate::allocator;
use crate::util::{ENOSYS, set_errno};
use core::ffi::{c_int, c_void};

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc(size: usize) -> *mut c_void {
    allocator::malloc(size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    allocator::calloc(nmemb, size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rhmalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { allocator::realloc(ptr.cast(), size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rhmalloc_free(ptr: *mut c_void) {
    unsafe { allocator::free(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rhmalloc_free_sized(ptr: *mut c_void, size: usize) {
    unsafe { allocator::free_sized(ptr.cast(), size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rhmalloc_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    unsafe { allocator::posix_memalign(memptr.cast(), alignment, size) }
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    allocator::aligned_alloc(alignment, size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_memalign(alignment: usize, size: usize) -> *mut c_void {
    allocator::memalign(alignment, size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_valloc(size: usize) -> *mut c_void {
    allocator::valloc(size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_pvalloc(size: usize) -> *mut c_void {
    allocator::pvalloc(size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rhmalloc_malloc_usable_size(ptr: *mut c_void) -> usize {
    unsafe { allocator::malloc_usable_size(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_object_size(ptr: *mut c_void) -> usize {
    allocator::malloc_object_size(ptr.cast())
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_object_size_fast(ptr: *mut c_void) -> usize {
    allocator::malloc_object_size_fast(ptr.cast())
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_trim(pad: usize) -> c_int {
    allocator::malloc_trim(pad) as c_int
}

/// glibc-compatible mallinfo result; always zeroed.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Mallinfo {
    pub arena: c_int,
    pub ordblks: c_int,
    pub smblks: c_int,
    pub hblks: c_int,
    pub hblkhd: c_int,
    pub usmblks: c_int,
    pub fsmblks: c_int,
    pub uordblks: c_int,
    pub fordblks: c_int,
    pub keepcost: c_int,
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_mallopt(_param: c_int, _value: c_int) -> c_int {
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_stats() {}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_mallinfo() -> Mallinfo {
    Mallinfo::default()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_info(_options: c_int, _fp: *mut c_void) -> c_int {
    set_errno(ENOSYS);
    -1
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_get_state() -> *mut c_void {
    core::ptr::null_mut()
}

#[unsafe(no_mangle)]
pub extern "C" fn rhmalloc_malloc_set_state(_state: *mut c_void) -> c_int {
    -2
}

#[cfg(feature = "c-abi")]
mod c_abi {
    //! Standard libc entry point names.

    use super::Mallinfo;
    use crate::allocator;
    use crate::util::{ENOSYS, set_errno};
    use core::ffi::{c_int, c_void};

    #[unsafe(export_name = "malloc")]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        allocator::malloc(size).cast()
    }

    #[unsafe(export_name = "calloc")]
    pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        allocator::calloc(nmemb, size).cast()
    }

    #[unsafe(export_name = "realloc")]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        unsafe { allocator::realloc(ptr.cast(), size).cast() }
    }

    #[unsafe(export_name = "free")]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        unsafe { allocator::free(ptr.cast()) }
    }

    #[unsafe(export_name = "cfree")]
    pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
        unsafe { allocator::free(ptr.cast()) }
    }

    #[unsafe(export_name = "free_sized")]
    pub unsafe extern "C" fn free_sized(ptr: *mut c_void, size: usize) {
        unsafe { allocator::free_sized(ptr.cast(), size) }
    }

    #[unsafe(export_name = "posix_memalign")]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> c_int {
        unsafe { allocator::posix_memalign(memptr.cast(), alignment, size) }
    }

    #[unsafe(export_name = "aligned_alloc")]
    pub extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
        allocator::aligned_alloc(alignment, size).cast()
    }

    #[unsafe(export_name = "memalign")]
    pub extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
        allocator::memalign(alignment, size).cast()
    }

    #[unsafe(export_name = "valloc")]
    pub extern "C" fn valloc(size: usize) -> *mut c_void {
        allocator::valloc(size).cast()
    }

    #[unsafe(export_name = "pvalloc")]
    pub extern "C" fn pvalloc(size: usize) -> *mut c_void {
        allocator::pvalloc(size).cast()
    }

    #[unsafe(export_name = "malloc_usable_size")]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        unsafe { allocator::malloc_usable_size(ptr.cast()) }
    }

    #[unsafe(export_name = "malloc_object_size")]
    pub extern "C" fn malloc_object_size(ptr: *mut c_void) -> usize {
        allocator::malloc_object_size(ptr.cast())
    }

    #[unsafe(export_name = "malloc_object_size_fast")]
    pub extern "C" fn malloc_object_size_fast(ptr: *mut c_void) -> usize {
        allocator::malloc_object_size_fast(ptr.cast())
    }

    #[unsafe(export_name = "malloc_trim")]
    pub extern "C" fn malloc_trim(pad: usize) -> c_int {
        allocator::malloc_trim(pad) as c_int
    }

    #[unsafe(export_name = "mallopt")]
    pub extern "C" fn mallopt(_param: c_int, _value: c_int) -> c_int {
        0
    }

    #[unsafe(export_name = "malloc_stats")]
    pub extern "C" fn malloc_stats() {}

    #[unsafe(export_name = "mallinfo")]
    pub extern "C" fn mallinfo() -> Mallinfo {
        Mallinfo::default()
    }

    #[unsafe(export_name = "malloc_info")]
    pub extern "C" fn malloc_info(_options: c_int, _fp: *mut c_void) -> c_int {
        set_errno(ENOSYS);
        -1
    }

    #[unsafe(export_name = "malloc_get_state")]
    pub extern "C" fn malloc_get_state() -> *mut c_void {
        core::ptr::null_mut()
    }

    #[unsafe(export_name = "malloc_set_state")]
    pub extern "C" fn malloc_set_state(_state: *mut c_void) -> c_int {
        -2
    }

    // Trigger initialization as early as possible so the fork handlers are
    // registered and the root sealed before other constructors allocate.
    extern "C" fn early_init() {
        unsafe { allocator::free(allocator::malloc(16)) };
    }

    #[used]
    #[unsafe(link_section = ".init_array")]
    static EARLY_INIT: extern "C" fn() = early_init;
}
