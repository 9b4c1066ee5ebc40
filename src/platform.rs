//! OS platform abstraction: address-space reservation, protection changes,
//! fixed remapping, guard-page composition, and the CSPRNG.
//!
//! The allocator only ever talks to the OS through this module, which keeps
//! the platform surface small and swappable. All mappings start inaccessible
//! (`PROT_NONE`); memory becomes readable and writable only for the exact
//! ranges the allocator is actively handing out.

#[cfg(unix)]
mod unix;

use crate::config::PAGE_SIZE;
use crate::util::{fatal_error, page_ceiling, set_errno, ENOMEM};
use core::ptr;

/// Reserve `size` bytes of inaccessible address space.
/// Returns null on failure.
///
/// # Safety
/// Caller must eventually release the range with `unmap`.
#[inline]
pub unsafe fn reserve(size: usize) -> *mut u8 {
    unsafe { unix::reserve(size) }
}

/// Replace `[ptr, ptr + size)` with a fresh inaccessible mapping, discarding
/// its pages. Used to purge slab memory and to return a retired region-table
/// buffer to its reservation hole.
///
/// # Safety
/// The range must lie within a live reservation.
#[inline]
pub unsafe fn map_fixed(ptr: *mut u8, size: usize) -> bool {
    unsafe { unix::map_fixed(ptr, size) }
}

/// # Safety
/// The range must have been obtained from `reserve`.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) -> bool {
    unsafe { unix::unmap(ptr, size) }
}

/// # Safety
/// The range must lie within a live reservation.
#[inline]
pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
    unsafe { unix::protect_rw(ptr, size) }
}

/// # Safety
/// The range must lie within a live reservation.
#[inline]
pub unsafe fn protect_ro(ptr: *mut u8, size: usize) -> bool {
    unsafe { unix::protect_ro(ptr, size) }
}

/// Transfer the mappings backing `[old, old + old_size)` to `new` without
/// copying. Reports failure where the OS cannot do this; callers fall back
/// to a copy.
///
/// # Safety
/// `old` must be a live mapped range; `new` must be a reservation able to
/// receive `new_size` bytes.
#[inline]
pub unsafe fn remap_fixed(old: *mut u8, old_size: usize, new: *mut u8, new_size: usize) -> bool {
    unsafe { unix::remap_fixed(old, old_size, new, new_size) }
}

/// Whether the OS page size matches the compile-time `PAGE_SIZE`.
pub fn page_size_matches() -> bool {
    unix::page_size() == PAGE_SIZE
}

/// Register fork handlers with the host threading library.
pub fn register_fork_hooks(
    prepare: extern "C" fn(),
    parent: extern "C" fn(),
    child: extern "C" fn(),
) -> bool {
    unix::at_fork(prepare, parent, child)
}

/// Fill `buf` from the OS CSPRNG. Fatal on failure: the allocator cannot
/// operate without entropy for placement and canaries.
pub fn csprng_bytes(buf: &mut [u8]) {
    if !unix::random_bytes(buf) {
        fatal_error("failed to get random bytes");
    }
}

/// Reserve `usable_size` bytes (page-rounded) surrounded by two guards of
/// `guard_size` bytes each, returning the pointer past the leading guard.
/// With `unprotect`, the usable range is made read-write.
///
/// # Safety
/// Caller must release with `deallocate_pages` using the same sizes.
pub unsafe fn allocate_pages(usable_size: usize, guard_size: usize, unprotect: bool) -> *mut u8 {
    let usable = page_ceiling(usable_size);
    if usable < usable_size {
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    let Some(real) = guard_size
        .checked_mul(2)
        .and_then(|g| usable.checked_add(g))
    else {
        set_errno(ENOMEM);
        return ptr::null_mut();
    };

    let real_ptr = unsafe { reserve(real) };
    if real_ptr.is_null() {
        return ptr::null_mut();
    }
    let usable_ptr = unsafe { real_ptr.add(guard_size) };
    if unprotect && !unsafe { protect_rw(usable_ptr, usable) } {
        unsafe { unmap(real_ptr, real) };
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    usable_ptr
}

/// Release an allocation made by `allocate_pages` or
/// `allocate_pages_aligned`, including both guards.
///
/// # Safety
/// Sizes must match the original allocation.
pub unsafe fn deallocate_pages(usable: *mut u8, usable_size: usize, guard_size: usize) {
    unsafe {
        unmap(
            usable.sub(guard_size),
            page_ceiling(usable_size) + guard_size * 2,
        )
    };
}

/// Like `allocate_pages`, but the returned pointer is aligned to
/// `alignment` (> PAGE_SIZE, a power of two). Over-reserves, then trims the
/// lead and trail so exactly guard + usable + guard stays mapped.
///
/// # Safety
/// Caller must release with `deallocate_pages` using the same sizes.
pub unsafe fn allocate_pages_aligned(
    usable_size: usize,
    alignment: usize,
    guard_size: usize,
) -> *mut u8 {
    let usable = page_ceiling(usable_size);
    if usable < usable_size {
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    let Some(alloc_size) = usable.checked_add(alignment - PAGE_SIZE) else {
        set_errno(ENOMEM);
        return ptr::null_mut();
    };
    let Some(real) = guard_size
        .checked_mul(2)
        .and_then(|g| alloc_size.checked_add(g))
    else {
        set_errno(ENOMEM);
        return ptr::null_mut();
    };

    let real_ptr = unsafe { reserve(real) };
    if real_ptr.is_null() {
        return ptr::null_mut();
    }

    let usable_ptr = unsafe { real_ptr.add(guard_size) };
    let base_addr = (usable_ptr as usize + alignment - 1) & !(alignment - 1);
    let base = base_addr as *mut u8;
    let lead_size = base_addr - usable_ptr as usize;
    let trail_size = alloc_size - lead_size - usable;

    if !unsafe { protect_rw(base, usable) } {
        unsafe { unmap(real_ptr, real) };
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    if lead_size > 0 {
        unsafe { unmap(real_ptr, lead_size) };
    }
    if trail_size > 0 {
        unsafe { unmap(base.add(usable + guard_size), trail_size) };
    }
    base
}
