//! Top-level allocator: sealed root state, initialization, request
//! dispatch, and the public allocation API.
//!
//! All mutable state lives in module-level statics: the per-class slab
//! states behind their own mutexes, the region table behind the region
//! mutex, and the root pointers in a page that is sealed read-only once
//! initialization finishes so stray writes cannot redirect the allocator.

use crate::config::{
    CANARY_SIZE, CLASS_REGION_SIZE, MAX_SLAB_SIZE_CLASS, MIN_ALIGN, MREMAP_THRESHOLD, PAGE_SIZE,
    REAL_CLASS_REGION_SIZE, SLAB_REGION_SIZE, ZERO_ON_FREE,
};
use crate::platform;
use crate::region::{INITIAL_REGION_TABLE_SIZE, MAX_REGION_TABLE_SIZE, RegionInfo, RegionTable};
use crate::size_class::{self, N_SIZE_CLASSES};
use crate::slab::{self, SlabClasses};
use crate::sync::SpinMutex;
use crate::util::{EINVAL, ENOMEM, fatal_error, page_ceiling, set_errno};
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ffi::c_int;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// Root pointers of the allocator. Page-sized and page-aligned so the whole
/// structure can be protected read-only after initialization.
#[repr(C, align(4096))]
pub(crate) struct Root {
    pub(crate) slab_region_start: *mut u8,
    pub(crate) slab_region_end: *mut u8,
    pub(crate) region_tables: [*mut RegionInfo; 2],
    pub(crate) initialized: AtomicBool,
}

const _: () = assert!(size_of::<Root>() == PAGE_SIZE);

/// Constructed once during the init slow path, then frozen: `seal` maps the
/// page read-only and every later access goes through the shared reference
/// from `get`.
struct SealedRoot {
    inner: UnsafeCell<Root>,
}

unsafe impl Sync for SealedRoot {}

impl SealedRoot {
    const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Root {
                slab_region_start: ptr::null_mut(),
                slab_region_end: ptr::null_mut(),
                region_tables: [ptr::null_mut(); 2],
                initialized: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    fn get(&self) -> &Root {
        unsafe { &*self.inner.get() }
    }

    /// # Safety
    /// Only during the init slow path, before `seal`.
    unsafe fn get_unsealed(&self) -> *mut Root {
        self.inner.get()
    }

    /// # Safety
    /// Only once, at the end of the init slow path.
    unsafe fn seal(&self) -> bool {
        unsafe { platform::protect_ro(self.inner.get().cast(), PAGE_SIZE) }
    }
}

static RO: SealedRoot = SealedRoot::new();
static SLAB_CLASSES: SlabClasses = SlabClasses::new();
static REGIONS: SpinMutex<RegionTable> = SpinMutex::new(RegionTable::new());
static INIT_LOCK: SpinMutex<()> = SpinMutex::new(());

#[inline]
fn is_init() -> bool {
    RO.get().initialized.load(Ordering::Acquire)
}

fn enforce_init() {
    if !is_init() {
        fatal_error("invalid uninitialized allocator usage");
    }
}

#[inline]
fn init() {
    if !is_init() {
        init_slow_path();
    }
}

#[cold]
fn init_slow_path() {
    {
        let _guard = INIT_LOCK.lock();
        if is_init() {
            return;
        }

        if !platform::page_size_matches() {
            fatal_error("page size mismatch");
        }

        unsafe {
            let root = RO.get_unsealed();
            let regions_state = REGIONS.data_ptr();

            (*regions_state).rng.init();
            for slot in (*root).region_tables.iter_mut() {
                let buffer = platform::allocate_pages(
                    MAX_REGION_TABLE_SIZE * size_of::<RegionInfo>(),
                    PAGE_SIZE,
                    false,
                );
                if buffer.is_null() {
                    fatal_error("failed to reserve memory for regions table");
                }
                *slot = buffer.cast();
            }
            (*regions_state).regions = (*root).region_tables[0];
            if !platform::protect_rw(
                (*regions_state).regions.cast(),
                INITIAL_REGION_TABLE_SIZE * size_of::<RegionInfo>(),
            ) {
                fatal_error("failed to unprotect memory for regions table");
            }

            let start = platform::reserve(SLAB_REGION_SIZE);
            if start.is_null() {
                fatal_error("failed to reserve slab region");
            }
            (*root).slab_region_start = start;
            (*root).slab_region_end = start.add(SLAB_REGION_SIZE);

            for class in 0..N_SIZE_CLASSES {
                let state = SLAB_CLASSES.class(class).data_ptr();
                // random gap before the class's usable region; the rest of
                // the stripe stays an inaccessible gap between classes
                let bound = ((REAL_CLASS_REGION_SIZE - CLASS_REGION_SIZE) / PAGE_SIZE - 1) as u64;
                let gap =
                    ((*regions_state).rng.next_u64_uniform(bound) as usize + 1) * PAGE_SIZE;
                let region_start = start.add(REAL_CLASS_REGION_SIZE * class + gap);
                if !slab::init_class(&mut *state, class, region_start) {
                    fatal_error("failed to reserve slab metadata");
                }
            }

            (*root).initialized.store(true, Ordering::Release);

            if !RO.seal() {
                fatal_error("failed to protect allocator data");
            }
        }
    }

    // the hooks may allocate, so register them only once initialization is
    // complete and the init lock is released
    if !platform::register_fork_hooks(fork_prepare, fork_parent, fork_child) {
        fatal_error("failed to register fork handlers");
    }
}

// Fork protocol: take every data-plane lock before the fork (region lock
// first, then class locks in ascending order), release them in the parent,
// and in the child force every lock back to unlocked and reseed every PRNG
// so child placement diverges from the parent.

extern "C" fn fork_prepare() {
    REGIONS.raw_lock();
    for class in 0..N_SIZE_CLASSES {
        SLAB_CLASSES.class(class).raw_lock();
    }
}

extern "C" fn fork_parent() {
    unsafe {
        REGIONS.raw_unlock();
        for class in 0..N_SIZE_CLASSES {
            SLAB_CLASSES.class(class).raw_unlock();
        }
    }
}

extern "C" fn fork_child() {
    unsafe {
        REGIONS.reset();
        (*REGIONS.data_ptr()).rng.init();
        for class in 0..N_SIZE_CLASSES {
            let mutex = SLAB_CLASSES.class(class);
            mutex.reset();
            (*mutex.data_ptr()).rng.init();
        }
    }
}

/// Nonzero slab-ranged requests carry a trailing canary.
fn adjust_size_for_canaries(size: usize) -> usize {
    if size > 0 && size <= MAX_SLAB_SIZE_CLASS {
        size + CANARY_SIZE
    } else {
        size
    }
}

/// Dispatch an adjusted request to the slab or region tier.
unsafe fn allocate(size: usize) -> *mut u8 {
    if size <= MAX_SLAB_SIZE_CLASS {
        stat_inc!(slab_allocs);
        return unsafe { slab::allocate_small(&SLAB_CLASSES, size) };
    }

    stat_inc!(region_allocs);
    let guard_size = REGIONS.lock().guard_size_for(size);

    let p = unsafe { platform::allocate_pages(size, guard_size, true) };
    if p.is_null() {
        return ptr::null_mut();
    }

    let inserted = unsafe {
        REGIONS
            .lock()
            .insert(&RO.get().region_tables, p, size, guard_size)
    };
    if !inserted {
        unsafe { platform::deallocate_pages(p, size, guard_size) };
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    p
}

unsafe fn deallocate_large(p: *mut u8, expected_size: Option<usize>) {
    enforce_init();

    let (size, guard_size) = {
        let mut table = REGIONS.lock();
        let region = unsafe { table.find(p) };
        if region.is_null() {
            fatal_error("invalid free");
        }
        let size = unsafe { (*region).size };
        if let Some(expected) = expected_size {
            if size != expected {
                fatal_error("sized deallocation mismatch");
            }
        }
        let guard_size = unsafe { (*region).guard_size };
        unsafe { table.delete(region) };
        (size, guard_size)
    };

    unsafe { platform::deallocate_pages(p, size, guard_size) };
}

/// Allocate `size` bytes, suitably aligned for any object of that size.
/// Returns null with errno set to ENOMEM on exhaustion. `malloc(0)` returns
/// a distinct valid pointer with zero usable size.
pub fn malloc(size: usize) -> *mut u8 {
    init();
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    unsafe { allocate(adjust_size_for_canaries(size)) }
}

/// Overflow-checked zeroed array allocation.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total_size) = nmemb.checked_mul(size) else {
        set_errno(ENOMEM);
        return ptr::null_mut();
    };
    init();
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, total_size as u64);
    let total_size = adjust_size_for_canaries(total_size);
    if ZERO_ON_FREE {
        // slots are already zero; fresh region pages always are
        return unsafe { allocate(total_size) };
    }
    let p = unsafe { allocate(total_size) };
    if p.is_null() {
        return p;
    }
    if total_size != 0 && total_size <= MAX_SLAB_SIZE_CLASS {
        unsafe { ptr::write_bytes(p, 0, total_size - CANARY_SIZE) };
    }
    p
}

/// Resize an allocation, preserving its prefix.
///
/// # Safety
/// `old` must be null or a live pointer from this allocator.
pub unsafe fn realloc(old: *mut u8, size: usize) -> *mut u8 {
    if old.is_null() {
        init();
        return unsafe { allocate(adjust_size_for_canaries(size)) };
    }

    stat_inc!(realloc_count);
    let size = adjust_size_for_canaries(size);

    let root = RO.get();
    let in_slab = old >= root.slab_region_start && old < root.slab_region_end;
    let old_size;

    if in_slab {
        old_size = slab::slab_usable_size(root.slab_region_start, old);
        if size <= MAX_SLAB_SIZE_CLASS && size_class::get_size_info(size).size == old_size {
            return old;
        }
    } else {
        enforce_init();

        let old_guard_size;
        {
            let table = REGIONS.lock();
            let region = unsafe { table.find(old) };
            if region.is_null() {
                fatal_error("invalid realloc");
            }
            old_size = unsafe { (*region).size };
            old_guard_size = unsafe { (*region).guard_size };
            if page_ceiling(old_size) == page_ceiling(size) {
                unsafe { (*region).size = size };
                return old;
            }
        }

        // in-place shrink: move the trailing guard inward and unmap the tail
        if size < old_size && size > MAX_SLAB_SIZE_CLASS {
            let rounded_size = page_ceiling(size);
            let old_rounded_size = page_ceiling(old_size);

            let new_end = unsafe { old.add(rounded_size) };
            if !unsafe { platform::map_fixed(new_end, old_guard_size) } {
                return ptr::null_mut();
            }
            let new_guard_end = unsafe { new_end.add(old_guard_size) };
            unsafe { platform::unmap(new_guard_end, old_rounded_size - rounded_size) };

            // the table may have moved while the lock was released
            let table = REGIONS.lock();
            let region = unsafe { table.find(old) };
            if region.is_null() {
                fatal_error("invalid realloc");
            }
            unsafe { (*region).size = size };
            return old;
        }

        let copy_size = size.min(old_size);
        if copy_size >= MREMAP_THRESHOLD {
            let new = unsafe { allocate(size) };
            if new.is_null() {
                return ptr::null_mut();
            }

            {
                let mut table = REGIONS.lock();
                let region = unsafe { table.find(old) };
                if region.is_null() {
                    fatal_error("invalid realloc");
                }
                unsafe { table.delete(region) };
            }

            if unsafe { platform::remap_fixed(old, old_size, new, size) } {
                // pages moved; only the old guards remain to release
                unsafe {
                    platform::unmap(old.sub(old_guard_size), old_guard_size);
                    platform::unmap(old.add(page_ceiling(old_size)), old_guard_size);
                }
            } else {
                unsafe {
                    ptr::copy_nonoverlapping(old, new, copy_size);
                    platform::deallocate_pages(old, old_size, old_guard_size);
                }
            }
            return new;
        }
    }

    let new = unsafe { allocate(size) };
    if new.is_null() {
        return ptr::null_mut();
    }
    let mut copy_size = size.min(old_size);
    if copy_size > 0 && copy_size <= MAX_SLAB_SIZE_CLASS {
        copy_size -= CANARY_SIZE;
    }
    unsafe { ptr::copy_nonoverlapping(old, new, copy_size) };
    if in_slab {
        unsafe { slab::deallocate_small(&SLAB_CLASSES, root.slab_region_start, old, None) };
    } else {
        unsafe { deallocate_large(old, None) };
    }
    new
}

/// Release an allocation. No-op on null; anything else is dispatched by
/// address range and fully validated.
///
/// # Safety
/// `p` must be null or a live pointer from this allocator.
pub unsafe fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }

    stat_inc!(free_count);
    let root = RO.get();
    if p >= root.slab_region_start && p < root.slab_region_end {
        unsafe { slab::deallocate_small(&SLAB_CLASSES, root.slab_region_start, p, None) };
        return;
    }

    unsafe { deallocate_large(p, None) };
}

/// Like [`free`], but aborts when the allocation does not match
/// `expected_size` (after class rounding for slab pointers).
///
/// # Safety
/// `p` must be null or a live pointer from this allocator.
pub unsafe fn free_sized(p: *mut u8, expected_size: usize) {
    if p.is_null() {
        return;
    }

    stat_inc!(free_count);
    let root = RO.get();
    if p >= root.slab_region_start && p < root.slab_region_end {
        let expected = size_class::get_size_info(adjust_size_for_canaries(expected_size)).size;
        unsafe {
            slab::deallocate_small(&SLAB_CLASSES, root.slab_region_start, p, Some(expected))
        };
        return;
    }

    unsafe { deallocate_large(p, Some(expected_size)) };
}

/// Shared aligned-allocation path. `size` is already canary-adjusted.
fn alloc_aligned(alignment: usize, size: usize, min_alignment: usize) -> Result<*mut u8, c_int> {
    if !alignment.is_power_of_two() || alignment < min_alignment {
        return Err(EINVAL);
    }

    if alignment <= PAGE_SIZE {
        // slabs are page aligned with contiguous slots, so any class whose
        // size the alignment divides yields aligned slots
        let size = if size <= MAX_SLAB_SIZE_CLASS && alignment > MIN_ALIGN {
            size_class::get_size_info_align(size, alignment).size
        } else {
            size
        };

        let p = unsafe { allocate(size) };
        if p.is_null() {
            return Err(ENOMEM);
        }
        return Ok(p);
    }

    stat_inc!(region_allocs);
    let guard_size = REGIONS.lock().guard_size_for(size);

    let p = unsafe { platform::allocate_pages_aligned(size, alignment, guard_size) };
    if p.is_null() {
        return Err(ENOMEM);
    }

    let inserted = unsafe {
        REGIONS
            .lock()
            .insert(&RO.get().region_tables, p, size, guard_size)
    };
    if !inserted {
        unsafe { platform::deallocate_pages(p, size, guard_size) };
        return Err(ENOMEM);
    }
    Ok(p)
}

fn alloc_aligned_simple(alignment: usize, size: usize) -> *mut u8 {
    match alloc_aligned(alignment, size, 1) {
        Ok(p) => p,
        Err(e) => {
            set_errno(e);
            ptr::null_mut()
        }
    }
}

/// POSIX aligned allocation: returns the error value instead of setting
/// errno, and requires the alignment to be a multiple of the pointer size.
///
/// # Safety
/// `memptr` must be valid for writes.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> c_int {
    init();
    stat_inc!(alloc_count);
    let size = adjust_size_for_canaries(size);
    match alloc_aligned(alignment, size, size_of::<*mut u8>()) {
        Ok(p) => {
            unsafe { *memptr = p };
            0
        }
        Err(e) => e,
    }
}

pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    init();
    stat_inc!(alloc_count);
    alloc_aligned_simple(alignment, adjust_size_for_canaries(size))
}

pub fn memalign(alignment: usize, size: usize) -> *mut u8 {
    aligned_alloc(alignment, size)
}

pub fn valloc(size: usize) -> *mut u8 {
    init();
    stat_inc!(alloc_count);
    alloc_aligned_simple(PAGE_SIZE, adjust_size_for_canaries(size))
}

/// Page-aligned with the size rounded up to a whole page.
pub fn pvalloc(size: usize) -> *mut u8 {
    let rounded = page_ceiling(size);
    if rounded == 0 {
        // zero request or rounding overflow
        set_errno(ENOMEM);
        return ptr::null_mut();
    }
    init();
    stat_inc!(alloc_count);
    alloc_aligned_simple(PAGE_SIZE, adjust_size_for_canaries(rounded))
}

/// Usable bytes behind a live pointer. Aborts on a non-null pointer this
/// allocator does not own.
///
/// # Safety
/// `p` must be null or a live pointer from this allocator.
pub unsafe fn malloc_usable_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    let root = RO.get();
    if p >= root.slab_region_start && p < root.slab_region_end {
        let size = slab::slab_usable_size(root.slab_region_start, p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    enforce_init();

    let table = REGIONS.lock();
    let region = unsafe { table.find(p) };
    if region.is_null() {
        fatal_error("invalid malloc_usable_size");
    }
    unsafe { (*region).size }
}

/// Like usable size, but reports `usize::MAX` for pointers the allocator
/// does not know about instead of aborting.
pub fn malloc_object_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    let root = RO.get();
    if p >= root.slab_region_start && p < root.slab_region_end {
        let size = slab::slab_usable_size(root.slab_region_start, p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    if !is_init() {
        return 0;
    }

    let table = REGIONS.lock();
    let region = unsafe { table.find(p) };
    if region.is_null() {
        usize::MAX
    } else {
        unsafe { (*region).size }
    }
}

/// Cheap variant skipping the region lookup: any non-slab pointer reports
/// `usize::MAX`.
pub fn malloc_object_size_fast(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    let root = RO.get();
    if p >= root.slab_region_start && p < root.slab_region_end {
        let size = slab::slab_usable_size(root.slab_region_start, p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    if !is_init() {
        return 0;
    }

    usize::MAX
}

/// Purge every cached empty slab. Returns whether anything was released.
pub fn malloc_trim(_pad: usize) -> bool {
    if !is_init() {
        return false;
    }
    unsafe { slab::trim(&SLAB_CLASSES) }
}

/// Hardened allocator handle for Rust use.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: rhmalloc::RhMalloc = rhmalloc::RhMalloc;
/// ```
pub struct RhMalloc;

unsafe impl GlobalAlloc for RhMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        if layout.align() <= MIN_ALIGN {
            malloc(size)
        } else {
            init();
            match alloc_aligned(layout.align(), adjust_size_for_canaries(size), 1) {
                Ok(p) => p,
                Err(_) => ptr::null_mut(),
            }
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= MIN_ALIGN {
            return calloc(1, layout.size());
        }
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() && !ZERO_ON_FREE {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return unsafe { realloc(ptr, new_size) };
        }

        // realloc does not preserve over-alignment; allocate, copy, free
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                free(ptr);
            }
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SIZE_CLASSES;
    use alloc::vec::Vec;

    #[test]
    fn test_malloc_basic() {
        let p = malloc(1);
        assert!(!p.is_null());
        assert_eq!(unsafe { malloc_usable_size(p) }, 16 - CANARY_SIZE);
        unsafe {
            *p = 42;
            assert_eq!(*p, 42);
            free(p);
        }
    }

    #[test]
    fn test_malloc_zero_distinct() {
        let p1 = malloc(0);
        let p2 = malloc(0);
        assert!(!p1.is_null());
        assert!(!p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(unsafe { malloc_usable_size(p1) }, 0);
        unsafe {
            free(p1);
            free(p2);
        }
    }

    #[test]
    fn test_malloc_usable_covers_request() {
        for size in [1usize, 15, 16, 17, 128, 129, 1000, 4096, 16384] {
            let p = malloc(size);
            assert!(!p.is_null(), "malloc({}) failed", size);
            let usable = unsafe { malloc_usable_size(p) };
            assert!(usable >= size, "usable {} < requested {}", usable, size);
            unsafe {
                ptr::write_bytes(p, 0xA5, usable);
                free(p);
            }
        }
    }

    #[test]
    fn test_slab_pointer_geometry() {
        let p = malloc(100);
        let root = RO.get();
        assert!(p >= root.slab_region_start && p < root.slab_region_end);
        let class = slab::slab_size_class(root.slab_region_start, p);
        assert_eq!(SIZE_CLASSES[class].size, 112);
        assert_eq!(p as usize % MIN_ALIGN, 0);
        unsafe { free(p) };
    }

    #[test]
    fn test_calloc_overflow() {
        let p = calloc(65537, 65537);
        assert!(p.is_null());
    }

    #[test]
    fn test_calloc_zeroed() {
        let p = calloc(100, 8);
        assert!(!p.is_null());
        for i in 0..800 {
            assert_eq!(unsafe { *p.add(i) }, 0);
        }
        unsafe { free(p) };
    }

    #[test]
    fn test_large_allocation() {
        let size = 200 * 1024;
        let p = malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        assert!(unsafe { malloc_usable_size(p) } >= size);
        unsafe {
            ptr::write_bytes(p, 0x5A, size);
            assert_eq!(*p, 0x5A);
            assert_eq!(*p.add(size - 1), 0x5A);
            free(p);
        }
    }

    #[test]
    fn test_object_size_family() {
        let p = malloc(30);
        assert!(malloc_object_size(p) >= 30);
        assert_eq!(malloc_object_size(p), unsafe { malloc_usable_size(p) });
        assert_eq!(malloc_object_size_fast(p), unsafe {
            malloc_usable_size(p)
        });
        unsafe { free(p) };

        // a pointer we never allocated
        let local = 0u64;
        let foreign = &local as *const u64 as *mut u8;
        assert_eq!(malloc_object_size(foreign), usize::MAX);
        assert_eq!(malloc_object_size_fast(foreign), usize::MAX);
        assert_eq!(malloc_object_size(ptr::null_mut()), 0);
        assert_eq!(malloc_object_size_fast(ptr::null_mut()), 0);
    }

    #[test]
    fn test_free_sized_ok() {
        let p = malloc(17);
        unsafe { free_sized(p, 17) };
        let q = malloc(100);
        // any size mapping to the same class is accepted
        unsafe { free_sized(q, 104) };
    }

    #[test]
    fn test_aligned_allocations() {
        for align in [16usize, 32, 64, 256, 1024, 4096] {
            let p = aligned_alloc(align, 100);
            assert!(!p.is_null(), "aligned_alloc({}, 100) failed", align);
            assert_eq!(p as usize % align, 0);
            unsafe { free(p) };
        }
        // beyond a page goes through the region path
        let p = aligned_alloc(8192, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8192, 0);
        unsafe { free(p) };
    }

    #[test]
    fn test_posix_memalign_contract() {
        let mut out = ptr::null_mut();
        assert_eq!(unsafe { posix_memalign(&mut out, 3, 100) }, EINVAL);
        assert_eq!(unsafe { posix_memalign(&mut out, 4, 100) }, EINVAL);
        assert_eq!(unsafe { posix_memalign(&mut out, 64, 100) }, 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        unsafe { free(out) };
    }

    #[test]
    fn test_valloc_pvalloc() {
        let p = valloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe { free(p) };

        let p = pvalloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        assert!(unsafe { malloc_usable_size(p) } >= PAGE_SIZE - CANARY_SIZE);
        unsafe { free(p) };

        assert!(pvalloc(0).is_null());
        assert!(pvalloc(usize::MAX).is_null());
    }

    #[test]
    fn test_malloc_trim_releases_empties() {
        // fill and drain a batch so some slabs end up on the empty lists
        let mut ptrs = Vec::new();
        for _ in 0..200 {
            ptrs.push(malloc(3000));
        }
        for p in ptrs {
            unsafe { free(p) };
        }
        malloc_trim(0);
        // trimmed slabs must come back usable
        let p = malloc(3000);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0x77, 3000);
            free(p);
        }
    }

    #[test]
    fn test_global_alloc_zero_size_convention() {
        let a = RhMalloc;
        let layout = Layout::from_size_align(0, 8).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert_eq!(p as usize, 8);
        unsafe { a.dealloc(p, layout) };
    }

    // Structural invariants from the slab engine, checked under each class
    // lock after real API traffic.
    #[test]
    fn test_slab_list_invariants() {
        let mut ptrs = Vec::new();
        for i in 0..300usize {
            ptrs.push(malloc(16 + (i % 64) * 16));
        }
        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 == 0 {
                unsafe { free(*p) };
            }
        }

        for class in 0..N_SIZE_CLASSES {
            let c = SLAB_CLASSES.class(class).lock();
            let size = if SIZE_CLASSES[class].size == 0 {
                16
            } else {
                SIZE_CLASSES[class].size
            };
            let slots = SIZE_CLASSES[class].slots.min(64);
            let slab_size = size_class::get_slab_size(SIZE_CLASSES[class].slots, size);

            let mut index = c.empty_slabs;
            let mut empty_bytes = 0usize;
            while index != slab::NONE {
                let metadata = unsafe { &*c.slab_info.add(index as usize) };
                assert_eq!(metadata.bitmap, 0, "empty slab with live slots");
                empty_bytes += slab_size;
                index = metadata.next;
            }
            assert_eq!(
                empty_bytes, c.empty_slabs_total,
                "empty byte counter out of sync for class {}",
                class
            );

            let mut index = c.partial_slabs;
            let mut prev = slab::NONE;
            while index != slab::NONE {
                let metadata = unsafe { &*c.slab_info.add(index as usize) };
                let count = metadata.bitmap.count_ones() as usize;
                assert!(count > 0, "empty slab on partial list");
                assert!(count < slots, "full slab on partial list");
                assert_eq!(metadata.prev, prev, "broken partial back link");
                prev = index;
                index = metadata.next;
            }

            let mut index = c.free_slabs_head;
            while index != slab::NONE {
                let metadata = unsafe { &*c.slab_info.add(index as usize) };
                assert_eq!(metadata.bitmap, 0, "free slab with live slots");
                if metadata.next == slab::NONE {
                    assert_eq!(index, c.free_slabs_tail);
                }
                index = metadata.next;
            }
        }

        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 != 0 {
                unsafe { free(*p) };
            }
        }
    }
}
