//! Slab engine: size-classed allocation for requests up to 16 KiB.
//!
//! Each size class owns an isolated 128 GiB region inside the shared slab
//! reservation; a slab is a page-rounded run of equal-sized slots at a fixed
//! index within that region. Slab metadata lives in one densely packed,
//! lazily unprotected array per class, and the partial/empty/free lists link
//! metadata entries by index rather than by pointer.

use crate::config::{
    CANARY_SIZE, CLASS_REGION_SIZE, GUARD_SLABS, MAX_EMPTY_SLABS_TOTAL, PAGE_SIZE,
    REAL_CLASS_REGION_SIZE, SLOT_RANDOMIZE, WRITE_AFTER_FREE_CHECK, ZERO_ON_FREE,
};
use crate::platform;
use crate::random::RandomState;
use crate::size_class::{self, N_SIZE_CLASSES, SIZE_CLASSES, get_slab_size};
use crate::sync::SpinMutex;
use crate::util::{FastDivisor, fatal_error, set_errno, ENOMEM};
use core::ptr;

/// Sentinel for "no slab" in the metadata index links.
pub(crate) const NONE: u32 = u32::MAX;

/// Canary values keep a zero byte on the side adjacent to the user region,
/// so a C string overflowing out of the slot terminates instead of leaking
/// the canary through strlen-style reads.
const CANARY_MASK: u64 = if cfg!(target_endian = "little") {
    0xffff_ffff_ffff_ff00
} else {
    0x00ff_ffff_ffff_ffff
};

/// Per-slab metadata: slot occupancy bitmap, list links (indices into the
/// owning class's metadata array), and the canary value stamped into every
/// slot of this slab.
#[repr(C)]
pub(crate) struct SlabMetadata {
    pub(crate) bitmap: u64,
    pub(crate) next: u32,
    pub(crate) prev: u32,
    pub(crate) canary_value: u64,
}

/// Mutable state of one size class, protected by its own mutex.
pub(crate) struct SizeClassState {
    pub(crate) class_region_start: *mut u8,
    pub(crate) slab_info: *mut SlabMetadata,

    /// Slabs with at least one allocated and at least one free slot.
    /// LIFO doubly-linked list.
    pub(crate) partial_slabs: u32,

    /// Slabs without allocated slots, still mapped for near-term reuse.
    /// LIFO singly-linked list.
    pub(crate) empty_slabs: u32,
    pub(crate) empty_slabs_total: usize,

    /// Slabs without allocated slots whose pages have been purged and
    /// protected. FIFO singly-linked list, delaying address reuse.
    pub(crate) free_slabs_head: u32,
    pub(crate) free_slabs_tail: u32,

    pub(crate) size_divisor: FastDivisor,
    pub(crate) slab_size_divisor: FastDivisor,
    pub(crate) rng: RandomState,
    pub(crate) metadata_allocated: usize,
    pub(crate) metadata_count: usize,
}

unsafe impl Send for SizeClassState {}

impl SizeClassState {
    const fn new() -> Self {
        Self {
            class_region_start: ptr::null_mut(),
            slab_info: ptr::null_mut(),
            partial_slabs: NONE,
            empty_slabs: NONE,
            empty_slabs_total: 0,
            free_slabs_head: NONE,
            free_slabs_tail: NONE,
            size_divisor: FastDivisor::new(16),
            slab_size_divisor: FastDivisor::new(PAGE_SIZE as u64),
            rng: RandomState::new_unseeded(),
            metadata_allocated: 0,
            metadata_count: 0,
        }
    }

    /// # Safety
    /// `index` must be below `metadata_allocated`.
    #[inline]
    unsafe fn metadata(&self, index: u32) -> *mut SlabMetadata {
        unsafe { self.slab_info.add(index as usize) }
    }

    /// Base address of the slab at `index` within this class's region.
    ///
    /// # Safety
    /// The class must be initialized.
    #[inline]
    unsafe fn slab(&self, slab_size: usize, index: u32) -> *mut u8 {
        unsafe { self.class_region_start.add(index as usize * slab_size) }
    }
}

/// One cache line per class so neighboring class locks do not false-share.
#[repr(align(64))]
struct CacheAligned<T>(T);

/// The per-class mutexes and states, const-initialized for static storage.
pub(crate) struct SlabClasses {
    classes: [CacheAligned<SpinMutex<SizeClassState>>; N_SIZE_CLASSES],
}

impl SlabClasses {
    pub(crate) const fn new() -> Self {
        Self {
            classes: [const { CacheAligned(SpinMutex::new(SizeClassState::new())) };
                N_SIZE_CLASSES],
        }
    }

    #[inline]
    pub(crate) fn class(&self, class: usize) -> &SpinMutex<SizeClassState> {
        &self.classes[class].0
    }
}

/// Effective slot size of a class (the zero class uses 16-byte slots).
#[inline]
fn nonzero_size(class: usize) -> usize {
    let size = SIZE_CLASSES[class].size;
    if size == 0 { 16 } else { size }
}

/// Set up one class: seed its PRNG, record its region base, build the
/// divisors and reserve the metadata array with an initial writable page.
///
/// # Safety
/// Must run once per class during allocator initialization, before any
/// other thread can touch the class.
pub(crate) unsafe fn init_class(c: &mut SizeClassState, class: usize, region_start: *mut u8) -> bool {
    c.rng.init();
    c.class_region_start = region_start;

    let size = nonzero_size(class);
    c.size_divisor = FastDivisor::new(size as u64);
    let slab_size = get_slab_size(SIZE_CLASSES[class].slots, size);
    c.slab_size_divisor = FastDivisor::new(slab_size as u64);

    let metadata_max = CLASS_REGION_SIZE / slab_size;
    let info = unsafe {
        platform::allocate_pages(metadata_max * size_of::<SlabMetadata>(), PAGE_SIZE, false)
    };
    if info.is_null() {
        return false;
    }
    c.slab_info = info.cast();
    c.metadata_allocated = PAGE_SIZE / size_of::<SlabMetadata>();
    unsafe {
        platform::protect_rw(
            c.slab_info.cast(),
            c.metadata_allocated * size_of::<SlabMetadata>(),
        )
    }
}

/// Bits at and above `slots` are permanently occupied so the slot search
/// never returns an out-of-range index.
#[inline]
fn get_mask(slots: usize) -> u64 {
    if slots < 64 { !0u64 << slots } else { 0 }
}

fn check_index(index: usize) {
    if index >= 64 {
        fatal_error("invalid slot index");
    }
}

fn set_slot(metadata: &mut SlabMetadata, index: usize) {
    check_index(index);
    metadata.bitmap |= 1 << index;
}

fn clear_slot(metadata: &mut SlabMetadata, index: usize) {
    check_index(index);
    metadata.bitmap &= !(1 << index);
}

fn get_slot(metadata: &SlabMetadata, index: usize) -> bool {
    check_index(index);
    (metadata.bitmap >> index) & 1 != 0
}

/// Pick a free slot. With SLOT_RANDOMIZE the linear search starts from a
/// random split point (a true uniform choice over the free slots would cost
/// too much); otherwise it is the lowest free slot.
fn get_free_slot(rng: &mut RandomState, slots: usize, metadata: &SlabMetadata) -> usize {
    let slots = slots.min(64);
    let masked = metadata.bitmap | get_mask(slots);
    if masked == !0 {
        fatal_error("no free slots in slab");
    }

    if SLOT_RANDOMIZE {
        let random_split = !(!0u64 << rng.next_u16_uniform(slots as u16));
        let above_split = masked | random_split;
        if above_split != !0 {
            return (!above_split).trailing_zeros() as usize;
        }
    }

    (!masked).trailing_zeros() as usize
}

fn has_free_slots(slots: usize, metadata: &SlabMetadata) -> bool {
    let slots = slots.min(64);
    metadata.bitmap | get_mask(slots) != !0
}

fn is_free_slab(metadata: &SlabMetadata) -> bool {
    metadata.bitmap == 0
}

/// Take the next unused metadata entry, growing the writable prefix of the
/// metadata array (doubling, capped at the region's capacity) and making the
/// slab's pages writable when the allocation has a payload.
unsafe fn alloc_metadata(
    c: &mut SizeClassState,
    slab_size: usize,
    non_zero_size: bool,
) -> Option<u32> {
    if c.metadata_count >= c.metadata_allocated {
        let metadata_max = CLASS_REGION_SIZE / slab_size;
        if c.metadata_count >= metadata_max {
            set_errno(ENOMEM);
            return None;
        }
        let mut allocate = c.metadata_allocated * 2;
        if allocate > metadata_max {
            allocate = metadata_max;
        }
        if !unsafe {
            platform::protect_rw(c.slab_info.cast(), allocate * size_of::<SlabMetadata>())
        } {
            return None;
        }
        c.metadata_allocated = allocate;
    }

    let index = c.metadata_count as u32;
    let slab = unsafe { c.slab(slab_size, index) };
    if non_zero_size && !unsafe { platform::protect_rw(slab, slab_size) } {
        return None;
    }
    c.metadata_count += 1;
    if GUARD_SLABS {
        // skip every other slab position, leaving an inaccessible gap
        c.metadata_count += 1;
    }
    Some(index)
}

/// Freed slots must still be zero when the slab hands them out again; any
/// other value is a write through a dangling pointer.
unsafe fn write_after_free_check(p: *mut u8, size: usize) {
    if !WRITE_AFTER_FREE_CHECK {
        return;
    }
    let mut i = 0;
    while i < size {
        if unsafe { p.add(i).cast::<u64>().read() } != 0 {
            fatal_error("detected write after free");
        }
        i += size_of::<u64>();
    }
}

unsafe fn set_canary(metadata: &SlabMetadata, p: *mut u8, size: usize) {
    unsafe {
        ptr::copy_nonoverlapping(
            (&raw const metadata.canary_value).cast::<u8>(),
            p.add(size - CANARY_SIZE),
            CANARY_SIZE,
        );
    }
}

fn partial_push_head(c: &mut SizeClassState, index: u32) {
    unsafe {
        let metadata = c.metadata(index);
        (*metadata).next = c.partial_slabs;
        (*metadata).prev = NONE;
        if c.partial_slabs != NONE {
            (*c.metadata(c.partial_slabs)).prev = index;
        }
        c.partial_slabs = index;
    }
}

fn partial_remove(c: &mut SizeClassState, index: u32) {
    unsafe {
        let metadata = c.metadata(index);
        if (*metadata).prev != NONE {
            (*c.metadata((*metadata).prev)).next = (*metadata).next;
        } else {
            c.partial_slabs = (*metadata).next;
        }
        if (*metadata).next != NONE {
            (*c.metadata((*metadata).next)).prev = (*metadata).prev;
        }
        (*metadata).prev = NONE;
    }
}

fn enqueue_free_slab(c: &mut SizeClassState, index: u32) {
    unsafe {
        (*c.metadata(index)).next = NONE;
        if c.free_slabs_tail != NONE {
            (*c.metadata(c.free_slabs_tail)).next = index;
        } else {
            c.free_slabs_head = index;
        }
        c.free_slabs_tail = index;
    }
}

/// Allocate from the slab tier. `requested_size` is the canary-adjusted
/// request; zero keeps its dedicated class with no canary or payload.
///
/// # Safety
/// The allocator must be initialized.
pub(crate) unsafe fn allocate_small(classes: &SlabClasses, requested_size: usize) -> *mut u8 {
    let info = size_class::get_size_info(requested_size);
    let size = if info.size != 0 { info.size } else { 16 };
    let slots = SIZE_CLASSES[info.class].slots;
    let slab_size = get_slab_size(slots, size);

    let mut c = classes.class(info.class).lock();

    if c.partial_slabs == NONE {
        if c.empty_slabs != NONE {
            // cached and still mapped, cheapest reuse
            let index = c.empty_slabs;
            let metadata = unsafe { c.metadata(index) };
            unsafe {
                c.empty_slabs = (*metadata).next;
                c.empty_slabs_total -= slab_size;
                (*metadata).next = NONE;
                (*metadata).prev = NONE;
            }
            c.partial_slabs = index;

            let slot = get_free_slot(&mut c.rng, slots, unsafe { &*metadata });
            unsafe { set_slot(&mut *metadata, slot) };
            let p = unsafe { c.slab(slab_size, index).add(slot * size) };
            if requested_size != 0 {
                unsafe {
                    write_after_free_check(p, size - CANARY_SIZE);
                    set_canary(&*metadata, p, size);
                }
            }
            return p;
        } else if c.free_slabs_head != NONE {
            // purged: needs a fresh canary and writable pages again
            let index = c.free_slabs_head;
            let metadata = unsafe { c.metadata(index) };
            unsafe { (*metadata).canary_value = c.rng.next_u64() };

            let slab = unsafe { c.slab(slab_size, index) };
            if requested_size != 0 && !unsafe { platform::protect_rw(slab, slab_size) } {
                return ptr::null_mut();
            }

            unsafe {
                c.free_slabs_head = (*metadata).next;
                if c.free_slabs_head == NONE {
                    c.free_slabs_tail = NONE;
                }
                (*metadata).next = NONE;
                (*metadata).prev = NONE;
            }
            c.partial_slabs = index;

            let slot = get_free_slot(&mut c.rng, slots, unsafe { &*metadata });
            unsafe { set_slot(&mut *metadata, slot) };
            let p = unsafe { slab.add(slot * size) };
            if requested_size != 0 {
                unsafe { set_canary(&*metadata, p, size) };
            }
            return p;
        }

        let Some(index) = (unsafe { alloc_metadata(&mut c, slab_size, requested_size != 0) })
        else {
            return ptr::null_mut();
        };
        let metadata = unsafe { c.metadata(index) };
        unsafe {
            (*metadata).canary_value = c.rng.next_u64() & CANARY_MASK;
            (*metadata).next = NONE;
            (*metadata).prev = NONE;
        }
        c.partial_slabs = index;

        let slot = get_free_slot(&mut c.rng, slots, unsafe { &*metadata });
        unsafe { set_slot(&mut *metadata, slot) };
        let p = unsafe { c.slab(slab_size, index).add(slot * size) };
        if requested_size != 0 {
            unsafe { set_canary(&*metadata, p, size) };
        }
        return p;
    }

    let index = c.partial_slabs;
    let metadata = unsafe { c.metadata(index) };
    let slot = get_free_slot(&mut c.rng, slots, unsafe { &*metadata });
    unsafe { set_slot(&mut *metadata, slot) };

    if !has_free_slots(slots, unsafe { &*metadata }) {
        // slab is now full, detach it from the partial list
        unsafe {
            c.partial_slabs = (*metadata).next;
            if c.partial_slabs != NONE {
                (*c.metadata(c.partial_slabs)).prev = NONE;
            }
        }
    }

    let p = unsafe { c.slab(slab_size, index).add(slot * size) };
    if requested_size != 0 {
        unsafe {
            write_after_free_check(p, size - CANARY_SIZE);
            set_canary(&*metadata, p, size);
        }
    }
    p
}

/// Class index for a pointer known to lie inside the slab region.
#[inline]
pub(crate) fn slab_size_class(slab_region_start: *mut u8, p: *mut u8) -> usize {
    let offset = p as usize - slab_region_start as usize;
    offset / REAL_CLASS_REGION_SIZE
}

/// Class size (canary included) for a pointer inside the slab region.
#[inline]
pub(crate) fn slab_usable_size(slab_region_start: *mut u8, p: *mut u8) -> usize {
    SIZE_CLASSES[slab_size_class(slab_region_start, p)].size
}

/// Return a slot to the slab tier, validating the pointer on the way in.
/// Every validation failure is a fatal abort. `expected_size`, when present,
/// is the already-classified size from a sized deallocation.
///
/// # Safety
/// `p` must lie inside the slab region and the allocator must be
/// initialized.
pub(crate) unsafe fn deallocate_small(
    classes: &SlabClasses,
    slab_region_start: *mut u8,
    p: *mut u8,
    expected_size: Option<usize>,
) {
    let class = slab_size_class(slab_region_start, p);
    let class_size = SIZE_CLASSES[class].size;
    if let Some(expected) = expected_size {
        if class_size != expected {
            fatal_error("sized deallocation mismatch");
        }
    }
    let is_zero_size = class_size == 0;
    let size = if is_zero_size { 16 } else { class_size };
    let slots = SIZE_CLASSES[class].slots;
    let slab_size = get_slab_size(slots, size);

    let mut c = classes.class(class).lock();

    // wrapping: a pointer in the guard gap below the region start must land
    // on an out-of-range index, not a subtraction overflow
    let offset = (p as usize).wrapping_sub(c.class_region_start as usize) as u64;
    let index = c.slab_size_divisor.divide(offset);
    // also caught without this check, as a metadata fault or a double free
    if index as usize >= c.metadata_allocated {
        fatal_error("invalid free within a slab yet to be used");
    }
    let index = index as u32;
    let metadata = unsafe { c.metadata(index) };
    let slab = unsafe { c.slab(slab_size, index) };
    let slot = c.size_divisor.divide((p as usize - slab as usize) as u64) as usize;

    if unsafe { slab.add(slot * size) } != p {
        fatal_error("invalid unaligned free");
    }
    if !get_slot(unsafe { &*metadata }, slot) {
        fatal_error("double free");
    }

    if !is_zero_size {
        if ZERO_ON_FREE {
            unsafe { ptr::write_bytes(p, 0, size - CANARY_SIZE) };
        }
        if CANARY_SIZE != 0 {
            let mut canary_value = 0u64;
            unsafe {
                ptr::copy_nonoverlapping(
                    p.add(size - CANARY_SIZE),
                    (&raw mut canary_value).cast::<u8>(),
                    CANARY_SIZE,
                );
            }
            if canary_value != unsafe { (*metadata).canary_value } {
                fatal_error("canary corrupted");
            }
        }
    }

    if !has_free_slots(slots, unsafe { &*metadata }) {
        // the slab was full, it re-enters the partial list
        partial_push_head(&mut c, index);
    }

    unsafe { clear_slot(&mut *metadata, slot) };

    if is_free_slab(unsafe { &*metadata }) {
        partial_remove(&mut c, index);

        if c.empty_slabs_total + slab_size > MAX_EMPTY_SLABS_TOTAL {
            if unsafe { platform::map_fixed(slab, slab_size) } {
                enqueue_free_slab(&mut c, index);
                return;
            }
            // purge failed, keep the slab on the empty list instead
        }

        unsafe { (*c.metadata(index)).next = c.empty_slabs };
        c.empty_slabs = index;
        c.empty_slabs_total += slab_size;
    }
}

/// Drain every class's empty list, purging each slab's pages and moving it
/// to the cold free queue. Reports whether anything was released.
///
/// # Safety
/// The allocator must be initialized.
pub(crate) unsafe fn trim(classes: &SlabClasses) -> bool {
    let mut trimmed = false;

    // the zero-byte class is skipped: its slabs are already minimal
    for class in 1..N_SIZE_CLASSES {
        let slab_size = get_slab_size(SIZE_CLASSES[class].slots, SIZE_CLASSES[class].size);
        let mut c = classes.class(class).lock();

        let mut iterator = c.empty_slabs;
        while iterator != NONE {
            let slab = unsafe { c.slab(slab_size, iterator) };
            if !unsafe { platform::map_fixed(slab, slab_size) } {
                break;
            }
            let next = unsafe { (*c.metadata(iterator)).next };
            c.empty_slabs_total -= slab_size;
            enqueue_free_slab(&mut c, iterator);
            iterator = next;
            trimmed = true;
        }
        c.empty_slabs = iterator;
    }

    trimmed
}
