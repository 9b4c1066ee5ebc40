//! Region table: tracking for allocations larger than the slab classes.
//!
//! Every large allocation is recorded as `{base, size, guard_size}` in an
//! open-addressed, power-of-two hash table. The probe sequence walks
//! backwards and deletion backward-shifts displaced entries, so lookups
//! always terminate at an empty slot. The table grows by rehashing into the
//! other of two pre-reserved buffers and returning the old one to its
//! reservation hole, which turns stale-pointer reads after a grow into
//! faults.

use crate::config::{CLASS_REGION_SIZE, PAGE_SHIFT, PAGE_SIZE};
use crate::platform;
use crate::random::RandomState;
use core::ptr;

pub(crate) const INITIAL_REGION_TABLE_SIZE: usize = 256;
pub(crate) const MAX_REGION_TABLE_SIZE: usize = CLASS_REGION_SIZE / PAGE_SIZE;

/// One tracked large allocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RegionInfo {
    pub(crate) p: *mut u8,
    pub(crate) size: usize,
    pub(crate) guard_size: usize,
}

/// Hash of the page-shifted address: three multiply-by-127 rounds folding
/// in the higher address bits.
fn hash_page(p: *mut u8) -> usize {
    let u = p as usize >> PAGE_SHIFT;
    let mut sum = u;
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 16);
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 32);
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 48);
    sum
}

/// The mutable table state, protected by the single region mutex. The two
/// backing buffer pointers live in the sealed root and are passed in where
/// growing may occur.
pub(crate) struct RegionTable {
    pub(crate) regions: *mut RegionInfo,
    pub(crate) total: usize,
    pub(crate) free: usize,
    pub(crate) rng: RandomState,
}

unsafe impl Send for RegionTable {}

impl RegionTable {
    pub(crate) const fn new() -> Self {
        Self {
            regions: ptr::null_mut(),
            total: INITIAL_REGION_TABLE_SIZE,
            free: INITIAL_REGION_TABLE_SIZE,
            rng: RandomState::new_unseeded(),
        }
    }

    #[inline]
    unsafe fn entry(&self, index: usize) -> *mut RegionInfo {
        unsafe { self.regions.add(index) }
    }

    /// Random guard size for a region of `size` bytes: one page minimum,
    /// scaling with the allocation.
    pub(crate) fn guard_size_for(&mut self, size: usize) -> usize {
        (self.rng.next_u64_uniform((size / PAGE_SIZE / 8) as u64) as usize + 1) * PAGE_SIZE
    }

    /// Double the table into the other backing buffer, rehashing every live
    /// entry, then return the old buffer's pages to the reservation.
    ///
    /// # Safety
    /// Caller must hold the region lock; `backing` must be the two reserved
    /// buffers from the root.
    unsafe fn grow(&mut self, backing: &[*mut RegionInfo; 2]) -> bool {
        if self.total > usize::MAX / size_of::<RegionInfo>() / 2 {
            return false;
        }
        let newtotal = self.total * 2;
        let newsize = newtotal * size_of::<RegionInfo>();
        let mask = newtotal - 1;
        if newtotal > MAX_REGION_TABLE_SIZE {
            return false;
        }

        let p = if self.regions == backing[0] {
            backing[1]
        } else {
            backing[0]
        };
        if !unsafe { platform::protect_rw(p.cast(), newsize) } {
            return false;
        }

        for i in 0..self.total {
            let entry = unsafe { *self.entry(i) };
            if !entry.p.is_null() {
                let mut index = hash_page(entry.p) & mask;
                while !unsafe { (*p.add(index)).p }.is_null() {
                    index = index.wrapping_sub(1) & mask;
                }
                unsafe { *p.add(index) = entry };
            }
        }

        unsafe {
            platform::map_fixed(self.regions.cast(), self.total * size_of::<RegionInfo>())
        };
        self.free += self.total;
        self.total = newtotal;
        self.regions = p;
        true
    }

    /// Record a large allocation. Fails (leaving the table unchanged) when
    /// the table cannot grow any further.
    ///
    /// # Safety
    /// Caller must hold the region lock.
    pub(crate) unsafe fn insert(
        &mut self,
        backing: &[*mut RegionInfo; 2],
        p: *mut u8,
        size: usize,
        guard_size: usize,
    ) -> bool {
        if self.free * 4 < self.total && !unsafe { self.grow(backing) } {
            return false;
        }

        let mask = self.total - 1;
        let mut index = hash_page(p) & mask;
        while !unsafe { (*self.entry(index)).p }.is_null() {
            index = index.wrapping_sub(1) & mask;
        }
        unsafe {
            *self.entry(index) = RegionInfo {
                p,
                size,
                guard_size,
            };
        }
        self.free -= 1;
        true
    }

    /// Find the entry for `p`, or null. The returned pointer is only valid
    /// while the region lock is held: a grow moves the table.
    ///
    /// # Safety
    /// Caller must hold the region lock.
    pub(crate) unsafe fn find(&self, p: *mut u8) -> *mut RegionInfo {
        let mask = self.total - 1;
        let mut index = hash_page(p) & mask;
        loop {
            let r = unsafe { (*self.entry(index)).p };
            if r == p && !r.is_null() {
                return unsafe { self.entry(index) };
            }
            if r.is_null() {
                return ptr::null_mut();
            }
            index = index.wrapping_sub(1) & mask;
        }
    }

    /// Remove an entry, backward-shifting any entries the vacated slot was
    /// blocking so later probes still terminate correctly.
    ///
    /// # Safety
    /// Caller must hold the region lock; `region` must be a live entry
    /// returned by `find` under the same lock.
    pub(crate) unsafe fn delete(&mut self, region: *mut RegionInfo) {
        let mask = self.total - 1;
        self.free += 1;

        let mut i = (region as usize - self.regions as usize) / size_of::<RegionInfo>();
        loop {
            unsafe {
                (*self.entry(i)).p = ptr::null_mut();
                (*self.entry(i)).size = 0;
            }
            let j = i;
            loop {
                i = i.wrapping_sub(1) & mask;
                let entry = unsafe { &mut *self.entry(i) };
                if entry.p.is_null() {
                    return;
                }
                let r = hash_page(entry.p) & mask;
                // an entry still between its hash slot and the vacancy must
                // not move past its natural probe position
                if (i <= r && r < j) || (r < j && j < i) || (j < i && i <= r) {
                    continue;
                }
                unsafe { *self.entry(j) = *entry };
                break;
            }
        }
    }
}
