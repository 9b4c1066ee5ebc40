//! Size class table and lookup functions.
//!
//! Requests up to 16 KiB are bucketed into fixed size classes, each owning
//! an isolated virtual region. The table is generated by build.rs from
//! `rhmalloc.toml`: 16-byte steps up to 128 bytes, then a geometric-ish
//! progression with four steps per doubling.

use crate::util::{fatal_error, page_ceiling};

/// A single size class: the slot size in bytes and the number of slots per
/// slab. Slot counts above 64 are clamped to the occupancy bitmap width at
/// allocation time; the full count still determines the slab's byte size.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    pub size: usize,
    pub slots: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// A classified request: the rounded allocation size and its class index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeInfo {
    pub size: usize,
    pub class: usize,
}

/// Map a requested byte count to its size class.
///
/// Only valid for sizes within the slab range; the dispatcher routes larger
/// requests to the region path before classification.
#[inline]
pub fn get_size_info(size: usize) -> SizeInfo {
    if size == 0 {
        return SizeInfo { size: 0, class: 0 };
    }
    if size <= 128 {
        return SizeInfo {
            size: (size + 15) & !15,
            class: ((size - 1) >> 4) + 1,
        };
    }
    for class in 9..N_SIZE_CLASSES {
        let real_size = SIZE_CLASSES[class].size;
        if size <= real_size {
            return SizeInfo {
                size: real_size,
                class,
            };
        }
    }
    fatal_error("invalid size for slabs");
}

/// Smallest class of at least `size` whose slot size is a multiple of
/// `alignment`. Since slabs are page aligned and slots are laid out
/// contiguously from the slab base, divisibility guarantees slot alignment.
/// `alignment` must be a power of two no larger than the page size.
#[inline]
pub fn get_size_info_align(size: usize, alignment: usize) -> SizeInfo {
    for class in 1..N_SIZE_CLASSES {
        let real_size = SIZE_CLASSES[class].size;
        if size <= real_size && real_size & (alignment - 1) == 0 {
            return SizeInfo {
                size: real_size,
                class,
            };
        }
    }
    fatal_error("invalid size for slabs");
}

/// Byte size of one slab for a class.
#[inline]
pub fn get_slab_size(slots: usize, size: usize) -> usize {
    page_ceiling(slots * size)
}
