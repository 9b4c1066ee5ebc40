//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering. They are observational only and not
//! used as synchronization primitives; the allocator's own locks provide the
//! ordering guarantees for correctness.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Total allocation requests (malloc/calloc/aligned paths).
    pub alloc_count: AtomicU64,
    /// Total frees of non-null pointers.
    pub free_count: AtomicU64,
    /// Total reallocs of non-null pointers.
    pub realloc_count: AtomicU64,
    /// Sum of requested byte sizes.
    pub alloc_bytes: AtomicU64,
    /// Requests served by the slab tier.
    pub slab_allocs: AtomicU64,
    /// Requests served by the region tier.
    pub region_allocs: AtomicU64,
}

pub(crate) static STATS: Stats = Stats {
    alloc_count: AtomicU64::new(0),
    free_count: AtomicU64::new(0),
    realloc_count: AtomicU64::new(0),
    alloc_bytes: AtomicU64::new(0),
    slab_allocs: AtomicU64::new(0),
    region_allocs: AtomicU64::new(0),
};

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub slab_allocs: u64,
    pub region_allocs: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        alloc_count: STATS.alloc_count.load(Ordering::Relaxed),
        free_count: STATS.free_count.load(Ordering::Relaxed),
        realloc_count: STATS.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: STATS.alloc_bytes.load(Ordering::Relaxed),
        slab_allocs: STATS.slab_allocs.load(Ordering::Relaxed),
        region_allocs: STATS.region_allocs.load(Ordering::Relaxed),
    }
}
