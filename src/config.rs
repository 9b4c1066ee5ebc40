//! Build-time configuration.
//!
//! The hardening toggles and page-size constants are generated by build.rs
//! from `rhmalloc.toml` (override with the `RHMALLOC_CONFIG` environment
//! variable). Derived constants and the compile-time requirements live here.

use crate::size_class::N_SIZE_CLASSES;

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Trailer bytes appended to every nonzero slab allocation.
pub const CANARY_SIZE: usize = if SLAB_CANARY { 8 } else { 0 };

/// Largest request served by the slab engine; anything bigger is a region.
pub const MAX_SLAB_SIZE_CLASS: usize = 16384;

/// Minimum slot alignment provided by the size class table.
pub const MIN_ALIGN: usize = 16;

/// Usable virtual range owned by each size class.
pub const CLASS_REGION_SIZE: usize = 128 * 1024 * 1024 * 1024;

/// Stripe per class: the usable region plus the randomized guard gap.
pub const REAL_CLASS_REGION_SIZE: usize = CLASS_REGION_SIZE * 2;

/// Total reservation holding every class stripe.
pub const SLAB_REGION_SIZE: usize = REAL_CLASS_REGION_SIZE * N_SIZE_CLASSES;

const _: () = assert!(size_of::<usize>() == 8, "64-bit hosts only");
const _: () = assert!(
    PAGE_SIZE == 4096,
    "bitmap and slab arithmetic assume 4 KiB pages"
);
const _: () = assert!(
    !WRITE_AFTER_FREE_CHECK || ZERO_ON_FREE,
    "WRITE_AFTER_FREE_CHECK depends on ZERO_ON_FREE"
);
