//! Alignment edge case tests.
//!
//! Verifies that allocations respect alignment requirements for various
//! alignment values, including over-aligned allocations routed through the
//! aligned size classes and, beyond a page, the region path.

use rhmalloc::RhMalloc;
use std::alloc::{GlobalAlloc, Layout};

#[global_allocator]
static GLOBAL: RhMalloc = RhMalloc;

#[test]
fn test_standard_alignments() {
    for align in [1, 2, 4, 8, 16] {
        for &size in &[1, 7, 8, 15, 16, 31, 64, 255, 256, 1024, 4096, 16384] {
            if size < align {
                continue;
            }
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
            assert_eq!(
                ptr as usize % align,
                0,
                "misaligned: ptr={ptr:?}, size={size}, align={align}"
            );
            // Write to verify it's usable
            unsafe { ptr.write_bytes(0xAB, size) };
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }
}

#[test]
fn test_over_aligned_within_page() {
    for align in [32usize, 64, 128, 256, 512, 1024, 2048, 4096] {
        for &size in &[16usize, 48, 100, 1024, 5000] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
            assert_eq!(
                ptr as usize % align,
                0,
                "misaligned: ptr={ptr:?}, size={size}, align={align}"
            );
            unsafe { ptr.write_bytes(0xCD, size) };
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }
}

#[test]
fn test_over_aligned_beyond_page() {
    for align in [8192usize, 16384, 65536] {
        let layout = Layout::from_size_align(1000, align).unwrap();
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null(), "alloc failed: align={align}");
        assert_eq!(ptr as usize % align, 0);
        unsafe { ptr.write_bytes(0xEF, 1000) };
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

#[test]
fn test_over_aligned_realloc_preserves_alignment_and_content() {
    let align = 64;
    let layout = Layout::from_size_align(128, align).unwrap();
    let ptr = unsafe { GLOBAL.alloc(layout) };
    assert!(!ptr.is_null());
    for i in 0..128 {
        unsafe { *ptr.add(i) = i as u8 };
    }

    let new_ptr = unsafe { GLOBAL.realloc(ptr, layout, 4096) };
    assert!(!new_ptr.is_null());
    assert_eq!(new_ptr as usize % align, 0);
    for i in 0..128 {
        assert_eq!(unsafe { *new_ptr.add(i) }, i as u8);
    }
    let new_layout = Layout::from_size_align(4096, align).unwrap();
    unsafe { GLOBAL.dealloc(new_ptr, new_layout) };
}

#[test]
fn test_alignment_under_real_load() {
    // Vec growth goes through the allocator's realloc path
    let mut v: Vec<u64> = Vec::new();
    for i in 0..100_000u64 {
        v.push(i);
    }
    assert_eq!(v.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
    for (i, &x) in v.iter().enumerate() {
        assert_eq!(x, i as u64);
    }
}
