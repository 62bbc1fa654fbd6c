use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use std::string::String;

use zone_alloc::{SizeClass, ZoneAllocator};

use test_log::test;

fn report(allocator: &ZoneAllocator) -> String {
    let mut out = String::new();
    allocator.dump(&mut out).unwrap();
    out
}

fn assert_valid(allocator: &ZoneAllocator) {
    let (validity, stats) = allocator.stats();
    log::debug!("Validity: {:?}, Stats: {:?}", validity, stats);
    assert!(validity.is_valid(), "{:?}", validity);
}

#[test]
fn test_sizes_are_aligned_and_released() {
    let allocator = ZoneAllocator::new();
    let sizes = [1usize, 128, 129, 1024, 1025, 65536];

    let pointers: Vec<*mut u8> = sizes.iter().map(|&size| allocator.allocate(size)).collect();
    for (&size, &ptr) in sizes.iter().zip(&pointers) {
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 16, 0, "{} bytes at {:?}", size, ptr);
        unsafe { ptr::write_bytes(ptr, 0x5A, size) };
    }

    let (_, stats) = allocator.stats();
    assert_eq!(stats.tiny_zones, 1);
    assert_eq!(stats.small_zones, 1);
    assert_eq!(stats.large_zones, 2);

    for ptr in pointers {
        allocator.release(ptr);
        assert_valid(&allocator);
    }
    let (_, stats) = allocator.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.large_zones, 0);
}

#[test]
fn test_zero_and_null() {
    let allocator = ZoneAllocator::new();
    assert!(allocator.allocate(0).is_null());
    allocator.release(null_mut());

    let ptr = allocator.resize(null_mut(), 48);
    assert!(!ptr.is_null());
    assert!(allocator.resize(ptr, 0).is_null());
    assert_eq!(allocator.stats().1.allocated_bytes, 0);
}

#[test]
fn test_resize_that_fits_keeps_pointer() {
    let allocator = ZoneAllocator::new();
    let ptr = allocator.allocate(100);
    unsafe { ptr::write_bytes(ptr, 3, 100) };

    assert_eq!(allocator.resize(ptr, 110), ptr);
    assert_eq!(allocator.resize(ptr, 20), ptr);
    let contents = unsafe { core::slice::from_raw_parts(ptr, 20) };
    assert!(contents.iter().all(|&x| x == 3));
    assert_valid(&allocator);
}

#[test]
fn test_double_release_is_harmless() {
    let allocator = ZoneAllocator::new();
    let a = allocator.allocate(64);
    let b = allocator.allocate(64);
    unsafe { ptr::write_bytes(b, 0xEE, 64) };

    allocator.release(a);
    allocator.release(a);
    allocator.release(b.wrapping_add(16));

    assert_valid(&allocator);
    let contents = unsafe { core::slice::from_raw_parts(b, 64) };
    assert!(contents.iter().all(|&x| x == 0xEE));
    allocator.release(b);
}

#[test]
fn test_freed_neighbours_coalesce() {
    let allocator = ZoneAllocator::new();
    // Each takes a 256 byte block
    let a = allocator.allocate(200);
    let b = allocator.allocate(200);
    let c = allocator.allocate(200);
    let guard = allocator.allocate(200);
    assert_eq!(b as usize - a as usize, 256);
    assert_eq!(c as usize - b as usize, 256);

    allocator.release(a);
    allocator.release(c);
    allocator.release(b);
    assert_valid(&allocator);

    // Three merged blocks make room for 768 bytes, header and footer included
    let merged = allocator.allocate(720);
    assert_eq!(merged, a);
    assert_valid(&allocator);

    allocator.release(merged);
    allocator.release(guard);
}

#[test]
fn test_only_surplus_zones_are_unmapped() {
    let allocator = ZoneAllocator::new();

    let ptr = allocator.allocate(100);
    allocator.release(ptr);
    assert_eq!(allocator.stats().1.tiny_zones, 1);
    assert_eq!(allocator.get_raw().pages.unmaps(), 0);

    // Fill TINY zones until a second one is needed
    let mut first = vec![allocator.allocate(100)];
    let first_zone = allocator
        .get_raw()
        .zones()
        .list(SizeClass::Tiny)
        .head()
        .unwrap();
    let mut extra: *mut u8 = null_mut();
    while extra.is_null() {
        let ptr = allocator.allocate(100);
        if first_zone.contains(ptr) {
            first.push(ptr);
        } else {
            extra = ptr;
        }
    }
    assert_eq!(allocator.stats().1.tiny_zones, 2);

    let zone_line = format!("TINY : {:p}", first_zone.start());
    assert!(report(&allocator).contains(&zone_line));

    for ptr in first {
        allocator.release(ptr);
    }
    assert_valid(&allocator);
    assert_eq!(allocator.stats().1.tiny_zones, 1);
    assert_eq!(allocator.get_raw().pages.unmaps(), 1);
    assert!(!report(&allocator).contains(&zone_line));

    // The last zone stays even once it is empty
    allocator.release(extra);
    assert_eq!(allocator.stats().1.tiny_zones, 1);
    assert_eq!(allocator.get_raw().pages.unmaps(), 1);
}

#[test]
fn test_large_allocations_get_their_own_zone() {
    let allocator = ZoneAllocator::new();
    let a = allocator.allocate(5000);
    let b = allocator.allocate(5000);
    assert_eq!(allocator.stats().1.large_zones, 2);
    // A header and one 5056 byte block each
    let zone_len = 48 + 5056;
    assert_eq!(allocator.get_raw().pages.maps(), 2);
    assert_eq!(allocator.get_raw().pages.mapped_bytes(), 2 * zone_len);

    let out = report(&allocator);
    log::info!("\n{}", out);
    assert_eq!(out.matches("LARGE : ").count(), 2);
    assert!(out.contains(&format!("{:p} - ", a)));
    assert!(out.ends_with("Total: 10032\n"));

    allocator.release(a);
    let out = report(&allocator);
    assert_eq!(out.matches("LARGE : ").count(), 1);
    assert!(!out.contains(&format!("{:p} - ", a)));
    assert_eq!(allocator.get_raw().pages.unmaps(), 1);
    assert_eq!(allocator.get_raw().pages.mapped_bytes(), zone_len);

    allocator.release(b);
    assert_eq!(report(&allocator), "Total: 0\n");
    assert_eq!(allocator.get_raw().pages.mapped_bytes(), 0);
}

#[test]
fn test_global_alloc() {
    let allocator = ZoneAllocator::new();
    unsafe {
        let layout = Layout::from_size_align(300, 8).unwrap();
        let ptr = allocator.alloc(layout);
        assert!(!ptr.is_null());
        for i in 0..300 {
            ptr.add(i).write(i as u8);
        }

        let grown = allocator.realloc(ptr, layout, 3000);
        assert!(!grown.is_null());
        let contents = core::slice::from_raw_parts(grown, 300);
        assert!(contents.iter().enumerate().all(|(i, &x)| x == i as u8));
        allocator.dealloc(grown, Layout::from_size_align(3000, 8).unwrap());

        // Only 16 byte alignment is on offer
        let aligned = Layout::from_size_align(64, 32).unwrap();
        assert!(allocator.alloc(aligned).is_null());
    }
    assert_valid(&allocator);
    assert_eq!(allocator.stats().1.allocated_bytes, 0);
}
