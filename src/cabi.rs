//! `malloc`, `free`, `realloc` and `calloc` for C callers, all served by one
//! process-wide allocator.
//!
//! Linked into a binary, these symbols replace the C library's, so every
//! allocation in the process goes through here, tests included.

use core::ffi::c_void;
use core::ptr::{self, null_mut};

use crate::ZoneAllocator;

static ALLOCATOR: ZoneAllocator = ZoneAllocator::new();

#[no_mangle]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    ALLOCATOR.allocate(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    ALLOCATOR.release(ptr as *mut u8)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    ALLOCATOR.resize(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => return null_mut(),
    };

    let ptr = ALLOCATOR.allocate(total);
    if !ptr.is_null() {
        // Reused blocks still hold whatever was written to them.
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr as *mut c_void
}

#[no_mangle]
pub extern "C" fn show_alloc_mem() {
    ALLOCATOR.show_alloc_mem()
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_malloc_and_free() {
        assert!(malloc(0).is_null());

        let ptr = malloc(100) as *mut u8;
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 16, 0);
        unsafe {
            ptr::write_bytes(ptr, 0x11, 100);
            free(ptr as *mut c_void);
            free(null_mut());
        }
    }

    #[test]
    fn test_calloc_overflow() {
        assert!(calloc(usize::MAX, 2).is_null());
        assert!(calloc(2, usize::MAX).is_null());
    }

    #[test]
    fn test_calloc_zeroes_reused_blocks() {
        let dirty = malloc(64) as *mut u8;
        unsafe {
            ptr::write_bytes(dirty, 0xFF, 64);
            free(dirty as *mut c_void);
        }

        let ptr = calloc(8, 8) as *const u8;
        assert!(!ptr.is_null());
        let contents = unsafe { core::slice::from_raw_parts(ptr, 64) };
        assert!(contents.iter().all(|&x| x == 0));
        unsafe { free(ptr as *mut c_void) };
    }

    #[test]
    fn test_realloc_edge_cases() {
        unsafe {
            // Null behaves like malloc
            let ptr = realloc(null_mut(), 40) as *mut u8;
            assert!(!ptr.is_null());
            ptr::write_bytes(ptr, 0x22, 40);

            let grown = realloc(ptr as *mut c_void, 4000) as *mut u8;
            assert!(!grown.is_null());
            let contents = core::slice::from_raw_parts(grown, 40);
            assert!(contents.iter().all(|&x| x == 0x22));

            // Zero behaves like free
            assert!(realloc(grown as *mut c_void, 0).is_null());
        }
    }
}
