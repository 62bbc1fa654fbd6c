use core::ptr;
use std::thread;

use zone_alloc::ZoneAllocator;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use test_log::test;

static ALLOCATOR: ZoneAllocator = ZoneAllocator::new();

const THREADS: usize = 8;
const CYCLES: usize = 2000;
const SIZES: [usize; 6] = [16, 100, 500, 1000, 3000, 70000];

// Addresses cross the thread boundary as integers.
fn check_fill(ptr: usize, size: usize, fill: u8) {
    let contents = unsafe { core::slice::from_raw_parts(ptr as *const u8, size) };
    assert!(
        contents.iter().all(|&x| x == fill),
        "allocation at {:#x} was overwritten",
        ptr
    );
}

fn churn(thread: usize, seed: u64) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let fill = thread as u8 + 1;
    let mut live: Vec<(usize, usize)> = Vec::new();

    for _ in 0..CYCLES {
        match rng.gen_range(0..4) {
            0 | 1 => {
                let size = *SIZES.choose(&mut rng).unwrap();
                let ptr = ALLOCATOR.allocate(size);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % 16, 0);
                unsafe { ptr::write_bytes(ptr, fill, size) };
                live.push((ptr as usize, size));
            }
            2 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (ptr, size) = live[i];
                check_fill(ptr, size, fill);
                let new_size = *SIZES.choose(&mut rng).unwrap();
                let new = ALLOCATOR.resize(ptr as *mut u8, new_size);
                assert!(!new.is_null());
                check_fill(new as usize, size.min(new_size), fill);
                unsafe { ptr::write_bytes(new, fill, new_size) };
                live[i] = (new as usize, new_size);
            }
            _ if !live.is_empty() => {
                let (ptr, size) = live.swap_remove(rng.gen_range(0..live.len()));
                check_fill(ptr, size, fill);
                ALLOCATOR.release(ptr as *mut u8);
            }
            _ => {}
        }
    }

    for (ptr, size) in live {
        check_fill(ptr, size, fill);
        ALLOCATOR.release(ptr as *mut u8);
    }
}

#[test]
fn test_threads_share_one_allocator() {
    let seed: u64 = rand::random();
    log::info!("Using seed {}", seed);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| thread::spawn(move || churn(t, seed.wrapping_add(t as u64))))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (validity, stats) = ALLOCATOR.stats();
    log::info!("Validity: {:?}, Stats: {:?}", validity, stats);
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.large_zones, 0);
    assert!(stats.tiny_zones <= 1 && stats.small_zones <= 1);
}
