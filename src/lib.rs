#![no_std]

//! A zone-based memory allocator.
//!
//! Requests are sorted into three size classes. TINY (up to 128 bytes) and
//! SMALL (up to 1024 bytes) requests are carved out of zones of a fixed number
//! of pages, each mapped once and shared by many allocations; every LARGE
//! request gets a zone of its own. Within a zone, blocks carry their size in a
//! header and in a trailing footer, so that freed blocks merge with their
//! free neighbours in both directions. Zones that become entirely free are
//! returned to the OS, except for the last TINY and the last SMALL zone.
//!
//! ```no_run
//! use zone_alloc::ZoneAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: ZoneAllocator = ZoneAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1000).collect();
//!     drop(v);
//!     ALLOCATOR.show_alloc_mem();
//! }
//! ```

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocators;
pub mod blocklist;
pub mod report;
pub mod zones;

#[cfg(feature = "c-abi")]
mod cabi;

pub use allocators::{
    AllocError, GenericAllocator, MmapPages, PageSource, RawAlloc, ToyHeap, ZoneAllocator,
};
pub use blocklist::{Stats, Validity};
pub use zones::SizeClass;
