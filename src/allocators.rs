//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded zone allocator: it routes requests to a
//! size class, finds or maps a zone with room, and hands out blocks from it.
//! It releases blocks, coalesces them, and unmaps zones that become empty.
//! Because it is not thread-safe, it cannot be used as a global allocator.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and initializes it on first use. It implements
//! [`core::alloc::GlobalAlloc`].
//!
//! ### [`PageSource`](trait.PageSource.html)
//!
//! `PageSource` is a simple trait interface meant to abstract over the calls
//! to the OS to map and unmap memory. [`MmapPages`](struct.MmapPages.html)
//! implements it with `mmap`, and [`ToyHeap`](struct.ToyHeap.html) with a
//! fixed in-process array, which is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
#[cfg(any(test, feature = "std"))]
use core::cell::Cell;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(any(test, feature = "std")))]
use core::sync::atomic::AtomicBool;

use errno::Errno;
use spin::{Mutex, MutexGuard};

use crate::blocklist::{self, Stats, Validity, ALIGNMENT};
use crate::report::{self, FdWriter};
use crate::zones::{SizeClass, Zone, Zones};

/// Why an operation produced no memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused to map `requested` more bytes, or the request cannot be
    /// represented at all.
    OutOfMemory { requested: usize },
    /// The pointer is not a live allocation of this allocator.
    InvalidPointer,
    /// Nothing to allocate.
    ZeroSize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { requested } => {
                write!(f, "out of memory mapping {} bytes", requested)
            }
            AllocError::InvalidPointer => f.write_str("pointer is not a live allocation"),
            AllocError::ZeroSize => f.write_str("zero-sized request"),
        }
    }
}

pub trait PageSource {
    type Err: fmt::Debug;

    /// Size of an OS page; TINY and SMALL zones are a multiple of it.
    fn page_size(&self) -> usize;

    /// Map `len` bytes of zeroed, writable memory, aligned to at least 16
    /// bytes.
    ///
    /// # Safety
    ///
    /// The returned memory must be available and untracked by any other rust
    /// code, including the allocator itself.
    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a mapping previously returned by `map` with the same `len`.
    ///
    /// # Safety
    ///
    /// Nothing may touch the memory afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize);
}

/// MmapPages uses virtual memory to map and unmap zones.
#[derive(Default)]
pub struct MmapPages {
    // Just for tracking, not really needed
    maps: usize,
    unmaps: usize,
    mapped_bytes: usize,
}

impl MmapPages {
    pub const fn new() -> Self {
        MmapPages {
            maps: 0,
            unmaps: 0,
            mapped_bytes: 0,
        }
    }

    /// Number of successful `mmap` calls.
    pub fn maps(&self) -> usize {
        self.maps
    }

    /// Number of successful `munmap` calls.
    pub fn unmaps(&self) -> usize {
        self.unmaps
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }
}

impl PageSource for MmapPages {
    type Err = Errno;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            len,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // Anonymous memory, not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.maps += 1;
        self.mapped_bytes += len;
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
        // A failed munmap leaves the mapping in place; all we can do is leak it.
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) == 0 {
            self.unmaps += 1;
            self.mapped_bytes -= len;
        }
    }
}

pub const TOY_HEAP_SIZE: usize = 128 * 1024;

#[repr(C, align(16))]
struct ToyArena([u8; TOY_HEAP_SIZE]);

/// A fixed array that pretends to be the OS. Mappings are carved off the
/// front and never reused; unmapping only counts the bytes.
pub struct ToyHeap {
    pub page_size: usize,
    /// Bytes handed out so far.
    pub size: usize,
    /// Bytes given back so far.
    pub unmapped: usize,
    /// Mapping fails past this many bytes.
    pub limit: usize,
    heap: ToyArena,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            page_size: 256,
            size: 0,
            unmapped: 0,
            limit: TOY_HEAP_SIZE,
            heap: ToyArena([0; TOY_HEAP_SIZE]),
        }
    }
}

impl ToyHeap {
    /// A toy heap that refuses to map more than `limit` bytes in total.
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..ToyHeap::default()
        }
    }

    /// Bytes currently mapped.
    pub fn mapped(&self) -> usize {
        self.size - self.unmapped
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl PageSource for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        let allocating = blocklist::align_up(len).ok_or(ToyHeapOverflowError())?;
        match self.size.checked_add(allocating) {
            Some(end) if end <= self.limit => {}
            _ => return Err(ToyHeapOverflowError()),
        }

        let ptr = self.heap.0.as_mut_ptr().add(self.size);
        self.size += allocating;
        NonNull::new(ptr).ok_or(ToyHeapOverflowError())
    }

    unsafe fn unmap(&mut self, _ptr: NonNull<u8>, len: usize) {
        self.unmapped += blocklist::align_up(len).unwrap_or(len);
    }
}

/// What [`RawAlloc::resize_in_place`] managed to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resize {
    /// The block now holds the new size at the same address.
    InPlace,
    /// The data has to move; `capacity` bytes of it are live.
    Relocate { capacity: usize },
}

/// A raw allocator, mapping zones from a [`PageSource`], handing out blocks
/// from them, and returning empty zones to the source.
pub struct RawAlloc<P: PageSource> {
    pub pages: P,
    zones: Zones,
}

impl<P: PageSource> Drop for RawAlloc<P> {
    fn drop(&mut self) {
        // Anything still allocated from us goes away with the zones.
        for class in SizeClass::ALL {
            while let Some(zone) = self.zones.list_mut(class).pop_front() {
                unsafe { self.pages.unmap(zone.start(), zone.size()) };
            }
        }
    }
}

impl<P: PageSource + Default> Default for RawAlloc<P> {
    fn default() -> Self {
        RawAlloc::new(P::default())
    }
}

impl<P: PageSource> RawAlloc<P> {
    pub const fn new(pages: P) -> Self {
        RawAlloc {
            pages,
            zones: Zones::new(),
        }
    }

    pub fn zones(&self) -> &Zones {
        &self.zones
    }

    /// Get statistics on this allocator, and verify the consistency of every
    /// zone.
    pub fn stats(&self) -> (Validity, Stats) {
        self.zones.stats()
    }

    /// Calculate the size of the block needed to hold `size` bytes.
    pub fn block_size(size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        blocklist::block_size(size).ok_or(AllocError::OutOfMemory { requested: size })
    }

    /// Allocate a 16 byte aligned region of at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let needed = Self::block_size(size)?;
        let class = SizeClass::of(needed);

        // A LARGE zone only ever holds the one block it was made for.
        if class != SizeClass::Large {
            if let Some((mut zone, block)) = self.zones.list(class).find_with_space(needed) {
                return Ok(zone.blocks_mut().claim(block, needed).payload());
            }
        }

        let mut zone = self.create_zone(class, needed)?;
        let block = zone
            .blocks_mut()
            .allocate(needed)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        Ok(block.payload())
    }

    /// Map a zone of `class` with room for a block of `block_size` bytes and
    /// put it at the head of its list.
    fn create_zone(&mut self, class: SizeClass, block_size: usize) -> Result<Zone, AllocError> {
        let len = class
            .zone_len(block_size, self.pages.page_size())
            .ok_or(AllocError::OutOfMemory {
                requested: block_size,
            })?;

        let ptr = unsafe { self.pages.map(len) }
            .map_err(|_| AllocError::OutOfMemory { requested: len })?;
        let zone = unsafe { Zone::init(ptr, len, class) };
        self.zones.list_mut(class).push_front(zone);
        Ok(zone)
    }

    /// Free the allocation at `ptr`.
    ///
    /// A null pointer is fine. A pointer that is not a live allocation is
    /// reported as [`AllocError::InvalidPointer`] and changes nothing.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }

        let (mut zone, block) = self
            .zones
            .find_block(ptr)
            .ok_or(AllocError::InvalidPointer)?;
        if block.is_free() {
            return Err(AllocError::InvalidPointer);
        }

        zone.blocks_mut().release(block);
        if zone.is_empty() {
            self.reclaim(zone);
        }
        Ok(())
    }

    /// Unmap an empty zone, unless it is the last TINY or SMALL zone of its
    /// class.
    fn reclaim(&mut self, zone: Zone) {
        let class = zone.class();
        let list = self.zones.list_mut(class);
        if class != SizeClass::Large && list.len() < 2 {
            return;
        }

        let (start, size) = (zone.start(), zone.size());
        if list.remove(zone) {
            unsafe { self.pages.unmap(start, size) };
        }
    }

    /// Try to make the allocation at `ptr` hold `size` bytes without moving
    /// it: shrink it, or grow it into a free neighbour.
    pub fn resize_in_place(&mut self, ptr: NonNull<u8>, size: usize) -> Result<Resize, AllocError> {
        let needed = Self::block_size(size)?;
        let (mut zone, mut block) = self
            .zones
            .find_block(ptr.as_ptr())
            .ok_or(AllocError::InvalidPointer)?;
        if block.is_free() {
            return Err(AllocError::InvalidPointer);
        }

        let blocks = zone.blocks_mut();
        if needed <= block.size() {
            blocks.shrink_in_place(&mut block, needed);
            return Ok(Resize::InPlace);
        }
        if blocks.grow_in_place(&mut block, needed) {
            return Ok(Resize::InPlace);
        }

        Ok(Resize::Relocate {
            capacity: block.user_size(),
        })
    }

    /// Change the size of the allocation at `ptr`, with `realloc` semantics.
    ///
    /// A null `ptr` allocates; a zero `size` releases and returns `None`. If a
    /// new block cannot be had, the old one is left untouched.
    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let old = match NonNull::new(ptr) {
            None => return self.allocate(size).map(Some),
            Some(old) => old,
        };
        if size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }

        let capacity = match self.resize_in_place(old, size)? {
            Resize::InPlace => return Ok(Some(old)),
            Resize::Relocate { capacity } => capacity,
        };

        let new = self.allocate(size)?;
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), capacity.min(size)) };
        self.release(ptr)?;
        Ok(Some(new))
    }

    /// Write the allocation report: every zone and every allocated block in
    /// it, then the total.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        report::write_report(&self.zones, out)
    }
}

// Set while this thread is emitting a log record, so that a logger allocating
// through us does not log again.
#[cfg(any(test, feature = "std"))]
std::thread_local! {
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

/// Run `f`, which emits a log record, unless this thread is already inside
/// one. Other threads logging at the same time do not matter.
#[cfg(any(test, feature = "std"))]
fn quietly<F: FnOnce()>(f: F) {
    // During thread teardown the flag may be gone; the record is dropped.
    let _ = LOGGING.try_with(|logging| {
        if !logging.replace(true) {
            f();
            logging.set(false);
        }
    });
}

// Without thread locals, one flag covers the whole process: a record is
// dropped while any other thread is emitting one.
#[cfg(not(any(test, feature = "std")))]
static LOGGING: AtomicBool = AtomicBool::new(false);

#[cfg(not(any(test, feature = "std")))]
fn quietly<F: FnOnce()>(f: F) {
    if LOGGING
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        f();
        LOGGING.store(false, Ordering::Release);
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Every operation holds the lock for all of its metadata work. Log records
/// are only written after the lock is released.
pub struct GenericAllocator<P: PageSource> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawAlloc<P>>>>,
}

// The RawAlloc is only reached through the mutex, once initialized.
unsafe impl<P: PageSource + Send> Sync for GenericAllocator<P> {}

impl<P: PageSource + Default> Default for GenericAllocator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageSource> Drop for GenericAllocator<P> {
    fn drop(&mut self) {
        if *self.init.get_mut() == 2 {
            unsafe { self.raw.get_mut().assume_init_drop() };
        }
    }
}

impl<P: PageSource> GenericAllocator<P> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<P: PageSource + Default> GenericAllocator<P> {
    /// Get a lock on the underlying RawAlloc, initializing it on first use.
    ///
    /// Calling any other method of this allocator, or allocating through it,
    /// while holding the guard deadlocks.
    pub fn get_raw(&self) -> MutexGuard<'_, RawAlloc<P>> {
        // The plan:
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        //
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient.
        match self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                // We won the race; nobody else touches `raw` until we store 2.
                unsafe { (*self.raw.get()).write(Mutex::new(RawAlloc::default())) };
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                while self.init.load(Ordering::SeqCst) != 2 {
                    core::hint::spin_loop();
                }
            }
            Err(_) => {
                // Already initialized
            }
        }

        let mutex = unsafe { (*self.raw.get()).assume_init_ref() };
        mutex.lock()
    }

    /// Allocate at least `size` bytes, 16 byte aligned. Returns null for a zero
    /// size or when no memory can be mapped.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let result = self.get_raw().allocate(size);
        match result {
            Ok(ptr) => {
                quietly(|| log::trace!("allocate({}) -> {:?}", size, ptr));
                ptr.as_ptr()
            }
            Err(err) => {
                log_failure("allocate", err);
                null_mut()
            }
        }
    }

    /// Free the allocation at `ptr`. Null and unknown pointers are ignored.
    pub fn release(&self, ptr: *mut u8) {
        let result = self.get_raw().release(ptr);
        match result {
            Ok(()) => quietly(|| log::trace!("release({:?})", ptr)),
            Err(err) => log_failure("release", err),
        }
    }

    /// Change the size of the allocation at `ptr`, with `realloc` semantics.
    ///
    /// Returns null after releasing for a zero `size`, and null with the old
    /// allocation untouched if it cannot be resized.
    pub fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.try_resize(ptr, size) {
            Ok(new) => {
                quietly(|| log::trace!("resize({:?}, {}) -> {:?}", ptr, size, new));
                new.map_or(null_mut(), NonNull::as_ptr)
            }
            Err(err) => {
                log_failure("resize", err);
                null_mut()
            }
        }
    }

    fn try_resize(&self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let old = match NonNull::new(ptr) {
            None => return self.get_raw().allocate(size).map(Some),
            Some(old) => old,
        };
        if size == 0 {
            self.get_raw().release(ptr)?;
            return Ok(None);
        }

        let capacity = {
            let mut raw = self.get_raw();
            match raw.resize_in_place(old, size)? {
                Resize::InPlace => return Ok(Some(old)),
                Resize::Relocate { capacity } => capacity,
            }
        };

        // The lock is not held here; each step below takes it on its own.
        let new = self.get_raw().allocate(size)?;
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), capacity.min(size)) };
        self.get_raw().release(ptr)?;
        Ok(Some(new))
    }

    /// Write the allocation report to `out`, holding the lock throughout.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.get_raw().dump(out)
    }

    /// Print the allocation report to standard output, without allocating.
    pub fn show_alloc_mem(&self) {
        let mut out = FdWriter::stdout();
        // Writing to stdout can only fail in ways we can't report anyway.
        let _ = self.dump(&mut out);
        out.flush();
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }
}

fn log_failure(op: &str, err: AllocError) {
    match err {
        AllocError::OutOfMemory { .. } => quietly(|| log::warn!("{}: {}", op, err)),
        AllocError::InvalidPointer => quietly(|| log::debug!("{}: ignored, {}", op, err)),
        AllocError::ZeroSize => quietly(|| log::trace!("{}: {}", op, err)),
    }
}

/// The allocator backed by `mmap`, usable as the global allocator.
pub type ZoneAllocator = GenericAllocator<MmapPages>;

unsafe impl<P: PageSource + Default + Send> GlobalAlloc for GenericAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.resize(ptr, new_size)
    }
}
