//! Zones: regions of mapped memory, each holding the blocks of one size
//! class.
//!
//! A zone starts with a [`ZoneHeader`], and the rest of it is partitioned into
//! blocks by the zone's [`BlockList`]. Zones of a class are chained in a
//! [`ZoneList`], newest first.

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::blocklist::{self, Block, BlockList, Stats, Validity, ALIGNMENT, MIN_BLOCK_SIZE};

/// Largest request, in bytes, served from TINY zones.
pub const TINY_MAX: usize = 128;
/// Largest request, in bytes, served from SMALL zones.
pub const SMALL_MAX: usize = 1024;
/// Pages mapped for every TINY zone.
pub const TINY_ZONE_PAGES: usize = 4;
/// Pages mapped for every SMALL zone.
pub const SMALL_ZONE_PAGES: usize = 32;

const TINY_BLOCK_MAX: usize = match blocklist::block_size(TINY_MAX) {
    Some(size) => size,
    None => 0,
};
const SMALL_BLOCK_MAX: usize = match blocklist::block_size(SMALL_MAX) {
    Some(size) => size,
    None => 0,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Tiny,
    Small,
    Large,
}

impl SizeClass {
    /// All classes, in the order zones are searched and reported.
    pub const ALL: [SizeClass; 3] = [SizeClass::Tiny, SizeClass::Small, SizeClass::Large];

    /// The class serving blocks of `block_size` total bytes.
    pub fn of(block_size: usize) -> SizeClass {
        if block_size <= TINY_BLOCK_MAX {
            SizeClass::Tiny
        } else if block_size <= SMALL_BLOCK_MAX {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    fn index(self) -> usize {
        match self {
            SizeClass::Tiny => 0,
            SizeClass::Small => 1,
            SizeClass::Large => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeClass::Tiny => "TINY",
            SizeClass::Small => "SMALL",
            SizeClass::Large => "LARGE",
        }
    }

    /// Bytes to map for a new zone of this class that must fit a block of
    /// `block_size` bytes.
    ///
    /// TINY and SMALL zones have a fixed capacity so that one mapping serves
    /// many allocations. A LARGE zone holds exactly one block.
    pub fn zone_len(self, block_size: usize, page_size: usize) -> Option<usize> {
        match self {
            SizeClass::Tiny => page_size.checked_mul(TINY_ZONE_PAGES),
            SizeClass::Small => page_size.checked_mul(SMALL_ZONE_PAGES),
            SizeClass::Large => ZONE_HEADER_SIZE.checked_add(block_size),
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The header at the start of every zone.
#[repr(C, align(16))]
pub struct ZoneHeader {
    size: usize,
    class: SizeClass,
    next: Option<Zone>,
    blocks: BlockList,
}

pub const ZONE_HEADER_SIZE: usize = size_of::<ZoneHeader>();

const_assert!(ZONE_HEADER_SIZE % ALIGNMENT == 0);

/// A handle to a mapped zone.
///
/// Invariant: the header is initialized and the mapping is alive for as long
/// as the zone is linked into a [`ZoneList`].
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Zone {
    header: NonNull<ZoneHeader>,
}

// Zones only travel between threads inside the locked allocator.
unsafe impl Send for Zone {}

impl Zone {
    /// Write a zone header at `ptr` and lay out one free block over the rest
    /// of the `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be 16 byte aligned and point to `size` bytes of fresh
    /// mapped memory, with `size` a multiple of 16 large enough for the
    /// header and a minimal block.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, class: SizeClass) -> Zone {
        debug_assert!(size >= ZONE_HEADER_SIZE + MIN_BLOCK_SIZE);
        let first = NonNull::new_unchecked(ptr.as_ptr().add(ZONE_HEADER_SIZE));
        let blocks = BlockList::new(first, size - ZONE_HEADER_SIZE);

        let header: NonNull<ZoneHeader> = ptr.cast();
        header.as_ptr().write(ZoneHeader {
            size,
            class,
            next: None,
            blocks,
        });
        Zone { header }
    }

    fn header_view(&self) -> &ZoneHeader {
        unsafe { self.header.as_ref() }
    }

    /// Start of the mapping.
    pub fn start(&self) -> NonNull<u8> {
        self.header.cast()
    }

    /// Total mapped size, header included.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn class(&self) -> SizeClass {
        self.header_view().class
    }

    pub fn next(&self) -> Option<Zone> {
        self.header_view().next
    }

    fn set_next(&mut self, next: Option<Zone>) {
        unsafe { self.header.as_mut().next = next };
    }

    pub fn blocks(&self) -> &BlockList {
        &self.header_view().blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockList {
        unsafe { &mut self.header.as_mut().blocks }
    }

    /// Whether `ptr` falls within the mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.start().as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr - start < self.size()
    }

    /// Whether the whole payload is one free block again.
    pub fn is_empty(&self) -> bool {
        self.blocks().is_single_free()
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone({}, {:?}, {})", self.class(), self.header, self.size())
    }
}

/// A singly linked list of zones, most recently created first.
#[derive(Default)]
pub struct ZoneList {
    head: Option<Zone>,
    len: usize,
}

pub struct ZoneIter<'list> {
    next: Option<Zone>,
    marker: core::marker::PhantomData<&'list ZoneList>,
}

impl<'list> Iterator for ZoneIter<'list> {
    type Item = Zone;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl ZoneList {
    pub const fn new() -> Self {
        ZoneList { head: None, len: 0 }
    }

    pub fn head(&self) -> Option<Zone> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> ZoneIter<'_> {
        ZoneIter {
            next: self.head,
            marker: core::marker::PhantomData,
        }
    }

    pub fn push_front(&mut self, mut zone: Zone) {
        zone.set_next(self.head.take());
        self.head = Some(zone);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<Zone> {
        let mut zone = self.head.take()?;
        self.head = zone.next();
        zone.set_next(None);
        self.len -= 1;
        Some(zone)
    }

    /// Unlink `zone`, wherever it is in the list. Returns false if it was not
    /// there.
    pub fn remove(&mut self, zone: Zone) -> bool {
        let mut current = match self.head {
            None => return false,
            Some(head) => head,
        };

        if current == zone {
            return self.pop_front().is_some();
        }

        while let Some(mut next) = current.next() {
            if next == zone {
                current.set_next(next.next());
                next.set_next(None);
                self.len -= 1;
                return true;
            }
            current = next;
        }

        false
    }

    /// First zone, newest first, with a free block of at least `size` bytes,
    /// along with that block.
    pub fn find_with_space(&self, size: usize) -> Option<(Zone, Block)> {
        self.iter()
            .find_map(|zone| zone.blocks().find_free(size).map(|block| (zone, block)))
    }
}

/// The three zone lists, one per size class.
#[derive(Default)]
pub struct Zones {
    lists: [ZoneList; 3],
}

impl Zones {
    pub const fn new() -> Self {
        Zones {
            lists: [ZoneList::new(), ZoneList::new(), ZoneList::new()],
        }
    }

    pub fn list(&self, class: SizeClass) -> &ZoneList {
        &self.lists[class.index()]
    }

    pub fn list_mut(&mut self, class: SizeClass) -> &mut ZoneList {
        &mut self.lists[class.index()]
    }

    /// Every zone: TINY, then SMALL, then LARGE, each newest first.
    pub fn iter(&self) -> impl Iterator<Item = Zone> + '_ {
        SizeClass::ALL
            .into_iter()
            .flat_map(move |class| self.list(class).iter())
    }

    /// The zone and block owning the payload pointer `ptr`, free or not.
    pub fn find_block(&self, ptr: *const u8) -> Option<(Zone, Block)> {
        let zone = self.iter().find(|zone| zone.contains(ptr))?;
        let block = zone.blocks().find_payload(ptr)?;
        Some((zone, block))
    }

    /// Check every zone for consistency and gather statistics.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        for zone in self.iter() {
            match zone.class() {
                SizeClass::Tiny => stats.tiny_zones += 1,
                SizeClass::Small => stats.small_zones += 1,
                SizeClass::Large => stats.large_zones += 1,
            }
            stats.zone_bytes += zone.size();
            if zone.blocks().span() != zone.size() - ZONE_HEADER_SIZE {
                validity.coverage_gaps += 1;
            }
            zone.blocks().check(&mut validity, &mut stats);
        }

        (validity, stats)
    }
}
