use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Every payload and every piece of metadata starts on a 16 byte boundary.
pub const ALIGNMENT: usize = 16;

/// Round `value` up to the next multiple of [`ALIGNMENT`], or `None` on
/// overflow.
pub const fn align_up(value: usize) -> Option<usize> {
    match value.checked_add(ALIGNMENT - 1) {
        Some(v) => Some(v & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// The header in front of every block, free or allocated.
///
/// `size` covers the whole block: header, payload and footer. `next` links
/// blocks in address order, regardless of whether they are free, so that it
/// always agrees with physical adjacency.
///
/// We use C representation and align to 16 bytes so that the payload right
/// after the header is aligned as well.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    free: bool,
    next: Option<Block>,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// The footer is a copy of the block size stored in the last bytes of the
/// block, so that the following block can find the start of this one.
pub const FOOTER_SIZE: usize = size_of::<usize>();

/// Size of the smallest block that can exist: one that holds a single byte.
pub const MIN_BLOCK_SIZE: usize = match block_size(1) {
    Some(size) => size,
    None => 0,
};

const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(MIN_BLOCK_SIZE >= HEADER_SIZE + FOOTER_SIZE);
const_assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);

/// Total size of a block whose payload holds at least `user_size` bytes.
pub const fn block_size(user_size: usize) -> Option<usize> {
    let payload = match align_up(user_size) {
        Some(payload) => payload,
        None => return None,
    };
    match payload.checked_add(HEADER_SIZE + FOOTER_SIZE) {
        Some(total) => align_up(total),
        None => None,
    }
}

/// A handle to a block living inside a zone.
///
/// A `Block` is only ever built from memory the allocator owns, and stays
/// valid until its zone is unmapped or it is absorbed by a neighbour.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks only travel between threads inside the locked allocator.
unsafe impl Send for Block {}

impl Block {
    /// Write a free block of `size` bytes at `ptr`, header and footer both.
    ///
    /// # Safety
    ///
    /// `ptr` must be 16 byte aligned and point to `size` bytes owned by the
    /// allocator and not covered by any other block.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, next: Option<Block>) -> Block {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        let header: NonNull<BlockHeader> = ptr.cast();
        header.as_ptr().write(BlockHeader {
            size,
            free: true,
            next,
        });
        let mut block = Block { header };
        block.write_footer();
        block
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// # Safety
    ///
    /// Changing the size or link of a block in isolation breaks the
    /// zone's partitioning; callers keep neighbours consistent.
    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// Total size of the block, metadata included.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn is_free(&self) -> bool {
        self.header_view().free
    }

    /// The next block in address order.
    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    /// Number of bytes the caller may use in the payload.
    pub fn user_size(&self) -> usize {
        self.size() - HEADER_SIZE - FOOTER_SIZE
    }

    pub fn start(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// The address handed out to callers.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.start();
        start..start.wrapping_add(self.size())
    }

    /// The value of the boundary tag at the end of the block.
    pub fn footer(&self) -> usize {
        unsafe { self.footer_ptr().read() }
    }

    fn footer_ptr(&self) -> *mut usize {
        (self.header.as_ptr() as *mut u8).wrapping_add(self.size() - FOOTER_SIZE) as *mut usize
    }

    unsafe fn write_footer(&mut self) {
        let size = self.size();
        self.footer_ptr().write(size);
    }

    /// Set the size in the header and the footer together.
    unsafe fn set_size(&mut self, size: usize) {
        self.header_mut().size = size;
        self.write_footer();
    }

    unsafe fn set_free(&mut self, free: bool) {
        self.header_mut().free = free;
    }

    unsafe fn set_next(&mut self, next: Option<Block>) {
        self.header_mut().next = next;
    }

    /// The block physically following this one, if it is below `limit`.
    fn physical_next(&self, limit: *const u8) -> Option<Block> {
        let end = self.as_range().end;
        if end >= limit {
            return None;
        }
        let header = NonNull::new(end as *mut BlockHeader)?;
        Some(Block { header })
    }

    /// The block physically preceding this one, found through its footer.
    ///
    /// `first` is the first block of the zone, which has no predecessor.
    fn physical_prev(&self, first: Block) -> Option<Block> {
        if *self == first {
            return None;
        }
        unsafe {
            let tag = (self.start() as *const usize).sub(1).read();
            let header = NonNull::new(self.start().sub(tag) as *mut BlockHeader)?;
            Some(Block { header })
        }
    }

    /// Carve the bytes past `size` into a new free block that follows this
    /// one, and return it.
    ///
    /// Returns `None`, leaving this block untouched, when the remainder is
    /// too small to hold a block of its own.
    unsafe fn split(&mut self, size: usize) -> Option<Block> {
        let total = self.size();
        match total.checked_sub(size) {
            Some(rest) if rest >= MIN_BLOCK_SIZE => {}
            _ => return None,
        }

        let rest_ptr = NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(size));
        let rest = Block::init(rest_ptr, total - size, self.next());
        self.set_size(size);
        self.set_next(Some(rest));
        Some(rest)
    }

    /// Merge `next`, which must directly follow this block, into this one.
    unsafe fn absorb(&mut self, next: Block) {
        debug_assert_eq!(self.next(), Some(next));
        let size = self.size() + next.size();
        self.set_next(next.next());
        self.set_size(size);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_free() { "free" } else { "used" };
        write!(f, "Block({:?}, {}, {})", self.header, self.size(), state)
    }
}

/// All the blocks of one zone, in address order.
///
/// The blocks partition `[first, limit)` exactly: no gaps, no overlap. `free`
/// counts the blocks currently marked free.
pub struct BlockList {
    first: Block,
    limit: NonNull<u8>,
    free: usize,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    marker: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found while
/// walking zones and their blocks.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose footer disagrees with their header.
    pub tag_mismatches: usize,
    /// Zones whose free block counter disagrees with the blocks.
    pub stale_free_counts: usize,
    /// Free blocks directly followed by another free block.
    pub uncoalesced: usize,
    /// Blocks whose `next` is not the block physically after them.
    pub broken_links: usize,
    /// Zones whose blocks do not add up to the payload region.
    pub coverage_gaps: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.tag_mismatches == 0
            && self.stale_free_counts == 0
            && self.uncoalesced == 0
            && self.broken_links == 0
            && self.coverage_gaps == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub tiny_zones: usize,
    pub small_zones: usize,
    pub large_zones: usize,
    /// Bytes mapped for all zones, headers included.
    pub zone_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Usable bytes in allocated blocks.
    pub allocated_bytes: usize,
    /// Total size of free blocks.
    pub free_bytes: usize,
}

impl Stats {
    pub fn zones(&self) -> usize {
        self.tiny_zones + self.small_zones + self.large_zones
    }
}

impl BlockList {
    /// Lay out one free block spanning `len` bytes at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be 16 byte aligned and point to `len` bytes owned by the
    /// caller, with `len` a multiple of 16 and at least [`MIN_BLOCK_SIZE`].
    pub unsafe fn new(start: NonNull<u8>, len: usize) -> BlockList {
        let first = Block::init(start, len, None);
        BlockList {
            first,
            limit: NonNull::new_unchecked(start.as_ptr().add(len)),
            free: 1,
        }
    }

    pub fn first(&self) -> Block {
        self.first
    }

    pub fn free_blocks(&self) -> usize {
        self.free
    }

    /// Bytes covered by the blocks.
    pub fn span(&self) -> usize {
        self.limit.as_ptr() as usize - self.first.start() as usize
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: Some(self.first),
            marker: PhantomData,
        }
    }

    /// First free block, in address order, of at least `size` bytes.
    pub fn find_free(&self, size: usize) -> Option<Block> {
        self.iter().find(|b| b.is_free() && b.size() >= size)
    }

    /// The allocated or free block whose payload starts at `ptr`.
    pub fn find_payload(&self, ptr: *const u8) -> Option<Block> {
        self.iter()
            .take_while(|b| b.start() < ptr)
            .find(|b| b.payload().as_ptr() as *const u8 == ptr)
    }

    /// Whether the zone is back to a single free block.
    pub fn is_single_free(&self) -> bool {
        self.first.is_free() && self.first.next().is_none()
    }

    fn split(&mut self, block: &mut Block, size: usize) -> Option<Block> {
        let rest = unsafe { block.split(size)? };
        self.free += 1;
        Some(rest)
    }

    /// Take `block`, which must be a free block of this list of at least
    /// `size` bytes, splitting off whatever is not needed.
    pub fn claim(&mut self, mut block: Block, size: usize) -> Block {
        debug_assert!(block.is_free() && block.size() >= size);
        self.split(&mut block, size);
        unsafe { block.set_free(false) };
        self.free -= 1;
        block
    }

    /// First-fit allocation of a block of `size` total bytes.
    pub fn allocate(&mut self, size: usize) -> Option<Block> {
        let block = self.find_free(size)?;
        Some(self.claim(block, size))
    }

    /// Mark an allocated block free and merge it with free neighbours.
    /// Returns the block that now contains it.
    pub fn release(&mut self, mut block: Block) -> Block {
        debug_assert!(!block.is_free());
        unsafe { block.set_free(true) };
        self.free += 1;
        self.coalesce(block)
    }

    /// Merge a free block with the next block, then with the previous one,
    /// when those are free. Returns the surviving block.
    pub fn coalesce(&mut self, block: Block) -> Block {
        let mut block = block;

        if let Some(next) = block.physical_next(self.limit.as_ptr()) {
            if next.is_free() {
                unsafe { block.absorb(next) };
                self.free -= 1;
            }
        }

        if let Some(mut prev) = block.physical_prev(self.first) {
            if prev.is_free() {
                unsafe { prev.absorb(block) };
                self.free -= 1;
                block = prev;
            }
        }

        block
    }

    /// Shrink an allocated block to `size` total bytes, returning the excess
    /// to the free pool when it is big enough to be a block.
    pub fn shrink_in_place(&mut self, block: &mut Block, size: usize) {
        if let Some(rest) = self.split(block, size) {
            self.coalesce(rest);
        }
    }

    /// Grow an allocated block to at least `size` total bytes by absorbing
    /// the free block after it. Returns false, changing nothing, when that
    /// is not possible.
    pub fn grow_in_place(&mut self, block: &mut Block, size: usize) -> bool {
        let next = match block.physical_next(self.limit.as_ptr()) {
            Some(next) if next.is_free() => next,
            _ => return false,
        };
        if block.size() + next.size() < size {
            return false;
        }

        unsafe { block.absorb(next) };
        self.free -= 1;
        self.split(block, size);
        true
    }

    /// Walk the blocks, recording anything inconsistent in `validity` and
    /// adding up sizes in `stats`.
    pub fn check(&self, validity: &mut Validity, stats: &mut Stats) {
        let limit = self.limit.as_ptr() as *const u8;
        let mut free = 0;
        let mut covered = 0;
        let mut previous_free = false;

        for block in self {
            if block.size() != block.footer() {
                validity.tag_mismatches += 1;
            }
            if block.next() != block.physical_next(limit) {
                validity.broken_links += 1;
            }

            if block.is_free() {
                if previous_free {
                    validity.uncoalesced += 1;
                }
                free += 1;
                stats.free_bytes += block.size();
            } else {
                stats.allocated_bytes += block.user_size();
            }

            previous_free = block.is_free();
            covered += block.size();
            stats.blocks += 1;
        }

        if free != self.free {
            validity.stale_free_counts += 1;
        }
        if covered != self.span() {
            validity.coverage_gaps += 1;
        }
        stats.free_blocks += free;
    }
}
