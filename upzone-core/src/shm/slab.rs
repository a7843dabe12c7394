//! Fixed-capacity block allocator over a segment's data region.
//!
//! Blocks are carved from a bump cursor and recycled through a singly
//! linked free list (first fit, no splitting or coalescing). The region
//! never grows. Every operation that touches the cursor or the free list
//! runs under the slab mutex; [`Slab::lock`] hands that mutex to callers
//! that need several allocations to appear atomic to other writers.

use super::mutex::{ShmMutex, ShmMutexGuard};
use super::segment::Segment;
use crate::error::OutOfMemory;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Size reserved for [`SlabHeader`] right after the segment header.
pub(crate) const SLAB_HEADER_SIZE: usize = 64;

/// Alignment of every block payload.
pub const BLOCK_ALIGN: usize = 8;

const BLOCK_HEADER_SIZE: u32 = mem::size_of::<BlockHeader>() as u32;

#[repr(C)]
pub(crate) struct SlabHeader {
    mutex: ShmMutex,
    start: u32,
    end: u32,
    cursor: AtomicU32,
    free_head: AtomicU32,
    used: AtomicU32,
    failures: AtomicU32,
    _pad: [u8; 32],
}

const _: () = assert!(mem::size_of::<SlabHeader>() == SLAB_HEADER_SIZE);

#[repr(C)]
struct BlockHeader {
    size: u32,
    next_free: u32,
}

const _: () = assert!(BLOCK_HEADER_SIZE as usize == BLOCK_ALIGN);

/// Write an empty slab header covering `start..end`.
///
/// # Safety
///
/// `header` must point into a mapping nobody else is using yet.
pub(crate) unsafe fn format(header: *mut SlabHeader, start: u32, end: u32) {
    debug_assert_eq!(start as usize % BLOCK_ALIGN, 0);
    ptr::write_bytes(header as *mut u8, 0, SLAB_HEADER_SIZE);
    (*header).start = start;
    (*header).end = end;
    (*header).cursor = AtomicU32::new(start);
}

/// A block handed out by the slab: payload offset and usable length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    offset: u32,
    len: u32,
}

impl Block {
    /// Offset of the payload from the segment base.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Usable payload length, at least the requested size.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the payload is empty. Never true for slab blocks.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocation counters of one slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    /// Size of the data region in bytes.
    pub capacity: usize,
    /// Payload bytes currently handed out.
    pub used: usize,
    /// Payload bytes parked on the free list.
    pub recycled: usize,
    /// Bytes never touched by the bump cursor.
    pub untouched: usize,
    /// Allocations refused for lack of space.
    pub failures: u32,
}

/// Handle to the allocator of one segment.
#[derive(Debug, Clone, Copy)]
pub struct Slab<'a> {
    segment: &'a Segment,
}

impl<'a> Slab<'a> {
    pub(crate) fn new(segment: &'a Segment) -> Self {
        Self { segment }
    }

    fn header(&self) -> &'a SlabHeader {
        self.segment.slab_header()
    }

    /// Take the slab mutex. The guard allocates without relocking.
    pub fn lock(&self) -> SlabGuard<'a> {
        let guard = self.header().mutex.lock();
        SlabGuard {
            segment: self.segment,
            header: self.header(),
            _guard: guard,
        }
    }

    /// Allocate `size` bytes, taking the mutex for this call only.
    pub fn alloc(&self, size: usize) -> Result<Block, OutOfMemory> {
        self.lock().alloc(size)
    }

    /// Like [`Slab::alloc`], with the payload zeroed.
    pub fn alloc_zeroed(&self, size: usize) -> Result<Block, OutOfMemory> {
        self.lock().alloc_zeroed(size)
    }

    /// Return a block to the free list.
    pub fn free(&self, block: Block) {
        self.lock().free(block)
    }

    /// Snapshot of the counters, read under the mutex.
    pub fn stats(&self) -> SlabStats {
        self.lock().stats()
    }

    /// Acquisitions of the slab mutex that had to wait.
    pub fn contended(&self) -> u32 {
        self.header().mutex.contended()
    }
}

/// The slab mutex, held. Dropping it releases the mutex.
pub struct SlabGuard<'a> {
    segment: &'a Segment,
    header: &'a SlabHeader,
    _guard: ShmMutexGuard<'a>,
}

impl<'a> SlabGuard<'a> {
    /// The segment this slab lives in.
    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    fn block_header(&self, payload: u32) -> *mut BlockHeader {
        self.segment.ptr(payload - BLOCK_HEADER_SIZE) as *mut BlockHeader
    }

    /// Allocate at least `size` bytes.
    ///
    /// On failure the cursor and the free list are left as they were.
    pub fn alloc(&mut self, size: usize) -> Result<Block, OutOfMemory> {
        let rounded = size
            .max(1)
            .checked_next_multiple_of(BLOCK_ALIGN)
            .and_then(|n| u32::try_from(n).ok());
        let Some(rounded) = rounded else {
            return Err(self.refuse(size));
        };

        if let Some(block) = self.take_free(rounded) {
            debug!(zone = %self.segment.name(), offset = block.offset, len = block.len, "slab reuse");
            return Ok(block);
        }

        let cursor = self.header.cursor.load(Ordering::Relaxed);
        let payload = cursor as u64 + BLOCK_HEADER_SIZE as u64;
        let next = payload + rounded as u64;
        if next > self.header.end as u64 {
            return Err(self.refuse(size));
        }

        let payload = payload as u32;
        // SAFETY: the header slot is inside the data region and unused.
        unsafe {
            ptr::write(
                self.block_header(payload),
                BlockHeader {
                    size: rounded,
                    next_free: 0,
                },
            );
        }
        self.header.cursor.store(next as u32, Ordering::Relaxed);
        self.header.used.fetch_add(rounded, Ordering::Relaxed);

        debug!(zone = %self.segment.name(), offset = payload, len = rounded, "slab alloc");
        Ok(Block {
            offset: payload,
            len: rounded,
        })
    }

    /// Allocate at least `size` zeroed bytes.
    pub fn alloc_zeroed(&mut self, size: usize) -> Result<Block, OutOfMemory> {
        let block = self.alloc(size)?;
        // SAFETY: the block is ours and lies inside the segment.
        unsafe { ptr::write_bytes(self.segment.ptr(block.offset), 0, block.len()) };
        Ok(block)
    }

    /// Push `block` onto the free list.
    ///
    /// The block must come from this slab and must not be reachable by
    /// readers any more.
    pub fn free(&mut self, block: Block) {
        debug_assert!(block.offset >= self.header.start + BLOCK_HEADER_SIZE);
        debug_assert!(block.offset < self.header.cursor.load(Ordering::Relaxed));

        let head = self.header.free_head.load(Ordering::Relaxed);
        // SAFETY: block headers are only touched under the mutex.
        unsafe { (*self.block_header(block.offset)).next_free = head };
        self.header.free_head.store(block.offset, Ordering::Relaxed);
        self.header.used.fetch_sub(block.len, Ordering::Relaxed);

        debug!(zone = %self.segment.name(), offset = block.offset, len = block.len, "slab free");
    }

    /// Counters as seen under the mutex.
    pub fn stats(&self) -> SlabStats {
        let mut recycled = 0usize;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            // SAFETY: free list entries are valid block headers.
            let bh = unsafe { &*self.block_header(cur) };
            recycled += bh.size as usize;
            cur = bh.next_free;
        }

        let cursor = self.header.cursor.load(Ordering::Relaxed);
        SlabStats {
            capacity: (self.header.end - self.header.start) as usize,
            used: self.header.used.load(Ordering::Relaxed) as usize,
            recycled,
            untouched: (self.header.end - cursor) as usize,
            failures: self.header.failures.load(Ordering::Relaxed),
        }
    }

    fn take_free(&mut self, size: u32) -> Option<Block> {
        let mut prev = 0u32;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);

        while cur != 0 {
            let bh = self.block_header(cur);
            // SAFETY: free list entries are valid block headers.
            let (len, next) = unsafe { ((*bh).size, (*bh).next_free) };

            if len >= size {
                if prev == 0 {
                    self.header.free_head.store(next, Ordering::Relaxed);
                } else {
                    // SAFETY: as above.
                    unsafe { (*self.block_header(prev)).next_free = next };
                }
                // SAFETY: as above.
                unsafe { (*bh).next_free = 0 };
                self.header.used.fetch_add(len, Ordering::Relaxed);
                return Some(Block { offset: cur, len });
            }

            prev = cur;
            cur = next;
        }

        None
    }

    fn refuse(&self, requested: usize) -> OutOfMemory {
        self.header.failures.fetch_add(1, Ordering::Relaxed);
        warn!(zone = %self.segment.name(), requested, "slab exhausted");
        OutOfMemory { requested }
    }
}
