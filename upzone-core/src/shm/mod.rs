//! Shared memory: segments, their slab allocator and the lock guarding it.

mod mutex;
mod segment;
mod slab;

pub use mutex::{ShmMutex, ShmMutexGuard};
pub use segment::{
    Segment, DEFAULT_SEGMENT_SIZE, HEADER_SIZE, LAYOUT_VERSION, MAGIC, MAX_NAME_LEN,
    MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE,
};
pub use slab::{Block, Slab, SlabGuard, SlabStats, BLOCK_ALIGN};
