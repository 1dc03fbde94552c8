#[cfg(not(target_pointer_width = "64"))]
compile_error!("segalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::block_allocator::{
    BOUNDARY_64MB, BlockAllocator, BlockAllocatorConfig, DEFAULT_MAX_BLOCKS, DEFAULT_SEGMENT_SIZE,
    FreeBlock,
};

// errors
pub use memory::error::{AllocatorError, Result};

// stats
pub use memory::stats::{MemoryStats, snapshot as stats_snapshot};
