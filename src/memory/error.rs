/// Result alias used by every [`BlockAllocator`](super::block_allocator::BlockAllocator) operation.
pub type Result<T> = std::result::Result<T, AllocatorError>;

/// Failure modes of the block allocator.
///
/// `OutOfSpace` is the only transient error: waiting for a `free` may fix it.
/// `TableFull` and `TooManyFragments` mean `max_blocks` is too small for the
/// fragmentation pattern and should be treated as configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// No free block is currently large enough.
    #[error("no free block large enough for the request")]
    OutOfSpace,

    /// The requested extension direction is blocked by a 64 MiB boundary or
    /// the edge of the buffer.
    #[error("extension blocked by a 64 MiB boundary or the buffer edge")]
    NoMemory,

    /// The allocator is being torn down.
    #[error("allocator is shutting down")]
    ShuttingDown,

    /// `free` found no slot to record the released range; the range is lost
    /// to the allocator until the next `reset`.
    #[error("free-block table full: {size} bytes at {offset:#x} leaked from bookkeeping")]
    TableFull { offset: usize, size: usize },

    /// `reset` needs more boundary-aligned runs than the table can hold.
    #[error("buffer needs {required} free runs but the table holds {capacity}")]
    TooManyFragments { required: usize, capacity: usize },

    /// Zero-byte request.
    #[error("zero-sized request")]
    ZeroSize,

    /// The region passed back does not lie inside the backing buffer.
    #[error("region {offset:#x}+{size:#x} is outside the backing buffer")]
    OutOfRange { offset: usize, size: usize },

    /// Construction parameters were rejected.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
}
