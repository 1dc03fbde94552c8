use super::error::{AllocatorError, Result};
use super::stats;
use crate::sync::{Condvar, Mutex};
use std::fmt;
use tracing::{debug, error, trace, warn};

/// Hardware rule: no granted region may straddle a multiple of this address.
pub const BOUNDARY_64MB: usize = 64 * 1024 * 1024;
/// Default allocation granularity.
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;
/// Default capacity of the free-block table.
pub const DEFAULT_MAX_BLOCKS: usize = 256;

/// Construction parameters for a [`BlockAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocatorConfig {
    /// Physical address of the first byte of the backing buffer.
    pub base_address: usize,

    /// Length of the backing buffer in bytes.
    pub buffer_size: usize,

    /// Allocation granularity. Every request is rounded up to a multiple of
    /// this. Default: 4096.
    pub segment_size: usize,

    /// Capacity of the free-block table. Default: 256.
    pub max_blocks: usize,

    /// Disable the 64 MiB boundary rule. Free runs and grants may then span
    /// boundaries, and `reset` describes the whole buffer as one run.
    /// Default: false.
    pub allow_boundary_crossing: bool,
}

impl BlockAllocatorConfig {
    #[must_use]
    pub fn new(base_address: usize, buffer_size: usize) -> Self {
        Self {
            base_address,
            buffer_size,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
            allow_boundary_crossing: false,
        }
    }

    #[must_use]
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    #[must_use]
    pub fn with_boundary_crossing(mut self, allow: bool) -> Self {
        self.allow_boundary_crossing = allow;
        self
    }

    /// Check the parameters for programmer errors.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::InvalidConfig`] describing the first rejected
    /// parameter.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AllocatorError::InvalidConfig(msg));

        if self.segment_size == 0 {
            return invalid("segment_size must be non-zero".to_string());
        }
        if self.max_blocks == 0 {
            return invalid("max_blocks must be non-zero".to_string());
        }
        if self.buffer_size == 0 {
            return invalid("buffer_size must be non-zero".to_string());
        }
        if self.base_address.checked_add(self.buffer_size).is_none() {
            return invalid(format!(
                "buffer {:#x}+{:#x} overflows the address space",
                self.base_address, self.buffer_size
            ));
        }
        if self.base_address % self.segment_size != 0 || self.buffer_size % self.segment_size != 0 {
            return invalid(format!(
                "base {:#x} and size {:#x} must be multiples of segment_size {:#x}",
                self.base_address, self.buffer_size, self.segment_size
            ));
        }
        if !self.allow_boundary_crossing && BOUNDARY_64MB % self.segment_size != 0 {
            return invalid(format!(
                "segment_size {:#x} must divide the 64 MiB boundary",
                self.segment_size
            ));
        }
        Ok(())
    }
}

/// A free run as reported by [`BlockAllocator::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub base: usize,
    pub size: usize,
}

impl FreeBlock {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// One slot of the free-block table.
///
/// `in_use` means "this slot describes live free space". A slot with
/// `in_use == false` is a hole in the table, not allocated memory.
#[derive(Debug, Clone, Copy, Default)]
struct Block {
    base: usize,
    size: usize,
    in_use: bool,
}

impl Block {
    const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Lock-protected allocator state.
struct Table {
    /// Fixed-capacity slot arena; `blocks.len() == max_blocks`.
    blocks: Vec<Block>,
    /// One past the highest slot that may be `in_use`. Scans stop here.
    high_water: usize,
    shutting_down: bool,
    /// Blocking allocations currently inside the allocator, waits included.
    calls_in_flight: usize,
}

impl Table {
    fn with_capacity(max_blocks: usize) -> Self {
        Self {
            blocks: vec![Block::default(); max_blocks],
            high_water: 0,
            shutting_down: false,
            calls_in_flight: 0,
        }
    }

    /// Replace every slot with the given runs, in order.
    fn load(&mut self, runs: &[(usize, usize)]) {
        self.blocks.fill(Block::default());
        for (slot, &(base, size)) in self.blocks.iter_mut().zip(runs) {
            *slot = Block {
                base,
                size,
                in_use: true,
            };
        }
        self.high_water = runs.len();
    }

    fn live(&self) -> impl Iterator<Item = (usize, &Block)> {
        self.blocks[..self.high_water]
            .iter()
            .enumerate()
            .filter(|(_, b)| b.in_use)
    }

    fn first_fit(&self, size: usize) -> Option<usize> {
        self.live().find(|(_, b)| b.size >= size).map(|(i, _)| i)
    }

    /// Index of the largest live block; the lowest index wins ties.
    fn largest(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (i, b) in self.live() {
            if best.is_none_or(|(_, size)| b.size > size) {
                best = Some((i, b.size));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Take `size` bytes from the front of slot `index`.
    fn carve(&mut self, index: usize, size: usize) -> usize {
        let block = &mut self.blocks[index];
        debug_assert!(block.in_use && block.size >= size);
        let base = block.base;
        block.base += size;
        block.size -= size;
        if block.size == 0 {
            self.vacate(index);
        }
        base
    }

    /// Remove slot `index` from the table, returning the run it described.
    fn take(&mut self, index: usize) -> (usize, usize) {
        let Block { base, size, .. } = self.blocks[index];
        self.vacate(index);
        (base, size)
    }

    fn vacate(&mut self, index: usize) {
        self.blocks[index] = Block::default();
        self.trim_high_water();
    }

    fn trim_high_water(&mut self) {
        while self.high_water > 0 && !self.blocks[self.high_water - 1].in_use {
            self.high_water -= 1;
        }
    }
}

/// Sub-allocator handing out segment-granular regions of one pre-reserved
/// contiguous buffer.
///
/// The allocator only records free space. Callers keep the `(offset, size)`
/// of each grant and pass it back to [`free`](Self::free),
/// [`extend`](Self::extend) or [`shrink`](Self::shrink). Offsets are absolute
/// addresses inside `[buffer_base, buffer_base + buffer_size)`; the buffer
/// contents are never touched.
///
/// Unless `allow_boundary_crossing` is set, no free run and no grant ever
/// straddles a 64 MiB-aligned address.
///
/// Blocking allocations sleep on a free-event that every successful `free`
/// and `reset` broadcasts. Waiters re-scan from scratch; there is no hand-off,
/// so a waiter needing a large run can be starved by callers taking small ones.
pub struct BlockAllocator {
    buffer_base: usize,
    buffer_size: usize,
    segment_size: usize,
    max_blocks: usize,
    allow_boundary_crossing: bool,
    /// Largest run `reset` produces; no request above this can ever succeed.
    largest_run: usize,
    table: Mutex<Table>,
    /// Free-event: broadcast on every successful `free`/`reset` and on shutdown.
    freed: Condvar,
    /// Signalled when the last in-flight call leaves during shutdown.
    drained: Condvar,
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("buffer_base", &format_args!("{:#x}", self.buffer_base))
            .field("buffer_size", &self.buffer_size)
            .field("segment_size", &self.segment_size)
            .field("max_blocks", &self.max_blocks)
            .field("allow_boundary_crossing", &self.allow_boundary_crossing)
            .finish_non_exhaustive()
    }
}

impl BlockAllocator {
    /// Bind an allocator to a caller-owned buffer and mark all of it free.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::InvalidConfig`] for rejected parameters and
    /// [`AllocatorError::TooManyFragments`] if the buffer spans more 64 MiB
    /// windows than the table has slots.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn new(config: BlockAllocatorConfig) -> Result<Self> {
        config.validate()?;

        let mut allocator = Self {
            buffer_base: config.base_address,
            buffer_size: config.buffer_size,
            segment_size: config.segment_size,
            max_blocks: config.max_blocks,
            allow_boundary_crossing: config.allow_boundary_crossing,
            largest_run: 0,
            table: Mutex::new(Table::with_capacity(config.max_blocks)),
            freed: Condvar::new(),
            drained: Condvar::new(),
        };
        allocator.largest_run = allocator.largest_boundary_run();

        // Drop subtracts this again, including when reset fails below.
        stats::BLOCK_POOL_MANAGED.add(allocator.buffer_size);
        allocator.reset()?;
        Ok(allocator)
    }

    #[must_use]
    pub const fn buffer_base(&self) -> usize {
        self.buffer_base
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    #[must_use]
    pub const fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    const fn buffer_end(&self) -> usize {
        self.buffer_base + self.buffer_size
    }

    fn round_up(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }
        // Overflow means the request is larger than any run could be.
        size.checked_next_multiple_of(self.segment_size)
            .ok_or(AllocatorError::OutOfSpace)
    }

    fn contains(&self, offset: usize, size: usize) -> bool {
        offset >= self.buffer_base
            && offset
                .checked_add(size)
                .is_some_and(|end| end <= self.buffer_end())
    }

    fn on_boundary(&self, address: usize) -> bool {
        !self.allow_boundary_crossing && address % BOUNDARY_64MB == 0
    }

    /// True if `[start, end)` lies inside a single 64 MiB window.
    fn same_window(&self, start: usize, end: usize) -> bool {
        self.allow_boundary_crossing || start / BOUNDARY_64MB == (end - 1) / BOUNDARY_64MB
    }

    /// Number of runs `boundary_runs` produces, without building them.
    fn boundary_run_count(&self) -> usize {
        if self.allow_boundary_crossing {
            return 1;
        }
        (self.buffer_end() - 1) / BOUNDARY_64MB - self.buffer_base / BOUNDARY_64MB + 1
    }

    /// Size of the largest run `boundary_runs` produces.
    fn largest_boundary_run(&self) -> usize {
        match self.boundary_run_count() {
            1 => self.buffer_size,
            2 => {
                let first = BOUNDARY_64MB - self.buffer_base % BOUNDARY_64MB;
                let last = self.buffer_size - first;
                first.max(last)
            }
            _ => BOUNDARY_64MB,
        }
    }

    /// Split the buffer into consecutive runs that each stay inside one
    /// 64 MiB window. Callers check `boundary_run_count` first.
    fn boundary_runs(&self) -> Vec<(usize, usize)> {
        let end = self.buffer_end();
        if self.allow_boundary_crossing {
            return vec![(self.buffer_base, self.buffer_size)];
        }

        let mut runs = Vec::new();
        let mut start = self.buffer_base;
        while start < end {
            let next = (start / BOUNDARY_64MB)
                .checked_add(1)
                .and_then(|window| window.checked_mul(BOUNDARY_64MB))
                .map_or(end, |boundary| boundary.min(end));
            runs.push((start, next - start));
            start = next;
        }
        runs
    }

    /// Rebuild the table as if the whole buffer were free.
    ///
    /// The caller must guarantee that no grants are outstanding; any that are
    /// will be handed out again.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::TooManyFragments`] if the buffer needs more runs
    ///   than `max_blocks`. The table is left unchanged.
    /// - [`AllocatorError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn reset(&self) -> Result<()> {
        let required = self.boundary_run_count();
        if required > self.max_blocks {
            error!(
                required,
                capacity = self.max_blocks,
                "block allocator table too small for buffer"
            );
            return Err(AllocatorError::TooManyFragments {
                required,
                capacity: self.max_blocks,
            });
        }
        let runs = self.boundary_runs();

        let mut table = self.table.lock().unwrap();
        if table.shutting_down {
            return Err(AllocatorError::ShuttingDown);
        }
        table.load(&runs);
        self.freed.notify_all();
        drop(table);

        debug!(
            base = self.buffer_base,
            size = self.buffer_size,
            runs = runs.len(),
            "block allocator reset"
        );
        Ok(())
    }

    /// Run `attempt` under the lock until it yields a value, sleeping on the
    /// free-event between attempts unless `non_blocking`.
    fn wait_for<T>(
        &self,
        non_blocking: bool,
        mut attempt: impl FnMut(&mut Table) -> Option<T>,
    ) -> Result<T> {
        let mut table = self.table.lock().unwrap();
        if table.shutting_down {
            return Err(AllocatorError::ShuttingDown);
        }
        table.calls_in_flight += 1;

        let result = loop {
            if table.shutting_down {
                break Err(AllocatorError::ShuttingDown);
            }
            if let Some(value) = attempt(&mut *table) {
                break Ok(value);
            }
            if non_blocking {
                break Err(AllocatorError::OutOfSpace);
            }
            stats::BLOCK_POOL_WAITS.add(1);
            trace!("block allocator waiting for free-event");
            table = self.freed.wait(table).unwrap();
        };

        table.calls_in_flight -= 1;
        if table.shutting_down && table.calls_in_flight == 0 {
            self.drained.notify_all();
        }
        result
    }

    /// First-fit allocation of `size` bytes, rounded up to the segment size.
    ///
    /// The grant is carved from the front of the first free block large
    /// enough. Without `non_blocking` the call sleeps until a `free` makes
    /// room or [`shutdown`](Self::shutdown) starts; wrap it yourself if you
    /// need a timeout.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::ZeroSize`] for `size == 0`.
    /// - [`AllocatorError::OutOfSpace`] if nothing fits and `non_blocking`, or
    ///   if no run could ever hold the request.
    /// - [`AllocatorError::ShuttingDown`] if shutdown starts before a grant.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn allocate(&self, size: usize, non_blocking: bool) -> Result<usize> {
        let size = self.round_up(size)?;
        if size > self.largest_run {
            if !non_blocking {
                warn!(size, largest_run = self.largest_run, "allocation can never be satisfied");
            }
            return Err(AllocatorError::OutOfSpace);
        }

        let offset = self.wait_for(non_blocking, |table| {
            let index = table.first_fit(size)?;
            Some(table.carve(index, size))
        })?;

        stats::BLOCK_POOL_GRANTED.add(size);
        trace!(offset, size, "block allocated");
        Ok(offset)
    }

    /// Hand out the whole of the largest free block, provided it holds at
    /// least `min_size` bytes. Returns `(offset, size)`; `size` may be far
    /// more than `min_size`.
    ///
    /// Blocking, non-blocking and shutdown behave as in
    /// [`allocate`](Self::allocate). `min_size == 0` accepts any block.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::OutOfSpace`] if the largest block is too small and
    ///   `non_blocking`, or if no run could ever hold `min_size`.
    /// - [`AllocatorError::ShuttingDown`] if shutdown starts before a grant.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn allocate_largest(&self, min_size: usize, non_blocking: bool) -> Result<(usize, usize)> {
        let min_size = min_size
            .checked_next_multiple_of(self.segment_size)
            .ok_or(AllocatorError::OutOfSpace)?;
        if min_size > self.largest_run {
            if !non_blocking {
                warn!(min_size, largest_run = self.largest_run, "allocation can never be satisfied");
            }
            return Err(AllocatorError::OutOfSpace);
        }

        let (offset, size) = self.wait_for(non_blocking, |table| {
            let index = table.largest()?;
            (table.blocks[index].size >= min_size).then(|| table.take(index))
        })?;

        stats::BLOCK_POOL_GRANTED.add(size);
        trace!(offset, size, "largest block allocated");
        Ok((offset, size))
    }

    /// Grow a held region in place by absorbing the free block that touches
    /// it. Returns the new `(offset, size)`; the offset only moves when
    /// extending downwards. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::NoMemory`] if the growth edge sits on a 64 MiB
    ///   boundary or on the edge of the buffer.
    /// - [`AllocatorError::OutOfSpace`] if no free block touches the edge.
    /// - [`AllocatorError::ZeroSize`] / [`AllocatorError::OutOfRange`] for a
    ///   malformed region.
    /// - [`AllocatorError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn extend(&self, offset: usize, size: usize, upwards: bool) -> Result<(usize, usize)> {
        let size = self.round_up(size)?;
        if !self.contains(offset, size) {
            return Err(AllocatorError::OutOfRange { offset, size });
        }

        let end = offset + size;
        let blocked = if upwards {
            end >= self.buffer_end() || self.on_boundary(end)
        } else {
            offset == self.buffer_base || self.on_boundary(offset)
        };
        if blocked {
            return Err(AllocatorError::NoMemory);
        }

        let mut table = self.table.lock().unwrap();
        if table.shutting_down {
            return Err(AllocatorError::ShuttingDown);
        }
        let index = table
            .live()
            .find(|(_, b)| if upwards { b.base == end } else { b.end() == offset })
            .map(|(i, _)| i)
            .ok_or(AllocatorError::OutOfSpace)?;
        let (base, grown) = table.take(index);
        drop(table);

        stats::BLOCK_POOL_GRANTED.add(grown);
        let extended = if upwards {
            (offset, size + grown)
        } else {
            (base, size + grown)
        };
        trace!(offset = extended.0, size = extended.1, upwards, "block extended");
        Ok(extended)
    }

    /// Return a region to the allocator, merging it with every free
    /// neighbour that shares its 64 MiB window, and wake blocked allocators.
    ///
    /// Accepted during shutdown so callers can hand memory back while
    /// draining.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::TableFull`] if nothing merged and no slot is
    ///   free. The range is lost to the allocator until the next `reset`.
    /// - [`AllocatorError::ZeroSize`] / [`AllocatorError::OutOfRange`] for a
    ///   malformed region.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn free(&self, offset: usize, size: usize) -> Result<()> {
        let size = self.round_up(size)?;
        if !self.contains(offset, size) {
            return Err(AllocatorError::OutOfRange { offset, size });
        }
        debug_assert!(
            offset % self.segment_size == 0,
            "free of {offset:#x} is not segment aligned"
        );
        debug_assert!(
            self.same_window(offset, offset + size),
            "free of {offset:#x}+{size:#x} straddles a 64 MiB boundary"
        );

        let mut table = self.table.lock().unwrap();
        let (mut start, mut len) = (offset, size);
        let mut vacant = None;

        for i in 0..table.high_water {
            let block = table.blocks[i];
            if !block.in_use {
                vacant.get_or_insert(i);
                continue;
            }
            debug_assert!(
                block.end() <= offset || block.base >= offset + size,
                "free of {offset:#x}+{size:#x} overlaps free block {:#x}+{:#x}",
                block.base,
                block.size
            );

            let merged = if block.end() == start && self.same_window(block.base, start + len) {
                Some((block.base, block.size + len))
            } else if start + len == block.base && self.same_window(start, block.end()) {
                Some((start, len + block.size))
            } else {
                None
            };
            if let Some((s, l)) = merged {
                start = s;
                len = l;
                table.blocks[i] = Block::default();
                vacant.get_or_insert(i);
            }
        }

        let slot = match vacant {
            Some(slot) => slot,
            None if table.high_water < self.max_blocks => table.high_water,
            None => {
                drop(table);
                stats::BLOCK_POOL_LEAKED.add(size);
                error!(
                    offset,
                    size,
                    capacity = self.max_blocks,
                    "block allocator table full, freed range leaked"
                );
                return Err(AllocatorError::TableFull { offset, size });
            }
        };

        table.blocks[slot] = Block {
            base: start,
            size: len,
            in_use: true,
        };
        table.high_water = table.high_water.max(slot + 1);
        table.trim_high_water();
        self.freed.notify_all();
        drop(table);

        stats::BLOCK_POOL_GRANTED.sub(size);
        trace!(offset, size, merged_base = start, merged_size = len, "block freed");
        Ok(())
    }

    /// Give back the tail of a held region, keeping its first `new_size`
    /// bytes (rounded up to the segment size). Returns the size kept.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::OutOfRange`] if `new_size` exceeds `size` or the
    ///   region is outside the buffer.
    /// - Anything [`free`](Self::free) returns for the tail.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn shrink(&self, offset: usize, size: usize, new_size: usize) -> Result<usize> {
        let size = self.round_up(size)?;
        if !self.contains(offset, size) {
            return Err(AllocatorError::OutOfRange { offset, size });
        }
        let new_size = new_size
            .checked_next_multiple_of(self.segment_size)
            .filter(|&n| n <= size)
            .ok_or(AllocatorError::OutOfRange {
                offset,
                size: new_size,
            })?;

        if new_size < size {
            self.free(offset + new_size, size - new_size)?;
        }
        Ok(new_size)
    }

    /// Size of the largest free block, or 0 if none.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn largest_free(&self) -> usize {
        let table = self.table.lock().unwrap();
        table.largest().map_or(0, |i| table.blocks[i].size)
    }

    /// Sum of all free block sizes.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.table.lock().unwrap().live().map(|(_, b)| b.size).sum()
    }

    /// Number of live entries in the free-block table.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.table.lock().unwrap().live().count()
    }

    /// Copy of the free runs, in table order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        self.table
            .lock()
            .unwrap()
            .live()
            .map(|(_, b)| FreeBlock {
                base: b.base,
                size: b.size,
            })
            .collect()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.table.lock().unwrap().shutting_down
    }

    /// Refuse new allocations, release every blocked waiter with
    /// [`AllocatorError::ShuttingDown`], and wait until all in-flight
    /// allocation calls have left. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn shutdown(&self) {
        let mut table = self.table.lock().unwrap();
        if !table.shutting_down {
            table.shutting_down = true;
            self.freed.notify_all();
            debug!(
                base = self.buffer_base,
                in_flight = table.calls_in_flight,
                "block allocator shutting down"
            );
        }
        while table.calls_in_flight > 0 {
            table = self.drained.wait(table).unwrap();
        }
    }

    #[cfg(test)]
    pub(crate) fn calls_in_flight(&self) -> usize {
        self.table.lock().unwrap().calls_in_flight
    }

    /// Assert the table invariants: disjoint in-buffer runs, no boundary
    /// straddling, maximal coalescing, and `high_water` covering every live
    /// slot.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let table = self.table.lock().unwrap();

        if let Some(last) = table.blocks.iter().rposition(|b| b.in_use) {
            assert!(table.high_water > last, "high_water {} misses slot {last}", table.high_water);
        }

        let mut runs: Vec<Block> = table.live().map(|(_, b)| *b).collect();
        runs.sort_by_key(|b| b.base);
        for b in &runs {
            assert!(b.size > 0);
            assert_eq!(b.size % self.segment_size, 0);
            assert!(self.contains(b.base, b.size), "run {b:?} outside buffer");
            assert!(self.same_window(b.base, b.end()), "run {b:?} straddles a boundary");
        }
        for pair in runs.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            assert!(lo.end() <= hi.base, "runs {lo:?} and {hi:?} overlap");
            assert!(
                lo.end() != hi.base || !self.same_window(lo.base, hi.end()),
                "runs {lo:?} and {hi:?} should have been merged"
            );
        }
    }
}

impl Drop for BlockAllocator {
    // `&mut self` means no call can be in flight; `shutdown` is only needed
    // while the allocator is shared.
    fn drop(&mut self) {
        stats::BLOCK_POOL_MANAGED.sub(self.buffer_size);
    }
}
