#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::trace;

use crate::primitives::concurrency::SpinLock;
use crate::region::layout::{FreeLists, PoolControl, DATA_OFFSET, SIZE_CLASSES};
use crate::types::{RegionError, RegionOffset, Result};

/// Smallest block handed out by the pool.
pub const MIN_BLOCK: u64 = 16;
/// Largest alignment the pool can honor.
pub const MAX_ALIGN: u64 = 4096;

/// Pool counters as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Bytes between the data offset and the end of the pool.
    pub capacity: u64,
    /// Bytes consumed by the bump cursor, including alignment gaps.
    pub reserved: u64,
    /// Bytes held by live blocks.
    pub in_use: u64,
    /// Bytes the bump cursor can still hand out.
    pub remaining: u64,
    /// Blocks handed out since creation.
    pub allocations: u64,
    /// Blocks returned since creation.
    pub frees: u64,
}

/// Size class of a request: class index and block size.
pub fn size_class(size: usize, align: usize) -> Result<(usize, u64)> {
    let align = align as u64;
    if align > MAX_ALIGN {
        return Err(RegionError::Alignment(align as usize));
    }
    let wanted = (size as u64).max(align).max(MIN_BLOCK);
    let block = wanted.checked_next_power_of_two().ok_or(RegionError::CapacityExceeded {
        requested: wanted,
        remaining: 0,
    })?;
    let class = (block.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize;
    if class >= SIZE_CLASSES {
        return Err(RegionError::CapacityExceeded {
            requested: block,
            remaining: 0,
        });
    }
    Ok((class, block))
}

fn block_align(block: u64) -> u64 {
    block.min(MAX_ALIGN)
}

/// View of the pool state stored in the region header.
pub(crate) struct Pool<'a> {
    control: &'a PoolControl,
    free: &'a FreeLists,
    base: *mut u8,
}

impl<'a> Pool<'a> {
    /// # Safety
    ///
    /// `base` must be the start of the mapping that holds `control` and
    /// `free`, and the mapping must cover `control.end` bytes.
    pub(crate) unsafe fn new(control: &'a PoolControl, free: &'a FreeLists, base: *mut u8) -> Self {
        Self {
            control,
            free,
            base,
        }
    }

    /// Resets the pool to cover `[DATA_OFFSET, end)`.
    pub(crate) fn format(&self, end: u64) {
        self.control.lock.store(0, Ordering::Relaxed);
        self.control.bump.store(DATA_OFFSET, Ordering::Relaxed);
        self.control.end.store(end, Ordering::Relaxed);
        self.control.in_use.store(0, Ordering::Relaxed);
        self.control.allocations.store(0, Ordering::Relaxed);
        self.control.frees.store(0, Ordering::Relaxed);
        for head in &self.free.heads {
            head.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn lock(&self) -> SpinLock<'a> {
        SpinLock::new(&self.control.lock)
    }

    /// Hands out a block for `size` bytes at `align`. Caller holds the lock.
    pub(crate) fn allocate_locked(&self, size: usize, align: usize) -> Result<RegionOffset> {
        let (class, block) = size_class(size, align)?;
        let head = &self.free.heads[class];
        let reused = head.load(Ordering::Acquire);
        let offset = if reused != 0 {
            let next = self.link(reused).load(Ordering::Acquire);
            head.store(next, Ordering::Release);
            trace!(offset = reused, block, "alloc.pool.reuse");
            reused
        } else {
            let bump = self.control.bump.load(Ordering::Acquire);
            let end = self.control.end.load(Ordering::Acquire);
            let align = block_align(block);
            let start = bump.div_ceil(align) * align;
            match start.checked_add(block) {
                Some(stop) if stop <= end => {
                    self.control.bump.store(stop, Ordering::Release);
                    start
                }
                _ => {
                    return Err(RegionError::CapacityExceeded {
                        requested: block,
                        remaining: end.saturating_sub(bump),
                    })
                }
            }
        };
        self.control.in_use.fetch_add(block, Ordering::AcqRel);
        self.control.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(RegionOffset(offset))
    }

    /// Returns a block to its class list. Caller holds the lock.
    pub(crate) fn deallocate_locked(&self, offset: RegionOffset, size: usize, align: usize) -> Result<()> {
        let (class, block) = size_class(size, align)?;
        let bump = self.control.bump.load(Ordering::Acquire);
        let raw = offset.get();
        if raw < DATA_OFFSET || raw + block > bump || raw % block_align(block) != 0 {
            return Err(RegionError::Invalid("offset is not a live pool block"));
        }
        debug_assert!(!self.on_free_list(class, raw), "block {raw:#x} freed twice");
        let head = &self.free.heads[class];
        self.link(raw).store(head.load(Ordering::Acquire), Ordering::Release);
        head.store(raw, Ordering::Release);
        self.control.in_use.fetch_sub(block, Ordering::AcqRel);
        self.control.frees.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let bump = self.control.bump.load(Ordering::Acquire);
        let end = self.control.end.load(Ordering::Acquire);
        PoolStats {
            capacity: end.saturating_sub(DATA_OFFSET),
            reserved: bump.saturating_sub(DATA_OFFSET),
            in_use: self.control.in_use.load(Ordering::Acquire),
            remaining: end.saturating_sub(bump),
            allocations: self.control.allocations.load(Ordering::Acquire),
            frees: self.control.frees.load(Ordering::Acquire),
        }
    }

    /// First free block of `class`, zero when the list is empty.
    pub(crate) fn free_head(&self, class: usize) -> u64 {
        self.free
            .heads
            .get(class)
            .map_or(0, |head| head.load(Ordering::Acquire))
    }

    /// Walks the free list of `class` looking for `offset`. Stops after as
    /// many steps as there have been frees, so a corrupted list cannot loop.
    fn on_free_list(&self, class: usize, offset: u64) -> bool {
        let bump = self.control.bump.load(Ordering::Acquire);
        let mut cursor = self.free_head(class);
        for _ in 0..=self.control.frees.load(Ordering::Acquire) {
            if cursor == 0 || cursor < DATA_OFFSET || cursor >= bump {
                return false;
            }
            if cursor == offset {
                return true;
            }
            cursor = self.link(cursor).load(Ordering::Acquire);
        }
        false
    }

    /// Next-pointer word at the start of a free block.
    fn link(&self, offset: u64) -> &AtomicU64 {
        // Blocks are at least 16 bytes and 16-aligned inside the mapping.
        unsafe { &*(self.base.add(offset as usize) as *const AtomicU64) }
    }
}
