#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, AtomicU64};

use super::descriptor::{RegionDescriptor, CACHE_LINE};

/// Size of the header page holding the control block.
pub const HEADER_PAGE: u64 = 4096;
/// Offset of the first pool byte.
pub const DATA_OFFSET: u64 = HEADER_PAGE;
/// Number of root slots.
pub const ROOT_SLOTS: usize = 8;
/// Number of power-of-two size classes, starting at 16 bytes.
pub const SIZE_CLASSES: usize = 48;
/// Number of barrier slots.
pub const BARRIER_SLOTS: usize = 32;

/// Pool bookkeeping, one cache line.
#[repr(C, align(64))]
pub struct PoolControl {
    /// Spin-lock word guarding the pool.
    pub lock: AtomicU32,
    _pad: u32,
    /// Next never-used byte.
    pub bump: AtomicU64,
    /// One past the last pool byte.
    pub end: AtomicU64,
    /// Bytes held by live blocks.
    pub in_use: AtomicU64,
    /// Blocks handed out.
    pub allocations: AtomicU64,
    /// Blocks returned.
    pub frees: AtomicU64,
}

/// Well-known object offsets, one cache line.
#[repr(C, align(64))]
pub struct RootTable {
    /// Offsets; zero means unset.
    pub slots: [AtomicU64; ROOT_SLOTS],
}

/// Free-list heads, one per size class.
#[repr(C, align(64))]
pub struct FreeLists {
    /// Offset of the first free block of each class; zero means empty.
    pub heads: [AtomicU64; SIZE_CLASSES],
}

/// One barrier, alone on its cache line.
#[repr(C, align(64))]
pub struct BarrierSlot {
    /// Zero until signalled.
    pub state: AtomicU64,
}

/// Everything stored in the header page.
#[repr(C)]
pub struct ControlBlock {
    /// Region descriptor.
    pub descriptor: RegionDescriptor,
    /// Pool bookkeeping.
    pub pool: PoolControl,
    /// Root table.
    pub roots: RootTable,
    /// Size-class free lists.
    pub free_lists: FreeLists,
    _gap: [u8; 384],
    /// Barrier slots.
    pub barriers: [BarrierSlot; BARRIER_SLOTS],
}

/// Byte offset of the pool control line.
pub const POOL_OFFSET: u64 = std::mem::offset_of!(ControlBlock, pool) as u64;
/// Byte offset of the root table.
pub const ROOTS_OFFSET: u64 = std::mem::offset_of!(ControlBlock, roots) as u64;
/// Byte offset of the free-list heads.
pub const FREE_LISTS_OFFSET: u64 = std::mem::offset_of!(ControlBlock, free_lists) as u64;
/// Byte offset of barrier slot 0.
pub const BARRIERS_OFFSET: u64 = std::mem::offset_of!(ControlBlock, barriers) as u64;
/// Byte offset of the clock line.
pub const CLOCK_OFFSET: u64 = CACHE_LINE as u64;

const _: () = {
    assert!(POOL_OFFSET == 128);
    assert!(ROOTS_OFFSET == 192);
    assert!(FREE_LISTS_OFFSET == 256);
    assert!(std::mem::size_of::<FreeLists>() == 384);
    assert!(BARRIERS_OFFSET == 1024);
    assert!(std::mem::size_of::<BarrierSlot>() == CACHE_LINE);
    assert!(std::mem::size_of::<ControlBlock>() <= HEADER_PAGE as usize);
};

/// Offset of barrier slot `index`.
pub const fn barrier_offset(index: usize) -> u64 {
    BARRIERS_OFFSET + (index * CACHE_LINE) as u64
}

/// Offset of the free-list line holding `class`.
pub const fn free_list_offset(class: usize) -> u64 {
    FREE_LISTS_OFFSET + (class * 8) as u64
}
