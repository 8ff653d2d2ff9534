#![allow(unsafe_code)]
//! Allocation out of the shared region.
//!
//! [`RegionAllocator`] is the untyped handle. It implements the
//! `allocator_api2` [`Allocator`] trait, so standard-shaped containers
//! ([`RegionVec`], [`RegionBox`]) can live directly in the region.
//! [`RegionAlloc<T>`] is the typed, rebindable interface used by code that
//! manages element storage by hand.
//!
//! All handles over the same region draw from one pool, so any two of them
//! compare equal, whatever their element type.

/// Size-class pool stored in the region.
pub mod pool;

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use allocator_api2::alloc::{AllocError, Allocator};
use tracing::warn;

use crate::region::Region;
use crate::types::{RegionError, RegionOffset, Result};

/// Vector whose buffer lives in the region.
pub type RegionVec<T> = allocator_api2::vec::Vec<T, RegionAllocator>;
/// Box whose value lives in the region.
pub type RegionBox<T> = allocator_api2::boxed::Box<T, RegionAllocator>;

/// Untyped allocator over a region's pool.
#[derive(Clone)]
pub struct RegionAllocator {
    region: Region,
}

impl RegionAllocator {
    /// Allocator for `region`.
    pub fn new(region: &Region) -> Self {
        Self {
            region: region.clone(),
        }
    }

    /// Region the allocator draws from.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Typed view of this allocator.
    pub fn typed<T>(&self) -> RegionAlloc<T> {
        RegionAlloc {
            inner: self.clone(),
            _marker: PhantomData,
        }
    }

    /// Allocates a block for `layout`. Zero-sized layouts get a dangling,
    /// well-aligned pointer and never touch the pool.
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<[u8]>> {
        if layout.size() == 0 {
            let dangling = NonNull::new(layout.align() as *mut u8)
                .ok_or(RegionError::Invalid("zero alignment"))?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let offset = self.region.allocate_block(layout.size(), layout.align())?;
        let ptr = self.region.ptr_at(offset, layout.size() as u64)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`RegionAllocator::allocate_layout`] on the same
    /// region with the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate_layout(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        if layout.size() == 0 {
            return Ok(());
        }
        let offset = self
            .region
            .offset_of(ptr.as_ptr())
            .ok_or(RegionError::Invalid("pointer does not belong to the region"))?;
        self.region
            .deallocate_block(offset, layout.size(), layout.align())
    }
}

impl PartialEq for RegionAllocator {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for RegionAllocator {}

impl fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("path", &self.region.path())
            .finish()
    }
}

unsafe impl Allocator for RegionAllocator {
    fn allocate(&self, layout: Layout) -> std::result::Result<NonNull<[u8]>, AllocError> {
        self.allocate_layout(layout).map_err(|err| {
            warn!(
                size = layout.size(),
                align = layout.align(),
                error = %err,
                "alloc.region.allocate_failed"
            );
            AllocError
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if let Err(err) = self.deallocate_layout(ptr, layout) {
            warn!(size = layout.size(), error = %err, "alloc.region.deallocate_failed");
        }
    }
}

/// Typed allocation interface over the region pool.
///
/// Carries no per-type state: [`RegionAlloc::rebind`] yields the allocator
/// for another element type over the same pool.
pub struct RegionAlloc<T> {
    inner: RegionAllocator,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RegionAlloc<T> {
    /// Typed allocator for `region`.
    pub fn new(region: &Region) -> Self {
        RegionAllocator::new(region).typed()
    }

    /// Storage for `n` elements, uninitialized.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>> {
        let layout = Layout::array::<T>(n).map_err(|_| RegionError::CapacityExceeded {
            requested: u64::MAX,
            remaining: 0,
        })?;
        Ok(self.inner.allocate_layout(layout)?.cast())
    }

    /// Returns storage for `n` elements.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`RegionAlloc::allocate`] with the same `n` on an
    /// allocator over the same region. Elements are not dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) -> Result<()> {
        let layout =
            Layout::array::<T>(n).map_err(|_| RegionError::Invalid("element count overflows"))?;
        self.inner.deallocate_layout(ptr.cast(), layout)
    }

    /// Moves `value` into uninitialized storage at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and properly aligned.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        ptr.as_ptr().write(value);
    }

    /// Drops the element at `ptr` without releasing its storage.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized element that is not used again.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
    }

    /// Allocates one element and moves `value` into it.
    pub fn emplace(&self, value: T) -> Result<NonNull<T>> {
        let ptr = self.allocate(1)?;
        unsafe { self.construct(ptr, value) };
        Ok(ptr)
    }

    /// The same allocator for element type `U`.
    pub fn rebind<U>(&self) -> RegionAlloc<U> {
        self.inner.typed()
    }

    /// Largest element count a single request could name.
    pub fn max_size(&self) -> usize {
        match std::mem::size_of::<T>() {
            0 => usize::MAX,
            size => isize::MAX as usize / size,
        }
    }

    /// Region offset of `value`, if it lives in the region.
    pub fn address(&self, value: &T) -> Option<RegionOffset> {
        self.inner.region.offset_of(value as *const T)
    }

    /// Untyped handle.
    pub fn untyped(&self) -> &RegionAllocator {
        &self.inner
    }
}

impl<T> Clone for RegionAlloc<T> {
    fn clone(&self) -> Self {
        self.inner.typed()
    }
}

impl<T, U> PartialEq<RegionAlloc<U>> for RegionAlloc<T> {
    fn eq(&self, _other: &RegionAlloc<U>) -> bool {
        true
    }
}

impl<T> Eq for RegionAlloc<T> {}

impl<T> fmt::Debug for RegionAlloc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAlloc")
            .field("element", &std::any::type_name::<T>())
            .field("path", &self.inner.region.path())
            .finish()
    }
}
