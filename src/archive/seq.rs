use std::mem::MaybeUninit;

use allocator_api2::alloc::{Allocator, Global};

use crate::types::{RegionError, Result};

/// Builds an empty value whose own storage comes from `alloc`.
///
/// Loading a sequence of containers creates each element empty before
/// reading into it; this is how an inner vector ends up in the same
/// allocator as the outer one.
pub trait EmptyIn<A> {
    /// Empty value for `alloc`.
    fn empty_in(alloc: &A) -> Self;
}

/// Growable buffer a sequence is loaded into.
pub trait SeqBuf<T> {
    /// Empty element matching the buffer's allocator.
    fn blank(&self) -> T;
    /// Removes every element.
    fn clear_items(&mut self);
    /// Reserves room for `additional` more elements without aborting.
    fn reserve_items(&mut self, additional: usize) -> Result<()>;
    /// Appends one element, growing fallibly.
    fn push_item(&mut self, item: T) -> Result<()>;
    /// Uninitialized slots past the current length.
    fn spare_items(&mut self) -> &mut [MaybeUninit<T>];
    /// Extends the length over `count` spare slots.
    ///
    /// # Safety
    ///
    /// The first `count` spare slots must hold initialized values.
    unsafe fn commit_items(&mut self, count: usize);
}

impl<T: EmptyIn<Global>> SeqBuf<T> for Vec<T> {
    fn blank(&self) -> T {
        T::empty_in(&Global)
    }

    fn clear_items(&mut self) {
        self.clear();
    }

    fn reserve_items(&mut self, additional: usize) -> Result<()> {
        self.try_reserve(additional)
            .map_err(|_| RegionError::ReserveFailed(additional))
    }

    fn push_item(&mut self, item: T) -> Result<()> {
        if self.len() == self.capacity() {
            self.reserve_items(1)?;
        }
        self.push(item);
        Ok(())
    }

    fn spare_items(&mut self) -> &mut [MaybeUninit<T>] {
        self.spare_capacity_mut()
    }

    unsafe fn commit_items(&mut self, count: usize) {
        let len = self.len();
        self.set_len(len + count);
    }
}

impl<T, A> SeqBuf<T> for allocator_api2::vec::Vec<T, A>
where
    T: EmptyIn<A>,
    A: Allocator + Clone,
{
    fn blank(&self) -> T {
        T::empty_in(self.allocator())
    }

    fn clear_items(&mut self) {
        self.clear();
    }

    fn reserve_items(&mut self, additional: usize) -> Result<()> {
        self.try_reserve(additional)
            .map_err(|_| RegionError::ReserveFailed(additional))
    }

    fn push_item(&mut self, item: T) -> Result<()> {
        if self.len() == self.capacity() {
            self.reserve_items(1)?;
        }
        self.push(item);
        Ok(())
    }

    fn spare_items(&mut self) -> &mut [MaybeUninit<T>] {
        self.spare_capacity_mut()
    }

    unsafe fn commit_items(&mut self, count: usize) {
        let len = self.len();
        self.set_len(len + count);
    }
}
