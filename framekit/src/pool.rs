// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bump-allocated pools with frame-granularity reset.
//!
//! Both descriptor storage and constant buffer storage are handed out by the same algorithm. A
//! pool is a fixed-capacity region with a *free start*. Every allocation receives the free start
//! (aligned up) as its offset, and the free start is then *bumped* past it. Allocations are never
//! freed individually, the whole pool is rewound at once with [`Pool::reset`].
//!
//! A [`PoolList`] strings pools of the same capacity together. When the active pool is exhausted,
//! the list advances to the next pool, creating one if none is left from a previous frame. Lists
//! only ever grow: after a short warm-up, a steady-state frame allocates nothing from the backend.
//!
//! # Efficiency
//!
//! Allocation is *O*(1) while the active pool has room, and so is resetting a pool. Resetting a
//! list is *O*(*n*) in the number of pools it owns.

use crate::DeviceSize;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    num::NonZero,
};

/// An alignment, stored as a [`DeviceSize`] that is guaranteed to be a power of two.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZero<DeviceSize>);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZero::<DeviceSize>::MIN);

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        match NonZero::new(alignment) {
            Some(alignment) if alignment.is_power_of_two() => Some(Self(alignment)),
            _ => None,
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.0.trailing_zeros())
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Rounds `val` up to the next multiple of `alignment`.
#[inline]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    let mask = alignment.as_devicesize() - 1;

    (val + mask) & !mask
}

/// The cursor of a single bump-allocated region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BumpCursor {
    capacity: DeviceSize,
    free_start: DeviceSize,
}

impl BumpCursor {
    /// Creates a cursor over an empty region of `capacity` units.
    #[inline]
    pub const fn new(capacity: DeviceSize) -> Self {
        BumpCursor {
            capacity,
            free_start: 0,
        }
    }

    /// Returns the offset of a new allocation of `size` units, or [`None`] if the region doesn't
    /// have enough room left. A failed allocation leaves the cursor untouched.
    #[inline]
    pub fn allocate(&mut self, size: DeviceSize, alignment: DeviceAlignment) -> Option<DeviceSize> {
        // These can't overflow because `free_start` never exceeds `capacity`.
        let offset = align_up(self.free_start, alignment);
        let free_start = offset.checked_add(size)?;

        if free_start > self.capacity {
            return None;
        }

        self.free_start = free_start;

        Some(offset)
    }

    /// Returns whether an allocation of `size` units would succeed in an empty region.
    #[inline]
    pub fn fits_empty(&self, size: DeviceSize) -> bool {
        size <= self.capacity
    }

    /// Resets the free start back to the beginning of the region.
    #[inline]
    pub fn reset(&mut self) {
        self.free_start = 0;
    }

    /// Returns the total capacity of the region.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.capacity
    }

    /// Returns how many units have been handed out since the last reset, including padding.
    #[inline]
    pub fn used(&self) -> DeviceSize {
        self.free_start
    }

    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.capacity - self.free_start
    }
}

/// A fixed-capacity region that is bump-allocated and rewound in bulk.
pub trait Pool {
    /// What an allocation asks for.
    type Request: ?Sized;

    /// What an allocation hands back.
    type Region;

    /// Allocates from the pool, returning [`None`] if the pool doesn't have enough room left.
    fn allocate(&mut self, request: &Self::Request) -> Option<Self::Region>;

    /// Returns whether `request` could be satisfied by this pool if it were empty.
    fn fits_empty(&self, request: &Self::Request) -> bool;

    /// Rewinds the pool to empty. Backing storage is kept for reuse.
    fn reset(&mut self);
}

/// An ordered list of pools of the same capacity, of which one is active.
#[derive(Debug)]
pub struct PoolList<P> {
    pools: Vec<P>,
    active: usize,
}

impl<P> Default for PoolList<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PoolList<P> {
    /// Creates an empty list. No pool is created until the first allocation.
    #[inline]
    pub const fn new() -> Self {
        PoolList {
            pools: Vec::new(),
            active: 0,
        }
    }

    /// Returns the number of pools the list owns.
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns the index of the pool allocations are currently made from.
    #[inline]
    pub fn active(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&P> {
        self.pools.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut P> {
        self.pools.get_mut(index)
    }

    /// Returns the pools that were allocated from since the last reset, the active one last.
    #[inline]
    pub fn touched_mut(&mut self) -> &mut [P] {
        let end = (self.active + 1).min(self.pools.len());

        &mut self.pools[..end]
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, P> {
        self.pools.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, P> {
        self.pools.iter_mut()
    }
}

impl<P: Pool> PoolList<P> {
    /// Allocates `request` from the active pool. If the active pool is exhausted, the list moves
    /// on to the next pool, calling `create` to append a new one if it ran out of pools.
    ///
    /// Returns the index of the pool that satisfied the request along with the region.
    ///
    /// # Panics
    ///
    /// - Panics if `request` doesn't fit in an empty pool. Pool capacities must be chosen larger
    ///   than any single request.
    pub fn allocate<E>(
        &mut self,
        request: &P::Request,
        mut create: impl FnMut() -> Result<P, E>,
    ) -> Result<(usize, P::Region), E> {
        if let Some(pool) = self.pools.get_mut(self.active) {
            if let Some(region) = pool.allocate(request) {
                return Ok((self.active, region));
            }

            self.active += 1;
        }

        loop {
            if self.active == self.pools.len() {
                let pool = create()?;
                self.pools.push(pool);
                log::debug!("pool list grew to {} pools", self.pools.len());
            }

            let pool = &mut self.pools[self.active];

            assert!(
                pool.fits_empty(request),
                "the request is larger than the capacity of a whole pool",
            );

            if let Some(region) = pool.allocate(request) {
                return Ok((self.active, region));
            }

            // Pools past the active one are empty, this only happens if `fits_empty` lied.
            self.active += 1;
        }
    }

    /// Rewinds every pool and makes the first one active again.
    pub fn reset(&mut self) {
        for pool in &mut self.pools {
            pool.reset();
        }

        self.active = 0;
    }
}
