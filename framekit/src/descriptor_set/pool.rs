// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{DescriptorClass, DescriptorCounts};
use crate::{
    backend::BackendHandle,
    device::{Device, DeviceOwned},
    pool::{BumpCursor, Pool},
    BackendError, DeviceAlignment, DeviceSize,
};
use std::sync::Arc;

/// A descriptor set suballocated from a [`DescriptorPool`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetRegion {
    /// The pool the set lives in.
    pub pool: BackendHandle,

    /// Index of the set within the pool.
    pub index: u32,

    /// Offset of the set's first descriptor of each class within the pool.
    pub first: DescriptorCounts,

    /// Number of descriptors of each class in the set.
    pub counts: DescriptorCounts,
}

/// A backend descriptor pool, bump-allocated one set at a time.
///
/// Each descriptor class has its own cursor, so a pool is exhausted as soon as one class runs out
/// or the maximum number of sets is reached. Sets are never freed individually, the whole pool is
/// reset at once.
#[derive(Debug)]
pub struct DescriptorPool {
    device: Arc<Device>,
    handle: BackendHandle,
    cursors: [BumpCursor; 4],
    sets: BumpCursor,
}

impl DescriptorPool {
    /// Creates a new `DescriptorPool` on the backend.
    pub fn new(
        device: Arc<Device>,
        capacity: &DescriptorCounts,
        max_sets: u32,
    ) -> Result<DescriptorPool, BackendError> {
        let handle = device
            .backend()
            .create_descriptor_pool(capacity, max_sets)?;

        Ok(DescriptorPool {
            device,
            handle,
            cursors: DescriptorClass::ALL
                .map(|class| BumpCursor::new(DeviceSize::from(capacity.get(class)))),
            sets: BumpCursor::new(DeviceSize::from(max_sets)),
        })
    }

    #[inline]
    pub fn handle(&self) -> BackendHandle {
        self.handle
    }

    /// Returns the number of sets allocated since the last reset.
    #[inline]
    pub fn allocated_sets(&self) -> u32 {
        self.sets.used() as u32
    }

    fn cursor(&self, class: DescriptorClass) -> &BumpCursor {
        &self.cursors[class as usize]
    }
}

impl Pool for DescriptorPool {
    type Request = DescriptorCounts;
    type Region = DescriptorSetRegion;

    fn allocate(&mut self, counts: &DescriptorCounts) -> Option<DescriptorSetRegion> {
        // Check every cursor before bumping any, so that a failed allocation leaves them all
        // untouched.
        let fits = self.sets.free_size() != 0
            && DescriptorClass::ALL.into_iter().all(|class| {
                DeviceSize::from(counts.get(class)) <= self.cursor(class).free_size()
            });

        if !fits {
            return None;
        }

        let index = self.sets.allocate(1, DeviceAlignment::MIN)? as u32;
        let mut first = DescriptorCounts::default();

        for class in DescriptorClass::ALL {
            let offset = self.cursors[class as usize]
                .allocate(DeviceSize::from(counts.get(class)), DeviceAlignment::MIN)?;
            *first.get_mut(class) = offset as u32;
        }

        Some(DescriptorSetRegion {
            pool: self.handle,
            index,
            first,
            counts: *counts,
        })
    }

    fn fits_empty(&self, counts: &DescriptorCounts) -> bool {
        self.sets.capacity() != 0
            && DescriptorClass::ALL
                .into_iter()
                .all(|class| self.cursor(class).fits_empty(DeviceSize::from(counts.get(class))))
    }

    fn reset(&mut self) {
        for cursor in &mut self.cursors {
            cursor.reset();
        }

        self.sets.reset();
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.backend().destroy(self.handle);
    }
}

impl DeviceOwned for DescriptorPool {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}
