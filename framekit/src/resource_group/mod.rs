// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-draw bundles of a descriptor set and a constant buffer.
//!
//! A [`ResourceGroup`] is everything a draw binds for one [`ResourceGroupLayout`]: a descriptor
//! set, and the region of a constant buffer that holds the layout's parameters, if it has any.
//! Resource groups are handed out by a per-thread [`ResourceGroupAllocator`], which recycles both
//! the groups themselves and the storage behind them every frame.
//!
//! The constant buffer can be allocated in one of two ways, see [`AllocationKind`].
//!
//! [`ResourceGroupLayout`]: crate::descriptor_set::ResourceGroupLayout

pub use self::{
    allocator::{
        ResourceGroupAllocator, ResourceGroupAllocatorCreateInfo, ResourceGroupError,
        ResourceGroupHandle,
    },
    per_thread::ThreadLocalAllocators,
};
use crate::{
    buffer::Buffer,
    descriptor_set::{DescriptorSetRegion, ResourceGroupLayout},
    DeviceSize,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub mod allocator;
mod per_thread;

/// How the constant buffer of a resource group is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// The data changes every draw. It is written straight into a mapped region of the
    /// allocator's active buffer pool, and reaches the backend when the allocator is flushed.
    UsedOnce,

    /// The data is the same for many draws of the frame. It is written into CPU memory owned by
    /// the group and uploaded to a dedicated buffer, at most once per frame, by an
    /// [`UploadCoordinator`](crate::upload::UploadCoordinator).
    UsedMultipleTimes,
}

/// Where the data of a [`ConstantBufferAllocation`] lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConstantData {
    /// The group has no constant buffer.
    #[default]
    None,

    /// The data lives in the mapped memory of the buffer pool at this index of the allocator.
    Mapped { pool: usize },

    /// The data lives in CPU memory owned by the allocation, and is pending upload.
    Staged,
}

/// The constant buffer region of a [`ResourceGroup`].
#[derive(Debug, Default)]
pub struct ConstantBufferAllocation {
    buffer: Option<Arc<Buffer>>,
    offset: DeviceSize,
    size: DeviceSize,
    data: ConstantData,
    uploaded: AtomicBool,

    // Kept across clears, so a group that is prepared with the same layout every frame doesn't
    // reallocate.
    staging: Vec<u8>,
    dedicated: Option<Arc<Buffer>>,
}

impl ConstantBufferAllocation {
    /// Returns the buffer the data is bound from.
    #[inline]
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn data(&self) -> ConstantData {
        self.data
    }

    /// Returns the data waiting to be uploaded, if any.
    #[inline]
    pub fn pending_data(&self) -> Option<&[u8]> {
        match self.data {
            ConstantData::Staged => Some(&self.staging),
            ConstantData::None | ConstantData::Mapped { .. } => None,
        }
    }

    /// Returns whether the data has been uploaded this frame.
    #[inline]
    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    /// Marks the data as uploaded. Returns `true` if this call did so, `false` if it already was.
    ///
    /// This is safe to race from several threads: exactly one of them gets `true`.
    #[inline]
    pub(crate) fn try_mark_uploaded(&self) -> bool {
        self.uploaded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives up a win of [`try_mark_uploaded`](Self::try_mark_uploaded) whose upload failed.
    #[inline]
    pub(crate) fn unmark_uploaded(&self) {
        self.uploaded.store(false, Ordering::Release);
    }

    pub(crate) fn clear(&mut self) {
        self.buffer = None;
        self.offset = 0;
        self.size = 0;
        self.data = ConstantData::None;
        *self.uploaded.get_mut() = false;
    }

    pub(crate) fn set_mapped(
        &mut self,
        buffer: Arc<Buffer>,
        pool: usize,
        offset: DeviceSize,
        size: DeviceSize,
    ) {
        self.buffer = Some(buffer);
        self.offset = offset;
        self.size = size;
        self.data = ConstantData::Mapped { pool };
        *self.uploaded.get_mut() = false;
    }

    pub(crate) fn dedicated_buffer(&self, size: DeviceSize) -> Option<&Arc<Buffer>> {
        self.dedicated.as_ref().filter(|buffer| buffer.size() == size)
    }

    pub(crate) fn set_staged(&mut self, buffer: Arc<Buffer>) {
        let size = buffer.size();

        self.staging.clear();
        self.staging.resize(size as usize, 0);
        self.buffer = Some(buffer.clone());
        self.dedicated = Some(buffer);
        self.offset = 0;
        self.size = size;
        self.data = ConstantData::Staged;
        *self.uploaded.get_mut() = false;
    }

    pub(crate) fn staging_mut(&mut self) -> &mut [u8] {
        &mut self.staging
    }
}

/// A descriptor set and a constant buffer region, bound together for a draw.
///
/// Groups are `Sync`, so that a group shared between many draws can be applied from several
/// threads at once.
#[derive(Debug, Default)]
pub struct ResourceGroup {
    layout: Option<Arc<ResourceGroupLayout>>,
    descriptor_set: Option<DescriptorSetRegion>,
    constant_buffer: ConstantBufferAllocation,
    // The epoch of the allocator that last prepared the group.
    epoch: u64,
}

impl ResourceGroup {
    /// Creates an empty group, to be prepared with
    /// [`ResourceGroupAllocator::prepare_external_group`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the layout the group was last prepared with.
    #[inline]
    pub fn layout(&self) -> Option<&Arc<ResourceGroupLayout>> {
        self.layout.as_ref()
    }

    #[inline]
    pub fn descriptor_set(&self) -> Option<&DescriptorSetRegion> {
        self.descriptor_set.as_ref()
    }

    #[inline]
    pub fn constant_buffer(&self) -> &ConstantBufferAllocation {
        &self.constant_buffer
    }

    /// Returns whether the group has been prepared since it was last cleared.
    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.layout.is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.layout = None;
        self.descriptor_set = None;
        self.constant_buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferUsage;
    use std::thread;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn groups_are_shareable() {
        assert_send_sync::<ResourceGroup>();
    }

    #[test]
    fn upload_flag_is_won_once() {
        let (device, _) = mock_device!();
        let mut allocation = ConstantBufferAllocation::default();
        allocation.set_staged(Buffer::new(device, 64, BufferUsage::CONSTANT_BUFFER).unwrap());

        let winners: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| allocation.try_mark_uploaded() as usize))
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert!(allocation.is_uploaded());

        allocation.clear();
        assert!(!allocation.is_uploaded());
        assert_eq!(allocation.pending_data(), None);
        assert!(allocation.dedicated_buffer(64).is_some());
        assert!(allocation.dedicated_buffer(128).is_none());
    }
}
