// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{AllocationKind, ConstantData, ResourceGroup};
use crate::{
    backend::CommandTarget,
    buffer::{Buffer, BufferPool, BufferUsage},
    descriptor_set::{DescriptorCounts, DescriptorPool, DescriptorWrite, ResourceGroupLayout},
    device::{Device, DeviceOwned},
    pool::PoolList,
    BackendError, DeviceAlignment, DeviceSize,
};
use bytemuck::Pod;
use std::{
    cell::Cell,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    marker::PhantomData,
    sync::Arc,
};

/// Hands out [`ResourceGroup`]s and the storage behind them, for one rendering thread.
///
/// The allocator owns a list of [`DescriptorPool`]s and a list of [`BufferPool`]s, all
/// bump-allocated, and a list of resource group records. Everything is recycled in bulk by
/// [`reset`], once per frame: pools are rewound, and group records are handed out again from the
/// start of the list with their fields cleared. After a short warm-up, a frame doesn't create
/// anything on the backend and doesn't allocate on the heap.
///
/// A thread can have as many allocators as it likes, but an allocator can't be shared between
/// threads. Use [`ThreadLocalAllocators`] to give every rendering thread its own.
///
/// # Frame protocol
///
/// Within one allocator, calls must follow `reset` → any number of
/// [`allocate_resource_group`]/[`prepare_resource_group`] pairs and writes → [`flush`] →
/// submission, once per frame. Writing after `flush` without a new `reset` leaves the written data
/// undefined; this is the caller's responsibility and is not checked.
///
/// Handles are checked, though: using a [`ResourceGroupHandle`] obtained before the last `reset`
/// returns [`ResourceGroupError::StaleResourceGroup`].
///
/// [`reset`]: Self::reset
/// [`allocate_resource_group`]: Self::allocate_resource_group
/// [`prepare_resource_group`]: Self::prepare_resource_group
/// [`flush`]: Self::flush
/// [`ThreadLocalAllocators`]: super::ThreadLocalAllocators
#[derive(Debug)]
pub struct ResourceGroupAllocator {
    pools: FramePools,
    groups: Vec<ResourceGroup>,
    next_group: usize,
    epoch: u64,
    // Whether anything was allocated since the last reset.
    dirty: bool,
    _not_sync: PhantomData<Cell<()>>,
}

#[derive(Debug)]
struct FramePools {
    device: Arc<Device>,
    descriptor_pools: PoolList<DescriptorPool>,
    buffer_pools: PoolList<BufferPool>,
    command_target: Option<CommandTarget>,
    descriptor_pool_capacity: DescriptorCounts,
    descriptor_pool_max_sets: u32,
    buffer_pool_size: DeviceSize,
    constant_buffer_alignment: DeviceAlignment,
}

impl ResourceGroupAllocator {
    /// Creates a new `ResourceGroupAllocator`.
    ///
    /// No pool is created until the first resource group is prepared. The allocator must be
    /// [`reset`](Self::reset) with a command target before its writes can be flushed.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.descriptor_pool_max_sets` or `create_info.buffer_pool_size` is
    ///   zero.
    pub fn new(
        device: Arc<Device>,
        create_info: ResourceGroupAllocatorCreateInfo,
    ) -> ResourceGroupAllocator {
        let ResourceGroupAllocatorCreateInfo {
            descriptor_pool_capacity,
            descriptor_pool_max_sets,
            buffer_pool_size,
            constant_buffer_alignment,
            _ne: _,
        } = create_info;

        assert!(descriptor_pool_max_sets != 0);
        assert!(buffer_pool_size != 0);

        ResourceGroupAllocator {
            pools: FramePools {
                device,
                descriptor_pools: PoolList::new(),
                buffer_pools: PoolList::new(),
                command_target: None,
                descriptor_pool_capacity,
                descriptor_pool_max_sets,
                buffer_pool_size,
                constant_buffer_alignment,
            },
            groups: Vec::new(),
            next_group: 0,
            epoch: 0,
            dirty: false,
            _not_sync: PhantomData,
        }
    }

    /// Returns a cleared resource group record, reusing the storage of a record handed out
    /// before the last reset if there is one.
    pub fn allocate_resource_group(&mut self) -> ResourceGroupHandle {
        let index = self.next_group;

        if index == self.groups.len() {
            self.groups.push(ResourceGroup::default());
        } else {
            self.groups[index].clear();
        }

        self.next_group += 1;
        self.dirty = true;

        ResourceGroupHandle {
            index: index as u32,
            epoch: self.epoch,
        }
    }

    /// Returns the resource group behind `handle`.
    pub fn group(&self, handle: ResourceGroupHandle) -> Result<&ResourceGroup, ResourceGroupError> {
        let index = self.check(handle)?;

        Ok(&self.groups[index])
    }

    /// Allocates the descriptor set and constant buffer of the group behind `handle`, sized from
    /// `layout`.
    ///
    /// See [`prepare_external_group`](Self::prepare_external_group) for details.
    pub fn prepare_resource_group(
        &mut self,
        layout: &Arc<ResourceGroupLayout>,
        kind: AllocationKind,
        handle: ResourceGroupHandle,
    ) -> Result<(), ResourceGroupError> {
        let index = self.check(handle)?;
        self.dirty = true;

        self.pools.prepare(layout, kind, self.epoch, &mut self.groups[index])
    }

    /// Allocates the descriptor set and constant buffer of `group`, sized from `layout`.
    ///
    /// Use this for groups that outlive a frame, for example one per material, and are prepared
    /// again every frame. Anything `group` was bound to before is released. Until it is prepared
    /// again, using `group` after the next [`reset`](Self::reset) returns
    /// [`ResourceGroupError::StaleResourceGroup`].
    ///
    /// The descriptor set is allocated from the active descriptor pool. If `layout` has a constant
    /// buffer, it is allocated according to `kind`: [`AllocationKind::UsedOnce`] suballocates the
    /// active buffer pool and maps the region right away, [`AllocationKind::UsedMultipleTimes`]
    /// binds a dedicated buffer, kept across frames, and stages the data for upload.
    ///
    /// # Panics
    ///
    /// - Panics if `layout` needs more descriptors, or a larger constant buffer, than an empty
    ///   pool can hold.
    pub fn prepare_external_group(
        &mut self,
        layout: &Arc<ResourceGroupLayout>,
        kind: AllocationKind,
        group: &mut ResourceGroup,
    ) -> Result<(), ResourceGroupError> {
        self.dirty = true;

        self.pools.prepare(layout, kind, self.epoch, group)
    }

    /// Returns the writable constant buffer data of the group behind `handle`, or [`None`] if its
    /// layout has no constant buffer.
    pub fn constants_mut(
        &mut self,
        handle: ResourceGroupHandle,
    ) -> Result<Option<&mut [u8]>, ResourceGroupError> {
        let index = self.check(handle)?;

        Ok(self.pools.constants_mut(&mut self.groups[index]))
    }

    /// Returns the writable constant buffer data of `group`, or [`None`] if it has no constant
    /// buffer.
    pub fn external_constants_mut<'a>(
        &'a mut self,
        group: &'a mut ResourceGroup,
    ) -> Result<Option<&'a mut [u8]>, ResourceGroupError> {
        self.check_group(group)?;

        Ok(self.pools.constants_mut(group))
    }

    /// Writes `value` at the start of the constant buffer of the group behind `handle`.
    ///
    /// # Panics
    ///
    /// - Panics if `T` is larger than the constant buffer.
    pub fn write_constants<T: Pod>(
        &mut self,
        handle: ResourceGroupHandle,
        value: &T,
    ) -> Result<(), ResourceGroupError> {
        let data = self
            .constants_mut(handle)?
            .ok_or(ResourceGroupError::NoConstantBuffer)?;
        let bytes = bytemuck::bytes_of(value);

        assert!(
            bytes.len() <= data.len(),
            "the value is larger than the constant buffer",
        );
        data[..bytes.len()].copy_from_slice(bytes);

        Ok(())
    }

    /// Writes descriptors into the descriptor set of `group`.
    pub fn write_descriptors(
        &self,
        group: &ResourceGroup,
        writes: &[DescriptorWrite],
    ) -> Result<(), ResourceGroupError> {
        let set = group
            .descriptor_set()
            .ok_or(ResourceGroupError::NotPrepared)?;
        self.check_group(group)?;

        self.pools
            .device
            .backend()
            .write_descriptors(set.pool, set, writes)?;

        Ok(())
    }

    /// Starts a new frame recorded into `command_target`.
    ///
    /// Writes that weren't flushed are flushed to the previous target first. Then every pool is
    /// rewound, and every resource group record becomes available again. Handles obtained before
    /// the reset are invalidated. Pools and records are kept for reuse.
    ///
    /// Resetting an allocator that hasn't been used since its last reset only rebinds it.
    pub fn reset(&mut self, command_target: CommandTarget) -> Result<(), ResourceGroupError> {
        self.flush()?;

        self.pools.descriptor_pools.reset();
        self.pools.buffer_pools.reset();
        self.pools.command_target = Some(command_target);
        self.next_group = 0;

        if self.dirty {
            self.epoch += 1;
            self.dirty = false;
        }

        log::trace!(
            "reset resource group allocator to {:?}, epoch {}",
            command_target,
            self.epoch,
        );

        Ok(())
    }

    /// Drops the current frame without flushing it, and unbinds the allocator from its command
    /// target. Handles and groups of the frame are invalidated.
    pub(crate) fn abandon_frame(&mut self) {
        self.pools.descriptor_pools.reset();
        self.pools.buffer_pools.reset();
        self.pools.command_target = None;
        self.next_group = 0;

        if self.dirty {
            self.epoch += 1;
            self.dirty = false;
        }
    }

    /// Closes the mappings of the buffer pools used this frame, making the per-draw constant data
    /// visible to the backend. Call this before submitting the command target.
    ///
    /// Returns [`ResourceGroupError::NotBound`] if data was written before the allocator was ever
    /// reset.
    pub fn flush(&mut self) -> Result<(), ResourceGroupError> {
        let target = self.pools.command_target;

        for pool in self.pools.buffer_pools.touched_mut() {
            if pool.mapped_range().is_none() {
                continue;
            }

            pool.flush(target.ok_or(ResourceGroupError::NotBound)?)?;
        }

        Ok(())
    }

    /// Returns the command target of the current frame.
    #[inline]
    pub fn command_target(&self) -> Option<CommandTarget> {
        self.pools.command_target
    }

    /// Returns how many frames with allocations the allocator has seen.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the number of descriptor pools created so far.
    #[inline]
    pub fn descriptor_pool_count(&self) -> usize {
        self.pools.descriptor_pools.len()
    }

    /// Returns the number of buffer pools created so far.
    #[inline]
    pub fn buffer_pool_count(&self) -> usize {
        self.pools.buffer_pools.len()
    }

    /// Returns the number of resource group records, in use or not.
    #[inline]
    pub fn resource_group_capacity(&self) -> usize {
        self.groups.len()
    }

    /// Returns the number of resource groups allocated since the last reset.
    #[inline]
    pub fn allocated_resource_groups(&self) -> usize {
        self.next_group
    }

    fn check(&self, handle: ResourceGroupHandle) -> Result<usize, ResourceGroupError> {
        let index = handle.index as usize;

        if handle.epoch != self.epoch || index >= self.next_group {
            return Err(ResourceGroupError::StaleResourceGroup);
        }

        Ok(index)
    }

    fn check_group(&self, group: &ResourceGroup) -> Result<(), ResourceGroupError> {
        if group.is_prepared() && group.epoch != self.epoch {
            return Err(ResourceGroupError::StaleResourceGroup);
        }

        Ok(())
    }
}

impl FramePools {
    fn prepare(
        &mut self,
        layout: &Arc<ResourceGroupLayout>,
        kind: AllocationKind,
        epoch: u64,
        group: &mut ResourceGroup,
    ) -> Result<(), ResourceGroupError> {
        group.clear();
        group.epoch = epoch;

        let (_, descriptor_set) = self.descriptor_pools.allocate(layout.descriptor_counts(), || {
            DescriptorPool::new(
                self.device.clone(),
                &self.descriptor_pool_capacity,
                self.descriptor_pool_max_sets,
            )
        })?;
        group.descriptor_set = Some(descriptor_set);

        let size = layout.constant_buffer_size();

        if size != 0 {
            match kind {
                AllocationKind::UsedOnce => {
                    let (pool_index, offset) = self.buffer_pools.allocate(&size, || {
                        BufferPool::new(
                            self.device.clone(),
                            self.buffer_pool_size,
                            self.constant_buffer_alignment,
                        )
                    })?;
                    let pool = &mut self.buffer_pools.touched_mut()[pool_index];
                    pool.map_for_write(offset..offset + size);

                    group
                        .constant_buffer
                        .set_mapped(pool.buffer().clone(), pool_index, offset, size);
                }
                AllocationKind::UsedMultipleTimes => {
                    let buffer = match group.constant_buffer.dedicated_buffer(size) {
                        Some(buffer) => buffer.clone(),
                        None => Buffer::new(
                            self.device.clone(),
                            size,
                            BufferUsage::CONSTANT_BUFFER | BufferUsage::DYNAMIC,
                        )?,
                    };

                    group.constant_buffer.set_staged(buffer);
                }
            }
        }

        group.layout = Some(layout.clone());

        Ok(())
    }

    fn constants_mut<'a>(&'a mut self, group: &'a mut ResourceGroup) -> Option<&'a mut [u8]> {
        let allocation = &mut group.constant_buffer;

        match allocation.data() {
            ConstantData::None => None,
            ConstantData::Mapped { pool } => {
                let range = allocation.offset()..allocation.offset() + allocation.size();

                Some(self.buffer_pools.get_mut(pool)?.map_for_write(range))
            }
            ConstantData::Staged => Some(allocation.staging_mut()),
        }
    }
}

impl DeviceOwned for ResourceGroupAllocator {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.pools.device
    }
}

/// Refers to a resource group handed out by a [`ResourceGroupAllocator`] during one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceGroupHandle {
    index: u32,
    epoch: u64,
}

impl ResourceGroupHandle {
    /// Returns the index of the group record within its allocator.
    ///
    /// Records are reused across frames, so handles from different frames may share an index.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Parameters to create a new [`ResourceGroupAllocator`].
#[derive(Clone, Debug)]
pub struct ResourceGroupAllocatorCreateInfo {
    /// The number of descriptors of each class that one descriptor pool can hold.
    ///
    /// This must be at least as large as what any single layout needs.
    ///
    /// The default value is 256 of each class.
    pub descriptor_pool_capacity: DescriptorCounts,

    /// The number of descriptor sets that one descriptor pool can hold.
    ///
    /// The default value is `256`.
    pub descriptor_pool_max_sets: u32,

    /// The size of one buffer pool in bytes.
    ///
    /// This must be at least as large as the largest constant buffer of any layout.
    ///
    /// The default value is `65536`.
    pub buffer_pool_size: DeviceSize,

    /// The alignment of constant buffer regions within a buffer pool.
    ///
    /// The default value is `256`, the strictest offset alignment common backends require.
    pub constant_buffer_alignment: DeviceAlignment,

    pub _ne: crate::NonExhaustive,
}

impl Default for ResourceGroupAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        ResourceGroupAllocatorCreateInfo {
            descriptor_pool_capacity: DescriptorCounts::splat(256),
            descriptor_pool_max_sets: 256,
            buffer_pool_size: 65536,
            constant_buffer_alignment: DeviceAlignment::new(256).unwrap_or(DeviceAlignment::MIN),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Error that can be returned by a [`ResourceGroupAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceGroupError {
    /// Creating a pool or buffer failed.
    Backend(BackendError),

    /// The handle was obtained, or the group prepared, before the allocator's last reset.
    StaleResourceGroup,

    /// The group hasn't been prepared.
    NotPrepared,

    /// The group's layout has no constant buffer.
    NoConstantBuffer,

    /// Data was written before the allocator was bound to a command target.
    NotBound,
}

impl Error for ResourceGroupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ResourceGroupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}",
            match self {
                Self::Backend(_) => "a backend operation failed",
                Self::StaleResourceGroup =>
                    "the resource group is from before the allocator's last reset",
                Self::NotPrepared => "the resource group hasn't been prepared",
                Self::NoConstantBuffer => "the resource group has no constant buffer",
                Self::NotBound =>
                    "the allocator must be reset with a command target before flushing",
            }
        )
    }
}

impl From<BackendError> for ResourceGroupError {
    #[inline]
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}
