// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The native graphics API that framekit drives.
//!
//! framekit doesn't encode commands or talk to a driver itself. Everything that reaches the GPU
//! goes through the [`Backend`] trait: object creation, descriptor writes, and the two ways of
//! getting constant data into a buffer (renaming and partial update).
//!
//! Backend objects are identified by opaque [`BackendHandle`]s. framekit never interprets a
//! handle, it only passes it back to the backend that created it.

use crate::{
    buffer::BufferUsage,
    descriptor_set::{DescriptorCounts, DescriptorSetRegion, DescriptorWrite},
    pipeline::PipelineStateDescription,
    BackendError, DeviceSize,
};
use std::{fmt::Debug, num::NonZero, ops::Range};

#[cfg(test)]
pub(crate) mod mock;

/// An opaque, non-null handle to an object owned by a [`Backend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BackendHandle(NonZero<u64>);

impl BackendHandle {
    /// Wraps a raw handle value, returning [`None`] if it is null.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZero::new(raw) {
            Some(raw) => Some(BackendHandle(raw)),
            None => None,
        }
    }

    /// Returns the raw handle value.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// The command list that backend commands are currently recorded into.
///
/// A [`ResourceGroupAllocator`](crate::resource_group::ResourceGroupAllocator) is rebound to a new
/// target on every reset, and uploads are recorded into the target passed to
/// [`UploadCoordinator::apply_pending`](crate::upload::UploadCoordinator::apply_pending).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CommandTarget(BackendHandle);

impl CommandTarget {
    #[inline]
    pub const fn new(handle: BackendHandle) -> Self {
        CommandTarget(handle)
    }

    #[inline]
    pub const fn handle(self) -> BackendHandle {
        self.0
    }
}

/// Capabilities of a backend, queried once when a [`Device`](crate::device::Device) is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BackendCapabilities {
    /// Whether a buffer can be remapped for writing with implicit discard-and-replace semantics,
    /// without stalling on draws that still use its previous contents.
    ///
    /// Without it, constant data can only be uploaded with a partial update, and buffers shared
    /// between draws can't be uploaded at all.
    pub resource_renaming: bool,

    /// Whether pipeline objects can safely be created from several threads at once, while other
    /// threads are rendering.
    ///
    /// Without it, the pipeline cache serializes every construction behind one lock.
    pub concurrent_construction: bool,
}

/// A native graphics API.
///
/// Implementations must be usable from any thread. Calls that record commands take the
/// [`CommandTarget`] they should be recorded into; framekit never records into one target from
/// two threads at once.
pub trait Backend: Send + Sync + Debug {
    /// Returns the capabilities of the backend. Called once per device.
    fn capabilities(&self) -> BackendCapabilities;

    /// Compiles a pipeline object.
    ///
    /// Returns [`BackendError::Unsupported`] if the description is rejected.
    fn create_pipeline(
        &self,
        description: &PipelineStateDescription,
    ) -> Result<BackendHandle, BackendError>;

    /// Creates a descriptor pool able to hold `capacity` descriptors of each class, spread over at
    /// most `max_sets` sets.
    fn create_descriptor_pool(
        &self,
        capacity: &DescriptorCounts,
        max_sets: u32,
    ) -> Result<BackendHandle, BackendError>;

    /// Writes descriptors into a set that was suballocated from `pool`.
    fn write_descriptors(
        &self,
        pool: BackendHandle,
        set: &DescriptorSetRegion,
        writes: &[DescriptorWrite],
    ) -> Result<(), BackendError>;

    /// Creates a buffer of `size` bytes.
    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage)
        -> Result<BackendHandle, BackendError>;

    /// Closes the CPU mapping of `buffer`, making the bytes of `written` visible to the device.
    ///
    /// `data` holds the contents of the written range.
    fn unmap_buffer(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        written: Range<DeviceSize>,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Replaces the whole contents of `buffer` through renaming: the previous contents stay
    /// available to draws already recorded, later draws see `data`.
    ///
    /// Only called if [`BackendCapabilities::resource_renaming`] is set.
    fn write_discard(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Records an explicit update of `data.len()` bytes of `buffer`, starting at `offset`.
    fn update_subresource(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Destroys an object created by this backend.
    fn destroy(&self, handle: BackendHandle);
}
