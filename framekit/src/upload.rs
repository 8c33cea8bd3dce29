// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Uploading staged constant buffer data before draws.
//!
//! Resource groups prepared with [`AllocationKind::UsedMultipleTimes`] keep their constant data
//! in CPU memory until it is applied. How it reaches the GPU depends on the constant buffer slot
//! of the group's layout, which is decided once when an effect is compiled:
//!
//! - A **preallocated** slot has one buffer shared by every draw that uses the group during the
//!   frame. The first draw to apply the group uploads it, every other draw skips the upload. This
//!   is decided with an atomic flag on the group, so draws can be applied from any number of
//!   threads. Uploading into a buffer that may still be in use by the GPU needs resource renaming,
//!   so preallocated slots are only supported on backends that have it.
//! - A **per-instance** slot gets its own storage every time the group is prepared, and is
//!   uploaded every time it is applied. With resource renaming, the whole buffer is replaced,
//!   otherwise the region is updated explicitly.
//!
//! Groups prepared with [`AllocationKind::UsedOnce`] have nothing pending: their data is written
//! straight into mapped memory and reaches the backend when the allocator is flushed.
//!
//! [`AllocationKind::UsedMultipleTimes`]: crate::resource_group::AllocationKind::UsedMultipleTimes
//! [`AllocationKind::UsedOnce`]: crate::resource_group::AllocationKind::UsedOnce

use crate::{
    backend::CommandTarget,
    descriptor_set::ResourceGroupLayout,
    device::{Device, DeviceOwned},
    resource_group::ResourceGroup,
    BackendError, DeviceSize,
};
use foldhash::HashMap;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

/// How the constant buffer slot of a layout is uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotBinding {
    /// The layout has no constant buffer.
    None,

    /// One buffer is shared by all draws using a group, and uploaded once per frame.
    Preallocated { slot: u32, size: DeviceSize },

    /// Every group has its own storage, uploaded every time it is applied.
    PerInstance { slot: u32, size: DeviceSize },
}

impl SlotBinding {
    fn from_layout(layout: &ResourceGroupLayout) -> Self {
        match layout.constant_buffer() {
            None => SlotBinding::None,
            Some(info) if info.shared => SlotBinding::Preallocated {
                slot: info.slot,
                size: info.size,
            },
            Some(info) => SlotBinding::PerInstance {
                slot: info.slot,
                size: info.size,
            },
        }
    }
}

/// Applies the pending constant data of resource groups, for the layouts of one effect.
#[derive(Debug)]
pub struct UploadCoordinator {
    device: Arc<Device>,
    bindings: Vec<SlotBinding>,
    by_layout: HashMap<NonZero<u64>, usize>,
}

impl UploadCoordinator {
    /// Decides the binding of the constant buffer slot of each of `layouts`.
    pub fn compile(device: Arc<Device>, layouts: &[Arc<ResourceGroupLayout>]) -> Self {
        let bindings: Vec<_> = layouts
            .iter()
            .map(|layout| SlotBinding::from_layout(layout))
            .collect();
        let by_layout = layouts
            .iter()
            .enumerate()
            .map(|(index, layout)| (layout.id(), index))
            .collect();

        if !device.capabilities().resource_renaming
            && bindings
                .iter()
                .any(|binding| matches!(binding, SlotBinding::Preallocated { .. }))
        {
            log::warn!(
                "compiled preallocated constant buffers for a backend without resource renaming, \
                applying them will fail",
            );
        }

        UploadCoordinator {
            device,
            bindings,
            by_layout,
        }
    }

    /// Returns the binding of each layout, in the order they were compiled.
    #[inline]
    pub fn bindings(&self) -> &[SlotBinding] {
        &self.bindings
    }

    /// Returns the binding of `layout`, or [`None`] if it wasn't compiled.
    #[inline]
    pub fn binding(&self, layout: &ResourceGroupLayout) -> Option<SlotBinding> {
        self.by_layout
            .get(&layout.id())
            .map(|&index| self.bindings[index])
    }

    /// Uploads the pending constant data of `groups`, recording into `target`.
    ///
    /// This can be called from several threads at once with overlapping `groups`: the data of a
    /// preallocated group is uploaded once per frame however many times the group is applied.
    ///
    /// Stops at the first error; groups before it have been applied.
    pub fn apply_pending(
        &self,
        target: CommandTarget,
        groups: &[&ResourceGroup],
    ) -> Result<UploadStats, UploadError> {
        let renaming = self.device.capabilities().resource_renaming;
        let backend = self.device.backend();
        let mut stats = UploadStats::default();

        for group in groups {
            let allocation = group.constant_buffer();

            let (Some(data), Some(buffer), Some(layout)) =
                (allocation.pending_data(), allocation.buffer(), group.layout())
            else {
                stats.skipped += 1;
                continue;
            };

            match self.binding(layout).ok_or(UploadError::UnknownLayout)? {
                SlotBinding::None => stats.skipped += 1,
                SlotBinding::PerInstance { .. } => {
                    if renaming {
                        backend.write_discard(target, buffer.handle(), data)?;
                    } else {
                        backend.update_subresource(
                            target,
                            buffer.handle(),
                            allocation.offset(),
                            data,
                        )?;
                    }

                    stats.uploaded += 1;
                }
                SlotBinding::Preallocated { .. } => {
                    if !renaming {
                        log::error!(
                            "cannot upload preallocated constant buffer {:?} without resource \
                            renaming",
                            buffer.handle(),
                        );

                        return Err(UploadError::RenamingUnsupported);
                    }

                    if !allocation.try_mark_uploaded() {
                        stats.skipped += 1;
                        continue;
                    }

                    if let Err(err) = backend.write_discard(target, buffer.handle(), data) {
                        allocation.unmark_uploaded();

                        return Err(err.into());
                    }

                    stats.uploaded += 1;
                }
            }
        }

        log::trace!(
            "applied {} constant buffers, skipped {}",
            stats.uploaded,
            stats.skipped,
        );

        Ok(stats)
    }
}

impl DeviceOwned for UploadCoordinator {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

/// What a call to [`UploadCoordinator::apply_pending`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// The number of groups whose data was uploaded.
    pub uploaded: usize,

    /// The number of groups that had nothing to upload, or whose data was already uploaded this
    /// frame.
    pub skipped: usize,
}

/// Error that can be returned by [`UploadCoordinator::apply_pending`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadError {
    /// A preallocated constant buffer was applied on a backend without resource renaming.
    RenamingUnsupported,

    /// A group was prepared with a layout the coordinator wasn't compiled with.
    UnknownLayout,

    /// The backend failed to record the upload.
    Backend(BackendError),
}

impl Error for UploadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for UploadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::RenamingUnsupported => write!(
                f,
                "preallocated constant buffers require a backend that supports resource renaming",
            ),
            Self::UnknownLayout => write!(
                f,
                "the resource group was prepared with a layout the coordinator doesn't know",
            ),
            Self::Backend(_) => write!(f, "the backend failed to record an upload"),
        }
    }
}

impl From<BackendError> for UploadError {
    #[inline]
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}
