// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Describes the content of a resource group.
//!
//! A [`ResourceGroupLayout`] is derived once from shader reflection data, when an effect is
//! compiled. It lists the descriptor slots of the group, in binding order, and whether one of them
//! is a constant buffer that framekit allocates along with the descriptor set.

use crate::{macros::impl_id_counter, DeviceSize};
use smallvec::SmallVec;
use std::{num::NonZero, sync::Arc};

/// The kind of resource a descriptor refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorClass {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    Sampler,
}

impl DescriptorClass {
    pub const ALL: [DescriptorClass; 4] = [
        DescriptorClass::ConstantBuffer,
        DescriptorClass::ShaderResource,
        DescriptorClass::UnorderedAccess,
        DescriptorClass::Sampler,
    ];
}

/// A number of descriptors of each [`DescriptorClass`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorCounts {
    pub constant_buffers: u32,
    pub shader_resources: u32,
    pub unordered_accesses: u32,
    pub samplers: u32,
}

impl DescriptorCounts {
    /// The same `count` for every class.
    #[inline]
    pub const fn splat(count: u32) -> Self {
        DescriptorCounts {
            constant_buffers: count,
            shader_resources: count,
            unordered_accesses: count,
            samplers: count,
        }
    }

    #[inline]
    pub fn get(&self, class: DescriptorClass) -> u32 {
        match class {
            DescriptorClass::ConstantBuffer => self.constant_buffers,
            DescriptorClass::ShaderResource => self.shader_resources,
            DescriptorClass::UnorderedAccess => self.unordered_accesses,
            DescriptorClass::Sampler => self.samplers,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, class: DescriptorClass) -> &mut u32 {
        match class {
            DescriptorClass::ConstantBuffer => &mut self.constant_buffers,
            DescriptorClass::ShaderResource => &mut self.shader_resources,
            DescriptorClass::UnorderedAccess => &mut self.unordered_accesses,
            DescriptorClass::Sampler => &mut self.samplers,
        }
    }

    /// Returns whether every count of `self` is at most the matching count of `other`.
    #[inline]
    pub fn fits_in(&self, other: &DescriptorCounts) -> bool {
        DescriptorClass::ALL
            .into_iter()
            .all(|class| self.get(class) <= other.get(class))
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.constant_buffers + self.shader_resources + self.unordered_accesses + self.samplers
    }
}

/// One binding slot of a resource group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub class: DescriptorClass,

    /// Array size of the slot. Must be at least 1.
    pub count: u32,
}

impl DescriptorSlot {
    #[inline]
    pub const fn new(class: DescriptorClass) -> Self {
        DescriptorSlot { class, count: 1 }
    }
}

/// The constant buffer of a resource group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConstantBufferInfo {
    /// Size of the buffer in bytes. Must not be zero.
    pub size: DeviceSize,

    /// Index of the slot the buffer is bound to. It must be a
    /// [`DescriptorClass::ConstantBuffer`] slot.
    pub slot: u32,

    /// Whether the buffer holds data that is identical for every draw binding the group in a
    /// frame, like per-view or per-material parameters. Shared buffers are uploaded once per frame
    /// instead of once per draw.
    pub shared: bool,
}

/// Describes the slots of a resource group.
///
/// Layouts are compared by identity: two layouts created from the same reflection data are still
/// different layouts.
#[derive(Debug)]
pub struct ResourceGroupLayout {
    id: NonZero<u64>,
    slots: SmallVec<[DescriptorSlot; 8]>,
    descriptor_counts: DescriptorCounts,
    constant_buffer: Option<ConstantBufferInfo>,
}

impl ResourceGroupLayout {
    /// Creates a new `ResourceGroupLayout`.
    ///
    /// # Panics
    ///
    /// - Panics if a slot has a `count` of zero.
    /// - Panics if `constant_buffer` has a size of zero, or doesn't refer to a constant buffer
    ///   slot.
    pub fn new(
        slots: impl IntoIterator<Item = DescriptorSlot>,
        constant_buffer: Option<ConstantBufferInfo>,
    ) -> Arc<ResourceGroupLayout> {
        let slots: SmallVec<[DescriptorSlot; 8]> = slots.into_iter().collect();
        let mut descriptor_counts = DescriptorCounts::default();

        for slot in &slots {
            assert!(slot.count != 0, "descriptor slots must hold at least one descriptor");
            *descriptor_counts.get_mut(slot.class) += slot.count;
        }

        if let Some(info) = &constant_buffer {
            assert!(info.size != 0, "a constant buffer can't be empty");
            assert!(
                slots
                    .get(info.slot as usize)
                    .is_some_and(|slot| slot.class == DescriptorClass::ConstantBuffer),
                "the constant buffer must be bound to a constant buffer slot",
            );
        }

        Arc::new(ResourceGroupLayout {
            id: Self::next_id(),
            slots,
            descriptor_counts,
            constant_buffer,
        })
    }

    /// Returns the slots, in binding order.
    #[inline]
    pub fn slots(&self) -> &[DescriptorSlot] {
        &self.slots
    }

    /// Returns how many descriptors of each class a set with this layout needs.
    #[inline]
    pub fn descriptor_counts(&self) -> &DescriptorCounts {
        &self.descriptor_counts
    }

    #[inline]
    pub fn constant_buffer(&self) -> Option<&ConstantBufferInfo> {
        self.constant_buffer.as_ref()
    }

    /// Returns the size of the constant buffer, or 0 if the layout has none.
    #[inline]
    pub fn constant_buffer_size(&self) -> DeviceSize {
        self.constant_buffer.map_or(0, |info| info.size)
    }

    #[inline]
    pub fn constant_buffer_slot(&self) -> Option<u32> {
        self.constant_buffer.map(|info| info.slot)
    }
}

impl_id_counter!(ResourceGroupLayout);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_class() {
        let layout = ResourceGroupLayout::new(
            [
                DescriptorSlot::new(DescriptorClass::ConstantBuffer),
                DescriptorSlot {
                    class: DescriptorClass::ShaderResource,
                    count: 3,
                },
                DescriptorSlot::new(DescriptorClass::Sampler),
            ],
            Some(ConstantBufferInfo {
                size: 192,
                slot: 0,
                shared: false,
            }),
        );

        assert_eq!(
            *layout.descriptor_counts(),
            DescriptorCounts {
                constant_buffers: 1,
                shader_resources: 3,
                unordered_accesses: 0,
                samplers: 1,
            },
        );
        assert_eq!(layout.descriptor_counts().total(), 5);
        assert_eq!(layout.constant_buffer_size(), 192);
        assert_eq!(layout.constant_buffer_slot(), Some(0));
    }

    #[test]
    fn without_constant_buffer() {
        let layout =
            ResourceGroupLayout::new([DescriptorSlot::new(DescriptorClass::Sampler)], None);

        assert_eq!(layout.constant_buffer_size(), 0);
        assert_eq!(layout.constant_buffer_slot(), None);
    }

    #[test]
    fn constant_buffer_slot_mismatch() {
        assert_should_panic!("must be bound to a constant buffer slot", {
            ResourceGroupLayout::new(
                [DescriptorSlot::new(DescriptorClass::Sampler)],
                Some(ConstantBufferInfo {
                    size: 16,
                    slot: 0,
                    shared: false,
                }),
            );
        });
    }

    #[test]
    fn fits_in() {
        let small = DescriptorCounts {
            samplers: 2,
            ..Default::default()
        };

        assert!(small.fits_in(&DescriptorCounts::splat(2)));
        assert!(!DescriptorCounts::splat(3).fits_in(&small));
    }
}
