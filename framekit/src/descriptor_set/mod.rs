// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bindings between shaders and the resources they read and write.
//!
//! A descriptor set is a group of descriptors, each one referring to a buffer, an image or a
//! sampler, that are bound together for a draw. framekit allocates descriptor sets from
//! [`DescriptorPool`]s, sized from a [`ResourceGroupLayout`], and fills them with
//! [`DescriptorWrite`]s that are forwarded to the backend.

pub use self::{
    layout::{
        ConstantBufferInfo, DescriptorClass, DescriptorCounts, DescriptorSlot,
        ResourceGroupLayout,
    },
    pool::{DescriptorPool, DescriptorSetRegion},
};
use crate::{backend::BackendHandle, DeviceSize};

pub mod layout;
pub mod pool;

/// A write of one descriptor into a set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// The slot of the layout the descriptor belongs to.
    pub slot: u32,

    /// The element within the slot, for slots with a `count` greater than 1.
    pub array_element: u32,

    pub resource: DescriptorResource,
}

impl DescriptorWrite {
    #[inline]
    pub fn new(slot: u32, resource: DescriptorResource) -> Self {
        DescriptorWrite {
            slot,
            array_element: 0,
            resource,
        }
    }
}

/// The resource a descriptor refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BackendHandle,
        offset: DeviceSize,
        size: DeviceSize,
    },
    Image(BackendHandle),
    Sampler(BackendHandle),
}
