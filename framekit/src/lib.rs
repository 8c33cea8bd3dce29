// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-frame resource caching and allocation for GPU renderers.
//!
//! framekit sits between a renderer's draw submission and a native graphics backend. It makes the
//! two expensive per-draw operations, creating pipeline objects and creating resource bindings,
//! idempotent under concurrency and cheap to repeat every frame.
//!
//! # Brief summary
//!
//! - A [`Backend`](crate::backend::Backend) is the native graphics API. framekit never talks to a
//!   driver directly, it only calls into this trait.
//!
//! - A [`Device`](crate::device::Device) wraps a backend. It resolves the backend's capabilities
//!   once and owns the [`PipelineCache`](crate::pipeline::PipelineCache) shared by every thread.
//!
//! - A [`PipelineStateDescription`](crate::pipeline::PipelineStateDescription) is a mutable
//!   builder for pipeline state. Resolving it against the pipeline cache returns the one
//!   [`PipelineState`](crate::pipeline::PipelineState) that corresponds to it, constructing it
//!   at most once no matter how many threads ask at the same time.
//!
//! - Each rendering thread owns a
//!   [`ResourceGroupAllocator`](crate::resource_group::ResourceGroupAllocator). It hands out
//!   [`ResourceGroup`](crate::resource_group::ResourceGroup)s, a descriptor set plus a constant
//!   buffer region, from bump-allocated [pools](crate::pool) that are rewound every frame.
//!
//! - An [`UploadCoordinator`](crate::upload::UploadCoordinator) is compiled once per effect. At
//!   submission time it uploads pending constant buffer data, making sure a buffer shared by many
//!   draws is uploaded only once per frame.
//!
//! # Frame protocol
//!
//! Per thread and per frame, calls follow this order:
//!
//! ```plain
//! reset(target) -> { allocate_resource_group, prepare_resource_group, writes }* -> flush -> submit
//! ```
//!
//! Writing to a resource group after `flush` without a new `reset` is a caller error. It is not
//! checked at runtime.

pub use pool::DeviceAlignment;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

#[macro_use]
mod macros;
pub mod backend;
pub mod buffer;
mod cache;
pub mod descriptor_set;
pub mod device;
pub mod pipeline;
pub mod pool;
pub mod resource_group;
pub mod upload;

/// Represents memory size and offset values on a device. Analogous to the Rust `usize` type on
/// the host.
pub type DeviceSize = u64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside framekit. Structures with a field of this type can only
/// be constructed by calling a constructor function or `Default::default()`. The effect is similar
/// to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent update
/// syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

/// Error type returned by most backend calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// There is not enough memory on the host.
    OutOfHostMemory,

    /// There is not enough memory on the device.
    OutOfDeviceMemory,

    /// The backend rejected the object description.
    ///
    /// This is a configuration error: retrying with the same description will fail again.
    Unsupported(String),
}

impl Error for BackendError {}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::OutOfHostMemory => write!(f, "no memory available on the host"),
            Self::OutOfDeviceMemory => write!(f, "no memory available on the graphical device"),
            Self::Unsupported(reason) => {
                write!(f, "the backend does not support this configuration: {}", reason)
            }
        }
    }
}
