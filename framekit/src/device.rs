// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Communication channel with a backend.
//!
//! The [`Device`] is the object every other framekit object is created from. It resolves the
//! capabilities of its [`Backend`] exactly once, at creation, and derives the policies that depend
//! on them. In particular it owns the [`PipelineCache`] that all rendering threads share, with the
//! construction policy matching the backend.
//!
//! ```ignore
//! use framekit::device::{Device, DeviceCreateInfo};
//!
//! let device = Device::new(backend, DeviceCreateInfo::default());
//! let pipeline = device.pipeline_cache().resolve(&description)?;
//! ```

use crate::{
    backend::{Backend, BackendCapabilities},
    macros::impl_id_counter,
    pipeline::{ConstructionMode, PipelineCache, PipelineCacheCreateInfo},
};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    ops::Deref,
    sync::Arc,
};

/// Represents a backend that objects are created on.
pub struct Device {
    id: NonZero<u64>,
    backend: Arc<dyn Backend>,
    capabilities: BackendCapabilities,
    pipeline_cache: PipelineCache,
}

impl Device {
    /// Creates a new `Device`.
    pub fn new(backend: Arc<dyn Backend>, create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo {
            pipeline_cache,
            _ne: _,
        } = create_info;

        let capabilities = backend.capabilities();
        let mode = pipeline_cache
            .construction
            .unwrap_or_else(|| ConstructionMode::from_capabilities(capabilities));

        log::debug!(
            "creating device with {:?}, pipeline construction is {:?}",
            capabilities,
            mode,
        );

        let pipeline_cache =
            PipelineCache::new(backend.clone(), mode.into_policy(), pipeline_cache);

        Arc::new(Device {
            id: Self::next_id(),
            backend,
            capabilities,
            pipeline_cache,
        })
    }

    /// Returns the backend of the device.
    #[inline]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns the capabilities of the backend, as they were when the device was created.
    #[inline]
    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    /// Returns the pipeline cache shared by everything rendering with this device.
    #[inline]
    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(Device);

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// Configuration of the device's pipeline cache.
    ///
    /// The default value is `PipelineCacheCreateInfo::default()`.
    pub pipeline_cache: PipelineCacheCreateInfo,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            pipeline_cache: PipelineCacheCreateInfo::default(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Implemented on objects that belong to a device.
pub trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

impl<T> DeviceOwned for T
where
    T: Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}
