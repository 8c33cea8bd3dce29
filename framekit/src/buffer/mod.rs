// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Location in memory that contains data.
//!
//! framekit only deals with constant buffers, which come in two flavors:
//!
//! - A [`BufferPool`] is one large buffer that per-draw constant data is suballocated from, and
//!   that is written through a CPU mapping.
//! - A dedicated [`Buffer`] holds constant data that is shared between many draws. It is written
//!   by an upload, see [`UploadCoordinator`](crate::upload::UploadCoordinator).

pub use self::pool::BufferPool;
use crate::{
    backend::BackendHandle,
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    BackendError, DeviceSize,
};
use std::{num::NonZero, ops::BitOr, sync::Arc};

pub mod pool;

/// Describes how a buffer is going to be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    /// The buffer can be bound as a constant buffer.
    pub const CONSTANT_BUFFER: Self = Self(1 << 0);

    /// The buffer is written by the CPU every frame.
    pub const DYNAMIC: Self = Self(1 << 1);

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A buffer created on the backend, destroyed when dropped.
#[derive(Debug)]
pub struct Buffer {
    id: NonZero<u64>,
    device: Arc<Device>,
    handle: BackendHandle,
    size: DeviceSize,
    usage: BufferUsage,
}

impl Buffer {
    /// Creates a new `Buffer` of `size` bytes.
    pub fn new(
        device: Arc<Device>,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<Arc<Buffer>, BackendError> {
        let handle = device.backend().create_buffer(size, usage)?;

        Ok(Arc::new(Buffer {
            id: Self::next_id(),
            device,
            handle,
            size,
            usage,
        }))
    }

    #[inline]
    pub fn handle(&self) -> BackendHandle {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.backend().destroy(self.handle);
    }
}

impl DeviceOwned for Buffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Buffer);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flags() {
        let usage = BufferUsage::CONSTANT_BUFFER | BufferUsage::DYNAMIC;

        assert!(usage.contains(BufferUsage::CONSTANT_BUFFER));
        assert!(usage.contains(BufferUsage::DYNAMIC));
        assert!(!BufferUsage::CONSTANT_BUFFER.contains(usage));
        assert!(usage.contains(BufferUsage::empty()));
    }

    #[test]
    fn create_and_destroy() {
        let (device, backend) = mock_device!();
        let buffer = Buffer::new(device, 256, BufferUsage::CONSTANT_BUFFER).unwrap();

        assert_eq!(buffer.size(), 256);
        assert_eq!(buffer.usage(), BufferUsage::CONSTANT_BUFFER);
        assert_eq!(backend.buffers_created(), 1);

        drop(buffer);
        assert_eq!(
            backend.destroyed.load(std::sync::atomic::Ordering::SeqCst),
            1,
        );
    }
}
