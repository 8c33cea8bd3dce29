// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{Buffer, BufferUsage};
use crate::{
    backend::CommandTarget,
    device::{Device, DeviceOwned},
    pool::{BumpCursor, Pool},
    BackendError, DeviceAlignment, DeviceSize,
};
use std::{ops::Range, sync::Arc};

/// A constant buffer that per-draw data is bump-allocated from.
///
/// The pool keeps a CPU copy of the whole buffer, which plays the role of its mapped memory.
/// [`map_for_write`] hands out a region of it and remembers which bytes were written. [`flush`]
/// closes the mapping by sending the written bytes to the backend.
///
/// Resetting the pool rewinds the cursor but keeps both the buffer and the CPU copy, so that a
/// pool is created once and then reused every frame.
///
/// [`map_for_write`]: Self::map_for_write
/// [`flush`]: Self::flush
#[derive(Debug)]
pub struct BufferPool {
    buffer: Arc<Buffer>,
    cursor: BumpCursor,
    alignment: DeviceAlignment,
    memory: Box<[u8]>,
    mapped: Option<Range<DeviceSize>>,
}

impl BufferPool {
    /// Creates a new `BufferPool` of `size` bytes, whose allocations are aligned to `alignment`.
    pub fn new(
        device: Arc<Device>,
        size: DeviceSize,
        alignment: DeviceAlignment,
    ) -> Result<BufferPool, BackendError> {
        let host_size = usize::try_from(size).map_err(|_| BackendError::OutOfHostMemory)?;
        let buffer = Buffer::new(
            device,
            size,
            BufferUsage::CONSTANT_BUFFER | BufferUsage::DYNAMIC,
        )?;

        Ok(BufferPool {
            buffer,
            cursor: BumpCursor::new(size),
            alignment,
            memory: vec![0; host_size].into_boxed_slice(),
            mapped: None,
        })
    }

    /// Returns the buffer the pool suballocates.
    #[inline]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    #[inline]
    pub fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Returns the number of bytes handed out since the last reset.
    #[inline]
    pub fn used(&self) -> DeviceSize {
        self.cursor.used()
    }

    /// Returns the range of bytes written since the last flush, if any.
    #[inline]
    pub fn mapped_range(&self) -> Option<Range<DeviceSize>> {
        self.mapped.clone()
    }

    /// Maps `range` for writing and returns the CPU memory backing it.
    ///
    /// # Panics
    ///
    /// - Panics if `range` is out of the bounds of the pool.
    pub fn map_for_write(&mut self, range: Range<DeviceSize>) -> &mut [u8] {
        assert!(
            range.start <= range.end && range.end <= self.cursor.capacity(),
            "the mapped range is out of the bounds of the pool",
        );

        self.mapped = Some(match self.mapped.take() {
            Some(mapped) => mapped.start.min(range.start)..mapped.end.max(range.end),
            None => range.clone(),
        });

        &mut self.memory[range.start as usize..range.end as usize]
    }

    /// Closes the mapping, making everything written since the last flush visible to the
    /// backend. Does nothing if nothing was mapped.
    pub fn flush(&mut self, target: CommandTarget) -> Result<(), BackendError> {
        let Some(range) = self.mapped.clone() else {
            return Ok(());
        };

        self.buffer.device().backend().unmap_buffer(
            target,
            self.buffer.handle(),
            range.clone(),
            &self.memory[range.start as usize..range.end as usize],
        )?;
        self.mapped = None;

        log::trace!(
            "flushed {} bytes of buffer pool {:?}",
            range.end - range.start,
            self.buffer.handle(),
        );

        Ok(())
    }
}

impl Pool for BufferPool {
    type Request = DeviceSize;
    type Region = DeviceSize;

    #[inline]
    fn allocate(&mut self, size: &DeviceSize) -> Option<DeviceSize> {
        self.cursor.allocate(*size, self.alignment)
    }

    #[inline]
    fn fits_empty(&self, size: &DeviceSize) -> bool {
        self.cursor.fits_empty(*size)
    }

    /// Rewinds the pool. Writes that weren't flushed are discarded.
    fn reset(&mut self) {
        if self.mapped.take().is_some() {
            log::warn!(
                "buffer pool {:?} was reset with unflushed writes",
                self.buffer.handle(),
            );
        }

        self.cursor.reset();
    }
}

impl DeviceOwned for BufferPool {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.buffer.device()
    }
}
