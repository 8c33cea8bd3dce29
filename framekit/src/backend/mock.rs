// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A backend that records calls instead of driving a GPU.

use super::{Backend, BackendCapabilities, BackendHandle, CommandTarget};
use crate::{
    buffer::BufferUsage,
    descriptor_set::{DescriptorCounts, DescriptorSetRegion, DescriptorWrite},
    pipeline::PipelineStateDescription,
    BackendError, DeviceSize,
};
use parking_lot::Mutex;
use std::{
    ops::Range,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

/// An upload recorded by [`MockBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Upload {
    Unmap {
        target: CommandTarget,
        buffer: BackendHandle,
        written: Range<DeviceSize>,
        data: Vec<u8>,
    },
    WriteDiscard {
        target: CommandTarget,
        buffer: BackendHandle,
        data: Vec<u8>,
    },
    UpdateSubresource {
        target: CommandTarget,
        buffer: BackendHandle,
        offset: DeviceSize,
        data: Vec<u8>,
    },
}

impl Upload {
    pub(crate) fn buffer(&self) -> BackendHandle {
        match self {
            Self::Unmap { buffer, .. }
            | Self::WriteDiscard { buffer, .. }
            | Self::UpdateSubresource { buffer, .. } => *buffer,
        }
    }
}

pub(crate) type RecordedDescriptorWrite =
    (BackendHandle, DescriptorSetRegion, Vec<DescriptorWrite>);

#[derive(Debug)]
pub(crate) struct MockBackend {
    capabilities: BackendCapabilities,
    next_handle: AtomicU64,
    construction_delay: Mutex<Duration>,
    reject_pipelines: Mutex<bool>,
    pub(crate) pipelines_created: AtomicUsize,
    pub(crate) concurrent_constructions: AtomicUsize,
    pub(crate) max_concurrent_constructions: AtomicUsize,
    pub(crate) descriptor_pools_created: AtomicUsize,
    pub(crate) buffers_created: AtomicUsize,
    pub(crate) destroyed: AtomicUsize,
    pub(crate) descriptor_writes: Mutex<Vec<RecordedDescriptorWrite>>,
    pub(crate) uploads: Mutex<Vec<Upload>>,
}

impl MockBackend {
    pub(crate) fn new(capabilities: BackendCapabilities) -> Self {
        MockBackend {
            capabilities,
            next_handle: AtomicU64::new(1),
            construction_delay: Mutex::new(Duration::ZERO),
            reject_pipelines: Mutex::new(false),
            pipelines_created: AtomicUsize::new(0),
            concurrent_constructions: AtomicUsize::new(0),
            max_concurrent_constructions: AtomicUsize::new(0),
            descriptor_pools_created: AtomicUsize::new(0),
            buffers_created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            descriptor_writes: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Makes every pipeline construction take at least `delay`.
    pub(crate) fn set_construction_delay(&self, delay: Duration) {
        *self.construction_delay.lock() = delay;
    }

    /// Makes every pipeline construction fail.
    pub(crate) fn set_reject_pipelines(&self, reject: bool) {
        *self.reject_pipelines.lock() = reject;
    }

    pub(crate) fn pipelines_created(&self) -> usize {
        self.pipelines_created.load(Ordering::SeqCst)
    }

    pub(crate) fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::SeqCst)
    }

    pub(crate) fn descriptor_pools_created(&self) -> usize {
        self.descriptor_pools_created.load(Ordering::SeqCst)
    }

    pub(crate) fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().clone()
    }

    fn next_handle(&self) -> BackendHandle {
        BackendHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed)).unwrap()
    }
}

impl Backend for MockBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn create_pipeline(
        &self,
        _description: &PipelineStateDescription,
    ) -> Result<BackendHandle, BackendError> {
        let concurrent = self.concurrent_constructions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_constructions
            .fetch_max(concurrent, Ordering::SeqCst);

        let delay = *self.construction_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.pipelines_created.fetch_add(1, Ordering::SeqCst);
        self.concurrent_constructions.fetch_sub(1, Ordering::SeqCst);

        if *self.reject_pipelines.lock() {
            return Err(BackendError::Unsupported("rejected by the mock".to_owned()));
        }

        Ok(self.next_handle())
    }

    fn create_descriptor_pool(
        &self,
        _capacity: &DescriptorCounts,
        _max_sets: u32,
    ) -> Result<BackendHandle, BackendError> {
        self.descriptor_pools_created.fetch_add(1, Ordering::SeqCst);

        Ok(self.next_handle())
    }

    fn write_descriptors(
        &self,
        pool: BackendHandle,
        set: &DescriptorSetRegion,
        writes: &[DescriptorWrite],
    ) -> Result<(), BackendError> {
        self.descriptor_writes
            .lock()
            .push((pool, set.clone(), writes.to_vec()));

        Ok(())
    }

    fn create_buffer(
        &self,
        _size: DeviceSize,
        _usage: BufferUsage,
    ) -> Result<BackendHandle, BackendError> {
        self.buffers_created.fetch_add(1, Ordering::SeqCst);

        Ok(self.next_handle())
    }

    fn unmap_buffer(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        written: Range<DeviceSize>,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.uploads.lock().push(Upload::Unmap {
            target,
            buffer,
            written,
            data: data.to_vec(),
        });

        Ok(())
    }

    fn write_discard(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        data: &[u8],
    ) -> Result<(), BackendError> {
        assert!(self.capabilities.resource_renaming);

        self.uploads.lock().push(Upload::WriteDiscard {
            target,
            buffer,
            data: data.to_vec(),
        });

        Ok(())
    }

    fn update_subresource(
        &self,
        target: CommandTarget,
        buffer: BackendHandle,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.uploads.lock().push(Upload::UpdateSubresource {
            target,
            buffer,
            offset,
            data: data.to_vec(),
        });

        Ok(())
    }

    fn destroy(&self, _handle: BackendHandle) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
