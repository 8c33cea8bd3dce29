// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{ResourceGroupAllocator, ResourceGroupAllocatorCreateInfo, ResourceGroupError};
use crate::device::{Device, DeviceOwned};
use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};
use thread_local::ThreadLocal;

/// One [`ResourceGroupAllocator`] per rendering thread, created lazily.
///
/// The allocators never see each other: each thread only ever touches its own, so no
/// synchronization happens on the allocation path.
///
/// Once a thread has exited, its allocator is handed to the next thread that asks for one, so
/// that its pools aren't lost. The new thread starts from an unbound allocator: the unflushed
/// frame of the exited thread is dropped, and the allocator must be [`reset`] before use.
///
/// [`reset`]: ResourceGroupAllocator::reset
#[derive(Debug)]
pub struct ThreadLocalAllocators {
    device: Arc<Device>,
    create_info: ResourceGroupAllocatorCreateInfo,
    allocators: ThreadLocal<OwnedAllocator>,
    count: AtomicUsize,
}

#[derive(Debug)]
struct OwnedAllocator {
    owner: Cell<ThreadId>,
    allocator: RefCell<ResourceGroupAllocator>,
}

impl ThreadLocalAllocators {
    /// Creates a new `ThreadLocalAllocators`. Every allocator will be created with
    /// `create_info`.
    pub fn new(
        device: Arc<Device>,
        create_info: ResourceGroupAllocatorCreateInfo,
    ) -> ThreadLocalAllocators {
        ThreadLocalAllocators {
            device,
            create_info,
            allocators: ThreadLocal::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Calls `f` with the calling thread's allocator, creating it on first use, or taking over
    /// the allocator of an exited thread.
    ///
    /// # Panics
    ///
    /// - Panics if called from within `f` on the same thread.
    pub fn with<R>(&self, f: impl FnOnce(&mut ResourceGroupAllocator) -> R) -> R {
        let current = thread::current().id();
        let slot = self.allocators.get_or(|| {
            let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("created resource group allocator #{} for {:?}", count, current);

            OwnedAllocator {
                owner: Cell::new(current),
                allocator: RefCell::new(ResourceGroupAllocator::new(
                    self.device.clone(),
                    self.create_info.clone(),
                )),
            }
        });
        let mut allocator = slot.allocator.borrow_mut();

        let previous = slot.owner.replace(current);
        if previous != current {
            log::debug!(
                "{:?} took over the resource group allocator of {:?}",
                current,
                previous,
            );
            allocator.abandon_frame();
        }

        f(&mut allocator)
    }

    /// Flushes the allocators of every thread. Stops at the first error.
    ///
    /// Taking `&mut self` guarantees that no thread is using its allocator.
    pub fn flush_all(&mut self) -> Result<(), ResourceGroupError> {
        for slot in self.allocators.iter_mut() {
            slot.allocator.get_mut().flush()?;
        }

        Ok(())
    }

    /// Returns the number of allocators created so far.
    ///
    /// Allocators of exited threads are reused, so this is the largest number of threads that
    /// held an allocator at the same time.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceOwned for ThreadLocalAllocators {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{mock::Upload, BackendHandle, CommandTarget},
        descriptor_set::{
            ConstantBufferInfo, DescriptorClass, DescriptorSlot, ResourceGroupLayout,
        },
        resource_group::AllocationKind,
    };
    use std::{collections::HashSet, sync::Barrier};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn shareable() {
        assert_send_sync::<ThreadLocalAllocators>();
    }

    #[test]
    fn one_allocator_per_thread() {
        let (device, backend) = mock_device!();
        let mut allocators = ThreadLocalAllocators::new(device, Default::default());
        let layout = ResourceGroupLayout::new(
            [DescriptorSlot::new(DescriptorClass::ConstantBuffer)],
            Some(ConstantBufferInfo {
                size: 64,
                slot: 0,
                shared: false,
            }),
        );

        // Keep every thread alive until all of them have their allocator.
        let barrier = Barrier::new(4);

        thread::scope(|scope| {
            for raw in 1..=4 {
                let allocators = &allocators;
                let layout = &layout;
                let barrier = &barrier;

                scope.spawn(move || {
                    let target = CommandTarget::new(BackendHandle::new(raw).unwrap());

                    for _ in 0..3 {
                        allocators.with(|allocator| {
                            allocator.reset(target).unwrap();
                            let handle = allocator.allocate_resource_group();
                            allocator
                                .prepare_resource_group(layout, AllocationKind::UsedOnce, handle)
                                .unwrap();
                            allocator.write_constants(handle, &[raw; 8]).unwrap();
                        });
                    }

                    barrier.wait();
                });
            }
        });

        assert_eq!(allocators.len(), 4);

        // Two resets per thread flushed two frames, the last frame is still mapped.
        assert_eq!(backend.uploads().len(), 8);
        allocators.flush_all().unwrap();

        let uploads = backend.uploads();
        assert_eq!(uploads.len(), 12);

        let targets: HashSet<_> = uploads
            .iter()
            .map(|upload| match upload {
                Upload::Unmap { target, .. } => *target,
                other => panic!("unexpected upload {:?}", other),
            })
            .collect();
        assert_eq!(targets.len(), 4);

        // Each thread reused its single buffer pool across frames.
        let buffers: HashSet<_> = uploads.iter().map(Upload::buffer).collect();
        assert_eq!(buffers.len(), 4);
        assert_eq!(backend.buffers_created(), 4);
    }

    #[test]
    fn exited_thread_leaves_nothing_behind() {
        let (device, backend) = mock_device!();
        let allocators = ThreadLocalAllocators::new(device, Default::default());
        let layout = ResourceGroupLayout::new(
            [DescriptorSlot::new(DescriptorClass::ConstantBuffer)],
            Some(ConstantBufferInfo {
                size: 16,
                slot: 0,
                shared: false,
            }),
        );
        let exited = CommandTarget::new(BackendHandle::new(1).unwrap());
        let current = CommandTarget::new(BackendHandle::new(2).unwrap());

        thread::scope(|scope| {
            scope.spawn(|| {
                allocators.with(|allocator| {
                    allocator.reset(exited).unwrap();
                    let handle = allocator.allocate_resource_group();
                    allocator
                        .prepare_resource_group(&layout, AllocationKind::UsedOnce, handle)
                        .unwrap();
                    allocator.write_constants(handle, &[1u32; 4]).unwrap();
                });
            });
        });

        // Whether this thread took over the exited thread's allocator or got a new one, it
        // starts unbound, and the unflushed frame doesn't end up in its target.
        thread::scope(|scope| {
            scope.spawn(|| {
                allocators.with(|allocator| {
                    assert_eq!(allocator.command_target(), None);
                    assert_eq!(allocator.allocated_resource_groups(), 0);

                    allocator.reset(current).unwrap();
                    let handle = allocator.allocate_resource_group();
                    allocator
                        .prepare_resource_group(&layout, AllocationKind::UsedOnce, handle)
                        .unwrap();
                    allocator.write_constants(handle, &[2u32; 4]).unwrap();
                    allocator.flush().unwrap();
                });
            });
        });

        let uploads = backend.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(matches!(
            &uploads[0],
            Upload::Unmap { target, data, .. }
                if *target == current && data.as_slice() == bytemuck::bytes_of(&[2u32; 4])
        ));
    }

    #[test]
    fn same_thread_same_allocator() {
        let (device, _) = mock_device!();
        let allocators = ThreadLocalAllocators::new(device, Default::default());

        let first = allocators.with(|allocator| {
            allocator.allocate_resource_group();
            allocator.allocated_resource_groups()
        });
        let second = allocators.with(|allocator| {
            allocator.allocate_resource_group();
            allocator.allocated_resource_groups()
        });

        assert_eq!((first, second), (1, 2));
        assert_eq!(allocators.len(), 1);
    }
}
