// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{HashedPipelineKey, PipelineStateDescription};
use crate::{
    backend::{Backend, BackendCapabilities, BackendHandle},
    cache::{InFlightCache, InFlightError, Resolution},
    macros::impl_id_counter,
    BackendError,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A compiled pipeline object.
///
/// Pipeline states are shared: the [`PipelineCache`] that created one keeps a reference for its
/// whole lifetime, and every [`resolve`](PipelineCache::resolve) hands out another. The backend
/// object is destroyed when the last reference is dropped, which is never before the cache itself
/// is dropped.
pub struct PipelineState {
    id: NonZero<u64>,
    handle: BackendHandle,
    backend: Arc<dyn Backend>,
    key: HashedPipelineKey,
}

impl PipelineState {
    /// Returns the backend handle of the pipeline.
    #[inline]
    pub fn handle(&self) -> BackendHandle {
        self.handle
    }

    /// Returns the description the pipeline was created from.
    #[inline]
    pub fn description(&self) -> &PipelineStateDescription {
        self.key.description()
    }

    #[inline]
    pub fn key(&self) -> &HashedPipelineKey {
        &self.key
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        self.backend.destroy(self.handle);
    }
}

impl Debug for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("PipelineState")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("hash", &self.key.structural_hash())
            .finish_non_exhaustive()
    }
}

impl_id_counter!(PipelineState);

/// Whether pipeline construction is serialized, decided once per device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConstructionMode {
    /// One construction at a time, across every thread.
    Serialized,
    /// Constructions of different pipelines may run in parallel.
    Concurrent,
}

impl ConstructionMode {
    /// Returns the mode that is safe for a backend with `capabilities`.
    #[inline]
    pub fn from_capabilities(capabilities: BackendCapabilities) -> Self {
        if capabilities.concurrent_construction {
            ConstructionMode::Concurrent
        } else {
            ConstructionMode::Serialized
        }
    }

    pub(crate) fn into_policy(self) -> Box<dyn ConstructionPolicy> {
        match self {
            ConstructionMode::Serialized => Box::new(SerializedConstruction::default()),
            ConstructionMode::Concurrent => Box::new(ConcurrentConstruction),
        }
    }
}

/// Decides what a thread must hold while it constructs a pipeline object.
pub trait ConstructionPolicy: Send + Sync + Debug {
    /// Called before construction. The returned guard is held until construction returns.
    fn enter(&self) -> Option<MutexGuard<'_, ()>>;

    fn mode(&self) -> ConstructionMode;
}

/// Serializes all constructions behind one lock.
#[derive(Debug, Default)]
pub struct SerializedConstruction {
    lock: Mutex<()>,
}

impl ConstructionPolicy for SerializedConstruction {
    #[inline]
    fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        Some(self.lock.lock())
    }

    #[inline]
    fn mode(&self) -> ConstructionMode {
        ConstructionMode::Serialized
    }
}

/// Constructs directly, without any lock.
#[derive(Debug, Default)]
pub struct ConcurrentConstruction;

impl ConstructionPolicy for ConcurrentConstruction {
    #[inline]
    fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        None
    }

    #[inline]
    fn mode(&self) -> ConstructionMode {
        ConstructionMode::Concurrent
    }
}

/// A device-wide, thread-safe map from pipeline descriptions to pipeline objects.
///
/// The cache canonicalizes: as long as the cache lives, descriptions that compare equal resolve to
/// the very same [`PipelineState`], and the backend constructs it exactly once, even if many
/// threads resolve the description for the first time simultaneously.
///
/// # Algorithm
///
/// The description is hashed and looked up under a short lock. A missing entry is marked pending
/// before the lock is released, and the thread that marked it constructs the pipeline. A thread
/// that finds the entry pending polls it, sleeping between polls, until it holds a pipeline or an
/// error. Polling is a last resort: construction is rare compared to lookups, and the poll budget
/// is only ever exhausted if a construction never finishes.
///
/// Whether constructions may overlap is decided by the [`ConstructionPolicy`] the device picked
/// from the capabilities of its backend.
///
/// # Eviction
///
/// Entries are never evicted, the number of pipelines grows with the number of distinct
/// descriptions the application uses. Use [`stats`](Self::stats) to monitor it.
#[derive(Debug)]
pub struct PipelineCache {
    backend: Arc<dyn Backend>,
    entries: InFlightCache<HashedPipelineKey, Arc<PipelineState>, BackendError>,
    policy: Box<dyn ConstructionPolicy>,
    hits: AtomicU64,
    waits: AtomicU64,
    constructions: AtomicU64,
    failures: AtomicU64,
}

impl PipelineCache {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        policy: Box<dyn ConstructionPolicy>,
        create_info: PipelineCacheCreateInfo,
    ) -> Self {
        let PipelineCacheCreateInfo {
            wait_interval,
            wait_retries,
            construction: _,
            _ne: _,
        } = create_info;

        PipelineCache {
            backend,
            entries: InFlightCache::new(wait_interval, wait_retries),
            policy,
            hits: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            constructions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Returns the pipeline object for `description`, constructing it if this is the first time
    /// the description is seen.
    ///
    /// `description` is only cloned when a new entry is inserted, so it can be reused as a
    /// builder for the next draw right away.
    pub fn resolve(
        &self,
        description: &PipelineStateDescription,
    ) -> Result<Arc<PipelineState>, PipelineCacheError> {
        let hash = description.structural_hash();

        let result = self.entries.get_or_try_insert(
            hash,
            description,
            || HashedPipelineKey::with_hash(hash, description.clone()),
            |key| self.construct(key),
        );

        match result {
            Ok((pipeline, resolution)) => {
                let counter = match resolution {
                    Resolution::Hit => &self.hits,
                    Resolution::Waited => &self.waits,
                    Resolution::Constructed => &self.constructions,
                };
                counter.fetch_add(1, Ordering::Relaxed);

                Ok(pipeline)
            }
            Err(InFlightError::Failed(err)) => Err(PipelineCacheError::Construction(err)),
            Err(InFlightError::WaitBudgetExhausted { retries }) => {
                Err(PipelineCacheError::WaitBudgetExhausted { retries })
            }
        }
    }

    /// Returns the pipeline object for `description` if it has already been constructed.
    pub fn get(&self, description: &PipelineStateDescription) -> Option<Arc<PipelineState>> {
        self.entries.get(description.structural_hash(), description)
    }

    fn construct(&self, key: &HashedPipelineKey) -> Result<Arc<PipelineState>, BackendError> {
        let _guard = self.policy.enter();

        match self.backend.create_pipeline(key.description()) {
            Ok(handle) => {
                log::debug!(
                    "constructed pipeline {:?} for description {:#018x}",
                    handle,
                    key.structural_hash(),
                );

                Ok(Arc::new(PipelineState {
                    id: PipelineState::next_id(),
                    handle,
                    backend: self.backend.clone(),
                    key: key.clone(),
                }))
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "failed to construct pipeline for description {:#018x}: {}",
                    key.structural_hash(),
                    err,
                );

                Err(err)
            }
        }
    }

    /// Returns the number of pipeline objects in the cache.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.ready_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the construction mode the cache was created with.
    #[inline]
    pub fn construction_mode(&self) -> ConstructionMode {
        self.policy.mode()
    }

    /// Returns counters describing how the cache has been used so far.
    pub fn stats(&self) -> PipelineCacheStats {
        PipelineCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Usage counters of a [`PipelineCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    /// Number of pipeline objects currently in the cache.
    pub entries: usize,

    /// Resolutions satisfied by an existing entry.
    pub hits: u64,

    /// Resolutions that waited for another thread's construction.
    pub waits: u64,

    /// Successful constructions.
    pub constructions: u64,

    /// Failed constructions.
    pub failures: u64,
}

/// Parameters to create a [`PipelineCache`].
#[derive(Clone, Debug)]
pub struct PipelineCacheCreateInfo {
    /// How long a thread sleeps between two polls of an entry another thread is constructing.
    ///
    /// The default value is 1 millisecond.
    pub wait_interval: Duration,

    /// How many times a thread polls a pending entry before giving up with
    /// [`PipelineCacheError::WaitBudgetExhausted`].
    ///
    /// The default value is `10_000`.
    pub wait_retries: u32,

    /// Overrides the construction mode derived from the backend capabilities.
    ///
    /// The default value is `None`.
    pub construction: Option<ConstructionMode>,

    pub _ne: crate::NonExhaustive,
}

impl Default for PipelineCacheCreateInfo {
    #[inline]
    fn default() -> Self {
        PipelineCacheCreateInfo {
            wait_interval: Duration::from_millis(1),
            wait_retries: 10_000,
            construction: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Error that can be returned when resolving a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineCacheError {
    /// The backend failed to construct the pipeline, either for this call or for the call this
    /// one waited on.
    Construction(BackendError),

    /// Another thread was constructing the pipeline and didn't finish within the wait budget.
    ///
    /// This indicates a bug: a construction that never completes.
    WaitBudgetExhausted { retries: u32 },
}

impl Error for PipelineCacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Construction(err) => Some(err),
            Self::WaitBudgetExhausted { .. } => None,
        }
    }
}

impl Display for PipelineCacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Construction(_) => write!(f, "the backend failed to construct the pipeline"),
            Self::WaitBudgetExhausted { retries } => write!(
                f,
                "the pipeline was still under construction after {} retries",
                retries,
            ),
        }
    }
}
