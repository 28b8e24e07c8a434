// Copyright 2025 xipcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cache device handle and its file registry.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use xipcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::model::Metrics,
};

use crate::{
    builder::DeviceConfig,
    eviction::AllocState,
    extent::Extent,
    file::{CacheFile, CacheFileId},
    mapping::MappingManager,
    memory::CacheMemory,
    physical::{PhysicalExtent, PhysicalIndex},
    request::{validate, CacheRequest, CacheResponse, ConsumerId, FileHandle, FileId, Payload},
    statistics::{Statistics, StatisticsSnapshot},
    store::{BackingStore, LayoutExtent},
};

/// Shared state of a cache device.
///
/// Lock order: `alloc` → per-file lock → `files` → mapping table → page table. `physical` and the memory
/// block locks are leaves.
#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub(crate) config: DeviceConfig,
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) memory: Arc<CacheMemory>,
    pub(crate) alloc: Mutex<AllocState>,
    pub(crate) files: RwLock<HashMap<FileId, Arc<CacheFile>>>,
    pub(crate) physical: PhysicalIndex,
    pub(crate) mapping: MappingManager,
    pub(crate) statistics: Arc<Statistics>,
    pub(crate) metrics: Arc<Metrics>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// A cache device attached in front of a backing store.
///
/// Cheap to clone. Every clone refers to the same device.
#[derive(Debug, Clone)]
pub struct CacheDevice {
    inner: Arc<DeviceInner>,
}

impl CacheDevice {
    pub(crate) fn open(config: DeviceConfig, store: Arc<dyn BackingStore>, metrics: Arc<Metrics>) -> Result<Self> {
        let total = config.total_blocks();
        let characteristics = store.characteristics();
        tracing::info!(
            name = %config.name,
            capacity = config.capacity,
            blocks = total,
            block_size = config.block_size,
            mapping_unit = config.mapping_unit,
            max_window = config.max_window,
            store = %characteristics.name,
            max_transfer = characteristics.max_transfer,
            physical_block_size = characteristics.physical_block_size,
            io_min = characteristics.io_min,
            io_opt = characteristics.io_opt,
            "[device]: attach"
        );

        let memory = Arc::new(CacheMemory::new(total, config.block_size));
        let statistics = Arc::new(Statistics::default());
        let mapping = MappingManager::new(memory.clone(), statistics.clone(), metrics.clone());
        metrics.device_free_blocks.absolute(total as u64);

        let inner = DeviceInner {
            config,
            store,
            memory,
            alloc: Mutex::new(AllocState::new(total)),
            files: RwLock::new(HashMap::new()),
            physical: PhysicalIndex::default(),
            mapping,
            statistics,
            metrics,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// The device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Closed, "cache device detached"));
        }
        Ok(())
    }

    fn lookup(&self, file: FileId) -> Option<Arc<CacheFile>> {
        self.inner.files.read().get(&file).cloned()
    }

    fn resolve_or_create(&self, file: FileId) -> Result<Arc<CacheFile>> {
        if let Some(f) = self.lookup(file) {
            return Ok(f);
        }
        let size = self.inner.store.file_len(file)?;

        let mut files = self.inner.files.write();
        let f = files
            .entry(file)
            .or_insert_with(|| {
                let id = CacheFileId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                tracing::debug!(%id, %file, size, "[device]: new cache file");
                Arc::new(CacheFile::new(id, file, size, self.inner.config.mapping_unit))
            })
            .clone();
        self.inner.metrics.device_files.absolute(files.len() as u64);
        Ok(f)
    }

    fn layout(&self, file: FileId, offset: u64) -> Option<LayoutExtent> {
        match self.inner.store.layout(file, offset) {
            Ok(Some(layout)) => Some(layout),
            Ok(None) => {
                tracing::debug!(%file, offset, "[device]: no layout, fall back to buffered");
                None
            }
            Err(e) => {
                let e = Error::new(ErrorKind::LayoutUnavailable, "layout discovery failed")
                    .with_context("file", file)
                    .with_source(e);
                tracing::debug!(?e, "[device]: fall back to buffered");
                None
            }
        }
    }

    /// Serve a read or a write.
    ///
    /// Requests that get a whole mapping window return a [`MappedView`](crate::mapping::MappedView) of it.
    pub fn cache_request(&self, request: CacheRequest, mut payload: Payload<'_>) -> Result<CacheResponse> {
        self.check_open()?;
        validate(&request, &payload, self.inner.config.max_window)?;

        let file = request.handle.file;
        let mut retried = false;
        let (cache_file, transfer) = loop {
            let cache_file = self.resolve_or_create(file)?;
            let layout = self.layout(file, request.offset);
            match self.inner.process_request(&cache_file, &request, &mut payload, layout) {
                Err(e) if e.kind() == ErrorKind::Retired && !retried => {
                    tracing::debug!(%file, "[device]: cache file retired, retry");
                    self.inner.statistics.record_retries(1);
                    retried = true;
                }
                res => break (cache_file, res?),
            }
        };

        let (extent_offset, extent_length) = transfer.extent.unwrap_or_default();
        Ok(CacheResponse {
            cache_file: cache_file.id(),
            transferred: transfer.transferred,
            map_length: transfer.mapping.as_ref().map(|view| view.len()).unwrap_or_default(),
            mapping: transfer.mapping,
            extent_offset,
            extent_length,
            readable: request.handle.readable,
            writable: request.handle.writable,
        })
    }

    /// The cache file of the handle, if the file is cached. No I/O is issued.
    pub fn resolve_cache_file(&self, handle: &FileHandle) -> Result<CacheFileId> {
        self.lookup(handle.file)
            .map(|file| file.id())
            .ok_or_else(|| Error::invalid_request("file is not cached").with_context("file", handle.file))
    }

    /// Tear down every mapping the consumer holds on the file. Dirty data stays in the cache.
    pub fn unmap(&self, handle: &FileHandle, consumer: ConsumerId) -> Result<usize> {
        let Some(file) = self.lookup(handle.file) else {
            return Ok(0);
        };
        let mut state = file.lock();
        let unmapped = self.inner.mapping.unmap_consumer(file.id(), &mut state, consumer);
        tracing::debug!(file = %file.id(), %consumer, unmapped, "[device]: unmap consumer");
        Ok(unmapped)
    }

    /// Flush the cache lines of `[start, end)` of the file. Returns the lines flushed.
    pub fn sync(&self, handle: &FileHandle, start: u64, end: u64) -> Result<usize> {
        self.check_open()?;
        Ok(self
            .lookup(handle.file)
            .map(|file| self.inner.sync_range(&file, start, end))
            .unwrap_or_default())
    }

    /// Write every dirty page of the file back to the store. Returns the pages written.
    pub fn flush(&self, handle: &FileHandle) -> Result<usize> {
        self.check_open()?;
        match self.lookup(handle.file) {
            Some(file) => self.inner.flush_file(&file),
            None => Ok(0),
        }
    }

    /// Write back and drop everything cached for the file. Returns the blocks freed.
    ///
    /// Waits for in-flight requests on the file.
    pub fn evict_file(&self, handle: &FileHandle) -> Result<usize> {
        match self.lookup(handle.file) {
            Some(file) => self.evict(&file),
            None => Ok(0),
        }
    }

    fn evict(&self, file: &Arc<CacheFile>) -> Result<usize> {
        let guard = match file.reserve(0, u64::MAX) {
            Ok(guard) => guard,
            Err(e) if e.kind() == ErrorKind::Retired => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut alloc = self.inner.alloc.lock();
        let mut state = file.lock();
        let freed = self.inner.evict_file_locked(&mut alloc, file, &mut state)?;
        self.inner.drop_record(&mut alloc, file, &mut state);
        drop(state);
        drop(alloc);
        drop(guard);
        tracing::info!(file = %file.id(), freed, "[device]: cache file evicted");
        Ok(freed)
    }

    /// Write everything back, drop every cache file and refuse further requests.
    ///
    /// Every file is attempted. The first failure is returned and its file stays cached.
    pub fn detach(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let files = self.inner.files.read().values().cloned().collect_vec();
        let mut result = Ok(());
        for file in files {
            if let Err(e) = self.evict(&file) {
                tracing::error!(file = %file.id(), ?e, "[device]: write back on detach failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if result.is_ok() {
            self.inner.physical.clear();
        }
        tracing::info!(name = %self.inner.config.name, ok = result.is_ok(), "[device]: detach");
        result
    }

    /// Free cache blocks.
    pub fn free_blocks(&self) -> usize {
        self.inner.alloc.lock().allocator.free_count()
    }

    /// Total cache blocks.
    pub fn total_blocks(&self) -> usize {
        self.inner.config.total_blocks()
    }

    /// Number of cache file records.
    pub fn cache_files(&self) -> usize {
        self.inner.files.read().len()
    }

    /// Snapshot of the device counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// Snapshot of the physical index.
    pub fn physical_extents(&self) -> Vec<PhysicalExtent> {
        self.inner.physical.snapshot()
    }

    /// The physical index entry covering the cache offset.
    pub fn find_physical(&self, physical_offset: u64) -> Option<PhysicalExtent> {
        self.inner.physical.find(physical_offset)
    }

    /// Snapshot of the extents cached for the file.
    pub fn extents(&self, handle: &FileHandle) -> Vec<Extent> {
        self.lookup(handle.file)
            .map(|file| file.lock().extents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cache blocks held by the file.
    pub fn file_blocks(&self, handle: &FileHandle) -> usize {
        self.lookup(handle.file).map(|file| file.block_count()).unwrap_or_default()
    }

    /// Cache lines flushed so far.
    pub fn flushed_lines(&self) -> usize {
        self.inner.memory.flushed_lines()
    }
}
