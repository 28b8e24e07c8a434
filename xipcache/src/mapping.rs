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

//! Consumer mappings of cached extents.
//!
//! A consumer maps a window of a file and then reads and writes it directly, without going through a
//! request. Each live mapping keeps a soft page table. A page not yet present faults: the fault resolves
//! the page against the block table of the file and never allocates. Writes through a mapping set the
//! dirty bit of the page, which eviction harvests before it writes the extent back.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use xipcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::model::Metrics,
};

use crate::{
    file::{BlockEntry, BlockId, CacheFile, CacheFileId, FileState},
    memory::CacheMemory,
    request::ConsumerId,
    statistics::Statistics,
};

/// Identifies one mapping: a consumer's view of one extent of one cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle {
    /// The mapped cache file.
    pub file: CacheFileId,
    /// Start of the mapped extent.
    pub extent: u64,
    /// The mapping consumer.
    pub consumer: ConsumerId,
}

/// Capability to query the dirty bit of a mapped page.
pub trait DirtyQuery: Send + Sync + 'static {
    /// Dirty bit of the `page`-th page of the mapping.
    ///
    /// `None` if the mapping or the page cannot be resolved. Such pages are skipped.
    fn query_dirty(&self, handle: MappingHandle, page: usize) -> Option<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Pte {
    block: Option<BlockId>,
    dirty: bool,
}

#[derive(Debug)]
struct PageTable {
    valid: bool,
    ptes: Vec<Pte>,
}

#[derive(Debug)]
struct View {
    table: Mutex<PageTable>,
}

/// In-process page tables of every live mapping.
#[derive(Debug, Default)]
pub struct SoftPageTables {
    views: Mutex<HashMap<MappingHandle, Arc<View>>>,
}

impl SoftPageTables {
    fn get(&self, handle: &MappingHandle) -> Option<Arc<View>> {
        self.views.lock().get(handle).cloned()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.views.lock().len()
    }

    /// Whether no mapping is live.
    pub fn is_empty(&self) -> bool {
        self.views.lock().is_empty()
    }
}

impl DirtyQuery for SoftPageTables {
    fn query_dirty(&self, handle: MappingHandle, page: usize) -> Option<bool> {
        let view = self.get(&handle)?;
        let table = view.table.lock();
        if !table.valid {
            return None;
        }
        table.ptes.get(page).map(|pte| pte.dirty)
    }
}

/// Establishes and tears down consumer mappings.
///
/// Callers hold the per-file lock of the mapped file for every operation here. The mapping table and the
/// page table locks nest inside it.
#[derive(Debug)]
pub struct MappingManager {
    tables: SoftPageTables,
    block_size: u64,
    memory: Arc<CacheMemory>,
    statistics: Arc<Statistics>,
    metrics: Arc<Metrics>,
}

impl MappingManager {
    /// Create a manager over the cache memory.
    pub fn new(memory: Arc<CacheMemory>, statistics: Arc<Statistics>, metrics: Arc<Metrics>) -> Self {
        let block_size = memory.block_size() as u64;
        Self {
            tables: SoftPageTables::default(),
            block_size,
            memory,
            statistics,
            metrics,
        }
    }

    /// The page tables, usable as a [`DirtyQuery`].
    pub fn tables(&self) -> &SoftPageTables {
        &self.tables
    }

    /// Create, or extend, the consumer's view of the extent starting at `extent` to `len` bytes.
    ///
    /// Returns the view and whether it was newly created.
    pub fn map(&self, file: &Arc<CacheFile>, extent: u64, consumer: ConsumerId, len: u64) -> (MappedView, bool) {
        let handle = MappingHandle {
            file: file.id(),
            extent,
            consumer,
        };
        let pages = (len / self.block_size) as usize;

        let mut views = self.tables.views.lock();
        let (view, newly) = match views.get(&handle) {
            Some(view) => (view.clone(), false),
            None => {
                let view = Arc::new(View {
                    table: Mutex::new(PageTable {
                        valid: true,
                        ptes: vec![],
                    }),
                });
                views.insert(handle, view.clone());
                (view, true)
            }
        };
        drop(views);

        {
            let mut table = view.table.lock();
            if table.ptes.len() < pages {
                table.ptes.resize(pages, Pte::default());
            }
        }

        tracing::trace!(file = %handle.file, extent, %consumer, len, newly, "[mapping]: map");

        let view = MappedView {
            handle,
            len: pages as u64 * self.block_size,
            view,
            file: Arc::downgrade(file),
            memory: Arc::downgrade(&self.memory),
            block_size: self.block_size,
            statistics: self.statistics.clone(),
            metrics: self.metrics.clone(),
        };
        (view, newly)
    }

    /// Install every allocated page below the tracked file size into the view's page table.
    ///
    /// Returns the pages installed.
    pub fn prefault(&self, view: &MappedView, state: &FileState, size: u64) -> usize {
        let first = view.handle.extent / self.block_size;
        let mut table = view.view.table.lock();
        if !table.valid {
            return 0;
        }
        let mut installed = 0;
        for (index, pte) in table.ptes.iter_mut().enumerate() {
            let page = first + index as u64;
            if pte.block.is_some() || page * self.block_size >= size {
                continue;
            }
            if let Some(block) = state.block(page) {
                pte.block = Some(block);
                installed += 1;
            }
        }
        installed
    }

    /// Per-page OR of the dirty bits of every mapping of the extent.
    ///
    /// Only queries; no dirty bit is cleared.
    pub fn dirty_page_array(
        &self,
        file: CacheFileId,
        extent: u64,
        consumers: impl IntoIterator<Item = ConsumerId>,
        page_count: usize,
        query: &dyn DirtyQuery,
    ) -> Vec<bool> {
        let mut dirty = vec![false; page_count];
        for consumer in consumers {
            let handle = MappingHandle { file, extent, consumer };
            for (page, bit) in dirty.iter_mut().enumerate() {
                if query.query_dirty(handle, page) == Some(true) {
                    *bit = true;
                }
            }
        }
        dirty
    }

    /// Tear down every mapping of the extent starting at `extent` and drop its regions.
    ///
    /// Dirty bits still held by the page tables are folded into the block table. Returns the mappings
    /// torn down.
    pub fn unmap_extent(&self, file: CacheFileId, state: &mut FileState, extent: u64) -> usize {
        let consumers = match state.extents.get(extent) {
            Some(e) => e.regions.iter().copied().collect::<Vec<_>>(),
            None => return 0,
        };
        for consumer in &consumers {
            let handle = MappingHandle {
                file,
                extent,
                consumer: *consumer,
            };
            self.teardown(handle, &mut state.blocks);
            state.extents.remove_region(extent, *consumer);
        }
        consumers.len()
    }

    /// Tear down every mapping the consumer holds on the file, keeping their dirty data in the block table.
    pub fn unmap_consumer(&self, file: CacheFileId, state: &mut FileState, consumer: ConsumerId) -> usize {
        let extents = state
            .extents
            .iter()
            .filter(|e| e.regions.contains(&consumer))
            .map(|e| e.offset)
            .collect::<Vec<_>>();
        for extent in &extents {
            self.teardown(MappingHandle { file, extent: *extent, consumer }, &mut state.blocks);
            state.extents.remove_region(*extent, consumer);
        }
        extents.len()
    }

    fn teardown(&self, handle: MappingHandle, blocks: &mut BTreeMap<u64, BlockEntry>) {
        let Some(view) = self.tables.views.lock().remove(&handle) else {
            return;
        };
        let first = handle.extent / self.block_size;
        let mut table = view.table.lock();
        table.valid = false;
        let mut folded = 0;
        for (index, pte) in table.ptes.drain(..).enumerate() {
            if !pte.dirty {
                continue;
            }
            if let Some(entry) = blocks.get_mut(&(first + index as u64)) {
                entry.dirty = true;
                folded += 1;
            }
        }
        tracing::trace!(file = %handle.file, extent = handle.extent, consumer = %handle.consumer, folded, "[mapping]: unmap");
    }
}

/// A consumer's mapping of a cached window.
///
/// The view does not own the cache file or the cache memory. Once the device tears the mapping down,
/// every access fails with [`ErrorKind::Fault`].
#[derive(Debug, Clone)]
pub struct MappedView {
    handle: MappingHandle,
    len: u64,
    view: Arc<View>,
    file: Weak<CacheFile>,
    memory: Weak<CacheMemory>,
    block_size: u64,
    statistics: Arc<Statistics>,
    metrics: Arc<Metrics>,
}

impl MappedView {
    /// The mapping handle.
    pub fn handle(&self) -> MappingHandle {
        self.handle
    }

    /// Logical file offset the view starts at.
    pub fn offset(&self) -> u64 {
        self.handle.extent
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is still established.
    pub fn is_valid(&self) -> bool {
        self.view.table.lock().valid
    }

    /// Read `buf.len()` bytes at `offset` bytes into the view.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        self.access(offset, len, false, |memory, block, in_block, range| {
            memory.read(block, in_block, &mut buf[range]);
        })?;
        Ok(len)
    }

    /// Write `buf` at `offset` bytes into the view, dirtying the touched pages.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.access(offset, buf.len(), true, |memory, block, in_block, range| {
            memory.write(block, in_block, &buf[range]);
        })?;
        Ok(buf.len())
    }

    fn access<F>(&self, offset: u64, len: usize, write: bool, mut copy: F) -> Result<()>
    where
        F: FnMut(&CacheMemory, BlockId, usize, std::ops::Range<usize>),
    {
        if offset.checked_add(len as u64).is_none_or(|end| end > self.len) {
            return Err(Error::invalid_request("access beyond the mapping")
                .with_context("offset", offset)
                .with_context("len", len)
                .with_context("view", self.len));
        }
        let memory = self
            .memory
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::Closed, "cache device detached"))?;

        let bs = self.block_size as usize;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let index = (pos / self.block_size) as usize;
            let in_block = (pos % self.block_size) as usize;
            let n = (bs - in_block).min(len - done);

            let mut table = self.view.table.lock();
            if !table.valid {
                drop(table);
                return Err(self.fault(pos, "access through a torn down mapping"));
            }
            let block = match table.ptes.get(index).and_then(|pte| pte.block) {
                Some(block) => block,
                None => {
                    drop(table);
                    let (guard, block) = self.fault_in(index, pos)?;
                    table = guard;
                    block
                }
            };

            copy(&*memory, block, in_block, done..done + n);
            if write {
                table.ptes[index].dirty = true;
            }
            drop(table);

            done += n;
        }
        Ok(())
    }

    /// Resolve the page against the block table and install it.
    ///
    /// The page table lock is released before the file lock is taken and retaken under it, so the order
    /// stays file before page table.
    fn fault_in(&self, index: usize, pos: u64) -> Result<(MutexGuard<'_, PageTable>, BlockId)> {
        let file = self
            .file
            .upgrade()
            .ok_or_else(|| self.fault(pos, "cache file evicted"))?;
        let state = file.lock();

        let page = self.handle.extent / self.block_size + index as u64;
        if page * self.block_size >= file.size() {
            return Err(self
                .fault(pos, "page beyond the end of the file")
                .with_context("size", file.size()));
        }
        let block = state
            .block(page)
            .ok_or_else(|| self.fault(pos, "page has no cache block"))?;

        let mut table = self.view.table.lock();
        drop(state);
        if !table.valid {
            drop(table);
            return Err(self.fault(pos, "access through a torn down mapping"));
        }
        table.ptes[index].block = Some(block);
        tracing::trace!(file = %self.handle.file, page, block, "[mapping]: fault in");
        Ok((table, block))
    }

    fn fault(&self, pos: u64, message: &'static str) -> Error {
        self.statistics.record_faults(1);
        self.metrics.device_fault.increase(1);
        tracing::debug!(file = %self.handle.file, extent = self.handle.extent, pos, reason = message, "[mapping]: fault");
        Error::fault(self.handle.extent + pos, message)
            .with_context("file", self.handle.file)
            .with_context("consumer", self.handle.consumer)
    }
}
