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

//! Cross-file eviction.
//!
//! Files are kept in one LRU list guarded by the allocation lock together with the block allocator.
//! Reclaim walks the list from the head, picks a victim extent of the first file that holds blocks, writes
//! it back and frees its blocks.

use std::{sync::Arc, time::Instant};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use itertools::Itertools;
use xipcache_common::{
    error::{Error, ErrorKind, Result},
    strict_assert,
};

use crate::{
    alloc::BlockAllocator,
    device::DeviceInner,
    file::{CacheFile, FileState},
};

intrusive_adapter! { LruAdapter = Arc<CacheFile>: CacheFile { link => LinkedListAtomicLink } }

/// LRU list of cache files, least recently used at the head.
pub struct Lru {
    list: LinkedList<LruAdapter>,
    len: usize,
}

impl std::fmt::Debug for Lru {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lru").field("len", &self.len).finish()
    }
}

impl Default for Lru {
    fn default() -> Self {
        Self {
            list: LinkedList::new(LruAdapter::new()),
            len: 0,
        }
    }
}

impl Lru {
    /// Move the file to the tail, linking it if needed.
    pub fn touch(&mut self, file: &Arc<CacheFile>) {
        if file.link.is_linked() {
            // Safety: a file is only ever linked into the LRU of its own device.
            let file = unsafe { self.list.remove_from_ptr(Arc::as_ptr(file)) };
            self.list.push_back(file);
        } else {
            self.list.push_back(file.clone());
            self.len += 1;
        }
    }

    /// Unlink the file. Returns whether it was linked.
    pub fn remove(&mut self, file: &Arc<CacheFile>) -> bool {
        if !file.link.is_linked() {
            return false;
        }
        // Safety: see `touch`.
        unsafe { self.list.remove_from_ptr(Arc::as_ptr(file)) };
        self.len -= 1;
        true
    }

    /// Move the head to the tail and return it.
    pub fn rotate(&mut self) -> Option<Arc<CacheFile>> {
        let file = self.list.pop_front()?;
        self.list.push_back(file.clone());
        Some(file)
    }

    /// Files from head to tail.
    pub fn files(&self) -> Vec<Arc<CacheFile>> {
        let mut files = Vec::with_capacity(self.len);
        let mut cursor = self.list.front();
        while let Some(file) = cursor.clone_pointer() {
            files.push(file);
            cursor.move_next();
        }
        files
    }

    /// Unlink every file.
    pub fn clear(&mut self) {
        while self.list.pop_front().is_some() {}
        self.len = 0;
    }

    /// Number of linked files.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no file is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// State guarded by the allocation lock.
#[derive(Debug)]
pub struct AllocState {
    /// Free cache blocks.
    pub allocator: BlockAllocator,
    /// Cross-file LRU.
    pub lru: Lru,
}

impl AllocState {
    /// Create the state for a device of `total` blocks.
    pub fn new(total: usize) -> Self {
        Self {
            allocator: BlockAllocator::new(total),
            lru: Lru::default(),
        }
    }
}

impl DeviceInner {
    /// Free blocks until twice `needed` are free, or until reclaim stops making progress.
    ///
    /// Succeeds if at least `needed` blocks are free afterwards.
    pub(crate) fn make_room(
        &self,
        alloc: &mut AllocState,
        requester: Option<&Arc<CacheFile>>,
        needed: usize,
    ) -> Result<()> {
        let mut barren = 0;
        let mut attempts = 0;
        let mut last_error = None;

        while alloc.allocator.free_count() < needed.saturating_mul(2) {
            if attempts >= self.config.max_reclaim_attempts {
                break;
            }
            attempts += 1;

            let freed = match self.reclaim(alloc, requester) {
                Ok(freed) => freed,
                Err(e) => {
                    last_error = Some(e);
                    0
                }
            };
            if freed > 0 {
                barren = 0;
                continue;
            }
            barren += 1;
            if barren >= alloc.lru.len().max(1) {
                break;
            }
        }

        let free = alloc.allocator.free_count();
        tracing::trace!(needed, free, attempts, "[eviction]: make room");
        if free >= needed {
            return Ok(());
        }
        Err(match last_error {
            Some(e) => e,
            None => Error::resource_exhausted(alloc.allocator.total(), free, needed),
        })
    }

    /// Reclaim one extent, or one whole file, from the least recently used file that holds blocks.
    ///
    /// Returns the blocks freed.
    pub(crate) fn reclaim(&self, alloc: &mut AllocState, requester: Option<&Arc<CacheFile>>) -> Result<usize> {
        let now = Instant::now();

        let mut victim = None;
        for _ in 0..alloc.lru.len() {
            let Some(file) = alloc.lru.rotate() else {
                break;
            };
            if file.block_count() > 0 {
                victim = Some(file);
                break;
            }
        }
        let Some(file) = victim else {
            self.record_barren();
            return Ok(0);
        };

        let is_requester = requester.is_some_and(|r| Arc::ptr_eq(r, &file));
        let mut state = file.lock();

        let offset = match state.extents.select_victim() {
            Some(offset) => Some(offset),
            None => {
                // Second chance: clear the referenced bits and retry once.
                state.extents.sweep();
                state.extents.select_victim()
            }
        };

        let freed = match offset {
            Some(offset) => self.evict_extent(alloc, &file, &mut state, offset)?,
            None if !is_requester && state.access.is_empty() => {
                tracing::info!(file = %file.id(), blocks = file.block_count(), "[eviction]: escalate to whole file");
                self.evict_file_locked(alloc, &file, &mut state)?
            }
            None => 0,
        };

        if !is_requester && file.block_count() == 0 && state.access.is_empty() {
            self.drop_record(alloc, &file, &mut state);
        }
        drop(state);

        if freed == 0 {
            self.record_barren();
        }
        self.metrics.evict_duration.record(now.elapsed().as_secs_f64());
        Ok(freed)
    }

    fn record_barren(&self) {
        self.statistics.record_barren_reclaims(1);
        self.metrics.evict_barren.increase(1);
    }

    /// Write back and free the extent starting at `offset`.
    ///
    /// On write-back failure the extent and its blocks are kept and marked active.
    pub(crate) fn evict_extent(
        &self,
        alloc: &mut AllocState,
        file: &Arc<CacheFile>,
        state: &mut FileState,
        offset: u64,
    ) -> Result<usize> {
        let Some(extent) = state.extents.get(offset) else {
            return Ok(0);
        };
        let (start, length) = (extent.offset, extent.length);

        if let Err(e) = self.write_back(file, state, start) {
            state.extents.mark_active(start);
            self.statistics.record_write_back_failures(1);
            tracing::error!(file = %file.id(), offset = start, length, ?e, "[eviction]: write back failed, extent kept");
            return Err(Error::new(ErrorKind::WriteBackFailure, "write back victim extent")
                .with_context("file", file.id())
                .with_context("offset", start)
                .with_source(e));
        }

        let bs = self.block_size();
        let taken = state.take_pages(start / bs..(start + length) / bs);
        let freed = self.free_pages(alloc, file, &taken);
        state.extents.remove(start);

        self.statistics.record_extent_evictions(1);
        self.metrics.evict_extent.increase(1);
        tracing::debug!(file = %file.id(), offset = start, length, freed, "[eviction]: extent reclaimed");
        Ok(freed)
    }

    /// Write back and free every block of the file. The record itself is left to the caller.
    pub(crate) fn evict_file_locked(
        &self,
        alloc: &mut AllocState,
        file: &Arc<CacheFile>,
        state: &mut FileState,
    ) -> Result<usize> {
        let offsets = state.extents.iter().map(|extent| extent.offset).collect_vec();
        let mut freed = 0;
        for offset in offsets {
            freed += self.evict_extent(alloc, file, state, offset)?;
        }

        // Pages outside any extent.
        if !state.blocks.is_empty() {
            tracing::warn!(file = %file.id(), pages = state.blocks.len(), "[eviction]: pages outside any extent");
            self.write_pages(file, state, 0..u64::MAX, &[])?;
            let taken = state.take_pages(0..u64::MAX);
            freed += self.free_pages(alloc, file, &taken);
        }
        strict_assert!(file.block_count() == 0);

        self.statistics.record_file_evictions(1);
        self.metrics.evict_file.increase(1);
        Ok(freed)
    }

    /// Retire the record and remove it from the LRU and the file table.
    ///
    /// Call with the allocation lock and the per-file lock held, after every block was freed.
    pub(crate) fn drop_record(&self, alloc: &mut AllocState, file: &Arc<CacheFile>, state: &mut FileState) {
        for extent in state.extents.iter().map(|extent| extent.offset).collect_vec() {
            self.mapping.unmap_extent(file.id(), state, extent);
        }
        state.extents.clear();
        file.retire();
        alloc.lru.remove(file);

        let mut files = self.files.write();
        if files.get(&file.file()).is_some_and(|f| Arc::ptr_eq(f, file)) {
            files.remove(&file.file());
        }
        self.metrics.device_files.absolute(files.len() as u64);
        drop(files);

        tracing::debug!(file = %file.id(), backing = %file.file(), "[eviction]: cache file dropped");
    }
}
