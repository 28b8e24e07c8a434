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

//! Cache file records.

use std::{
    collections::BTreeMap,
    fmt::Display,
    ops::Range,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use intrusive_collections::LinkedListAtomicLink;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{access::AccessIndex, extent::ExtentIndex, request::FileId};

/// Cache-device block index. The cache offset of a block is `block * block_size`.
pub type BlockId = u32;

/// Internal identifier of a cached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheFileId(pub u64);

impl Display for CacheFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page of a cached file backed by a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// The cache block holding the page.
    pub block: BlockId,
    /// Written through the buffered path (or folded in from a torn-down mapping) and not yet written back.
    pub dirty: bool,
}

/// Mutable per-file state, guarded by the per-file lock.
#[derive(Debug)]
pub struct FileState {
    /// Cached logical ranges.
    pub extents: ExtentIndex,
    /// In-flight byte ranges.
    pub access: AccessIndex,
    /// Page index to cache block.
    pub blocks: BTreeMap<u64, BlockEntry>,
}

impl FileState {
    /// Cache block of the page, if allocated.
    pub fn block(&self, page: u64) -> Option<BlockId> {
        self.blocks.get(&page).map(|entry| entry.block)
    }

    /// Allocated pages in the page range.
    pub fn pages(&self, pages: Range<u64>) -> impl Iterator<Item = (u64, &BlockEntry)> + '_ {
        self.blocks.range(pages).map(|(page, entry)| (*page, entry))
    }

    /// Remove the pages of the range from the block table and return their blocks.
    pub fn take_pages(&mut self, pages: Range<u64>) -> Vec<(u64, BlockEntry)> {
        let mut tail = self.blocks.split_off(&pages.start);
        let mut rest = tail.split_off(&pages.end);
        self.blocks.append(&mut rest);
        tail.into_iter().collect()
    }
}

/// Per-file cache state.
///
/// Created on the first request for a backing file and destroyed when the file is evicted from the cache
/// entirely. The record owns exactly one [`ExtentIndex`] and one [`AccessIndex`], both guarded by the
/// per-file lock. The condition variable is signaled whenever a reservation is released.
#[derive(Debug)]
pub struct CacheFile {
    id: CacheFileId,
    file: FileId,

    size: AtomicU64,
    block_count: AtomicUsize,
    retired: AtomicBool,

    pub(crate) link: LinkedListAtomicLink,

    state: Mutex<FileState>,
    pub(crate) cond: Condvar,
}

impl CacheFile {
    /// Create an empty cache file record for the backing file.
    pub fn new(id: CacheFileId, file: FileId, size: u64, unit: u64) -> Self {
        Self {
            id,
            file,
            size: AtomicU64::new(size),
            block_count: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            link: LinkedListAtomicLink::new(),
            state: Mutex::new(FileState {
                extents: ExtentIndex::new(unit),
                access: AccessIndex::default(),
                blocks: BTreeMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Internal identifier.
    pub fn id(&self) -> CacheFileId {
        self.id
    }

    /// Backing file identifier.
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Tracked file size.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Raise the tracked size to `end` if it is larger.
    pub fn update_size(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }

    /// Cache blocks held by the file.
    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_blocks(&self, count: usize) {
        self.block_count.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn sub_blocks(&self, count: usize) {
        self.block_count.fetch_sub(count, Ordering::AcqRel);
    }

    /// Whether the record was evicted from the cache.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Lock the per-file state.
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test_log::test]
    fn test_take_pages() {
        let file = CacheFile::new(CacheFileId(1), FileId(7), 0, 2 << 20);
        let mut state = file.lock();
        for page in 0..8 {
            state.blocks.insert(
                page,
                BlockEntry {
                    block: page as BlockId + 100,
                    dirty: page % 2 == 0,
                },
            );
        }

        let taken = state.take_pages(2..5);
        assert_eq!(taken.iter().map(|(page, _)| *page).collect_vec(), vec![2, 3, 4]);
        assert_eq!(state.blocks.keys().copied().collect_vec(), vec![0, 1, 5, 6, 7]);
        assert_eq!(state.block(5), Some(105));
        assert_eq!(state.block(3), None);
        assert_eq!(state.pages(0..6).filter(|(_, e)| e.dirty).count(), 1);
    }

    #[test_log::test]
    fn test_size_is_monotonic() {
        let file = CacheFile::new(CacheFileId(1), FileId(7), 10, 2 << 20);
        file.update_size(5);
        assert_eq!(file.size(), 10);
        file.update_size(4096);
        assert_eq!(file.size(), 4096);
    }
}
