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

//! Reverse index from cache device offsets to file ranges.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use xipcache_common::error::{Error, ErrorKind, Result};

use crate::file::CacheFileId;

/// A physical cache range owned by one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalExtent {
    /// Owning file.
    pub file: CacheFileId,
    /// Logical offset of the range in the owning file.
    pub logical_offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Physical cache offset.
    pub physical_offset: u64,
}

impl PhysicalExtent {
    /// Exclusive physical end.
    pub fn physical_end(&self) -> u64 {
        self.physical_offset + self.length
    }

    /// Exclusive logical end.
    pub fn logical_end(&self) -> u64 {
        self.logical_offset + self.length
    }

    fn contains(&self, physical_offset: u64) -> bool {
        self.physical_offset <= physical_offset && physical_offset < self.physical_end()
    }

    /// Whether `next` continues this range both logically and physically for the same file.
    fn absorbs(&self, next: &PhysicalExtent) -> bool {
        self.file == next.file
            && self.physical_end() >= next.physical_offset
            && self.logical_offset + (next.physical_offset - self.physical_offset) == next.logical_offset
    }
}

/// Global index from physical cache ranges back to `(file, logical offset)`.
///
/// Ranges of the same file that are contiguous both logically and physically are merged eagerly, so the
/// index size is bounded by the number of physically discontiguous regions.
#[derive(Debug, Default)]
pub struct PhysicalIndex {
    inner: Mutex<BTreeMap<u64, PhysicalExtent>>,
}

fn lookup(tree: &BTreeMap<u64, PhysicalExtent>, physical_offset: u64) -> Option<PhysicalExtent> {
    tree.range(..=physical_offset)
        .next_back()
        .map(|(_, extent)| *extent)
        .filter(|extent| extent.contains(physical_offset))
}

impl PhysicalIndex {
    /// The entry whose physical range contains `physical_offset`.
    pub fn find(&self, physical_offset: u64) -> Option<PhysicalExtent> {
        lookup(&self.inner.lock(), physical_offset)
    }

    /// Register `[physical_offset, physical_offset + length)` as holding `[logical_offset, ..)` of `file`.
    ///
    /// Fails with [`ErrorKind::ConflictingExtent`] and leaves the index unchanged if the physical range is
    /// already owned by another file or by an inconsistent logical range of the same file.
    pub fn insert(&self, file: CacheFileId, logical_offset: u64, length: u64, physical_offset: u64) -> Result<()> {
        let new = PhysicalExtent {
            file,
            logical_offset,
            length,
            physical_offset,
        };
        let mut tree = self.inner.lock();

        let start = match lookup(&tree, physical_offset) {
            Some(existing) => {
                if existing.file != file
                    || logical_offset.wrapping_sub(existing.logical_offset)
                        != physical_offset - existing.physical_offset
                {
                    return Err(conflict(&existing, &new));
                }
                if new.physical_end() <= existing.physical_end() {
                    return Ok(());
                }
                Self::check_successor(&tree, &existing, &new)?;
                let node = tree.get_mut(&existing.physical_offset).ok_or_else(|| missing(existing.physical_offset))?;
                node.length = new.physical_end() - node.physical_offset;
                existing.physical_offset
            }
            None => {
                Self::check_successor(&tree, &new, &new)?;
                tree.insert(physical_offset, new);

                let prev = tree.range(..physical_offset).next_back().map(|(_, prev)| *prev);
                match prev {
                    Some(mut prev) if prev.absorbs(&new) => {
                        if prev.physical_end() < new.physical_end() {
                            prev.length = new.physical_end() - prev.physical_offset;
                        }
                        tree.remove(&physical_offset);
                        tree.insert(prev.physical_offset, prev);
                        prev.physical_offset
                    }
                    _ => physical_offset,
                }
            }
        };

        Self::merge_successors(&mut tree, start);
        Ok(())
    }

    /// Reject a range that runs into a successor it cannot absorb.
    fn check_successor(tree: &BTreeMap<u64, PhysicalExtent>, base: &PhysicalExtent, new: &PhysicalExtent) -> Result<()> {
        for (_, next) in tree.range(base.physical_offset + 1..new.physical_end()) {
            if !base.absorbs(next) {
                return Err(conflict(next, new));
            }
        }
        Ok(())
    }

    fn merge_successors(tree: &mut BTreeMap<u64, PhysicalExtent>, start: u64) {
        while let Some(mut node) = tree.get(&start).copied() {
            let next = match tree.range(start + 1..).next() {
                Some((_, next)) if node.absorbs(next) => *next,
                _ => break,
            };
            if next.physical_end() > node.physical_end() {
                node.length = next.physical_end() - node.physical_offset;
            }
            tree.remove(&next.physical_offset);
            tree.insert(start, node);
        }
    }

    /// Forget `[physical_offset, physical_offset + length)`, trimming or splitting overlapping entries.
    pub fn remove(&self, physical_offset: u64, length: u64) {
        let end = physical_offset + length;
        let mut tree = self.inner.lock();

        let first = lookup(&tree, physical_offset)
            .map(|extent| extent.physical_offset)
            .unwrap_or(physical_offset);
        let hit: Vec<PhysicalExtent> = tree.range(first..end).map(|(_, extent)| *extent).collect();

        for extent in hit {
            tree.remove(&extent.physical_offset);
            if extent.physical_offset < physical_offset {
                let head = PhysicalExtent {
                    length: physical_offset - extent.physical_offset,
                    ..extent
                };
                tree.insert(head.physical_offset, head);
            }
            if extent.physical_end() > end {
                let cut = end - extent.physical_offset;
                let tail = PhysicalExtent {
                    file: extent.file,
                    logical_offset: extent.logical_offset + cut,
                    length: extent.physical_end() - end,
                    physical_offset: end,
                };
                tree.insert(tail.physical_offset, tail);
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of all entries in physical order.
    pub fn snapshot(&self) -> Vec<PhysicalExtent> {
        self.inner.lock().values().copied().collect()
    }
}

fn conflict(existing: &PhysicalExtent, new: &PhysicalExtent) -> Error {
    tracing::warn!(?existing, ?new, "[physical]: existing physical extent hit but unmatched");
    Error::new(ErrorKind::ConflictingExtent, "physical range already registered")
        .with_context("physical", new.physical_offset)
        .with_context("owner", existing.file)
        .with_context("file", new.file)
}

fn missing(physical_offset: u64) -> Error {
    Error::new(ErrorKind::ConflictingExtent, "physical extent vanished under lock").with_context("physical", physical_offset)
}
