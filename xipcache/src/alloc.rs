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

//! Cache block allocation.

use std::collections::BTreeSet;

use xipcache_common::{
    error::{Error, Result},
    strict_assert,
};

use crate::file::BlockId;

/// Free-block bookkeeping of the cache device.
///
/// The allocator hands out the lowest free block first so that consecutive allocations of a request are
/// physically contiguous whenever the device is not fragmented.
///
/// The free count is the single arbiter of available space. The allocator lives under the device
/// allocation mutex and is never touched without it.
#[derive(Debug)]
pub struct BlockAllocator {
    free: BTreeSet<BlockId>,
    total: usize,
}

impl BlockAllocator {
    /// Create an allocator with every block in `[0, total)` free.
    pub fn new(total: usize) -> Self {
        let free = (0..total as BlockId).collect();
        Self { free, total }
    }

    /// Total blocks of the device.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Currently free blocks.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Begin an allocation transaction.
    ///
    /// Blocks taken by the transaction are returned to the free set unless it is committed.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction {
            allocator: self,
            taken: vec![],
        }
    }

    /// Return blocks to the free set.
    pub fn free(&mut self, blocks: impl IntoIterator<Item = BlockId>) -> usize {
        let mut freed = 0;
        for block in blocks {
            strict_assert!((block as usize) < self.total);
            let inserted = self.free.insert(block);
            strict_assert!(inserted, "double free of block {block}");
            if inserted {
                freed += 1;
            }
        }
        freed
    }

    fn take(&mut self) -> Option<BlockId> {
        self.free.pop_first()
    }
}

/// An all-or-nothing allocation of cache blocks.
#[derive(Debug)]
pub struct Transaction<'a> {
    allocator: &'a mut BlockAllocator,
    taken: Vec<BlockId>,
}

impl Transaction<'_> {
    /// Allocate `count` blocks in one step.
    ///
    /// Nothing is taken if the device cannot satisfy the whole count.
    pub fn allocate(&mut self, count: usize) -> Result<&[BlockId]> {
        if self.allocator.free_count() < count {
            return Err(Error::resource_exhausted(
                self.allocator.total,
                self.allocator.free_count(),
                count,
            ));
        }
        let start = self.taken.len();
        for _ in 0..count {
            // Checked above.
            if let Some(block) = self.allocator.take() {
                self.taken.push(block);
            }
        }
        Ok(&self.taken[start..])
    }

    /// Blocks taken so far.
    pub fn blocks(&self) -> &[BlockId] {
        &self.taken
    }

    /// Commit the transaction. The blocks now belong to the caller.
    pub fn commit(mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.taken)
    }

    /// Abort the transaction and return every taken block.
    pub fn abort(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.taken.is_empty() {
            tracing::debug!(blocks = self.taken.len(), "[alloc]: abort allocation transaction");
            let taken = std::mem::take(&mut self.taken);
            self.allocator.free(taken);
        }
    }
}
