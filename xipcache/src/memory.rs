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

//! Cache memory, the blocks that cached pages live in.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use parking_lot::RwLock;
use xipcache_common::strict_assert;

use crate::file::BlockId;

/// Cache line size used by the flush hooks.
pub const CACHE_LINE: usize = 64;

/// The fast byte-addressable cache region, split into fixed-size blocks.
///
/// Each block is guarded by its own lock. Block locks are leaves of the lock order.
#[derive(Debug)]
pub struct CacheMemory {
    blocks: Vec<RwLock<Box<[u8]>>>,
    block_size: usize,
    flushed_lines: AtomicUsize,
}

impl CacheMemory {
    /// Allocate a zeroed cache region of `total` blocks.
    pub fn new(total: usize, block_size: usize) -> Self {
        let blocks = (0..total)
            .map(|_| RwLock::new(vec![0u8; block_size].into_boxed_slice()))
            .collect();
        Self {
            blocks,
            block_size,
            flushed_lines: AtomicUsize::new(0),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Copy out of `block` starting at `offset` within the block.
    pub fn read(&self, block: BlockId, offset: usize, buf: &mut [u8]) {
        strict_assert!(offset + buf.len() <= self.block_size);
        let data = self.blocks[block as usize].read();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy into `block` starting at `offset` within the block.
    pub fn write(&self, block: BlockId, offset: usize, buf: &[u8]) {
        strict_assert!(offset + buf.len() <= self.block_size);
        let mut data = self.blocks[block as usize].write();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    /// Zero a whole block.
    pub fn zero(&self, block: BlockId) {
        self.blocks[block as usize].write().fill(0);
    }

    /// Flush every cache line touched by `[offset, offset + len)` of `block`.
    ///
    /// Returns the number of lines flushed.
    pub fn flush(&self, block: BlockId, offset: usize, len: usize) -> usize {
        strict_assert!((block as usize) < self.blocks.len());
        if len == 0 {
            return 0;
        }
        let start = offset / CACHE_LINE;
        let end = (offset + len).div_ceil(CACHE_LINE);
        self.persist(end - start)
    }

    /// Flush only the partially written cache lines at both edges of `[offset, offset + len)`.
    ///
    /// Full lines in between are assumed to have been written with non-temporal stores.
    pub fn flush_edges(&self, block: BlockId, offset: usize, len: usize) -> usize {
        strict_assert!((block as usize) < self.blocks.len());
        if len == 0 {
            return 0;
        }
        let end = offset + len;
        let head = offset % CACHE_LINE != 0;
        let tail = end % CACHE_LINE != 0 && (!head || end / CACHE_LINE != offset / CACHE_LINE);
        self.persist(head as usize + tail as usize)
    }

    /// Total cache lines flushed so far.
    pub fn flushed_lines(&self) -> usize {
        self.flushed_lines.load(Ordering::Relaxed)
    }

    fn persist(&self, lines: usize) -> usize {
        fence(Ordering::SeqCst);
        self.flushed_lines.fetch_add(lines, Ordering::Relaxed);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_read_write() {
        let memory = CacheMemory::new(4, 4096);
        memory.write(2, 4090, b"hello!");
        let mut buf = [0u8; 6];
        memory.read(2, 4090, &mut buf);
        assert_eq!(&buf, b"hello!");

        memory.zero(2);
        memory.read(2, 4090, &mut buf);
        assert_eq!(buf, [0; 6]);
    }

    #[test_log::test]
    fn test_flush_lines() {
        let memory = CacheMemory::new(1, 4096);
        assert_eq!(memory.flush(0, 0, 64), 1);
        assert_eq!(memory.flush(0, 63, 2), 2);
        assert_eq!(memory.flush(0, 0, 4096), 64);
        assert_eq!(memory.flush(0, 10, 0), 0);

        assert_eq!(memory.flush_edges(0, 0, 128), 0);
        assert_eq!(memory.flush_edges(0, 10, 5), 1);
        assert_eq!(memory.flush_edges(0, 10, 128), 2);
        assert_eq!(memory.flushed_lines(), 1 + 2 + 64 + 1 + 2);
    }
}
