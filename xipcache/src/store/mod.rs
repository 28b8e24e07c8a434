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

//! Backing stores the cache sits in front of.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use xipcache_common::error::Result;

use crate::request::FileId;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A contiguous range of a file in the backing store layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutExtent {
    /// Logical file offset of the range.
    pub logical: u64,
    /// Physical store offset of the range.
    pub physical: u64,
    /// Length in bytes.
    pub length: u64,
}

impl LayoutExtent {
    /// Exclusive logical end.
    pub fn logical_end(&self) -> u64 {
        self.logical + self.length
    }

    /// Physical offset of the logical `offset`, if it lies in the range.
    pub fn physical_of(&self, offset: u64) -> Option<u64> {
        (self.logical <= offset && offset < self.logical_end()).then(|| self.physical + (offset - self.logical))
    }
}

/// Queue characteristics of a backing store, read once at attach for logging and tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCharacteristics {
    /// Store name.
    pub name: String,
    /// Largest single transfer in bytes.
    pub max_transfer: usize,
    /// Physical block size in bytes.
    pub physical_block_size: usize,
    /// Minimal I/O size hint.
    pub io_min: usize,
    /// Optimal I/O size hint.
    pub io_opt: usize,
}

/// The slower store behind the cache.
///
/// How the store performs its I/O is up to the implementation.
pub trait BackingStore: Send + Sync + 'static + Debug {
    /// Queue characteristics.
    fn characteristics(&self) -> StoreCharacteristics;

    /// Current length of the file.
    ///
    /// Fails with [`ErrorKind::InvalidRequest`](xipcache_common::error::ErrorKind::InvalidRequest) for an
    /// unknown file.
    fn file_len(&self, file: FileId) -> Result<u64>;

    /// Read at `offset`. Returns the bytes read, which is short only at the end of the file.
    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer at `offset`, growing the file if needed.
    fn write_at(&self, file: FileId, offset: u64, buf: &[u8]) -> Result<()>;

    /// The contiguous layout extent that contains `offset`, or else the first one after it.
    ///
    /// `None` means no layout is known for the range.
    fn layout(&self, file: FileId, offset: u64) -> Result<Option<LayoutExtent>>;
}
