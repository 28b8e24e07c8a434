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

//! An in-memory backing store.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use xipcache_common::{
    bits,
    error::{Error, ErrorKind, Result},
};

use super::{BackingStore, LayoutExtent, StoreCharacteristics};
use crate::request::FileId;

const PHYSICAL_SPACING: u64 = 1 << 30;

#[derive(Debug)]
enum Layout {
    /// The whole file is one extent starting at the file's physical base.
    Contiguous,
    /// A fixed layout, `None` for unavailable.
    Fixed(Option<LayoutExtent>),
}

#[derive(Debug)]
struct MemoryFile {
    data: Vec<u8>,
    physical: u64,
    layout: Layout,
}

#[derive(Debug, Default)]
struct Inner {
    files: RwLock<HashMap<FileId, MemoryFile>>,
    next_physical: AtomicU64,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// An in-memory backing store.
///
/// Each file gets a contiguous layout at its own physical base unless a fixed layout is set. Clones share
/// the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or truncate) a zero-filled file of `len` bytes.
    pub fn create(&self, file: FileId, len: usize) {
        // Leave a gap so that files never look physically adjacent.
        let span = bits::align_up(PHYSICAL_SPACING, len as u64) + PHYSICAL_SPACING;
        let physical = self.inner.next_physical.fetch_add(span, Ordering::Relaxed);
        self.inner.files.write().insert(
            file,
            MemoryFile {
                data: vec![0; len],
                physical,
                layout: Layout::Contiguous,
            },
        );
    }

    /// Pin the layout reported for the file. `None` makes layout discovery fail.
    pub fn set_layout(&self, file: FileId, layout: Option<LayoutExtent>) {
        if let Some(f) = self.inner.files.write().get_mut(&file) {
            f.layout = Layout::Fixed(layout);
        }
    }

    /// Make every following write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of the file content.
    pub fn contents(&self, file: FileId) -> Option<Vec<u8>> {
        self.inner.files.read().get(&file).map(|f| f.data.clone())
    }

    /// Read calls served so far.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Write calls served so far.
    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

fn unknown(file: FileId) -> Error {
    Error::new(ErrorKind::InvalidRequest, "unknown backing file").with_context("file", file)
}

impl BackingStore for MemoryStore {
    fn characteristics(&self) -> StoreCharacteristics {
        StoreCharacteristics {
            name: "memory".to_string(),
            max_transfer: 1 << 20,
            physical_block_size: 4096,
            io_min: 4096,
            io_opt: 0,
        }
    }

    fn file_len(&self, file: FileId) -> Result<u64> {
        let files = self.inner.files.read();
        let f = files.get(&file).ok_or_else(|| unknown(file))?;
        Ok(f.data.len() as u64)
    }

    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        let files = self.inner.files.read();
        let f = files.get(&file).ok_or_else(|| unknown(file))?;
        let start = (offset as usize).min(f.data.len());
        let end = (start + buf.len()).min(f.data.len());
        buf[..end - start].copy_from_slice(&f.data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, file: FileId, offset: u64, buf: &[u8]) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::Relaxed) {
            return Err(std::io::Error::other("injected write failure").into());
        }
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        let mut files = self.inner.files.write();
        let f = files.get_mut(&file).ok_or_else(|| unknown(file))?;
        let start = offset as usize;
        let end = start + buf.len();
        if f.data.len() < end {
            f.data.resize(end, 0);
        }
        f.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn layout(&self, file: FileId, offset: u64) -> Result<Option<LayoutExtent>> {
        let files = self.inner.files.read();
        let f = files.get(&file).ok_or_else(|| unknown(file))?;
        let layout = match &f.layout {
            Layout::Contiguous => Some(LayoutExtent {
                logical: 0,
                physical: f.physical,
                length: f.data.len() as u64,
            }),
            Layout::Fixed(layout) => *layout,
        };
        Ok(layout.filter(|layout| offset < layout.logical_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.create(FileId(1), 16);
        store.write_at(FileId(1), 12, b"abcdefgh").unwrap();
        assert_eq!(store.file_len(FileId(1)).unwrap(), 20);

        let mut buf = [0u8; 10];
        assert_eq!(store.read_at(FileId(1), 14, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"cdefgh");

        let layout = store.layout(FileId(1), 0).unwrap().unwrap();
        assert_eq!((layout.logical, layout.length), (0, 20));
        assert!(store.layout(FileId(1), 20).unwrap().is_none());

        store.set_layout(FileId(1), None);
        assert!(store.layout(FileId(1), 0).unwrap().is_none());

        let err = store.file_len(FileId(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        store.set_fail_writes(true);
        assert_eq!(store.write_at(FileId(1), 0, b"x").unwrap_err().kind(), ErrorKind::Io);
    }

    #[test_log::test]
    fn test_files_get_distinct_physical_bases() {
        let store = MemoryStore::new();
        store.create(FileId(1), 4 << 20);
        store.create(FileId(2), 4 << 20);
        let a = store.layout(FileId(1), 0).unwrap().unwrap();
        let b = store.layout(FileId(2), 0).unwrap().unwrap();
        assert_ne!(a.physical, b.physical);
        assert!(bits::is_aligned(PHYSICAL_SPACING, a.physical));
    }
}
