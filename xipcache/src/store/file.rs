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

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use xipcache_common::error::{Error, ErrorKind, Result};

use super::{BackingStore, LayoutExtent, StoreCharacteristics};
use crate::request::FileId;

/// A backing store over a directory of regular files, one per [`FileId`].
///
/// Files are accessed with positional I/O, so one opened handle is shared by every caller.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    files: RwLock<HashMap<FileId, Arc<File>>>,
}

impl FileStore {
    /// Open a store over `dir`, creating the directory if it does not exist.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: RwLock::new(HashMap::new()),
        })
    }

    /// The directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `file`.
    pub fn path(&self, file: FileId) -> PathBuf {
        self.dir.join(format!("{:016x}", file.0))
    }

    /// Create (or resize) the file to `len` bytes.
    pub fn create(&self, file: FileId, len: u64) -> Result<()> {
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.path(file))?;
        f.set_len(len)?;
        self.files.write().insert(file, Arc::new(f));
        Ok(())
    }

    fn file(&self, file: FileId) -> Result<Arc<File>> {
        if let Some(f) = self.files.read().get(&file) {
            return Ok(f.clone());
        }

        let f = match OpenOptions::new().read(true).write(true).open(self.path(file)) {
            Ok(f) => Arc::new(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::new(ErrorKind::InvalidRequest, "unknown backing file")
                    .with_context("file", file)
                    .with_source(e))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.files.write().entry(file).or_insert(f).clone())
    }
}

#[cfg(target_family = "unix")]
fn pread(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut read = 0;
    while !buf.is_empty() {
        match file.read_at(buf, offset) {
            Ok(0) => break,
            Ok(n) => {
                read += n;
                offset += n as u64;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(target_family = "unix")]
fn pwrite(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, offset)
}

#[cfg(target_family = "windows")]
fn pread(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;

    let mut read = 0;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => break,
            Ok(n) => {
                read += n;
                offset += n as u64;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(target_family = "windows")]
fn pwrite(file: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

impl BackingStore for FileStore {
    fn characteristics(&self) -> StoreCharacteristics {
        StoreCharacteristics {
            name: self.dir.display().to_string(),
            max_transfer: 1 << 20,
            physical_block_size: 4096,
            io_min: 4096,
            io_opt: 64 << 10,
        }
    }

    fn file_len(&self, file: FileId) -> Result<u64> {
        Ok(self.file(file)?.metadata()?.len())
    }

    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = self.file(file)?;
        let read = pread(&f, offset, buf)?;
        Ok(read)
    }

    fn write_at(&self, file: FileId, offset: u64, buf: &[u8]) -> Result<()> {
        let f = self.file(file)?;
        pwrite(&f, offset, buf)?;
        Ok(())
    }

    /// A regular file reports its whole logical range as one extent at the same physical offsets.
    fn layout(&self, file: FileId, offset: u64) -> Result<Option<LayoutExtent>> {
        let len = self.file_len(file)?;
        if offset >= len {
            return Ok(None);
        }
        Ok(Some(LayoutExtent {
            logical: 0,
            physical: 0,
            length: len,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.create(FileId(3), 8192).unwrap();

        store.write_at(FileId(3), 4000, b"across a page").unwrap();
        let mut buf = vec![0u8; 13];
        assert_eq!(store.read_at(FileId(3), 4000, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"across a page");

        let mut tail = vec![0u8; 100];
        assert_eq!(store.read_at(FileId(3), 8150, &mut tail).unwrap(), 42);

        let layout = store.layout(FileId(3), 100).unwrap().unwrap();
        assert_eq!((layout.logical, layout.length), (0, 8192));
        assert!(store.layout(FileId(3), 8192).unwrap().is_none());

        assert_eq!(store.file_len(FileId(4)).unwrap_err().kind(), ErrorKind::InvalidRequest);
    }

    #[test_log::test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.create(FileId(1), 16).unwrap();
            store.write_at(FileId(1), 0, b"persisted").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        let mut buf = [0u8; 9];
        store.read_at(FileId(1), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
