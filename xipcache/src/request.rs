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

//! The request boundary: descriptors copied in and out of the cache.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use xipcache_common::error::{Error, ErrorKind, Result};

use crate::{file::CacheFileId, mapping::MappedView};

/// Stable identifier of a file in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a consumer that maps cached extents into its view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open backing file together with the permissions it was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    /// Backing file.
    pub file: FileId,
    /// Opened for reading.
    pub readable: bool,
    /// Opened for writing.
    pub writable: bool,
}

impl FileHandle {
    /// A handle that may read and write.
    pub fn read_write(file: FileId) -> Self {
        Self {
            file,
            readable: true,
            writable: true,
        }
    }

    /// A handle that may only read.
    pub fn read_only(file: FileId) -> Self {
        Self {
            file,
            readable: true,
            writable: false,
        }
    }
}

/// Request direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Copy out of the cache.
    Read,
    /// Copy into the cache.
    Write,
}

impl Direction {
    /// Static name, used as metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// A cache request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRequest {
    /// The file handle the request is issued through.
    pub handle: FileHandle,
    /// The consumer a mapping would be established for.
    pub consumer: ConsumerId,
    /// Byte offset.
    pub offset: u64,
    /// Direction.
    pub direction: Direction,
    /// Whether a qualifying window should be exposed as a mapping in the response.
    pub with_mapping: bool,
}

impl CacheRequest {
    /// A read request.
    pub fn read(handle: FileHandle, consumer: ConsumerId, offset: u64) -> Self {
        Self {
            handle,
            consumer,
            offset,
            direction: Direction::Read,
            with_mapping: true,
        }
    }

    /// A write request.
    pub fn write(handle: FileHandle, consumer: ConsumerId, offset: u64) -> Self {
        Self {
            handle,
            consumer,
            offset,
            direction: Direction::Write,
            with_mapping: true,
        }
    }

    /// Do not establish a mapping even if the window qualifies.
    pub fn without_mapping(mut self) -> Self {
        self.with_mapping = false;
        self
    }
}

/// The user buffer of a request.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Destination of a read.
    Read(&'a mut [u8]),
    /// Source of a write.
    Write(&'a [u8]),
}

impl Payload<'_> {
    /// Buffer length.
    pub fn len(&self) -> usize {
        match self {
            Payload::Read(buf) => buf.len(),
            Payload::Write(buf) => buf.len(),
        }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direction implied by the buffer.
    pub fn direction(&self) -> Direction {
        match self {
            Payload::Read(_) => Direction::Read,
            Payload::Write(_) => Direction::Write,
        }
    }
}

/// Output of a cache request.
#[derive(Debug)]
pub struct CacheResponse {
    /// Resolved cache file.
    pub cache_file: CacheFileId,
    /// Bytes copied between the payload and the cache.
    pub transferred: usize,
    /// The mapping exposing the window, if one was established.
    pub mapping: Option<MappedView>,
    /// Length of the mapping, `0` when none.
    pub map_length: u64,
    /// Offset of the backing extent the window lies in.
    pub extent_offset: u64,
    /// Length of the backing extent the window lies in.
    pub extent_length: u64,
    /// Read permission derived from the handle.
    pub readable: bool,
    /// Write permission derived from the handle.
    pub writable: bool,
}

/// Validate handle permissions and the shape of the request.
///
/// The working range of a request is rounded out to whole blocks and may end on the window after the one
/// holding the request end, so two windows past the end must stay addressable too.
pub(crate) fn validate(request: &CacheRequest, payload: &Payload<'_>, max_window: u64) -> Result<()> {
    let permitted = match request.direction {
        Direction::Read => request.handle.readable,
        Direction::Write => request.handle.writable,
    };
    if !permitted {
        return Err(
            Error::new(ErrorKind::PermissionDenied, "file handle does not permit the request direction")
                .with_context("file", request.handle.file)
                .with_context("direction", request.direction.as_str()),
        );
    }
    if payload.direction() != request.direction {
        return Err(Error::invalid_request("payload does not match the request direction"));
    }
    if payload.is_empty() {
        return Err(Error::invalid_request("empty request").with_context("offset", request.offset));
    }
    if request
        .offset
        .checked_add(payload.len() as u64)
        .and_then(|end| end.checked_add(max_window))
        .and_then(|end| end.checked_add(max_window))
        .is_none()
    {
        return Err(Error::invalid_request("request range overflows")
            .with_context("offset", request.offset)
            .with_context("size", payload.len()));
    }
    Ok(())
}
