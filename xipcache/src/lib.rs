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

//! An extent cache in front of a slower backing store.
//!
//! Reads and writes are served out of a fast byte-addressable cache region split into blocks. Cached ranges
//! of a file are tracked as extents aligned to a mapping unit. A request that can be given a whole mapping
//! window gets a [`MappedView`](mapping::MappedView) of the window, so the consumer can access the cache
//! directly afterwards. Smaller requests are served with buffered copies.
//!
//! Concurrent requests on the same file serialize on overlapping byte ranges only. When the cache runs out
//! of blocks, the least recently used files give up extents, which are written back first if dirty.

/// Byte-range reservations of in-flight requests.
pub mod access;
/// Cache block allocator with all-or-nothing transactions.
pub mod alloc;
/// Device configuration and builder.
pub mod builder;
/// The cache device and its request boundary.
pub mod device;
pub mod engine;
pub mod eviction;
pub mod extent;
/// Per-file cache records.
pub mod file;
pub mod mapping;
/// The cache region.
pub mod memory;
/// Reverse index from cache-device offsets to file ranges.
pub mod physical;
pub mod request;
/// Device counters.
pub mod statistics;
pub mod store;

/// Re-exports of the commonly used types.
pub mod prelude;
