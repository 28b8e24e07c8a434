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

pub use xipcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::registry::noop::NoopMetricsRegistry,
};

pub use crate::{
    builder::{CacheDeviceBuilder, DeviceConfig},
    device::CacheDevice,
    engine::{decide_window, Window},
    extent::{Extent, ExtentIndex, InsertOutcome},
    file::{CacheFileId, BlockId},
    mapping::{DirtyQuery, MappedView, MappingHandle},
    physical::{PhysicalExtent, PhysicalIndex},
    request::{CacheRequest, CacheResponse, ConsumerId, Direction, FileHandle, FileId, Payload},
    statistics::StatisticsSnapshot,
    store::{BackingStore, FileStore, LayoutExtent, MemoryStore, StoreCharacteristics},
};
