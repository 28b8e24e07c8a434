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

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, CounterVecOps, GaugeVecOps, HistogramVecOps, RegistryOps};

trait Boxer {
    fn boxed(self) -> Box<Self>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}
impl<T> Boxer for T {}

/// Metrics of a cache device.
#[derive(Debug)]
pub struct Metrics {
    /* request metrics */
    /// Buffered and mapped read requests.
    pub request_read: BoxedCounter,
    /// Buffered and mapped write requests.
    pub request_write: BoxedCounter,
    /// Requests served with a mapping window.
    pub request_mapped: BoxedCounter,
    /// Requests that stopped with a partial transfer.
    pub request_partial: BoxedCounter,

    /// Bytes copied out of the cache.
    pub request_read_bytes: BoxedCounter,
    /// Bytes copied into the cache.
    pub request_write_bytes: BoxedCounter,

    /// Read request durations in seconds.
    pub request_read_duration: BoxedHistogram,
    /// Write request durations in seconds.
    pub request_write_duration: BoxedHistogram,

    /* eviction metrics */
    /// Extents reclaimed.
    pub evict_extent: BoxedCounter,
    /// Whole cache files evicted.
    pub evict_file: BoxedCounter,
    /// Reclaim calls that freed nothing.
    pub evict_barren: BoxedCounter,
    /// Reclaim durations in seconds.
    pub evict_duration: BoxedHistogram,

    /* store metrics */
    /// Blocks read from the backing store.
    pub store_read_blocks: BoxedCounter,
    /// Blocks written back to the backing store.
    pub store_write_blocks: BoxedCounter,

    /* device metrics */
    /// Free cache blocks.
    pub device_free_blocks: BoxedGauge,
    /// Cache file records.
    pub device_files: BoxedGauge,
    /// Rejected index inserts.
    pub device_conflict: BoxedCounter,
    /// Faults through mappings that could not be resolved.
    pub device_fault: BoxedCounter,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new<R>(name: &'static str, registry: &R) -> Self
    where
        R: RegistryOps,
    {
        let xipcache_request_total =
            registry.register_counter_vec("xipcache_request_total", "xipcache requests", &["name", "op"]);
        let xipcache_request_bytes =
            registry.register_counter_vec("xipcache_request_bytes", "xipcache request bytes", &["name", "op"]);
        let xipcache_request_duration = registry.register_histogram_vec(
            "xipcache_request_duration",
            "xipcache request durations",
            &["name", "op"],
        );

        let request_read = xipcache_request_total.counter(&[name, "read"]).boxed();
        let request_write = xipcache_request_total.counter(&[name, "write"]).boxed();
        let request_mapped = xipcache_request_total.counter(&[name, "mapped"]).boxed();
        let request_partial = xipcache_request_total.counter(&[name, "partial"]).boxed();

        let request_read_bytes = xipcache_request_bytes.counter(&[name, "read"]).boxed();
        let request_write_bytes = xipcache_request_bytes.counter(&[name, "write"]).boxed();

        let request_read_duration = xipcache_request_duration.histogram(&[name, "read"]).boxed();
        let request_write_duration = xipcache_request_duration.histogram(&[name, "write"]).boxed();

        let xipcache_evict_total =
            registry.register_counter_vec("xipcache_evict_total", "xipcache eviction operations", &["name", "op"]);
        let xipcache_evict_duration =
            registry.register_histogram_vec("xipcache_evict_duration", "xipcache reclaim durations", &["name"]);

        let evict_extent = xipcache_evict_total.counter(&[name, "extent"]).boxed();
        let evict_file = xipcache_evict_total.counter(&[name, "file"]).boxed();
        let evict_barren = xipcache_evict_total.counter(&[name, "barren"]).boxed();
        let evict_duration = xipcache_evict_duration.histogram(&[name]).boxed();

        let xipcache_store_io_blocks =
            registry.register_counter_vec("xipcache_store_io_blocks", "xipcache backing store io blocks", &["name", "op"]);

        let store_read_blocks = xipcache_store_io_blocks.counter(&[name, "read"]).boxed();
        let store_write_blocks = xipcache_store_io_blocks.counter(&[name, "write"]).boxed();

        let xipcache_device_usage =
            registry.register_gauge_vec("xipcache_device_usage", "xipcache device usage", &["name", "kind"]);
        let xipcache_device_error_total =
            registry.register_counter_vec("xipcache_device_error_total", "xipcache device errors", &["name", "kind"]);

        let device_free_blocks = xipcache_device_usage.gauge(&[name, "free_blocks"]).boxed();
        let device_files = xipcache_device_usage.gauge(&[name, "files"]).boxed();
        let device_conflict = xipcache_device_error_total.counter(&[name, "conflict"]).boxed();
        let device_fault = xipcache_device_error_total.counter(&[name, "fault"]).boxed();

        Self {
            request_read,
            request_write,
            request_mapped,
            request_partial,
            request_read_bytes,
            request_write_bytes,
            request_read_duration,
            request_write_duration,
            evict_extent,
            evict_file,
            evict_barren,
            evict_duration,
            store_read_blocks,
            store_write_blocks,
            device_free_blocks,
            device_files,
            device_conflict,
            device_fault,
        }
    }

    /// Build a noop metrics for test.
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}
