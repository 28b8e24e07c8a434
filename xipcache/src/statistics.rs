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

//! Device statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Deterministic counters of a cache device.
///
/// Unlike [`Metrics`](xipcache_common::metrics::model::Metrics), the counters can always be read back.
#[derive(Debug, Default)]
pub struct Statistics {
    requests: AtomicUsize,
    mapped_requests: AtomicUsize,
    partial_transfers: AtomicUsize,
    retries: AtomicUsize,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
    store_read_pages: AtomicUsize,
    store_write_pages: AtomicUsize,
    extent_evictions: AtomicUsize,
    file_evictions: AtomicUsize,
    barren_reclaims: AtomicUsize,
    write_back_failures: AtomicUsize,
    conflicts: AtomicUsize,
    faults: AtomicUsize,
}

/// A point-in-time copy of [`Statistics`].
#[expect(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests: usize,
    pub mapped_requests: usize,
    pub partial_transfers: usize,
    pub retries: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
    pub store_read_pages: usize,
    pub store_write_pages: usize,
    pub extent_evictions: usize,
    pub file_evictions: usize,
    pub barren_reclaims: usize,
    pub write_back_failures: usize,
    pub conflicts: usize,
    pub faults: usize,
}

macro_rules! record {
    ($($field:ident => $fn:ident),* $(,)?) => {
        impl Statistics {
            $(
                pub(crate) fn $fn(&self, v: usize) {
                    self.$field.fetch_add(v, Ordering::Relaxed);
                }
            )*

            /// Take a snapshot of every counter.
            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

record! {
    requests => record_requests,
    mapped_requests => record_mapped_requests,
    partial_transfers => record_partial_transfers,
    retries => record_retries,
    bytes_read => record_bytes_read,
    bytes_written => record_bytes_written,
    store_read_pages => record_store_read_pages,
    store_write_pages => record_store_write_pages,
    extent_evictions => record_extent_evictions,
    file_evictions => record_file_evictions,
    barren_reclaims => record_barren_reclaims,
    write_back_failures => record_write_back_failures,
    conflicts => record_conflicts,
    faults => record_faults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_snapshot() {
        let stats = Statistics::default();
        stats.record_requests(2);
        stats.record_bytes_written(4096);
        stats.record_extent_evictions(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.bytes_written, 4096);
        assert_eq!(snapshot.extent_evictions, 1);
        assert_eq!(snapshot.faults, 0);
    }
}
