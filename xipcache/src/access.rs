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

//! In-flight request ranges of a cache file.

use std::{collections::BTreeMap, sync::Arc};

use xipcache_common::{
    bits,
    error::{Error, ErrorKind, Result},
    strict_assert,
};

use crate::file::CacheFile;

/// Per-file index of in-flight byte ranges.
///
/// The index never holds two overlapping reservations.
#[derive(Debug, Default)]
pub struct AccessIndex {
    reservations: BTreeMap<u64, u64>,
}

impl AccessIndex {
    /// Whether `[offset, offset + length)` overlaps any reservation.
    pub fn is_reserved(&self, offset: u64, length: u64) -> bool {
        // The candidates are the last reservation starting at or before `offset` and those starting inside the range.
        let before = self.reservations.range(..=offset).next_back();
        let inside = self.reservations.range(offset.saturating_add(1)..offset + length).next();
        before
            .into_iter()
            .chain(inside)
            .any(|(start, len)| bits::overlaps(*start, (*len).max(1), offset, length.max(1)))
    }

    fn insert(&mut self, offset: u64, length: u64) {
        strict_assert!(!self.is_reserved(offset, length));
        self.reservations.insert(offset, length);
    }

    fn remove(&mut self, offset: u64, length: u64) {
        let removed = self.reservations.remove(&offset);
        strict_assert!(removed == Some(length), "release of unknown reservation {offset}+{length}");
        if removed.is_none() {
            tracing::warn!(offset, length, "[access]: release of unknown reservation");
        }
    }

    /// Number of live reservations.
    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    /// Whether no reservation is live.
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

impl CacheFile {
    /// Reserve `[offset, offset + length)` for one request, blocking while it overlaps another reservation.
    ///
    /// Every extent overlapping the range is pinned and marked active for the lifetime of the guard.
    ///
    /// Fails with [`ErrorKind::Retired`] if the record was evicted from the cache before or while waiting.
    pub fn reserve(self: &Arc<Self>, offset: u64, length: u64) -> Result<ReservationGuard> {
        let mut state = self.lock();
        loop {
            if self.is_retired() {
                return Err(Error::new(ErrorKind::Retired, "cache file evicted")
                    .with_context("file", self.id())
                    .with_context("offset", offset));
            }
            if !state.access.is_reserved(offset, length) {
                break;
            }
            tracing::trace!(file = %self.id(), offset, length, "[access]: waiting on reserved range");
            self.cond.wait(&mut state);
        }

        state.access.insert(offset, length);
        let pinned = state
            .extents
            .overlapping(offset, length)
            .map(|extent| extent.offset)
            .collect::<Vec<_>>();
        for extent in &pinned {
            state.extents.pin(*extent);
        }
        tracing::trace!(file = %self.id(), offset, length, pinned = pinned.len(), "[access]: reserved");

        Ok(ReservationGuard {
            file: self.clone(),
            offset,
            length,
            pinned,
        })
    }
}

/// A live reservation. Dropping the guard releases the range, unpins its extents and wakes every waiter.
#[derive(Debug)]
pub struct ReservationGuard {
    file: Arc<CacheFile>,
    offset: u64,
    length: u64,
    pinned: Vec<u64>,
}

impl ReservationGuard {
    /// Reserved offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved length.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The reserving file.
    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }

    /// Record that the request pinned the extent starting at `offset` after the reservation was taken.
    ///
    /// Must be called under the per-file lock right after pinning.
    pub fn track_pin(&mut self, offset: u64) {
        self.pinned.push(offset);
    }

    /// Whether the extent starting at `offset` is pinned by this reservation.
    pub fn is_pinned(&self, offset: u64) -> bool {
        self.pinned.contains(&offset)
    }

    fn release(&mut self) {
        let mut state = self.file.lock();
        state.access.remove(self.offset, self.length);
        if self.file.is_retired() {
            // The extents went with the record.
            self.pinned.clear();
        }
        for extent in self.pinned.drain(..) {
            state.extents.unpin(extent);
        }
        drop(state);
        tracing::trace!(file = %self.file.id(), offset = self.offset, length = self.length, "[access]: released");
        self.file.cond.notify_all();
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{file::CacheFileId, request::FileId};

    const UNIT: u64 = 2 << 20;

    fn file() -> Arc<CacheFile> {
        Arc::new(CacheFile::new(CacheFileId(1), FileId(1), 0, UNIT))
    }

    #[test_log::test]
    fn test_is_reserved() {
        let mut index = AccessIndex::default();
        index.insert(100, 100);
        index.insert(300, 50);

        assert!(!index.is_reserved(0, 100));
        assert!(index.is_reserved(0, 101));
        assert!(index.is_reserved(199, 1));
        assert!(!index.is_reserved(200, 100));
        assert!(index.is_reserved(200, 101));
        assert!(index.is_reserved(150, 500));
        assert!(!index.is_reserved(350, 10));

        index.remove(100, 100);
        assert!(!index.is_reserved(0, 300));
        assert_eq!(index.len(), 1);
    }

    #[test_log::test]
    fn test_disjoint_ranges_do_not_block() {
        let file = file();
        let a = file.reserve(0, 4096).unwrap();
        let b = file.reserve(4096, 4096).unwrap();
        assert_eq!(file.lock().access.len(), 2);
        drop(a);
        drop(b);
        assert!(file.lock().access.is_empty());
    }

    #[test_log::test]
    fn test_overlapping_ranges_exclude() {
        let file = file();
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles = (0..4)
            .map(|i| {
                let file = file.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        // Every range overlaps [4096, 8192).
                        let guard = file.reserve(i * 1024, 8192).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                        drop(guard);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(file.lock().access.is_empty());
    }

    #[test_log::test]
    fn test_waiter_wakes_on_release() {
        let file = file();
        let guard = file.reserve(0, 8192).unwrap();

        let waiter = {
            let file = file.clone();
            thread::spawn(move || file.reserve(4096, 4096).map(|g| g.offset()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.join().unwrap().unwrap(), 4096);
    }

    #[test_log::test]
    fn test_retired_wakes_waiters() {
        let file = file();
        let guard = file.reserve(0, 4096).unwrap();
        let waiter = {
            let file = file.clone();
            thread::spawn(move || file.reserve(0, 4096).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        {
            let _state = file.lock();
            file.retire();
        }
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retired);
        drop(guard);
    }

    #[test_log::test]
    fn test_reservation_pins_extents() {
        let file = file();
        file.lock().extents.insert(0, UNIT, None, None);
        file.lock().extents.clear_active(0);

        let guard = file.reserve(100, 10).unwrap();
        assert!(guard.is_pinned(0));
        {
            let state = file.lock();
            assert_eq!(state.extents.get(0).unwrap().in_flight, 1);
            assert_eq!(state.extents.select_victim(), None);
        }
        drop(guard);
        let mut state = file.lock();
        assert_eq!(state.extents.get(0).unwrap().in_flight, 0);
        state.extents.clear_active(0);
        assert_eq!(state.extents.select_victim(), Some(0));
    }
}
