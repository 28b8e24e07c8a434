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

//! The read/write engine: window decision, request processing, population and write-back.

use std::{ops::Range, sync::Arc, time::Instant};

use itertools::Itertools;
use xipcache_common::{
    bits,
    error::{Error, ErrorKind, Result},
};

use crate::{
    builder::DeviceConfig,
    device::DeviceInner,
    eviction::AllocState,
    extent::InsertOutcome,
    file::{BlockEntry, BlockId, CacheFile, FileState},
    mapping::MappedView,
    request::{CacheRequest, Direction, Payload},
    store::LayoutExtent,
};

/// The mapping window of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Window start, aligned to the mapping unit.
    pub offset: u64,
    /// Window length, `0` when the request is served buffered.
    pub length: u64,
    /// Physical base of the window in the backing store layout.
    pub physical_base: Option<u64>,
    /// Start of the range the request works on.
    pub pos: u64,
    /// Length of the range the request works on.
    pub count: u64,
}

impl Window {
    fn buffered(offset: u64, size: u64, layout: Option<&LayoutExtent>) -> Self {
        Self {
            offset: 0,
            length: 0,
            physical_base: layout.and_then(|layout| layout.physical_of(offset)),
            pos: offset,
            count: size,
        }
    }

    /// Whether the request is served through a mapping.
    pub fn is_enabled(&self) -> bool {
        self.length > 0
    }

    /// Exclusive end of the working range.
    pub fn end(&self) -> u64 {
        self.pos + self.count
    }
}

/// Decide the mapping window of the request `[offset, offset + size)`.
///
/// The window starts at the request offset rounded down to the mapping unit, or at the layout start rounded
/// up if the layout starts later. It never passes the layout end, is capped at the maximum window and ends
/// on a maximum window boundary. A window shorter than the maximum falls back to the buffered path.
pub fn decide_window(config: &DeviceConfig, offset: u64, size: u64, layout: Option<&LayoutExtent>) -> Window {
    let Some(layout) = layout else {
        return Window::buffered(offset, size, None);
    };

    let unit = config.mapping_unit;
    let start = if layout.logical <= bits::align_down(unit, offset) {
        bits::align_down(unit, offset)
    } else {
        bits::align_up(unit, layout.logical)
    };
    let layout_end = layout.logical_end();
    if layout_end <= start {
        return Window::buffered(offset, size, Some(layout));
    }

    let length = bits::align_down(config.block_size as u64, layout_end - start).min(config.max_window);
    let length = bits::align_down(config.max_window, start + length).saturating_sub(start);
    if length < config.max_window {
        return Window::buffered(offset, size, Some(layout));
    }

    let end = start + length;
    let pos = start.min(offset);
    Window {
        offset: start,
        length,
        physical_base: layout.physical_of(start),
        pos,
        count: end.max(offset + size) - pos,
    }
}

/// Outcome of a processed request.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub transferred: usize,
    pub mapping: Option<MappedView>,
    pub extent: Option<(u64, u64)>,
}

/// Split `(page, block)` pairs into runs contiguous in both page and block.
fn contiguous_runs(pages: impl IntoIterator<Item = (u64, BlockId)>) -> Vec<(u64, BlockId, u64)> {
    let mut runs: Vec<(u64, BlockId, u64)> = vec![];
    for (page, block) in pages {
        match runs.last_mut() {
            Some((p, b, n)) if *p + *n == page && *b as u64 + *n == block as u64 => *n += 1,
            _ => runs.push((page, block, 1)),
        }
    }
    runs
}

impl DeviceInner {
    pub(crate) fn block_size(&self) -> u64 {
        self.config.block_size as u64
    }

    /// Serve one request against the cache file.
    pub(crate) fn process_request(
        &self,
        file: &Arc<CacheFile>,
        request: &CacheRequest,
        payload: &mut Payload<'_>,
        layout: Option<LayoutExtent>,
    ) -> Result<Transfer> {
        let now = Instant::now();
        let bs = self.block_size();
        let offset = request.offset;
        let size = payload.len() as u64;
        let end = offset + size;
        let write = request.direction == Direction::Write;

        let window = match request.with_mapping {
            true => decide_window(&self.config, offset, size, layout.as_ref()),
            false => Window::buffered(offset, size, layout.as_ref()),
        };
        tracing::trace!(file = %file.id(), offset, size, ?window, direction = request.direction.as_str(), "[engine]: process request");

        // step 1: recency
        {
            let mut alloc = self.alloc.lock();
            if !file.is_retired() {
                alloc.lru.touch(file);
            }
        }

        // step 2: reserve the working range rounded out to blocks
        let rstart = bits::align_down(bs, window.pos);
        let rend = bits::align_up(bs, window.end());
        let mut guard = file.reserve(rstart, rend - rstart)?;

        // step 3: plan
        let mut missing = vec![];
        let mut required = vec![];
        {
            let state = file.lock();
            for page in rstart / bs..rend / bs {
                if state.block(page).is_some() {
                    continue;
                }
                let covered = write && offset <= page * bs && (page + 1) * bs <= end;
                required.push(!covered);
                missing.push(page);
            }
        }

        // step 4: allocate and populate, blocks are private to the transaction until installed
        let mut alloc = self.alloc.lock();
        if !missing.is_empty() {
            self.make_room(&mut alloc, Some(file), missing.len())?;
        }
        let mut txn = alloc.allocator.transaction();
        let blocks = txn.allocate(missing.len())?.to_vec();
        let fills = missing
            .iter()
            .zip_eq(blocks.iter())
            .zip_eq(required.iter())
            .filter(|(_, required)| **required)
            .map(|((page, block), _)| (*page, *block))
            .collect_vec();
        for block in &blocks {
            self.memory.zero(*block);
        }
        self.fill(file, &fills)?;

        // step 5: install
        let mut state = file.lock();
        if file.is_retired() {
            return Err(Error::new(ErrorKind::Retired, "cache file evicted").with_context("file", file.id()));
        }
        for (page, block) in missing.iter().zip_eq(blocks.iter()) {
            state.blocks.insert(
                *page,
                BlockEntry {
                    block: *block,
                    dirty: false,
                },
            );
        }
        file.add_blocks(blocks.len());

        // step 6: physical index
        if self.config.physical_tracking {
            for (page, block, n) in contiguous_runs(missing.iter().copied().zip(blocks.iter().copied())) {
                if let Err(e) = self.physical.insert(file.id(), page * bs, n * bs, block as u64 * bs) {
                    self.record_conflict();
                    tracing::warn!(file = %file.id(), page, block, ?e, "[engine]: physical index insert rejected");
                }
            }
        }

        // step 7: mapped extent
        let mut mapping = None;
        if window.is_enabled() {
            let outcome = state
                .extents
                .insert(window.offset, window.length, window.physical_base, Some(request.consumer));
            if outcome == InsertOutcome::Conflict {
                self.record_conflict();
            }
            if let Some(extent) = outcome.is_established().then(|| state.extents.get(window.offset)).flatten() {
                let len = extent.length;
                let (view, newly) = self.mapping.map(file, window.offset, request.consumer, len);
                mapping = Some((view, newly));
            }
        }

        // step 8: cover every touched unit and pin what the reservation did not
        let unit = self.config.mapping_unit;
        let mut u = bits::align_down(unit, window.pos);
        while u < window.end() {
            if state.extents.find(u).is_none() {
                let physical = layout.and_then(|layout| layout.physical_of(u));
                if state.extents.insert(u, unit, physical, None) == InsertOutcome::Conflict {
                    self.record_conflict();
                }
            }
            let Some(extent) = state.extents.find(u).map(|extent| (extent.offset, extent.end())) else {
                u += unit;
                continue;
            };
            if !guard.is_pinned(extent.0) {
                state.extents.pin(extent.0);
                guard.track_pin(extent.0);
            }
            u = extent.1;
        }

        txn.commit();
        self.metrics.device_free_blocks.absolute(alloc.allocator.free_count() as u64);
        drop(alloc);

        // step 9: buffered writes dirty their pages, mappings are populated
        let user_pages = bits::block_span(bs, offset, size);
        let lookup = user_pages.clone().map(|page| state.block(page)).collect_vec();
        if write {
            for page in user_pages.clone() {
                if let Some(entry) = state.blocks.get_mut(&page) {
                    entry.dirty = true;
                }
            }
        }
        let mut extent = None;
        let mapping = match mapping {
            Some((view, newly)) => {
                if newly {
                    self.mapping.prefault(&view, &state, file.size().max(end));
                }
                extent = state.extents.get(view.offset()).map(|e| (e.offset, e.length));
                Some(view)
            }
            None => None,
        };
        drop(state);

        // step 10: copy exactly the user range
        let mut transferred = 0;
        let mut result = Ok(());
        for (page, block) in user_pages.zip_eq(lookup) {
            let Some(block) = block else {
                result = Err(Error::partial_transfer(transferred, "missing cache block")
                    .with_context("file", file.id())
                    .with_context("page", page));
                break;
            };
            let page_start = page * bs;
            let from = offset.max(page_start);
            let to = end.min(page_start + bs);
            let in_block = (from - page_start) as usize;
            let n = (to - from) as usize;
            match payload {
                Payload::Read(buf) => self.memory.read(block, in_block, &mut buf[transferred..transferred + n]),
                Payload::Write(buf) => {
                    self.memory.write(block, in_block, &buf[transferred..transferred + n]);
                    self.memory.flush_edges(block, in_block, n);
                }
            }
            transferred += n;
        }

        // step 11: size
        file.update_size(offset + transferred as u64);
        drop(guard);

        self.record_request(request, transferred, mapping.is_some(), now);
        if let Err(e) = result {
            self.statistics.record_partial_transfers(1);
            self.metrics.request_partial.increase(1);
            tracing::warn!(file = %file.id(), offset, size, transferred, "[engine]: partial transfer");
            return Err(e);
        }

        Ok(Transfer {
            transferred,
            mapping,
            extent,
        })
    }

    fn record_conflict(&self) {
        self.statistics.record_conflicts(1);
        self.metrics.device_conflict.increase(1);
    }

    fn record_request(&self, request: &CacheRequest, transferred: usize, mapped: bool, now: Instant) {
        self.statistics.record_requests(1);
        if mapped {
            self.statistics.record_mapped_requests(1);
            self.metrics.request_mapped.increase(1);
        }
        let elapsed = now.elapsed().as_secs_f64();
        match request.direction {
            Direction::Read => {
                self.statistics.record_bytes_read(transferred);
                self.metrics.request_read.increase(1);
                self.metrics.request_read_bytes.increase(transferred as u64);
                self.metrics.request_read_duration.record(elapsed);
            }
            Direction::Write => {
                self.statistics.record_bytes_written(transferred);
                self.metrics.request_write.increase(1);
                self.metrics.request_write_bytes.increase(transferred as u64);
                self.metrics.request_write_duration.record(elapsed);
            }
        }
    }

    /// Populate blocks with their pages from the backing store. Short reads are zero-filled.
    pub(crate) fn fill(&self, file: &CacheFile, pages: &[(u64, BlockId)]) -> Result<usize> {
        if pages.is_empty() {
            return Ok(0);
        }
        let bs = self.block_size();
        let mut buf = vec![0u8; bs as usize];
        for (page, block) in pages {
            let read = self.store.read_at(file.file(), page * bs, &mut buf)?;
            buf[read..].fill(0);
            self.memory.write(*block, 0, &buf);
        }
        self.statistics.record_store_read_pages(pages.len());
        self.metrics.store_read_blocks.increase(pages.len() as u64);
        Ok(pages.len())
    }

    /// Write back the extent starting at `offset`.
    ///
    /// Dirty bits are harvested from every mapping of the extent, the mappings are torn down, then every
    /// page dirty in either the harvest or the block table is written. Returns the pages written.
    pub(crate) fn write_back(&self, file: &CacheFile, state: &mut FileState, offset: u64) -> Result<usize> {
        let Some(extent) = state.extents.get(offset) else {
            return Ok(0);
        };
        let bs = self.block_size();
        let (start, length) = (extent.offset, extent.length);
        let consumers = extent.regions.iter().copied().collect_vec();

        let harvested = self.mapping.dirty_page_array(
            file.id(),
            start,
            consumers,
            (length / bs) as usize,
            self.mapping.tables(),
        );
        self.mapping.unmap_extent(file.id(), state, start);
        self.write_pages(file, state, start / bs..(start + length) / bs, &harvested)
    }

    /// Write every dirty page of the range, clamped to the tracked file size, and clear its dirty flag.
    ///
    /// `harvested` holds extra dirty bits indexed from the range start.
    pub(crate) fn write_pages(
        &self,
        file: &CacheFile,
        state: &mut FileState,
        pages: Range<u64>,
        harvested: &[bool],
    ) -> Result<usize> {
        let bs = self.block_size();
        let size = file.size();
        let first = pages.start;
        let dirty = state
            .pages(pages)
            .filter(|(page, entry)| {
                entry.dirty
                    || harvested
                        .get((page - first) as usize)
                        .copied()
                        .unwrap_or(false)
            })
            .map(|(page, entry)| (page, entry.block))
            .collect_vec();

        let mut buf = vec![0u8; bs as usize];
        let mut written = 0;
        for (page, block) in dirty {
            let pos = page * bs;
            if pos < size {
                let len = bs.min(size - pos) as usize;
                self.memory.read(block, 0, &mut buf[..len]);
                self.store.write_at(file.file(), pos, &buf[..len])?;
                written += 1;
            }
            if let Some(entry) = state.blocks.get_mut(&page) {
                entry.dirty = false;
            }
        }

        if written > 0 {
            self.statistics.record_store_write_pages(written);
            self.metrics.store_write_blocks.increase(written as u64);
            tracing::trace!(file = %file.id(), written, "[engine]: pages written back");
        }
        Ok(written)
    }

    /// Return taken pages to the allocator and drop their physical index entries.
    pub(crate) fn free_pages(&self, alloc: &mut AllocState, file: &CacheFile, taken: &[(u64, BlockEntry)]) -> usize {
        let bs = self.block_size();
        if self.config.physical_tracking {
            for (_, block, n) in contiguous_runs(taken.iter().map(|(page, entry)| (*page, entry.block))) {
                self.physical.remove(block as u64 * bs, n * bs);
            }
        }
        let freed = alloc.allocator.free(taken.iter().map(|(_, entry)| entry.block));
        file.sub_blocks(freed);
        self.metrics.device_free_blocks.absolute(alloc.allocator.free_count() as u64);
        freed
    }

    /// Flush the cache lines of `[start, end)` of the file. Returns the lines flushed.
    pub(crate) fn sync_range(&self, file: &CacheFile, start: u64, end: u64) -> usize {
        if end <= start {
            return 0;
        }
        let bs = self.block_size();
        let state = file.lock();
        let mut lines = 0;
        for (page, entry) in state.pages(bits::block_span(bs, start, end - start)) {
            let page_start = page * bs;
            let from = start.max(page_start);
            let to = end.min(page_start + bs);
            lines += self.memory.flush(entry.block, (from - page_start) as usize, (to - from) as usize);
        }
        lines
    }

    /// Write back every dirty page of the file without evicting anything. Mappings stay established.
    pub(crate) fn flush_file(&self, file: &CacheFile) -> Result<usize> {
        let bs = self.block_size();
        let mut state = file.lock();
        let extents = state
            .extents
            .iter()
            .map(|e| (e.offset, e.length, e.regions.iter().copied().collect_vec()))
            .collect_vec();
        let mut written = 0;
        for (start, length, consumers) in extents {
            let harvested =
                self.mapping
                    .dirty_page_array(file.id(), start, consumers, (length / bs) as usize, self.mapping.tables());
            written += self.write_pages(file, &mut state, start / bs..(start + length) / bs, &harvested)?;
        }
        tracing::debug!(file = %file.id(), written, "[engine]: file flushed");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn config() -> DeviceConfig {
        DeviceConfig {
            capacity: 16 * MIB,
            ..Default::default()
        }
    }

    fn layout(logical: u64, length: u64) -> LayoutExtent {
        LayoutExtent {
            logical,
            physical: 1 << 30,
            length,
        }
    }

    #[test_log::test]
    fn test_window_enabled() {
        let config = config();
        let w = decide_window(&config, 3 * MIB, 4096, Some(&layout(0, 8 * MIB)));
        assert!(w.is_enabled());
        assert_eq!((w.offset, w.length), (2 * MIB, 2 * MIB));
        assert_eq!((w.pos, w.count), (2 * MIB, 2 * MIB));
        assert_eq!(w.physical_base, Some((1 << 30) + 2 * MIB));

        // The request runs past the window.
        let w = decide_window(&config, 3 * MIB, 2 * MIB, Some(&layout(0, 8 * MIB)));
        assert_eq!((w.pos, w.count), (2 * MIB, 3 * MIB));
    }

    #[test_log::test]
    fn test_window_disabled() {
        let config = config();

        // Layout too short for a whole window.
        let w = decide_window(&config, 0, 5, Some(&layout(0, MIB)));
        assert!(!w.is_enabled());
        assert_eq!((w.pos, w.count), (0, 5));
        assert_eq!(w.physical_base, Some(1 << 30));

        // No layout.
        let w = decide_window(&config, 4096, 100, None);
        assert!(!w.is_enabled());
        assert_eq!(w.physical_base, None);

        // Layout ends before the aligned start.
        let w = decide_window(&config, 5 * MIB, 100, Some(&layout(0, 3 * MIB)));
        assert!(!w.is_enabled());
    }

    #[test_log::test]
    fn test_window_aligns_to_later_layout() {
        let config = config();
        let w = decide_window(&config, 4096, 4096, Some(&layout(MIB, 8 * MIB)));
        assert!(w.is_enabled());
        assert_eq!(w.offset, 2 * MIB);
        assert_eq!(w.pos, 4096);
        assert_eq!(w.end(), 4 * MIB);
    }

    #[test_log::test]
    fn test_contiguous_runs() {
        let runs = contiguous_runs([(0, 10), (1, 11), (2, 13), (5, 14), (6, 15)]);
        assert_eq!(runs, vec![(0, 10, 2), (2, 13, 1), (5, 14, 2)]);
        assert!(contiguous_runs(Vec::<(u64, BlockId)>::new()).is_empty());
    }
}
