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

//! Per-file index of cached logical byte ranges.

use std::collections::{BTreeMap, BTreeSet};

use xipcache_common::{bits, strict_assert};

use crate::request::ConsumerId;

/// A cached logical byte range `[offset, offset + length)` of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Logical start, aligned to the mapping unit.
    pub offset: u64,
    /// Length, aligned to the mapping unit.
    pub length: u64,
    /// Whether the extent may hold data newer than the backing store.
    pub dirty: bool,
    /// Physical base of the range in the backing store layout, if known.
    pub physical_offset: Option<u64>,
    /// Consumers that map the extent.
    pub regions: BTreeSet<ConsumerId>,
    /// Touched since the last eviction sweep.
    pub active: bool,
    /// Live requests pinning the extent.
    pub in_flight: usize,
}

impl Extent {
    fn new(offset: u64, length: u64, physical_offset: Option<u64>) -> Self {
        Self {
            offset,
            length,
            dirty: true,
            physical_offset,
            regions: BTreeSet::new(),
            active: true,
            in_flight: 0,
        }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Whether `offset` lies in the range.
    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    /// Whether eviction may pick the extent.
    pub fn is_reclaimable(&self) -> bool {
        !self.active && self.in_flight == 0
    }
}

/// Result of [`ExtentIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new extent was linked.
    Created,
    /// The extent at the same start was extended.
    Extended {
        /// Whether the consumer was recorded for the first time.
        new_region: bool,
    },
    /// An existing extent already covers the range.
    Reused {
        /// Whether the consumer was recorded for the first time.
        new_region: bool,
    },
    /// An existing extent with incompatible metadata contains the offset. The tree is unchanged.
    Conflict,
    /// Offset or length is not aligned to the mapping unit. The tree is unchanged.
    Misaligned,
}

impl InsertOutcome {
    /// Whether an extent now starts at the inserted offset.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Created | Self::Extended { .. } | Self::Reused { .. })
    }

    /// Whether the consumer was newly recorded on the extent.
    pub fn is_new_region(&self) -> bool {
        match self {
            Self::Created => true,
            Self::Extended { new_region } | Self::Reused { new_region } => *new_region,
            Self::Conflict | Self::Misaligned => false,
        }
    }
}

/// Ordered index of the cached extents of one file, keyed by extent start.
///
/// No two extents overlap. Offsets and lengths are multiples of the mapping unit.
#[derive(Debug)]
pub struct ExtentIndex {
    extents: BTreeMap<u64, Extent>,
    unit: u64,
}

impl ExtentIndex {
    /// Create an empty index for the mapping unit.
    pub fn new(unit: u64) -> Self {
        strict_assert!(bits::is_pow2(unit));
        Self {
            extents: BTreeMap::new(),
            unit,
        }
    }

    /// The extent whose range contains `offset`.
    pub fn find(&self, offset: u64) -> Option<&Extent> {
        self.extents
            .range(..=offset)
            .next_back()
            .map(|(_, extent)| extent)
            .filter(|extent| extent.contains(offset))
    }

    fn find_mut(&mut self, offset: u64) -> Option<&mut Extent> {
        self.extents
            .range_mut(..=offset)
            .next_back()
            .map(|(_, extent)| extent)
            .filter(|extent| extent.contains(offset))
    }

    /// Extents overlapping `[offset, offset + length)`, in offset order.
    pub fn overlapping(&self, offset: u64, length: u64) -> impl Iterator<Item = &Extent> + '_ {
        let first = self.find(offset).map(|extent| extent.offset).unwrap_or(offset);
        self.extents
            .range(first..offset + length)
            .map(|(_, extent)| extent)
            .filter(move |extent| bits::overlaps(extent.offset, extent.length, offset, length))
    }

    /// Link an extent for `[offset, offset + length)` and record `consumer` on it.
    ///
    /// The extent is marked active. An existing extent at the same start with a compatible physical base
    /// is reused, and extended in place if the new range is longer. An extent is truncated if it runs
    /// into its successor.
    pub fn insert(
        &mut self,
        offset: u64,
        length: u64,
        physical_offset: Option<u64>,
        consumer: Option<ConsumerId>,
    ) -> InsertOutcome {
        if length == 0 || !bits::is_aligned(self.unit, offset) || !bits::is_aligned(self.unit, length) {
            tracing::info!(offset, length, unit = self.unit, "[extent]: insert range not aligned to mapping unit");
            return InsertOutcome::Misaligned;
        }

        let outcome = match self.find_mut(offset) {
            Some(existing) => {
                let compatible = existing.offset == offset
                    && match (existing.physical_offset, physical_offset) {
                        (Some(a), Some(b)) => a == b,
                        _ => true,
                    };
                if !compatible {
                    tracing::warn!(
                        existing.offset,
                        existing.length,
                        existing.physical = ?existing.physical_offset,
                        offset,
                        length,
                        physical = ?physical_offset,
                        "[extent]: existing extent hit but unmatched"
                    );
                    existing.active = true;
                    return InsertOutcome::Conflict;
                }

                if existing.physical_offset.is_none() {
                    existing.physical_offset = physical_offset;
                }
                let new_region = consumer.map(|c| existing.regions.insert(c)).unwrap_or(false);
                existing.active = true;
                if existing.length < length {
                    existing.length = length;
                    InsertOutcome::Extended { new_region }
                } else {
                    return InsertOutcome::Reused { new_region };
                }
            }
            None => {
                let mut extent = Extent::new(offset, length, physical_offset);
                if let Some(consumer) = consumer {
                    extent.regions.insert(consumer);
                }
                self.extents.insert(offset, extent);
                InsertOutcome::Created
            }
        };

        self.truncate_against_successor(offset);
        outcome
    }

    fn truncate_against_successor(&mut self, offset: u64) {
        let next = self
            .extents
            .range(offset + 1..)
            .next()
            .map(|(next, _)| *next);
        if let (Some(next), Some(extent)) = (next, self.extents.get_mut(&offset)) {
            if extent.end() > next {
                tracing::debug!(offset, length = extent.length, next, "[extent]: truncate against successor");
                extent.length = next - offset;
            }
        }
    }

    /// Erase the extent containing `offset`. Its mapped regions go with it.
    pub fn remove(&mut self, offset: u64) -> Option<Extent> {
        let start = self.find(offset)?.offset;
        self.extents.remove(&start)
    }

    /// Clear the active flag of the extent containing `offset`.
    pub fn clear_active(&mut self, offset: u64) -> bool {
        match self.find_mut(offset) {
            Some(extent) => {
                extent.active = false;
                true
            }
            None => false,
        }
    }

    /// Mark the extent containing `offset` active.
    pub fn mark_active(&mut self, offset: u64) -> bool {
        match self.find_mut(offset) {
            Some(extent) => {
                extent.active = true;
                true
            }
            None => false,
        }
    }

    /// Start of the first extent, in offset order, that is neither active nor pinned.
    ///
    /// The caller is responsible for erasing it.
    pub fn select_victim(&self) -> Option<u64> {
        self.extents
            .values()
            .find(|extent| extent.is_reclaimable())
            .map(|extent| extent.offset)
    }

    /// Clear the active flag of every extent that is not pinned. Returns how many were cleared.
    pub fn sweep(&mut self) -> usize {
        let mut cleared = 0;
        for extent in self.extents.values_mut() {
            if extent.active && extent.in_flight == 0 {
                extent.active = false;
                cleared += 1;
            }
        }
        cleared
    }

    /// Pin the extent containing `offset` for a live request and mark it active.
    pub fn pin(&mut self, offset: u64) -> Option<u64> {
        let extent = self.find_mut(offset)?;
        extent.in_flight += 1;
        extent.active = true;
        Some(extent.offset)
    }

    /// Drop one pin of the extent starting at `offset`.
    pub fn unpin(&mut self, offset: u64) {
        match self.extents.get_mut(&offset) {
            Some(extent) => {
                strict_assert!(extent.in_flight > 0);
                extent.in_flight = extent.in_flight.saturating_sub(1);
            }
            None => tracing::warn!(offset, "[extent]: unpin missing extent"),
        }
    }

    /// Record the consumer's mapping of the extent starting at `offset` as torn down.
    pub fn remove_region(&mut self, offset: u64, consumer: ConsumerId) -> bool {
        self.extents
            .get_mut(&offset)
            .map(|extent| extent.regions.remove(&consumer))
            .unwrap_or(false)
    }

    /// The extent starting exactly at `offset`.
    pub fn get(&self, offset: u64) -> Option<&Extent> {
        self.extents.get(&offset)
    }

    /// Remove every extent.
    pub fn clear(&mut self) -> Vec<Extent> {
        std::mem::take(&mut self.extents).into_values().collect()
    }

    /// Extents in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &Extent> + '_ {
        self.extents.values()
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Whether the index holds no extent.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// The mapping unit.
    pub fn unit(&self) -> u64 {
        self.unit
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    const UNIT: u64 = 2 << 20;

    fn offsets(index: &ExtentIndex) -> Vec<(u64, u64)> {
        index.iter().map(|e| (e.offset, e.length)).collect_vec()
    }

    #[test_log::test]
    fn test_find() {
        let mut index = ExtentIndex::new(UNIT);
        assert_eq!(index.insert(UNIT, UNIT, Some(0), None), InsertOutcome::Created);
        assert!(index.find(0).is_none());
        assert_eq!(index.find(UNIT).unwrap().offset, UNIT);
        assert_eq!(index.find(2 * UNIT - 1).unwrap().offset, UNIT);
        assert!(index.find(2 * UNIT).is_none());
    }

    #[test_log::test]
    fn test_misaligned_is_noop() {
        let mut index = ExtentIndex::new(UNIT);
        assert_eq!(index.insert(4096, UNIT, None, None), InsertOutcome::Misaligned);
        assert_eq!(index.insert(0, 4096, None, None), InsertOutcome::Misaligned);
        assert_eq!(index.insert(0, 0, None, None), InsertOutcome::Misaligned);
        assert!(index.is_empty());
    }

    #[test_log::test]
    fn test_extend_and_truncate() {
        let mut index = ExtentIndex::new(UNIT);
        index.insert(0, UNIT, Some(0), Some(ConsumerId(1)));
        index.insert(2 * UNIT, UNIT, Some(2 * UNIT), None);

        let outcome = index.insert(0, 4 * UNIT, Some(0), Some(ConsumerId(2)));
        assert_eq!(outcome, InsertOutcome::Extended { new_region: true });
        assert_eq!(offsets(&index), vec![(0, 2 * UNIT), (2 * UNIT, UNIT)]);
        assert_eq!(index.get(0).unwrap().regions.len(), 2);

        let outcome = index.insert(0, UNIT, Some(0), Some(ConsumerId(2)));
        assert_eq!(outcome, InsertOutcome::Reused { new_region: false });
        assert_eq!(offsets(&index), vec![(0, 2 * UNIT), (2 * UNIT, UNIT)]);

        // New extent runs into its successor.
        let mut index = ExtentIndex::new(UNIT);
        index.insert(UNIT, UNIT, None, None);
        assert_eq!(index.insert(0, 4 * UNIT, None, None), InsertOutcome::Created);
        assert_eq!(offsets(&index), vec![(0, UNIT), (UNIT, UNIT)]);
    }

    #[test_log::test]
    fn test_conflict_keeps_existing() {
        let mut index = ExtentIndex::new(UNIT);
        index.insert(0, 2 * UNIT, Some(4096), None);
        index.clear_active(0);

        assert_eq!(index.insert(0, UNIT, Some(8192), None), InsertOutcome::Conflict);
        assert_eq!(index.insert(UNIT, UNIT, Some(4096 + UNIT), None), InsertOutcome::Conflict);

        let existing = index.get(0).unwrap();
        assert_eq!(existing.physical_offset, Some(4096));
        assert_eq!(existing.length, 2 * UNIT);
        assert!(existing.active);
        assert_eq!(index.len(), 1);
    }

    #[test_log::test]
    fn test_unknown_physical_is_adopted() {
        let mut index = ExtentIndex::new(UNIT);
        index.insert(0, UNIT, None, None);
        assert_eq!(
            index.insert(0, UNIT, Some(1 << 30), Some(ConsumerId(9))),
            InsertOutcome::Reused { new_region: true }
        );
        assert_eq!(index.get(0).unwrap().physical_offset, Some(1 << 30));
    }

    #[test_log::test]
    fn test_select_victim_excludes_active() {
        let mut index = ExtentIndex::new(UNIT);
        index.insert(0, UNIT, None, None);
        index.insert(UNIT, UNIT, None, None);
        assert_eq!(index.select_victim(), None);

        index.clear_active(UNIT + 10);
        assert_eq!(index.select_victim(), Some(UNIT));

        index.pin(UNIT);
        assert_eq!(index.select_victim(), None);
        assert_eq!(index.sweep(), 1);
        assert_eq!(index.select_victim(), Some(0));

        index.unpin(UNIT);
        index.clear_active(UNIT);
        assert_eq!(index.select_victim(), Some(0));
        let victim = index.remove(0).unwrap();
        assert_eq!(victim.offset, 0);
        assert_eq!(index.select_victim(), Some(UNIT));
    }

    #[test_log::test]
    fn test_overlapping() {
        let mut index = ExtentIndex::new(UNIT);
        for i in [0, 2, 3, 5] {
            index.insert(i * UNIT, UNIT, None, None);
        }
        let found = |offset, length| index.overlapping(offset, length).map(|e| e.offset / UNIT).collect_vec();
        assert_eq!(found(UNIT / 2, UNIT), vec![0]);
        assert_eq!(found(UNIT, 2 * UNIT + 1), vec![2, 3]);
        assert_eq!(found(4 * UNIT, UNIT), Vec::<u64>::new());
        assert_eq!(found(0, 6 * UNIT), vec![0, 2, 3, 5]);
    }

    #[test_log::test]
    fn test_clear() {
        let mut index = ExtentIndex::new(UNIT);
        index.insert(0, UNIT, None, Some(ConsumerId(1)));
        index.insert(UNIT, UNIT, None, None);
        let removed = index.clear();
        assert_eq!(removed.len(), 2);
        assert!(index.is_empty());
    }
}
