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

//! Randomized tests of the extent and physical indices.

use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};
use xipcache::prelude::*;

const UNIT: u64 = 64 * 1024;
const ROUNDS: usize = 5000;

fn assert_disjoint(index: &ExtentIndex) {
    for (a, b) in index.iter().tuple_windows() {
        assert!(a.end() <= b.offset, "{a:?} overlaps {b:?}");
    }
    for extent in index.iter() {
        assert_eq!(extent.offset % UNIT, 0);
        assert_eq!(extent.length % UNIT, 0);
        assert!(extent.length > 0);
    }
}

#[test_log::test]
fn test_extent_index_never_overlaps() {
    for seed in 0..4 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut index = ExtentIndex::new(UNIT);

        for _ in 0..ROUNDS {
            let offset = rng.random_range(0..256) * UNIT;
            match rng.random_range(0..10) {
                0..=5 => {
                    let length = rng.random_range(1..8) * UNIT;
                    let physical = rng.random_bool(0.5).then(|| rng.random_range(0..4) * UNIT);
                    let consumer = rng.random_bool(0.5).then(|| ConsumerId(rng.random_range(0..3)));
                    let outcome = index.insert(offset, length, physical, consumer);
                    if outcome.is_established() {
                        assert_eq!(index.get(offset).map(|e| e.offset), Some(offset));
                    }
                }
                6 => {
                    // Misaligned inserts never touch the tree.
                    let before = index.len();
                    assert_eq!(index.insert(offset + 1, UNIT, None, None), InsertOutcome::Misaligned);
                    assert_eq!(index.len(), before);
                }
                7 => {
                    index.remove(offset);
                    assert!(index.find(offset).is_none());
                }
                8 => {
                    index.sweep();
                    if let Some(victim) = index.select_victim() {
                        let extent = index.get(victim).unwrap();
                        assert!(!extent.active && extent.in_flight == 0);
                    }
                }
                _ => {
                    if let Some(pinned) = index.pin(offset) {
                        assert!(index.select_victim() != Some(pinned));
                        index.unpin(pinned);
                    }
                }
            }
            assert_disjoint(&index);
        }
    }
}

#[test_log::test]
fn test_physical_index_stays_consistent() {
    const BS: u64 = 4096;

    let mut rng = StdRng::seed_from_u64(42);
    let index = PhysicalIndex::default();
    // Ground truth: cache block to (file, logical page).
    let mut owners = vec![None; 256];

    for _ in 0..ROUNDS {
        let block = rng.random_range(0..250u64);
        let len = rng.random_range(1..6u64);
        if rng.random_bool(0.7) {
            let file = CacheFileId(rng.random_range(0..2));
            let page = rng.random_range(0..1024u64);
            let res = index.insert(file, page * BS, len * BS, block * BS);
            let free = (block..block + len).all(|b| owners[b as usize].is_none());
            if res.is_ok() {
                for i in 0..len {
                    let owner = &mut owners[(block + i) as usize];
                    assert!(owner.is_none() || *owner == Some((file, page + i)));
                    *owner = Some((file, page + i));
                }
            } else {
                assert_eq!(res.unwrap_err().kind(), ErrorKind::ConflictingExtent);
                assert!(!free);
            }
        } else {
            index.remove(block * BS, len * BS);
            for b in block..block + len {
                owners[b as usize] = None;
            }
        }

        for (block, owner) in owners.iter().enumerate() {
            let found = index.find(block as u64 * BS);
            match owner {
                Some((file, page)) => {
                    let found = found.unwrap();
                    assert_eq!(found.file, *file);
                    assert_eq!(found.logical_offset + (block as u64 * BS - found.physical_offset), page * BS);
                }
                None => assert!(found.is_none()),
            }
        }
    }
}
