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

//! End-to-end tests of the cache device.

use std::{collections::HashMap, sync::Arc, thread};

use rand::{rngs::StdRng, Rng, SeedableRng};
use xipcache::prelude::*;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;
const PAGE: usize = 4 * KB;

const CONSUMER: ConsumerId = ConsumerId(1);

fn device(store: &MemoryStore, capacity: usize) -> CacheDevice {
    CacheDeviceBuilder::new("test")
        .with_capacity(capacity as u64)
        .attach(store.clone())
        .unwrap()
}

fn write(device: &CacheDevice, file: FileId, offset: usize, data: &[u8]) -> Result<CacheResponse> {
    device.cache_request(
        CacheRequest::write(FileHandle::read_write(file), CONSUMER, offset as u64),
        Payload::Write(data),
    )
}

fn read(device: &CacheDevice, file: FileId, offset: usize, len: usize) -> Result<(CacheResponse, Vec<u8>)> {
    let mut buf = vec![0u8; len];
    let response = device.cache_request(
        CacheRequest::read(FileHandle::read_write(file), CONSUMER, offset as u64),
        Payload::Read(&mut buf),
    )?;
    Ok((response, buf))
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

#[test_log::test]
fn test_hello() {
    let store = MemoryStore::new();
    store.create(FileId(1), 0);
    let device = device(&store, 2 * MB);
    assert_eq!(device.free_blocks(), 512);

    let response = write(&device, FileId(1), 0, b"hello").unwrap();
    assert_eq!(response.transferred, 5);
    assert!(response.mapping.is_none());
    assert_eq!(response.map_length, 0);
    assert!(response.readable && response.writable);

    let (response, buf) = read(&device, FileId(1), 0, 5).unwrap();
    assert_eq!(response.transferred, 5);
    assert_eq!(&buf, b"hello");

    assert_eq!(device.free_blocks(), 511);
    let extents = device.extents(&FileHandle::read_only(FileId(1)));
    assert_eq!(extents.len(), 1);
    assert_eq!((extents[0].offset, extents[0].length), (0, 2 * MB as u64));
    assert!(extents[0].regions.is_empty());

    let physical = device.physical_extents();
    assert_eq!(physical.len(), 1);
    assert_eq!((physical[0].logical_offset, physical[0].length), (0, PAGE as u64));
    assert_eq!(
        device.find_physical(physical[0].physical_offset).map(|p| p.file),
        Some(response.cache_file)
    );

    // Nothing reached the store yet.
    assert_eq!(store.contents(FileId(1)).unwrap(), Vec::<u8>::new());
    device.flush(&FileHandle::read_only(FileId(1))).unwrap();
    assert_eq!(store.contents(FileId(1)).unwrap(), b"hello".to_vec());
}

#[test_log::test]
fn test_round_trip_buffered() {
    let store = MemoryStore::new();
    store.create(FileId(1), MB);
    let device = device(&store, 16 * MB);

    let data = pattern(1, 10 * KB + 17);
    let response = write(&device, FileId(1), 3 * KB + 5, &data).unwrap();
    assert_eq!(response.transferred, data.len());
    assert!(response.mapping.is_none());

    let (_, buf) = read(&device, FileId(1), 3 * KB + 5, data.len()).unwrap();
    assert_eq!(buf, data);

    // The bytes around the write come from the store.
    let (_, buf) = read(&device, FileId(1), 0, 3 * KB + 5).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test_log::test]
fn test_round_trip_mapped() {
    let store = MemoryStore::new();
    store.create(FileId(1), 8 * MB);
    let device = device(&store, 16 * MB);

    let data = pattern(2, 3 * MB);
    let response = write(&device, FileId(1), MB, &data).unwrap();
    assert_eq!(response.transferred, data.len());
    let view = response.mapping.unwrap();
    assert_eq!(response.map_length, 2 * MB as u64);
    assert_eq!((response.extent_offset, response.extent_length), (0, 2 * MB as u64));
    assert_eq!(device.statistics().mapped_requests, 1);

    // The window and the rest of the request are both cached.
    assert_eq!(device.free_blocks(), device.total_blocks() - 1024);

    let (_, buf) = read(&device, FileId(1), MB, data.len()).unwrap();
    assert_eq!(buf, data);

    let mut buf = vec![0u8; 100];
    view.read_at(MB as u64, &mut buf).unwrap();
    assert_eq!(buf, data[..100]);

    device.detach().unwrap();
    assert_eq!(store.contents(FileId(1)).unwrap()[MB..4 * MB], data[..]);
    assert!(!view.is_valid());
    assert_eq!(
        write(&device, FileId(1), 0, b"late").unwrap_err().kind(),
        ErrorKind::Closed
    );
}

#[test_log::test]
fn test_two_windows_on_one_window_device() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    let device = device(&store, 2 * MB);
    let start = device.free_blocks();

    let first = pattern(3, 2 * MB);
    let second = pattern(4, 2 * MB);
    write(&device, FileId(1), 0, &first).unwrap();
    assert_eq!(device.free_blocks(), 0);
    write(&device, FileId(1), 2 * MB, &second).unwrap();

    let stats = device.statistics();
    assert_eq!(stats.extent_evictions, 1);
    assert_eq!(device.free_blocks(), start - 512);
    assert_eq!(store.contents(FileId(1)).unwrap()[..2 * MB], first[..]);

    let extents = device.extents(&FileHandle::read_only(FileId(1)));
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0].offset, 2 * MB as u64);
}

#[test_log::test]
fn test_fault_beyond_size() {
    let store = MemoryStore::new();
    store.create(FileId(1), PAGE);
    store.write_at(FileId(1), 0, b"short file").unwrap();
    // The layout claims more than the file holds.
    store.set_layout(
        FileId(1),
        Some(LayoutExtent {
            logical: 0,
            physical: 1 << 40,
            length: 4 * MB as u64,
        }),
    );
    let device = device(&store, 4 * MB);

    let (response, buf) = read(&device, FileId(1), 0, 10).unwrap();
    assert_eq!(&buf, b"short file");
    let view = response.mapping.unwrap();

    let mut buf = [0u8; 10];
    view.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"short file");

    let err = view.read_at(2 * PAGE as u64, &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fault);
    assert_eq!(device.statistics().faults, 1);
}

#[test_log::test]
fn test_layout_unavailable_falls_back() {
    let store = MemoryStore::new();
    store.create(FileId(1), 8 * MB);
    store.set_layout(FileId(1), None);
    let device = device(&store, 8 * MB);

    let data = pattern(5, 2 * MB);
    let response = write(&device, FileId(1), 0, &data).unwrap();
    assert!(response.mapping.is_none());
    let (_, buf) = read(&device, FileId(1), 0, data.len()).unwrap();
    assert_eq!(buf, data);
}

#[test_log::test]
fn test_mapped_write_back() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    let device = device(&store, 4 * MB);
    let handle = FileHandle::read_write(FileId(1));

    let (response, _) = read(&device, FileId(1), 0, PAGE).unwrap();
    let view = response.mapping.unwrap();
    view.write_at(3 * PAGE as u64, b"through the mapping").unwrap();

    // Dirty bits live in the page table only, flush harvests them.
    assert_eq!(device.flush(&handle).unwrap(), 1);
    assert_eq!(&store.contents(FileId(1)).unwrap()[3 * PAGE..3 * PAGE + 19], b"through the mapping");

    view.write_at(5 * PAGE as u64, b"again").unwrap();
    let freed = device.evict_file(&handle).unwrap();
    assert_eq!(freed, 512);
    assert_eq!(&store.contents(FileId(1)).unwrap()[5 * PAGE..5 * PAGE + 5], b"again");
    assert_eq!(device.free_blocks(), device.total_blocks());
    assert_eq!(device.cache_files(), 0);
    assert!(device.physical_extents().is_empty());

    assert_eq!(view.write_at(0, b"x").unwrap_err().kind(), ErrorKind::Fault);
}

#[test_log::test]
fn test_unmap_consumer_keeps_dirty_data() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    let device = device(&store, 4 * MB);
    let handle = FileHandle::read_write(FileId(1));

    let (response, _) = read(&device, FileId(1), 0, PAGE).unwrap();
    let view = response.mapping.unwrap();
    view.write_at(7, b"kept").unwrap();

    assert_eq!(device.unmap(&handle, CONSUMER).unwrap(), 1);
    assert!(!view.is_valid());
    assert!(device.extents(&handle)[0].regions.is_empty());

    let (_, buf) = read(&device, FileId(1), 7, 4).unwrap();
    assert_eq!(&buf, b"kept");

    assert_eq!(device.flush(&handle).unwrap(), 1);
    assert_eq!(&store.contents(FileId(1)).unwrap()[7..11], b"kept");
}

#[test_log::test]
fn test_write_back_failure_keeps_extent() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    let device = device(&store, 2 * MB);
    let handle = FileHandle::read_write(FileId(1));

    let first = pattern(6, 2 * MB);
    write(&device, FileId(1), 0, &first).unwrap();

    store.set_fail_writes(true);
    let err = write(&device, FileId(1), 2 * MB, b"no room").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteBackFailure);
    assert_eq!(device.file_blocks(&handle), 512);
    assert_eq!(device.statistics().write_back_failures, 1);

    // Nothing was lost.
    let (_, buf) = read(&device, FileId(1), 0, 2 * MB).unwrap();
    assert_eq!(buf, first);

    store.set_fail_writes(false);
    write(&device, FileId(1), 2 * MB, b"room").unwrap();
    assert_eq!(store.contents(FileId(1)).unwrap()[..2 * MB], first[..]);
}

#[test_log::test]
fn test_rejected_requests() {
    let store = MemoryStore::new();
    store.create(FileId(1), MB);
    let device = device(&store, 4 * MB);

    let err = device
        .cache_request(
            CacheRequest::write(FileHandle::read_only(FileId(1)), CONSUMER, 0),
            Payload::Write(b"x"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let err = write(&device, FileId(9), 0, b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = device.resolve_cache_file(&FileHandle::read_only(FileId(1))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let response = write(&device, FileId(1), 0, b"x").unwrap();
    assert_eq!(
        device.resolve_cache_file(&FileHandle::read_only(FileId(1))).unwrap(),
        response.cache_file
    );
}

#[test_log::test]
fn test_rejects_range_near_address_end() {
    let store = MemoryStore::new();
    store.create(FileId(1), MB);
    let device = device(&store, 4 * MB);

    let err = device
        .cache_request(
            CacheRequest::write(FileHandle::read_write(FileId(1)), CONSUMER, u64::MAX - 10),
            Payload::Write(b"abc"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(device.free_blocks(), device.total_blocks());
    assert_eq!(device.cache_files(), 0);
}

#[test_log::test]
fn test_exhausted_after_barren_reclaim() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    store.set_layout(FileId(1), None);
    let device = device(&store, 2 * MB);
    let free = device.free_blocks();

    let data = pattern(9, 4 * MB);
    let err = write(&device, FileId(1), 0, &data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(device.free_blocks(), free);
    assert_eq!(device.file_blocks(&FileHandle::read_only(FileId(1))), 0);

    // The device is still usable afterwards.
    write(&device, FileId(1), 0, b"fits").unwrap();
    let (_, buf) = read(&device, FileId(1), 0, 4).unwrap();
    assert_eq!(&buf, b"fits");
}

#[test_log::test]
fn test_reclaim_drops_foreign_record() {
    let store = MemoryStore::new();
    store.create(FileId(1), 4 * MB);
    store.create(FileId(2), 4 * MB);
    let device = device(&store, 2 * MB);

    let data = pattern(10, 2 * MB);
    write(&device, FileId(1), 0, &data).unwrap();
    assert_eq!(device.free_blocks(), 0);
    assert_eq!(device.cache_files(), 1);

    write(&device, FileId(2), 0, b"room").unwrap();
    assert_eq!(device.cache_files(), 1);
    assert_eq!(device.file_blocks(&FileHandle::read_only(FileId(1))), 0);
    assert_eq!(device.statistics().extent_evictions, 1);
    assert!(device.resolve_cache_file(&FileHandle::read_only(FileId(1))).is_err());
    assert_eq!(store.contents(FileId(1)).unwrap()[..2 * MB], data[..]);

    // The evicted file is read back from the store.
    let (_, buf) = read(&device, FileId(1), MB, 64).unwrap();
    assert_eq!(buf, data[MB..MB + 64]);
}

#[test_log::test]
fn test_concurrent_requests_with_eviction() {
    const THREADS: usize = 4;
    const FILES: u64 = 4;
    const FILE_SIZE: usize = 2 * MB;
    const OPS: usize = 300;

    let store = MemoryStore::new();
    for file in 0..FILES {
        store.create(FileId(file), FILE_SIZE);
    }
    let device = CacheDeviceBuilder::new("concurrent")
        .with_capacity(MB as u64)
        .with_mapping_unit(64 * KB as u64)
        .with_max_window(64 * KB as u64)
        .attach(store.clone())
        .unwrap();

    let handles = (0..THREADS)
        .map(|t| {
            let device = device.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut expected = HashMap::new();
                for i in 0..OPS {
                    let file = FileId(rng.random_range(0..FILES));
                    // Each thread owns the pages congruent to its index.
                    let page = rng.random_range(0..FILE_SIZE / PAGE / THREADS) * THREADS + t;
                    if rng.random_bool(0.3) {
                        let (_, buf) = read(&device, file, page * PAGE, PAGE).unwrap();
                        if let Some(data) = expected.get(&(file, page)) {
                            assert_eq!(&buf, data);
                        }
                    } else {
                        let data = vec![(t * OPS + i) as u8; PAGE];
                        write(&device, file, page * PAGE, &data).unwrap();
                        expected.insert((file, page), data);
                    }
                }
                expected
            })
        })
        .collect::<Vec<_>>();

    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }
    assert!(device.statistics().extent_evictions > 0);

    device.detach().unwrap();
    assert_eq!(device.free_blocks(), device.total_blocks());
    for ((file, page), data) in expected {
        assert_eq!(store.contents(file).unwrap()[page * PAGE..(page + 1) * PAGE], data[..]);
    }
}

#[test_log::test]
fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    store.create(FileId(1), 4 * MB as u64).unwrap();

    let device = CacheDeviceBuilder::new("file")
        .with_capacity(8 * MB as u64)
        .attach_shared(store.clone())
        .unwrap();

    let data = pattern(7, 2 * MB + 100);
    let response = write(&device, FileId(1), 100, &data).unwrap();
    assert!(response.mapping.is_some());
    device.detach().unwrap();

    let mut buf = vec![0u8; data.len()];
    assert_eq!(store.read_at(FileId(1), 100, &mut buf).unwrap(), data.len());
    assert_eq!(buf, data);
}
