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

mod error;

use std::{collections::HashMap, path::PathBuf, sync::Arc, thread, time::Instant};

use bytesize::ByteSize;
use clap::Args;
use rand::{rngs::StdRng, Rng, SeedableRng};
use xipcache::prelude::*;

use crate::run::error::{Error, Result};

const CONSUMER: ConsumerId = ConsumerId(1);

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Directory of the backing store. Files are created in it.
    #[arg(short, long)]
    dir: PathBuf,

    /// Cache capacity.
    #[arg(long, default_value = "64MiB")]
    capacity: ByteSize,

    /// Mapping unit and window size.
    #[arg(long, default_value = "2MiB")]
    mapping_unit: ByteSize,

    /// Number of backing files.
    #[arg(long, default_value_t = 4)]
    files: u64,

    /// Size of each backing file.
    #[arg(long, default_value = "32MiB")]
    file_size: ByteSize,

    /// Size of each request.
    #[arg(long, default_value = "64KiB")]
    io_size: ByteSize,

    /// Requests issued per thread.
    #[arg(long, default_value_t = 10000)]
    count: usize,

    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Percentage of writes.
    #[arg(long, default_value_t = 50)]
    write_ratio: u32,

    /// Never ask for mappings.
    #[arg(long, default_value_t = false)]
    no_mapping: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Data a worker expects at `(file, slot)`. Slots are owned by one worker each.
type Shadow = HashMap<(FileId, u64), Vec<u8>>;

pub fn run(args: RunArgs) -> Result<()> {
    let io_size = args.io_size.as_u64();
    let file_size = args.file_size.as_u64();
    if io_size == 0 || file_size < io_size || args.threads == 0 {
        return Err(Error::Args(format!(
            "io size {} must be non-zero and not larger than file size {} with at least one thread",
            args.io_size, args.file_size
        )));
    }

    let store = Arc::new(FileStore::open(&args.dir)?);
    // Start from zeroed files so unwritten slots read back as zeros.
    for file in 0..args.files {
        store.create(FileId(file), 0)?;
        store.create(FileId(file), file_size)?;
    }

    let device = CacheDeviceBuilder::new("xipcache-cli")
        .with_capacity(args.capacity.as_u64())
        .with_mapping_unit(args.mapping_unit.as_u64())
        .with_max_window(args.mapping_unit.as_u64())
        .attach_shared(store.clone())?;

    let start = Instant::now();
    let shadows = thread::scope(|s| {
        let handles = (0..args.threads)
            .map(|id| {
                let device = &device;
                let args = &args;
                s.spawn(move || worker(device, args, id))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;
    let elapsed = start.elapsed();

    let stats = device.statistics();
    device.detach()?;

    let mut buf = vec![0u8; io_size as usize];
    for ((file, slot), expected) in shadows.iter().flatten() {
        let offset = slot * io_size;
        let read = store.read_at(*file, offset, &mut buf)?;
        if read != expected.len() || buf != *expected {
            return Err(Error::Mismatch { file: *file, offset });
        }
    }

    let requests = args.count * args.threads;
    println!(
        "{requests} requests in {elapsed:?} ({:.0} req/s), {} slots verified after detach",
        requests as f64 / elapsed.as_secs_f64(),
        shadows.iter().map(|shadow| shadow.len()).sum::<usize>(),
    );
    println!("{}", serde_json::to_string_pretty(&stats).map_err(anyhow::Error::from)?);

    Ok(())
}

fn worker(device: &CacheDevice, args: &RunArgs, id: usize) -> Result<Shadow> {
    let io_size = args.io_size.as_u64();
    let slots = args.file_size.as_u64() / io_size;
    let threads = args.threads as u64;
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(id as u64));
    let mut shadow = Shadow::new();
    let mut buf = vec![0u8; io_size as usize];

    let owned = (id as u64..slots).step_by(args.threads).count() as u64;
    if owned == 0 {
        return Ok(shadow);
    }

    for _ in 0..args.count {
        let file = FileId(rng.random_range(0..args.files.max(1)));
        let slot = id as u64 + rng.random_range(0..owned) * threads;
        let offset = slot * io_size;
        let handle = FileHandle::read_write(file);

        let request = if rng.random_ratio(args.write_ratio.min(100), 100) {
            rng.fill(&mut buf[..]);
            CacheRequest::write(handle, CONSUMER, offset)
        } else {
            CacheRequest::read(handle, CONSUMER, offset)
        };
        let request = if args.no_mapping { request.without_mapping() } else { request };

        let response = match request.direction {
            Direction::Write => device.cache_request(request, Payload::Write(&buf))?,
            Direction::Read => device.cache_request(request, Payload::Read(&mut buf))?,
        };
        if response.transferred != buf.len() {
            tracing::warn!(%file, offset, transferred = response.transferred, "[run]: short transfer");
        }

        match request.direction {
            Direction::Write => {
                shadow.insert((file, slot), buf.clone());
            }
            Direction::Read => {
                let matched = match shadow.get(&(file, slot)) {
                    Some(expected) => *expected == buf,
                    None => buf.iter().all(|b| *b == 0),
                };
                if !matched {
                    return Err(Error::Mismatch { file, offset });
                }
            }
        }
    }

    Ok(shadow)
}
