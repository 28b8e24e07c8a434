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

use std::fmt::Debug;

use xipcache::prelude::FileId;

/// Workload error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Cache device error.
    #[error("cache error: {0}")]
    Cache(#[from] xipcache::prelude::Error),
    /// Data read back does not match what was written.
    #[error("data mismatch: file {file}, offset {offset}")]
    Mismatch { file: FileId, offset: u64 },
    /// Invalid arguments.
    #[error("invalid arguments: {0}")]
    Args(String),
    /// Other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Workload result type.
pub type Result<T> = core::result::Result<T, Error>;
