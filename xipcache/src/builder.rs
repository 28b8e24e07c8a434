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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use xipcache_common::{
    bits,
    error::{Error, ErrorKind, Result},
    metrics::{model::Metrics, RegistryOps},
};

use crate::{device::CacheDevice, memory::CACHE_LINE, store::BackingStore};

/// Configuration of a cache device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name, used in logs.
    pub name: String,
    /// Cache region capacity in bytes.
    pub capacity: u64,
    /// Cache block size in bytes.
    pub block_size: usize,
    /// Alignment unit of extents in bytes.
    pub mapping_unit: u64,
    /// Maximum mapping window in bytes. Requests that cannot get a whole window are served buffered.
    pub max_window: u64,
    /// Register allocated blocks in the physical index.
    pub physical_tracking: bool,
    /// Upper bound of reclaim calls per allocation.
    pub max_reclaim_attempts: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "xipcache".to_string(),
            capacity: 64 << 20,
            block_size: 4096,
            mapping_unit: 2 << 20,
            max_window: 2 << 20,
            physical_tracking: true,
            max_reclaim_attempts: 64,
        }
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &'static str) -> Error {
    Error::new(ErrorKind::Config, reason).with_context(key, value)
}

impl DeviceConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        let bs = self.block_size as u64;
        if !bits::is_pow2(self.block_size) || self.block_size < CACHE_LINE {
            return Err(invalid(
                "block_size",
                self.block_size,
                "block size must be a power of 2 of at least a cache line",
            ));
        }
        if !bits::is_pow2(self.mapping_unit) || self.mapping_unit < bs {
            return Err(invalid(
                "mapping_unit",
                self.mapping_unit,
                "mapping unit must be a power of 2 of at least a block",
            ));
        }
        if !bits::is_pow2(self.max_window) || self.max_window < self.mapping_unit {
            return Err(invalid(
                "max_window",
                self.max_window,
                "max window must be a power of 2 of at least a mapping unit",
            ));
        }
        if self.capacity < bs {
            return Err(invalid("capacity", self.capacity, "capacity must hold at least one block"));
        }
        if self.capacity / bs > u32::MAX as u64 {
            return Err(invalid("capacity", self.capacity, "too many blocks"));
        }
        if self.max_reclaim_attempts == 0 {
            return Err(invalid(
                "max_reclaim_attempts",
                self.max_reclaim_attempts,
                "at least one reclaim attempt is required",
            ));
        }
        Ok(())
    }

    /// Number of cache blocks.
    pub fn total_blocks(&self) -> usize {
        (self.capacity / self.block_size as u64) as usize
    }
}

/// Builder of a [`CacheDevice`].
///
/// ```rust
/// use xipcache::prelude::*;
///
/// let store = MemoryStore::new();
/// store.create(FileId(1), 4096);
/// let device = CacheDeviceBuilder::new("doc")
///     .with_capacity(4 << 20)
///     .attach(store)
///     .unwrap();
/// assert_eq!(device.total_blocks(), 1024);
/// ```
pub struct CacheDeviceBuilder {
    name: &'static str,
    config: DeviceConfig,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for CacheDeviceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDeviceBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl CacheDeviceBuilder {
    /// Create a builder with the default configuration.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            config: DeviceConfig {
                name: name.to_string(),
                ..Default::default()
            },
            metrics: None,
        }
    }

    /// Start from an existing configuration. The builder name is kept for metrics labels.
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cache region capacity in bytes.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the cache block size in bytes.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Set the extent alignment unit in bytes.
    pub fn with_mapping_unit(mut self, mapping_unit: u64) -> Self {
        self.config.mapping_unit = mapping_unit;
        self
    }

    /// Set the maximum mapping window in bytes.
    pub fn with_max_window(mut self, max_window: u64) -> Self {
        self.config.max_window = max_window;
        self
    }

    /// Enable or disable the physical index.
    pub fn with_physical_tracking(mut self, enable: bool) -> Self {
        self.config.physical_tracking = enable;
        self
    }

    /// Bound the reclaim calls of one allocation.
    pub fn with_max_reclaim_attempts(mut self, attempts: usize) -> Self {
        self.config.max_reclaim_attempts = attempts;
        self
    }

    /// Report metrics to the registry.
    pub fn with_metrics_registry<R>(mut self, registry: R) -> Self
    where
        R: RegistryOps,
    {
        self.metrics = Some(Arc::new(Metrics::new(self.name, &registry)));
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Validate the configuration and attach the device in front of the store.
    pub fn attach<S>(self, store: S) -> Result<CacheDevice>
    where
        S: BackingStore,
    {
        self.attach_shared(Arc::new(store))
    }

    /// Like [`attach`](Self::attach), for a store shared with other owners.
    pub fn attach_shared(self, store: Arc<dyn BackingStore>) -> Result<CacheDevice> {
        self.config.validate()?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::noop()),
        };
        CacheDevice::open(self.config, store, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_validate() {
        assert!(DeviceConfig::default().validate().is_ok());

        let cases = [
            DeviceConfig {
                block_size: 3000,
                ..Default::default()
            },
            DeviceConfig {
                mapping_unit: 2048,
                ..Default::default()
            },
            DeviceConfig {
                max_window: 1 << 20,
                ..Default::default()
            },
            DeviceConfig {
                capacity: 100,
                ..Default::default()
            },
            DeviceConfig {
                max_reclaim_attempts: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Config, "{config:?}");
        }
    }

    #[test_log::test]
    fn test_config_serde() {
        let config: DeviceConfig = serde_json::from_str(r#"{ "capacity": 8388608, "physical_tracking": false }"#).unwrap();
        assert_eq!(config.capacity, 8 << 20);
        assert!(!config.physical_tracking);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.total_blocks(), 2048);
    }
}
