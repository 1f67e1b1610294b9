/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::flow::key::{DynamicFields, KeySelector};

#[derive(Debug, Deserialize)]
#[serde(remote = "log::Level", rename_all = "kebab-case")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Which fields make up a flow key. `five-tuple` is the production mode;
/// `empty` folds everything into one flow for throughput measurement;
/// `dynamic` keys on a configured subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyMode {
    FiveTuple,
    Empty,
    Dynamic(DynamicFields),
}

impl KeyMode {
    pub fn to_selector(self) -> KeySelector {
        match self {
            KeyMode::FiveTuple => KeySelector::FiveTuple,
            KeyMode::Empty => KeySelector::Empty,
            KeyMode::Dynamic(fields) => KeySelector::Dynamic(fields),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// worker thread count, one flow table each
    pub shards: usize,
    #[serde(with = "humantime_serde")]
    pub active_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub expire_interval: Duration,
    pub pool_slots: usize,
    /// batches per ring, shared between the empty and full side
    pub ring_capacity: usize,
    pub batch_size: usize,
    /// retained objects per flow pool and shard
    pub flow_pool_capacity: usize,
    pub key_mode: KeyMode,
    #[serde(with = "LevelDef")]
    pub log_level: log::Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shards: 1,
            active_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            expire_interval: Duration::from_secs(5),
            pool_slots: 8192,
            ring_capacity: 8,
            batch_size: 512,
            flow_pool_capacity: 4096,
            key_mode: KeyMode::FiveTuple,
            log_level: log::Level::Info,
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Self::load(&contents)
    }

    pub fn load(contents: &str) -> Result<Config> {
        let mut config: Config =
            serde_yaml::from_str(contents).map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        // out-of-range sizes are clamped, not rejected
        if config.batch_size < 1 {
            config.batch_size = 1;
        }
        if config.ring_capacity < 2 {
            config.ring_capacity = 2;
        }
        if config.pool_slots < config.batch_size * config.ring_capacity {
            config.pool_slots = config.batch_size * config.ring_capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards < 1 {
            return Err(Error::ConfigInvalid("shards must be >= 1".into()));
        }
        if self.active_timeout.is_zero() {
            return Err(Error::ConfigInvalid("active-timeout must be > 0".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::ConfigInvalid("idle-timeout must be > 0".into()));
        }
        if self.expire_interval.is_zero() {
            return Err(Error::ConfigInvalid("expire-interval must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_mode, KeyMode::FiveTuple);
    }

    #[test]
    fn yaml_roundtrip() {
        let config = Config::load(
            r#"
shards: 4
active-timeout: 30m
idle-timeout: 1m
expire-interval: 10s
batch-size: 128
key-mode: five-tuple
log-level: debug
"#,
        )
        .unwrap();
        assert_eq!(config.shards, 4);
        assert_eq!(config.active_timeout, Duration::from_secs(1800));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.log_level, log::Level::Debug);
    }

    #[test]
    fn dynamic_key_mode() {
        let config = Config::load(
            r#"
key-mode:
  dynamic:
    src-ip: true
    dst-ip: true
    proto: true
"#,
        )
        .unwrap();
        match config.key_mode {
            KeyMode::Dynamic(fields) => {
                assert!(fields.src_ip && fields.dst_ip && fields.proto);
                assert!(!fields.src_port && !fields.dst_port);
            }
            other => panic!("unexpected key mode: {:?}", other),
        }
    }

    #[test]
    fn zero_shards_rejected() {
        let result = Config::load("shards: 0");
        assert!(result.is_err());
    }

    #[test]
    fn small_pool_clamped() {
        let config = Config::load("pool-slots: 1").unwrap();
        assert!(config.pool_slots >= config.batch_size * config.ring_capacity);
    }
}
