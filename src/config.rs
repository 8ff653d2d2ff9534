//! Region and flush-server configuration.
//!
//! A [`RegionConfig`] can be built in code with the `with_*` methods or read
//! from a TOML file:
//!
//! ```toml
//! path = "/dev/shm/pagerank.region"
//! size = 1073741824
//! label = "page rank"
//! flush_mode = "msync"
//! startup_grace_ms = 10000
//!
//! [server]
//! flush_period_us = 5000
//! clock_period_ms = 50
//! idle = "spin"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flush::server::{FlushServerConfig, IdleStrategy};

/// Default region size: 256 MiB.
pub const DEFAULT_REGION_SIZE: u64 = 256 * 1024 * 1024;

/// Smallest region accepted: the header page plus one page of pool.
pub const MIN_REGION_SIZE: u64 = 8 * 1024;

/// How a range flush reaches the backing medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Write back CPU cache lines only.
    CacheLine,
    /// Write back cache lines, then `msync` the dirty pages to the file.
    #[default]
    Msync,
}

/// Idle behavior of the flush server between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdleSetting {
    /// Busy-spin with a CPU pause hint.
    #[default]
    Spin,
    /// Yield the time slice.
    Yield,
    /// Sleep for `sleep_us`.
    Sleep,
}

/// Flush-server section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Period between write-log flushes, in microseconds.
    pub flush_period_us: u64,
    /// Period between global clock publications, in milliseconds.
    pub clock_period_ms: u64,
    /// Idle behavior between polls.
    pub idle: IdleSetting,
    /// Sleep length for [`IdleSetting::Sleep`], in microseconds.
    pub sleep_us: u64,
    /// CPU the server thread is pinned to, if any.
    pub pin_cpu: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            flush_period_us: 5_000,
            clock_period_ms: 50,
            idle: IdleSetting::Spin,
            sleep_us: 100,
            pin_cpu: None,
        }
    }
}

impl ServerSection {
    /// Builds the runtime server configuration.
    pub fn to_server_config(&self) -> FlushServerConfig {
        let idle = match self.idle {
            IdleSetting::Spin => IdleStrategy::Spin,
            IdleSetting::Yield => IdleStrategy::Yield,
            IdleSetting::Sleep => IdleStrategy::Sleep(Duration::from_micros(self.sleep_us.max(1))),
        };
        FlushServerConfig {
            flush_period: Duration::from_micros(self.flush_period_us.max(1)),
            clock_period: Duration::from_millis(self.clock_period_ms.max(1)),
            idle,
            pin_cpu: self.pin_cpu,
        }
    }
}

/// Everything a node needs to create or attach a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Backing file of the region.
    pub path: PathBuf,
    /// Total region size in bytes, header included.
    pub size: u64,
    /// Free-text label recorded in the descriptor (truncated to 24 bytes).
    pub label: String,
    /// How flushes reach the backing medium.
    pub flush_mode: FlushMode,
    /// Pause between the initializer's full flush and its barrier signal.
    pub startup_grace_ms: u64,
    /// Poll interval of barrier waiters, in microseconds.
    pub barrier_poll_us: u64,
    /// Flush-server settings.
    pub server: ServerSection,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("graphheap.region"),
            size: DEFAULT_REGION_SIZE,
            label: String::new(),
            flush_mode: FlushMode::Msync,
            startup_grace_ms: 0,
            barrier_poll_us: 50,
            server: ServerSection::default(),
        }
    }
}

impl RegionConfig {
    /// Configuration for a region at `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the region size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the descriptor label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the flush mode.
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Sets the startup grace interval.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Sets the flush-server section.
    pub fn with_server(mut self, server: ServerSection) -> Self {
        self.server = server;
        self
    }

    /// Startup grace interval as a duration.
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Barrier poll interval as a duration.
    pub fn barrier_poll(&self) -> Duration {
        Duration::from_micros(self.barrier_poll_us)
    }

    /// Reads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RegionConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `explicit` if given, else the default location if it exists,
    /// else falls back to defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Writes the configuration as TOML.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, serialized).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks values that would make the region unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size < MIN_REGION_SIZE {
            return Err(ConfigError::Invalid {
                field: "size",
                reason: format!("must be at least {MIN_REGION_SIZE} bytes"),
            });
        }
        if self.size % 4096 != 0 {
            return Err(ConfigError::Invalid {
                field: "size",
                reason: "must be a multiple of 4096".to_string(),
            });
        }
        if usize::try_from(self.size).is_err() {
            return Err(ConfigError::Invalid {
                field: "size",
                reason: "does not fit the address space".to_string(),
            });
        }
        Ok(())
    }
}

/// Errors raised while reading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read region config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`RegionConfig`].
    #[error("failed to parse region config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },
    /// Serialization failed.
    #[error("failed to serialize region config: {source}")]
    Serialize {
        /// Serializer error.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write region config {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// The parent directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Default configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("graphheap").join("region.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_partial_file_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.toml");
        fs::write(
            &path,
            r#"
path = "/tmp/pagerank.region"
size = 1048576
flush_mode = "cache_line"

[server]
clock_period_ms = 10
idle = "sleep"
sleep_us = 250
"#,
        )
        .unwrap();
        let config = RegionConfig::load(&path).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/pagerank.region"));
        assert_eq!(config.size, 1 << 20);
        assert_eq!(config.flush_mode, FlushMode::CacheLine);
        assert_eq!(config.server.flush_period_us, 5_000);
        let server = config.server.to_server_config();
        assert_eq!(server.clock_period, Duration::from_millis(10));
        assert_eq!(server.idle, IdleStrategy::Sleep(Duration::from_micros(250)));
    }

    #[test]
    fn rejects_unaligned_size() {
        let config = RegionConfig::new("/tmp/x").with_size(MIN_REGION_SIZE + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "size", .. })
        ));
    }

    #[test]
    fn persist_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("region.toml");
        let config = RegionConfig::new(dir.path().join("r.region"))
            .with_size(1 << 20)
            .with_label("diameter")
            .with_startup_grace(Duration::from_millis(20));
        config.persist(&path).unwrap();
        let loaded = RegionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
