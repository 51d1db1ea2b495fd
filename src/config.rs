//! Runtime configuration for hybridswap.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Geometry, I/O batching, reclaim knobs and fault back-off all live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extent::HEADER_LEN;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hybridswap",
    about = "Two-tier compressed memory store smoke driver"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "hybridswap.json")]
    pub config: PathBuf,

    /// Backing file or block device. Uses an in-memory device when omitted.
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Number of owners to drive.
    #[arg(long, default_value_t = 4)]
    pub owners: u16,

    /// Pages stored per owner.
    #[arg(long, default_value_t = 2048)]
    pub pages_per_owner: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sizes of the object, extent and owner spaces.
    pub geometry: GeometryConfig,

    /// I/O batching and back-pressure.
    pub io: IoConfig,

    /// Reclaim knobs.
    pub reclaim: ReclaimConfig,

    /// Fault-path waiting.
    pub fault: FaultConfig,

    /// Compression settings.
    pub compression: CompressionConfig,
}

/// Fixed sizes of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Uncompressed page size in bytes.
    pub page_size: usize,

    /// Size of one extent on the backing device in bytes.
    pub extent_size: usize,

    /// Number of extents on the backing device.
    pub extent_count: usize,

    /// Number of object slots in the RAM tier.
    pub object_count: usize,

    /// Maximum number of distinct owners.
    pub owner_count: usize,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            extent_size: 128 * 1024,
            extent_count: 1024,
            object_count: 64 * 1024,
            owner_count: 64,
        }
    }
}

impl GeometryConfig {
    /// Bytes needed on the backing device.
    pub fn device_bytes(&self) -> u64 {
        self.extent_size as u64 * self.extent_count as u64
    }
}

/// I/O scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Largest merged transfer in bytes.
    pub max_batch_bytes: usize,

    /// In-flight entries at which admission blocks.
    pub inflight_ceiling: usize,

    /// Poll interval of a blocked admission, in milliseconds.
    pub admission_poll_ms: u64,

    /// Threads completing read transfers.
    pub read_workers: usize,

    /// Threads completing write transfers.
    pub write_workers: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 1024 * 1024,
            inflight_ceiling: 64,
            admission_poll_ms: 10,
            read_workers: 2,
            write_workers: 2,
        }
    }
}

impl IoConfig {
    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms.max(1))
    }
}

/// Reclaim (RAM → disk) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Global switch.
    pub enabled: bool,

    /// Default target disk share of each owner's resident size, in percent.
    pub default_ratio: u32,

    /// Skip an owner whose reclaimable size is below this, unless forced.
    pub min_reclaim_bytes: u64,

    /// Upper bound for one reclaim invocation (0 = unbounded).
    pub max_reclaim_bytes: u64,

    /// Bytes that may be reclaimed per day (0 = unbounded).
    pub daily_quota_bytes: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ratio: 50,
            min_reclaim_bytes: 64 * 1024,
            max_reclaim_bytes: 64 * 1024 * 1024,
            daily_quota_bytes: 0,
        }
    }
}

/// Back-off of a fault waiting for a busy extent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// First back-off step, in microseconds.
    pub backoff_min_us: u64,

    /// Largest back-off step, in microseconds.
    pub backoff_max_us: u64,

    /// Give up after waiting this long, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            backoff_min_us: 100,
            backoff_max_us: 20_000,
            timeout_ms: 10_000,
        }
    }
}

impl FaultConfig {
    pub fn backoff_min(&self) -> Duration {
        Duration::from_micros(self.backoff_min_us.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_micros(self.backoff_max_us.max(self.backoff_min_us).max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is missing and for missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject geometry and knobs the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.geometry;
        if g.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be non-zero".into()));
        }
        if g.extent_size < g.page_size + HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "extent_size {} cannot hold one {}-byte page plus its header",
                g.extent_size, g.page_size
            )));
        }
        if g.extent_count == 0 || g.object_count == 0 {
            return Err(ConfigError::Invalid(
                "extent_count and object_count must be non-zero".into(),
            ));
        }
        if g.object_count >= u32::MAX as usize {
            return Err(ConfigError::Invalid("object_count must fit in u32".into()));
        }
        if g.owner_count == 0 || g.owner_count >= u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "owner_count must be in 1..{}",
                u16::MAX
            )));
        }
        if self.io.max_batch_bytes < g.extent_size {
            return Err(ConfigError::Invalid(format!(
                "max_batch_bytes {} is smaller than one extent ({})",
                self.io.max_batch_bytes, g.extent_size
            )));
        }
        if self.io.inflight_ceiling == 0 {
            return Err(ConfigError::Invalid("inflight_ceiling must be non-zero".into()));
        }
        if self.io.read_workers == 0 || self.io.write_workers == 0 {
            return Err(ConfigError::Invalid(
                "completion pools need at least one worker".into(),
            ));
        }
        if self.reclaim.default_ratio > 100 {
            return Err(ConfigError::Invalid("default_ratio is a percentage".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.geometry.page_size, 4096);
        assert_eq!(cfg.reclaim.default_ratio, 50);
    }

    #[test]
    fn test_device_bytes() {
        let cfg = Config::default();
        assert_eq!(cfg.geometry.device_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"geometry": {"extent_count": 16}, "io": {"inflight_ceiling": 4}}"#)
                .unwrap();
        assert_eq!(cfg.geometry.extent_count, 16);
        assert_eq!(cfg.geometry.page_size, 4096);
        assert_eq!(cfg.io.inflight_ceiling, 4);
        assert_eq!(cfg.io.read_workers, 2);
    }

    #[test]
    fn test_rejects_tiny_extent() {
        let mut cfg = Config::default();
        cfg.geometry.extent_size = cfg.geometry.page_size;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_small_batch() {
        let mut cfg = Config::default();
        cfg.io.max_batch_bytes = cfg.geometry.extent_size - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/hybridswap.json")).unwrap();
        assert_eq!(cfg.geometry.extent_count, 1024);
    }
}
