use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::platform::memory::available_memory_bytes;

const CACHE_DIR_NAME: &str = "image-loader";

/// Order in which idle workers pick queued tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    /// Oldest request first.
    Fifo,
    /// Newest request first; the image requested last is the one most likely still on screen.
    #[default]
    Lifo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MemoryCacheOptions {
    /// Capacity is the platform's available memory divided by this.
    pub divisor: u64,
    /// Fixed capacity; takes precedence over `divisor`.
    pub capacity_bytes: Option<u64>,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            divisor: 8,
            capacity_bytes: None,
        }
    }
}

impl MemoryCacheOptions {
    /// Byte budget for decoded images.
    pub fn capacity(&self) -> u64 {
        match self.capacity_bytes {
            Some(bytes) => bytes,
            None => available_memory_bytes() / self.divisor.max(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DiskCacheOptions {
    /// Persist downloaded originals and decode from the persisted copy.
    pub enabled: bool,
    /// App-private cache root.
    pub dir: Option<PathBuf>,
    /// Removable-storage cache root, preferred whenever it is present.
    pub external_dir: Option<PathBuf>,
}

impl Default for DiskCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            external_dir: None,
        }
    }
}

impl DiskCacheOptions {
    pub fn private_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(CACHE_DIR_NAME),
        }
    }
}

/// Full pixel size of the display; the last fallback when a target has no size at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FetchOptions {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            user_agent: concat!("image-loader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Number of pipelines allowed to run at once.
    pub worker_count: usize,
    /// Dequeue policy for pending loads.
    pub queue_order: QueueOrder,
    pub memory_cache: MemoryCacheOptions,
    pub disk_cache: DiskCacheOptions,
    pub display: DisplaySize,
    pub fetch: FetchOptions,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(self.worker_count > 0, "worker-count must be greater than zero");
        ensure!(
            self.memory_cache.divisor > 0,
            "memory-cache.divisor must be greater than zero"
        );
        if let Some(bytes) = self.memory_cache.capacity_bytes {
            ensure!(bytes > 0, "memory-cache.capacity-bytes must be greater than zero");
        }
        ensure!(
            self.display.width > 0 && self.display.height > 0,
            "display width and height must be greater than zero"
        );
        ensure!(
            !self.fetch.timeout.is_zero(),
            "fetch.timeout must be greater than zero"
        );
        if let Some(dir) = &self.disk_cache.dir {
            ensure!(
                !dir.is_file(),
                "disk-cache.dir {} points to a file",
                dir.display()
            );
        }
        Ok(self)
    }

    pub fn from_yaml_file_validated(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?
            .validated()
            .context("invalid configuration values")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            worker_count: 1,
            queue_order: QueueOrder::default(),
            memory_cache: MemoryCacheOptions::default(),
            disk_cache: DiskCacheOptions::default(),
            display: DisplaySize::default(),
            fetch: FetchOptions::default(),
        }
    }
}
