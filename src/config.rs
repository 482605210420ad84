/*!
 * Configuration types for ossx
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::core::progress::ProgressCallback;
use crate::error::{Result, TransferError};

/// Default preferred part size (10 MiB)
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Smallest part size the planner will choose (100 KiB)
pub const DEFAULT_MIN_PART_SIZE: u64 = 100 * 1024;

/// Protocol limit on the number of parts in one multipart upload
pub const DEFAULT_MAX_PARTS: u32 = 10_000;

/// Uploads below this size use a single request (10 MiB)
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Downloads below this size use a single request (100 MiB)
pub const DEFAULT_MULTIGET_THRESHOLD: u64 = 100 * 1024 * 1024;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Process-independent transfer settings, loadable from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Preferred part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Part sizes below this are raised to it
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    /// Maximum number of parts per transfer
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Worker count for uploads
    #[serde(default = "default_concurrency")]
    pub upload_concurrency: usize,

    /// Worker count for downloads
    #[serde(default = "default_concurrency")]
    pub download_concurrency: usize,

    /// Uploads smaller than this go through a single `put_object`
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Downloads smaller than this go through a single GET
    #[serde(default = "default_multiget_threshold")]
    pub multiget_threshold: u64,

    /// Compare CRC-64 values reported by the service
    #[serde(default = "default_true")]
    pub verify_crc: bool,

    /// Per-part request timeout in seconds
    #[serde(default)]
    pub part_timeout_secs: Option<u64>,

    /// Directory holding checkpoint records (default: `~/.ossx/checkpoints`)
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
            upload_concurrency: DEFAULT_CONCURRENCY,
            download_concurrency: DEFAULT_CONCURRENCY,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multiget_threshold: DEFAULT_MULTIGET_THRESHOLD,
            verify_crc: true,
            part_timeout_secs: None,
            checkpoint_dir: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TransferConfig = toml::from_str(contents)
            .map_err(|e| TransferError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            TransferError::InvalidConfig(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(TransferError::InvalidConfig(
                "part_size must be greater than 0".to_string(),
            ));
        }
        if self.min_part_size == 0 {
            return Err(TransferError::InvalidConfig(
                "min_part_size must be greater than 0".to_string(),
            ));
        }
        if self.max_parts == 0 {
            return Err(TransferError::InvalidConfig(
                "max_parts must be greater than 0".to_string(),
            ));
        }
        if self.upload_concurrency == 0 || self.download_concurrency == 0 {
            return Err(TransferError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.part_timeout_secs == Some(0) {
            return Err(TransferError::InvalidConfig(
                "part_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn part_limits(&self) -> PartLimits {
        PartLimits {
            min_part_size: self.min_part_size,
            max_parts: self.max_parts,
            default_part_size: self.part_size,
        }
    }
}

/// Constraints handed to the part planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    pub min_part_size: u64,
    pub max_parts: u32,
    pub default_part_size: u64,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
            default_part_size: DEFAULT_PART_SIZE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of compact logs to stdout
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_min_part_size() -> u64 {
    DEFAULT_MIN_PART_SIZE
}

fn default_max_parts() -> u32 {
    DEFAULT_MAX_PARTS
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_multipart_threshold() -> u64 {
    DEFAULT_MULTIPART_THRESHOLD
}

fn default_multiget_threshold() -> u64 {
    DEFAULT_MULTIGET_THRESHOLD
}

/// Per-call options for one upload or download
///
/// Options are an immutable value handed to each call, so concurrent
/// transfers can run with different settings.
///
/// # Example
///
/// ```
/// use ossx::config::TransferOptions;
///
/// let options = TransferOptions::default()
///     .with_part_size(8 * 1024 * 1024)
///     .with_concurrency(8)
///     .with_progress(|done, total| println!("{done}/{total}"));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct TransferOptions {
    /// Explicit part size; auto-determined when unset
    pub part_size: Option<u64>,
    pub limits: PartLimits,
    pub concurrency: usize,
    /// Single-request cutoff; the direction's default applies when unset
    pub threshold: Option<u64>,
    pub verify_crc: bool,
    pub part_timeout: Option<Duration>,
    /// Store override; otherwise `checkpoint_dir` or the default location
    pub checkpoint_store: Option<Arc<CheckpointStore>>,
    pub checkpoint_dir: Option<PathBuf>,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: None,
            limits: PartLimits::default(),
            concurrency: DEFAULT_CONCURRENCY,
            threshold: None,
            verify_crc: true,
            part_timeout: None,
            checkpoint_store: None,
            checkpoint_dir: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("part_size", &self.part_size)
            .field("limits", &self.limits)
            .field("concurrency", &self.concurrency)
            .field("threshold", &self.threshold)
            .field("verify_crc", &self.verify_crc)
            .field("part_timeout", &self.part_timeout)
            .field("checkpoint_store", &self.checkpoint_store)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TransferOptions {
    /// Options for uploads derived from a config file
    pub fn for_upload(config: &TransferConfig) -> Self {
        Self {
            concurrency: config.upload_concurrency,
            threshold: Some(config.multipart_threshold),
            ..Self::from_config(config)
        }
    }

    /// Options for downloads derived from a config file
    pub fn for_download(config: &TransferConfig) -> Self {
        Self {
            concurrency: config.download_concurrency,
            threshold: Some(config.multiget_threshold),
            ..Self::from_config(config)
        }
    }

    fn from_config(config: &TransferConfig) -> Self {
        Self {
            limits: config.part_limits(),
            verify_crc: config.verify_crc,
            part_timeout: config.part_timeout_secs.map(Duration::from_secs),
            checkpoint_dir: config.checkpoint_dir.clone(),
            ..Self::default()
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_limits(mut self, limits: PartLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_verify_crc(mut self, verify: bool) -> Self {
        self.verify_crc = verify;
        self
    }

    pub fn with_part_timeout(mut self, timeout: Duration) -> Self {
        self.part_timeout = Some(timeout);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(TransferError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.part_size == Some(0) {
            return Err(TransferError::InvalidConfig(
                "part_size must be greater than 0".to_string(),
            ));
        }
        if self.limits.min_part_size == 0 || self.limits.max_parts == 0 {
            return Err(TransferError::InvalidConfig(
                "part limits must be non-zero".to_string(),
            ));
        }
        if self.part_timeout == Some(Duration::ZERO) {
            return Err(TransferError::InvalidConfig(
                "part_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the checkpoint store for this call
    pub fn resolve_checkpoint_store(&self) -> Result<Arc<CheckpointStore>> {
        if let Some(store) = &self.checkpoint_store {
            return Ok(Arc::clone(store));
        }
        let store = match &self.checkpoint_dir {
            Some(dir) => CheckpointStore::in_directory(dir)?,
            None => CheckpointStore::default_location()?,
        };
        Ok(Arc::new(store))
    }
}
