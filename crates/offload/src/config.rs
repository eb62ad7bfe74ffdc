//! Configuration management.
//!
//! Settings are loaded with the `config` crate from an optional TOML file,
//! then overlaid with `OFFLOAD__*` environment variables
//! (`OFFLOAD__ROUTINE__LEN=1024`, `OFFLOAD__DEVICE__MEMORY_LIMIT_BYTES=...`).
//!
//! ```toml
//! backend = "cpu"
//!
//! [routine]
//! len = 1048576
//! launch = "single-thread"
//! sync_timeout_ms = 30000
//!
//! [device]
//! execution_units = 8
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::vector_add::{VectorAddOptions, DEFAULT_LEN, DEFAULT_SYNC_TIMEOUT};
use crate::{Backend, LaunchPolicy, Offload, OffloadError, Result};

const ENV_PREFIX: &str = "OFFLOAD";
const ENV_SEPARATOR: &str = "__";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Backend to use (auto, cpu, cuda).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Vector-add routine configuration.
    #[serde(default)]
    pub routine: RoutineConfig,

    /// Device configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_backend() -> String {
    "auto".to_string()
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            routine: RoutineConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Vector-add routine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineConfig {
    /// Vector length.
    #[serde(default = "default_len")]
    pub len: usize,

    /// Launch policy (single-thread, parallel).
    #[serde(default = "default_launch")]
    pub launch: String,

    /// Threads per block for the parallel policy.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Bound on the synchronize wait in milliseconds; 0 waits forever.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Check the result on the host after synchronize.
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_len() -> usize {
    DEFAULT_LEN
}

fn default_launch() -> String {
    "single-thread".to_string()
}

fn default_block_size() -> u32 {
    offload_core::launch::DEFAULT_BLOCK_SIZE
}

fn default_sync_timeout() -> u64 {
    DEFAULT_SYNC_TIMEOUT.as_millis() as u64
}

fn default_verify() -> bool {
    true
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            len: default_len(),
            launch: default_launch(),
            block_size: default_block_size(),
            sync_timeout_ms: default_sync_timeout(),
            verify: default_verify(),
        }
    }
}

/// Device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Execution units; host parallelism when unset.
    #[serde(default)]
    pub execution_units: Option<usize>,

    /// Device memory capacity in bytes; unbounded when unset.
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

impl OffloadConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(environment());

        builder.build()?.try_deserialize()
    }

    /// Create from environment variables only.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder().add_source(environment());

        builder.build()?.try_deserialize()
    }

    /// Load configuration from a TOML string.
    pub fn load_from_str(content: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(environment());

        builder.build()?.try_deserialize()
    }

    /// Parsed backend.
    pub fn backend(&self) -> Result<Backend> {
        self.backend.parse()
    }

    /// Parsed launch policy, with the configured block size applied.
    pub fn launch_policy(&self) -> Result<LaunchPolicy> {
        let policy: LaunchPolicy = self.routine.launch.parse()?;
        Ok(policy.with_block_size(self.routine.block_size))
    }

    /// Synchronize bound, `None` when unbounded.
    pub fn sync_timeout(&self) -> Option<Duration> {
        match self.routine.sync_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.routine.len == 0 {
            return Err(OffloadError::InvalidConfig(
                "routine.len must be greater than 0".to_string(),
            ));
        }

        if self.routine.block_size == 0 {
            return Err(OffloadError::InvalidConfig(
                "routine.block_size must be greater than 0".to_string(),
            ));
        }

        if self.device.execution_units == Some(0) {
            return Err(OffloadError::InvalidConfig(
                "device.execution_units must be greater than 0".to_string(),
            ));
        }

        self.backend()?;
        self.launch_policy()?;
        Ok(())
    }

    /// Options for [`crate::vector_add::run`].
    pub fn routine_options(&self) -> Result<VectorAddOptions> {
        Ok(VectorAddOptions {
            len: self.routine.len,
            policy: self.launch_policy()?,
            sync_timeout: self.sync_timeout(),
            verify: self.routine.verify,
        })
    }

    /// Build the runtime this configuration describes.
    pub async fn build_runtime(&self) -> Result<Offload> {
        let mut builder = Offload::builder().backend(self.backend()?);
        if let Some(units) = self.device.execution_units {
            builder = builder.execution_units(units);
        }
        if let Some(bytes) = self.device.memory_limit_bytes {
            builder = builder.memory_limit(bytes);
        }
        builder.build().await
    }
}
