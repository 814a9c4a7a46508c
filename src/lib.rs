pub mod capture;
pub mod error;
pub mod pipeline;
pub mod sdk;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use error::{CaptureError, ResourceCleanupWarning, Result};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device_index: u32,
    pub wait_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub join_timeout_ms: u64,
    pub single_shot_timeout_ms: u64,
    /// Consecutive failures before a `Degraded` event
    pub degraded_threshold: u64,
    pub worker_core: Option<usize>, // CPU pinning for the capture worker
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            wait_timeout_ms: 1000,
            retry_backoff_ms: 100,
            join_timeout_ms: 5000,
            single_shot_timeout_ms: 10_000,
            degraded_threshold: 5,
            worker_core: None,
            snapshot_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "dhyana=debug".into(),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `DHYANA__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("DHYANA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
