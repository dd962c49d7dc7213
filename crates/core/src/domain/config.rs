//! Configuration management for eq8comp
//!
//! This module provides:
//! - Configuration structs for the state owner, telemetry and pipelines
//! - TOML loading/saving
//! - A manager for the main config file with corrupt-file recovery

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// State owner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Rate limiter window for persistence and broadcasts
    pub broadcast_window_ms: u64,

    /// Delay between attempts to read persisted state
    pub storage_retry_ms: u64,

    /// Read attempts before giving up (0 = retry forever)
    pub storage_retry_attempts: u32,

    /// State file (None = `<config_dir>/state.json`)
    pub state_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_window_ms: 50,
            storage_retry_ms: 1000,
            storage_retry_attempts: 30,
            state_path: None,
        }
    }
}

impl StoreConfig {
    pub fn broadcast_window(&self) -> Duration {
        Duration::from_millis(self.broadcast_window_ms)
    }

    pub fn storage_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_retry_ms)
    }
}

/// Telemetry sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Sampling period
    pub interval_ms: u64,

    /// Frames buffered towards a slow consumer before ticks are dropped
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20,
            channel_capacity: 8,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-page pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay between attempts to resume a suspended context
    pub resume_retry_ms: u64,

    /// Analyser FFT size (power of two)
    pub fft_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resume_retry_ms: 1000,
            fft_size: 2048,
        }
    }
}

impl PipelineConfig {
    pub fn resume_retry(&self) -> Duration {
        Duration::from_millis(self.resume_retry_ms)
    }
}

/// Complete eq8comp configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Eq8Config {
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
    pub pipeline: PipelineConfig,
}

impl Eq8Config {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.store.broadcast_window_ms == 0 {
            return Err(ConfigError::Invalid("store.broadcast_window_ms must be > 0".to_string()));
        }
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::Invalid("telemetry.interval_ms must be > 0".to_string()));
        }
        if self.telemetry.channel_capacity == 0 {
            return Err(ConfigError::Invalid("telemetry.channel_capacity must be > 0".to_string()));
        }
        if self.pipeline.resume_retry_ms == 0 {
            return Err(ConfigError::Invalid("pipeline.resume_retry_ms must be > 0".to_string()));
        }
        let fft = self.pipeline.fft_size;
        if !(32..=32768).contains(&fft) || !fft.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "pipeline.fft_size must be a power of two in 32..=32768, got {}",
                fft
            )));
        }
        Ok(())
    }
}

/// Manager for the main config file
///
/// Manages `config.toml` inside the config directory (`~/.config/eq8comp` on
/// Linux) and resolves the default state file location next to it.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit config file path
    pub fn for_file(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("eq8comp"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Where the state record lives unless the config overrides it
    pub fn state_path(&self, config: &Eq8Config) -> PathBuf {
        config
            .store
            .state_path
            .clone()
            .unwrap_or_else(|| self.config_dir.join("state.json"))
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns defaults.
    /// If the config file is corrupt, backs it up and returns defaults.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Eq8Config {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating default"
            );

            let config = Eq8Config::default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default config"
                );
            }
            return config;
        }

        match Eq8Config::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                Eq8Config::default()
            }
        }
    }
}
