//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the alarm-config.toml file.
//! It covers GPIO wiring, queue and worker sizing, and the alarm settings the
//! clock starts with.
//!
//! Every section and field has a default, so a partial file only overrides what
//! it names:
//!
//! ```toml
//! [encoder]
//! pin_a = 4
//! pin_b = 17
//!
//! [alarm]
//! hour = 7
//! minute = 15
//! wake_command = ["/usr/local/bin/lights-on"]
//! ```

use crate::dispatcher::DispatchLimits;
use crate::encoder::EncoderSettings;
use crate::scheduler::{AlarmConfig, SchedulerError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest accepted knob step, half a day either way
pub const MAX_STEP_MINUTES: i64 = 12 * 60;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "alarm-config.toml";

/// Errors from [`Config::load_strict`] and [`Config::save_to_path`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration loaded from alarm-config.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Encoder and button wiring
    pub encoder: EncoderConfig,
    /// Callback worker pool
    pub dispatch: DispatchConfig,
    /// Alarm settings at startup
    pub alarm: AlarmSettings,
}

/// Encoder wiring and edge handling
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// BCM number of channel A
    pub pin_a: u8,
    /// BCM number of channel B
    pub pin_b: u8,
    /// Whether a push button is wired
    pub use_button: bool,
    /// BCM number of the button (active low, pulled up)
    pub button_pin: u8,
    /// Edges buffered between interrupt and decoder
    pub queue_capacity: usize,
    /// Decode loop wake-up interval when idle
    pub poll_timeout_ms: u64,
    /// Presses closer together than this are treated as bounce
    pub button_holdoff_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            pin_a: 4,
            pin_b: 17,
            use_button: true,
            button_pin: 27,
            queue_capacity: 1000,
            poll_timeout_ms: 500,
            button_holdoff_ms: 50,
        }
    }
}

/// Callback worker pool sizing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let limits = DispatchLimits::default();
        Self {
            workers: limits.workers,
            queue_capacity: limits.queue_capacity,
        }
    }
}

/// Alarm settings the clock starts with
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlarmSettings {
    pub hour: u32,
    pub minute: u32,
    pub active: bool,
    /// Fire on Saturday and Sunday too
    pub include_weekends: bool,
    /// Minutes the alarm moves per encoder click
    pub step_minutes: i64,
    /// Program and arguments run when the alarm fires; empty only logs
    pub wake_command: Vec<String>,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            hour: 6,
            minute: 30,
            active: true,
            include_weekends: true,
            step_minutes: 5,
            wake_command: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from alarm-config.toml file
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::load_strict(&path) {
            Ok(config) => {
                info!(
                    "Loaded configuration from {} (alarm {:02}:{:02})",
                    path.as_ref().display(),
                    config.alarm.hour,
                    config.alarm.minute
                );
                config
            }
            Err(ConfigError::Io { .. }) => {
                info!("No config file found, using default configuration");
                Self::default()
            }
            Err(e) => {
                warn!("{}", e);
                warn!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Load configuration, failing if the file is missing or invalid
    pub fn load_strict<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.encoder.queue_capacity == 0 {
            return Err(invalid("encoder.queue_capacity", "must be at least 1"));
        }
        if self.encoder.poll_timeout_ms == 0 {
            return Err(invalid("encoder.poll_timeout_ms", "must be at least 1"));
        }
        if self.dispatch.workers == 0 {
            return Err(invalid("dispatch.workers", "must be at least 1"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(invalid("dispatch.queue_capacity", "must be at least 1"));
        }
        if !(1..=MAX_STEP_MINUTES).contains(&self.alarm.step_minutes) {
            return Err(invalid(
                "alarm.step_minutes",
                format!("{} is outside 1..={}", self.alarm.step_minutes, MAX_STEP_MINUTES),
            ));
        }
        if let Err(e) = self.alarm_config() {
            return Err(invalid("alarm", e.to_string()));
        }
        Ok(())
    }

    /// Save current configuration to alarm-config.toml
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(DEFAULT_CONFIG_FILE)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Initial alarm settings; fails on an out-of-range hour or minute
    pub fn alarm_config(&self) -> Result<AlarmConfig, SchedulerError> {
        AlarmConfig::new(
            self.alarm.hour,
            self.alarm.minute,
            self.alarm.active,
            self.alarm.include_weekends,
        )
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            queue_capacity: self.encoder.queue_capacity,
            poll_timeout: Duration::from_millis(self.encoder.poll_timeout_ms),
            use_button: self.encoder.use_button,
            button_holdoff: Duration::from_millis(self.encoder.button_holdoff_ms),
            dispatch: DispatchLimits {
                workers: self.dispatch.workers,
                queue_capacity: self.dispatch.queue_capacity,
            },
        }
    }
}
