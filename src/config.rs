//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the
//! gap-recovery.toml file. It provides a centralized way to configure the IWLS
//! endpoints, logger timeouts and run limits.
//!
//! Every section is optional; missing keys take their default values, so a
//! file holding only `[iwls] bearer_token = "..."` is valid.

use crate::gaps::{FrequencyError, SplitFrequency};
use crate::iwls::{IwlsClient, IwlsError, DEFAULT_TIME_SERIES_CODE};
use crate::pipeline::PipelineSettings;
use crate::sensor_map::{PushFileSensorMap, DEFAULT_CHANNEL_PREFIX, DEFAULT_SENSOR_PREFIX};
use crate::session::SessionTimeouts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "gap-recovery.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("lookback of {0} hours is out of range")]
    Lookback(i64),
}

/// Application configuration loaded from gap-recovery.toml
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Station list (`[[stations]]` tables)
    pub stations_file: PathBuf,
    pub iwls: IwlsConfig,
    pub logger: LoggerConfig,
    pub run: RunConfig,
}

/// IWLS REST endpoints
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IwlsConfig {
    /// Base of the station API, e.g. `https://.../api/v1`
    pub api_base: String,
    /// Full URL messages are posted to
    pub ingest_url: String,
    /// Sent as a bearer token when set
    pub bearer_token: Option<String>,
    /// Pause before each gap or time-series lookup
    pub request_delay_ms: u64,
    /// Time series searched for gaps (`wlo` = observed water level)
    pub time_series_code: String,
}

/// Data logger session settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Connect, login and initial prompt wait
    pub prompt_timeout_secs: u64,
    /// Wait for one query's reply
    pub query_timeout_secs: u64,
    /// Longest window asked of the logger in one query (`1D`, `6H`, `30T`, ...)
    pub split_frequency: String,
    /// Read sensor maps from the push file for stations that name one
    pub push_file_sensor_map: bool,
    pub sensor_prefix: String,
    pub channel_prefix: String,
}

/// Limits for one run
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// How far back from now to look for gaps
    pub lookback_hours: i64,
    /// Logger sessions tried per station
    pub max_attempts: u32,
    pub max_rows_per_message: usize,
    /// Frame messages without posting them
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stations_file: PathBuf::from("stations.toml"),
            iwls: IwlsConfig::default(),
            logger: LoggerConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl Default for IwlsConfig {
    fn default() -> Self {
        IwlsConfig {
            api_base: "http://localhost:8080/api/v1".to_string(),
            ingest_url: "http://localhost:8080/rest/stations/integrateRawObservations".to_string(),
            bearer_token: None,
            request_delay_ms: 250,
            time_series_code: DEFAULT_TIME_SERIES_CODE.to_string(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            prompt_timeout_secs: 10,
            query_timeout_secs: 25,
            split_frequency: "1D".to_string(),
            push_file_sensor_map: false,
            sensor_prefix: DEFAULT_SENSOR_PREFIX.to_string(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            lookback_hours: 24,
            max_attempts: 3,
            max_rows_per_message: 1440,
            dry_run: false,
        }
    }
}

impl RunConfig {
    /// Start of the gap search window ending at `to`, at least one hour back.
    pub fn window_start(&self, to: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        chrono::Duration::try_hours(self.lookback_hours.max(1))
            .and_then(|lookback| to.checked_sub_signed(lookback))
            .ok_or(ConfigError::Lookback(self.lookback_hours))
    }
}

impl Config {
    /// Load configuration from gap-recovery.toml
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), "invalid config file format: {e}");
                    warn!("using default configuration");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file found, using default configuration");
                Self::default()
            }
        }
    }

    /// Save current configuration to gap-recovery.toml
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(CONFIG_FILE)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            prompt: Duration::from_secs(self.logger.prompt_timeout_secs),
            query: Duration::from_secs(self.logger.query_timeout_secs),
        }
    }

    pub fn split_frequency(&self) -> Result<SplitFrequency, FrequencyError> {
        self.logger.split_frequency.parse()
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, FrequencyError> {
        Ok(PipelineSettings {
            timeouts: self.timeouts(),
            split_frequency: self.split_frequency()?,
            max_attempts: self.run.max_attempts.max(1),
            max_rows_per_message: self.run.max_rows_per_message.max(1),
            push_file_sensor_map: self.logger.push_file_sensor_map,
            dry_run: self.run.dry_run,
        })
    }

    pub fn push_file(&self) -> PushFileSensorMap {
        PushFileSensorMap {
            sensor_prefix: self.logger.sensor_prefix.clone(),
            channel_prefix: self.logger.channel_prefix.clone(),
        }
    }

    pub fn iwls_client(&self) -> Result<IwlsClient, IwlsError> {
        Ok(IwlsClient::new(&self.iwls.api_base, &self.iwls.ingest_url)?
            .with_bearer_token(self.iwls.bearer_token.clone())
            .with_request_delay(Duration::from_millis(self.iwls.request_delay_ms))
            .with_time_series_code(&self.iwls.time_series_code))
    }
}
