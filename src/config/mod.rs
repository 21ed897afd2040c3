//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{RawSwrConfig, SwrConfig};
use crate::infra::error::SwrError;

const LOCAL_CONFIG_BASENAME: &str = "swr";
const ENV_PREFIX: &str = "SWR";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub swr: SwrConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

impl From<LoadError> for SwrError {
    fn from(err: LoadError) -> Self {
        SwrError::configuration(err.to_string())
    }
}

/// Load settings using the configured precedence (file → environment).
///
/// `swr.toml` in the working directory is read when present. An explicit
/// `path` must exist. Environment variables use the `SWR__` prefix with `__`
/// between sections, e.g. `SWR__SWR__ERROR_RETRY_COUNT=2`.
pub fn load(path: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            swr: build_swr_settings(raw.swr)?,
            logging: build_logging_settings(raw.logging)?,
        })
    }
}

fn build_swr_settings(swr: RawSwrConfig) -> Result<SwrConfig, LoadError> {
    if swr.invalidated_cache_ttl_ms == 0 {
        return Err(LoadError::invalid(
            "swr.invalidated_cache_ttl_ms",
            "must be greater than zero",
        ));
    }

    if swr.should_retry_on_error && swr.error_retry_count > 0 && swr.error_retry_interval_ms == 0 {
        return Err(LoadError::invalid(
            "swr.error_retry_interval_ms",
            "must be greater than zero when retries are enabled",
        ));
    }

    Ok(SwrConfig::from_raw(swr))
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    swr: RawSwrConfig,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
