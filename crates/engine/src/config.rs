// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Layered runtime configuration.
//!
//! Values come from the built-in defaults, then an optional TOML file, then
//! `AOSL_`-prefixed environment variables (`AOSL_WORKER_POOL__SIZE=8`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::constants::{
    DEFAULT_IO_THREAD_NAME, DEFAULT_IO_WORKER_THREADS, DEFAULT_MAIN_QUEUE_NAME,
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_QUEUE_BACKLOG_WARN, DEFAULT_TIMER_MIN_INTERVAL_MS,
    DEFAULT_WORKER_POOL_NAME, DEFAULT_WORKER_POOL_SIZE,
};

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { console_enable: true, level: LogLevel::default(), format: LogFormat::default() }
    }
}

const fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MainQueueConfig {
    pub name: String,
}

impl Default for MainQueueConfig {
    fn default() -> Self {
        Self { name: DEFAULT_MAIN_QUEUE_NAME.to_string() }
    }
}

/// Per-queue settings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Pending count that triggers backlog warnings (0 disables them).
    pub backlog_warn: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { backlog_warn: DEFAULT_QUEUE_BACKLOG_WARN }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { name: DEFAULT_WORKER_POOL_NAME.to_string(), size: DEFAULT_WORKER_POOL_SIZE }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
    pub worker_threads: usize,
    pub thread_name: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_IO_WORKER_THREADS,
            thread_name: DEFAULT_IO_THREAD_NAME.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    pub min_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { min_interval_ms: DEFAULT_TIMER_MIN_INTERVAL_MS }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PacketConfig {
    pub max_packet_size: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self { max_packet_size: DEFAULT_MAX_PACKET_SIZE }
    }
}

/// Root configuration for the process-wide runtime.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub main_queue: MainQueueConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker_pool: PoolConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub packet: PacketConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Result of loading configuration, with an optional note that the file was absent.
#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: EngineConfig,
    pub file_missing: Option<String>,
}

/// Loads configuration from defaults, an optional TOML file and the environment.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
pub fn load(config_path: Option<&str>) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));

    let mut file_missing = None;
    if let Some(path) = config_path {
        if std::path::Path::new(path).exists() {
            figment = figment.merge(Toml::file(path));
        } else {
            file_missing = Some(path.to_string());
        }
    }

    let config: EngineConfig =
        figment.merge(Env::prefixed("AOSL_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&EngineConfig::default())
}
