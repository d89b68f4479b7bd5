// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{LogConfig, LogFormat};

type DynLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn env_filter_or_level(default_level: tracing::Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

fn make_console_layer(level: tracing::Level, format: LogFormat) -> DynLayer {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_thread_names(true)
            .with_filter(env_filter_or_level(level))
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_filter(env_filter_or_level(level))
            .boxed(),
    }
}

/// Initialize logging based on configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Queue threads are
/// named after their queue, so thread names are included in every line.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(log_config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut layers: Vec<DynLayer> = Vec::new();

    if log_config.console_enable {
        layers.push(make_console_layer(log_config.level.into(), log_config.format));
    }

    tracing_subscriber::registry().with(layers).try_init()?;

    tracing::debug!(level = ?log_config.level, format = ?log_config.format, "logging initialized");
    Ok(())
}
