// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

use aosl_engine::config::{LogConfig, LogFormat, LogLevel};
use aosl_engine::logging::init_logging;

#[test]
fn test_global_subscriber_installs_once() {
    let config = LogConfig { console_enable: true, level: LogLevel::Debug, format: LogFormat::Json };
    init_logging(&config).unwrap();
    tracing::info!(target: "aosl", "logging ready");

    // A second global subscriber is refused.
    assert!(init_logging(&LogConfig::default()).is_err());
}
