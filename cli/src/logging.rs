// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tracing subscriber setup.
//!
//! Level and format come from the command line (or `MESHBUS_LOG_LEVEL` /
//! `MESHBUS_LOG_FORMAT`) first, then from `spec.observability.logging` of the
//! configuration, then from the defaults `info` / `text`. `RUST_LOG` still
//! wins over the resolved level when it is set.

use anyhow::{Context, Result};
use std::path::PathBuf;

use meshbus_core::domain::mesh_config::MeshConfigManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "compact" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown log format '{}' (expected text or json)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

/// Resolves the effective settings. The config file is only read when one of
/// the two values was not given explicitly.
pub fn resolve(level: Option<String>, format: Option<String>, config_path: Option<PathBuf>) -> Result<LogSettings> {
    let from_config = if level.is_none() || format.is_none() {
        MeshConfigManifest::load_or_default(config_path)
            .ok()
            .and_then(|config| config.spec.observability)
            .and_then(|observability| observability.logging)
    } else {
        None
    };

    let level = level
        .or_else(|| from_config.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = match format.or_else(|| from_config.map(|l| l.format)) {
        Some(format) => LogFormat::parse(&format)?,
        None => LogFormat::Text,
    };

    Ok(LogSettings { level, format })
}

/// Initialize tracing subscriber for logging
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&settings.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match settings.format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}
