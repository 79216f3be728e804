//! `tracing` subscriber setup for binaries embedding the engine.
//!
//! The library itself only emits events; nothing here runs implicitly.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, with file and line.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
    Compact,
}

impl LogFormat {
    /// Case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| ConfigError::Invalid {
            field: "logging.format",
            reason: format!("unknown log format '{value}'"),
        })
    }
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(level).map_err(|error| ConfigError::Invalid {
        field: "logging.level",
        reason: error.to_string(),
    })
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// # Errors
///
/// Returns [`ConfigError`] when `level` is not a valid filter directive or
/// a global subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), ConfigError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(level)?,
    };

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .try_init(),
    };
    installed.map_err(|error| ConfigError::Logging(error.to_string()))?;

    tracing::info!(format = ?format, level, "logging initialized");
    Ok(())
}
