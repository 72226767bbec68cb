//! Tracing subscriber setup for applications embedding the core.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Default filter directive when `RUST_LOG` is unset (e.g. "info", "dossier=debug")
    pub level: String,
    /// Emit one JSON object per event instead of compact text
    pub json: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl From<&LoggingSection> for LoggingOptions {
    fn from(section: &LoggingSection) -> Self {
        Self {
            level: section.level.clone(),
            json: section.json,
        }
    }
}

/// `RUST_LOG` if set and valid, otherwise `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level directive '{}'", level)),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(options: &LoggingOptions) -> Result<()> {
    let filter = env_filter(&options.level)?;

    if options.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .context("Failed to install JSON tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }
    Ok(())
}
