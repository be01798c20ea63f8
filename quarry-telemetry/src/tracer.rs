//! Tracing Subscriber Initialization
//!
//! Maps the adapter's `log` categories and `errorFormat` onto a
//! `tracing-subscriber` registry. `RUST_LOG`, when set, replaces the
//! derived filter entirely.

use std::collections::BTreeSet;

use quarry_core::{AdapterConfig, ErrorFormat, LogLevel, QuarryError, QuarryResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that switches output to JSON lines.
pub const LOG_JSON_ENV: &str = "QUARRY_LOG_JSON";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub levels: BTreeSet<LogLevel>,
    pub format: ErrorFormat,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_adapter(&AdapterConfig::default())
    }
}

impl LogConfig {
    /// Take levels and format from `config`; `json` comes from
    /// `QUARRY_LOG_JSON`.
    pub fn from_adapter(config: &AdapterConfig) -> Self {
        Self {
            levels: config.log.clone(),
            format: config.error_format,
            json: std::env::var(LOG_JSON_ENV)
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }

    /// Filter directives for the configured levels.
    ///
    /// The most verbose of `info`/`warn`/`error` becomes the default level
    /// (`off` if none is set). `query` enables debug output for
    /// `quarry::query` on top of that.
    pub fn directives(&self) -> String {
        let base = if self.levels.contains(&LogLevel::Info) {
            "info"
        } else if self.levels.contains(&LogLevel::Warn) {
            "warn"
        } else if self.levels.contains(&LogLevel::Error) {
            "error"
        } else {
            "off"
        };
        if self.levels.contains(&LogLevel::Query) {
            format!("{},quarry::query=debug", base)
        } else {
            base.to_string()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> QuarryResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        match config.format {
            ErrorFormat::Pretty => registry.with(fmt::layer().pretty().with_ansi(true)).try_init(),
            ErrorFormat::Colorless => registry.with(fmt::layer().with_ansi(false)).try_init(),
            ErrorFormat::Minimal => registry
                .with(fmt::layer().compact().with_ansi(false).with_target(false))
                .try_init(),
        }
    };
    result.map_err(|e| QuarryError::config(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        levels = %config.directives(),
        format = ?config.format,
        json = config.json,
        "Logging initialized"
    );
    Ok(())
}
