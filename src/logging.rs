//! Tracing Infrastructure
//!
//! Structured logging for the engine, drivers and sweeps, built on `tracing`
//! and `tracing-subscriber`. Level and line format come from the
//! `[application]` section of [`PsiConfig`]; `RUST_LOG` overrides the level.
//!
//! Output drivers log per-refill detail at `trace`/`debug`, underruns at
//! `warn` and lifecycle changes at `info`, so `info` is quiet during playback.
//! Thread names are always printed because the mock engine clock runs on its
//! own named thread.
//!
//! # Example
//! ```no_run
//! use rust_psi::{config::PsiConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PsiConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(name = %config.application.name, "Application started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::PsiConfig;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Most verbose level shown when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Print source file and line
    pub source_location: bool,
    /// Colors (pretty format only)
    pub ansi: bool,
}

impl TracingConfig {
    /// Settings at `level`, compact, colored, without source locations.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            source_location: false,
            ansi: true,
        }
    }

    /// Settings named by the `[application]` section.
    pub fn from_config(config: &PsiConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        let format = config.application.log_format.parse()?;
        Ok(Self::new(level).with_format(format))
    }

    /// Set the line format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colors.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }
}

/// Initialize tracing from the application configuration.
pub fn init_from_config(config: &PsiConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` when a subscriber is already installed, so tests and
/// embedding applications can call it more than once.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let base = fmt::layer()
        .with_thread_names(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location);
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.ansi).with_filter(filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => base.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse a level name, ignoring case.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}
