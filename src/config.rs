//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/psi.toml` (base configuration)
//! 2. Environment variables prefixed with `RUST_PSI_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use rust_psi::config::PsiConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // RUST_PSI_SWEEP__REPETITIONS=4 overrides [sweep] repetitions
//! let config = PsiConfig::load()?;
//! config.validate()?;
//! println!("Engine runs at {} Hz", config.engine.fs);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub use crate::calibration::ToneSweepConfig;
pub use crate::engine::mock::{AiChannelConfig, AoChannelConfig};
pub use crate::engine::MockEngineConfig;
use crate::logging::OutputFormat;
use crate::output::DEFAULT_BLOCK_DURATION;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/psi.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RUST_PSI_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsiConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Engine and channel definitions
    #[serde(default)]
    pub engine: MockEngineConfig,
    /// Output driver settings
    #[serde(default)]
    pub output: OutputConfig,
    /// Tone sweep parameters
    #[serde(default)]
    pub sweep: ToneSweepConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Output driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Largest block written per driver refill (s)
    #[serde(default = "default_block_duration")]
    pub block_duration: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_block_duration() -> f64 {
    DEFAULT_BLOCK_DURATION
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            block_duration: default_block_duration(),
        }
    }
}

impl Default for PsiConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "rust_psi".to_string(),
                log_level: default_log_level(),
                log_format: default_log_format(),
            },
            engine: MockEngineConfig::default(),
            output: OutputConfig::default(),
            sweep: ToneSweepConfig::default(),
        }
    }
}

impl PsiConfig {
    /// Load configuration from `config/psi.toml` and environment variables.
    ///
    /// Environment variables override the file, for example
    /// `RUST_PSI_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        self.application
            .log_format
            .parse::<OutputFormat>()
            .map_err(|e| format!("Invalid application: {e}"))?;

        self.engine
            .validate()
            .map_err(|e| format!("Invalid engine: {e}"))?;

        if !(self.engine.buffer_duration.is_finite() && self.engine.buffer_duration > 0.0) {
            return Err(format!(
                "Invalid buffer_duration {}. Must be positive",
                self.engine.buffer_duration
            ));
        }

        if !(self.output.block_duration.is_finite() && self.output.block_duration > 0.0) {
            return Err(format!(
                "Invalid block_duration {}. Must be positive",
                self.output.block_duration
            ));
        }

        self.sweep
            .validate()
            .map_err(|e| format!("Invalid sweep: {e}"))?;

        Ok(())
    }

    /// Sweep parameters, refilling in `output.block_duration` blocks unless
    /// the sweep sets its own.
    pub fn sweep_config(&self) -> ToneSweepConfig {
        let mut sweep = self.sweep.clone();
        sweep.block_duration.get_or_insert(self.output.block_duration);
        sweep
    }

    /// Render as TOML, e.g. to show the effective configuration.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PsiConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = PsiConfig::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.contains("Invalid log_level 'loud'"));

        let mut config = PsiConfig::default();
        config.application.log_format = "xml".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log format 'xml'"));
    }

    #[test]
    fn test_engine_errors_surface() {
        let mut config = PsiConfig::default();
        config.engine = MockEngineConfig::loopback(0.0, "speaker", "mic");
        assert!(config.validate().unwrap_err().starts_with("Invalid engine"));

        let mut config = PsiConfig::default();
        config.engine = MockEngineConfig::loopback(10_000.0, "speaker", "mic");
        config.engine.ai_channels[0].loopback = Some("headphone".to_string());
        assert!(config.validate().unwrap_err().contains("headphone"));
    }

    #[test]
    fn test_block_duration_must_be_positive() {
        let mut config = PsiConfig::default();
        config.output.block_duration = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_inherits_block_duration() {
        let mut config = PsiConfig::default();
        config.output.block_duration = 0.25;
        assert_eq!(config.sweep_config().block_duration, Some(0.25));
        config.sweep.block_duration = Some(0.05);
        assert_eq!(config.sweep_config().block_duration, Some(0.05));
    }

    #[test]
    fn test_toml_rendering_parses_back() {
        let mut config = PsiConfig::default();
        config.engine = MockEngineConfig::loopback(10_000.0, "speaker", "mic");
        let text = config.to_toml().unwrap();
        let parsed: PsiConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine.ai_channels[0].loopback.as_deref(), Some("speaker"));
    }
}
