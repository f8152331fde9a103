//! CLI entry point for rust_psi
//!
//! Provides command-line access to:
//! - Output sensitivity sweeps on the configured (mock) engine
//! - Configuration validation
//!
//! # Usage
//!
//! Run a sweep and print a table:
//! ```bash
//! rust_psi sweep --config config/psi.toml --frequency 1000 --frequency 2000
//! ```
//!
//! Check a configuration file:
//! ```bash
//! rust_psi check-config config/psi.toml
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_psi::calibration::{tone_sens, ToneMeasurement, ToneTable};
use rust_psi::config::{PsiConfig, DEFAULT_CONFIG_PATH};
use rust_psi::engine::MockEngine;
use rust_psi::logging;
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "rust_psi")]
#[command(about = "Stimulus output and tone calibration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure output sensitivity with a tone sweep
    Sweep {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Tone frequency in Hz (repeatable)
        #[arg(long = "frequency", default_values_t = [500.0, 1000.0, 2000.0, 4000.0, 8000.0])]
        frequencies: Vec<f64>,

        /// Output channel (defaults to the first configured output)
        #[arg(long)]
        output: Option<String>,

        /// Input channel (repeatable; defaults to every configured input)
        #[arg(long = "input")]
        inputs: Vec<String>,

        /// Result format
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },

    /// Validate a configuration file and print the effective configuration
    CheckConfig {
        /// Configuration file
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Table,
}

#[derive(Serialize)]
struct RowReport<'a> {
    channel: &'a str,
    frequency: f64,
    #[serde(flatten)]
    measurement: Option<&'a ToneMeasurement>,
    error: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sweep {
            config,
            frequencies,
            output,
            inputs,
            format,
        } => run_sweep(config, &frequencies, output, inputs, format),
        Commands::CheckConfig { file } => check_config(file),
    }
}

fn load_config(path: &PathBuf) -> Result<PsiConfig> {
    let config = PsiConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn run_sweep(
    path: PathBuf,
    frequencies: &[f64],
    output: Option<String>,
    inputs: Vec<String>,
    format: Format,
) -> Result<()> {
    let config = load_config(&path)?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let output = match output {
        Some(name) => name,
        None => config
            .engine
            .ao_channels
            .first()
            .map(|c| c.name.clone())
            .context("No analog output configured")?,
    };
    let inputs = if inputs.is_empty() {
        config.engine.ai_channels.iter().map(|c| c.name.clone()).collect()
    } else {
        inputs
    };
    if inputs.is_empty() {
        bail!("No analog input configured");
    }
    let input_refs: Vec<&str> = inputs.iter().map(String::as_str).collect();

    let engine = MockEngine::new(config.engine.clone()).context("Failed to create engine")?;
    info!(output = %output, inputs = ?inputs, "Running sensitivity sweep");
    let table = tone_sens(&engine, frequencies, &output, &input_refs, &config.sweep_config())
        .context("Sweep failed")?;

    match format {
        Format::Json => print_json(&table)?,
        Format::Table => print_table(&table),
    }
    Ok(())
}

fn print_json(table: &ToneTable) -> Result<()> {
    let rows: Vec<RowReport<'_>> = table
        .rows()
        .iter()
        .map(|row| RowReport {
            channel: &row.channel,
            frequency: row.frequency,
            measurement: row.result.as_ref().ok(),
            error: row.result.as_ref().err().map(ToString::to_string),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn print_table(table: &ToneTable) {
    println!(
        "{:<12} {:>10} {:>12} {:>8} {:>8} {:>8} {:>10} {:>10}",
        "channel", "freq (Hz)", "rms (V)", "snr", "thd (%)", "spl", "norm_spl", "sens"
    );
    for row in table.rows() {
        match &row.result {
            Ok(m) => println!(
                "{:<12} {:>10.1} {:>12.6} {:>8.2} {:>8.3} {:>8.2} {:>10.2} {:>10.2}",
                row.channel, row.frequency, m.rms, m.snr, m.thd, m.spl, m.norm_spl, m.sens
            ),
            Err(e) => println!("{:<12} {:>10.1} rejected: {}", row.channel, row.frequency, e),
        }
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    println!("✅ {} is valid", path.display());
    println!();
    print!("{}", config.to_toml().context("Failed to render configuration")?);
    Ok(())
}
