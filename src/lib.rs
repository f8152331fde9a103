//! # rust_psi
//!
//! Real-time stimulus output and epoch acquisition for trial-based
//! physiology and acoustics experiments.
//!
//! An [`Engine`](engine::Engine) owns the hardware sample buffers and calls
//! back when outputs need data or inputs have produced it. Output drivers
//! answer those callbacks with exactly the samples due next, generated from
//! declarative [`StimulusSpec`](waveform::StimulusSpec)s, and an
//! [`EpochExtractor`](input::EpochExtractor) cuts the acquired stream into
//! per-trial epochs for analysis.
//!
//! ```text
//! engine "needs data" ──▶ output driver ──▶ WaveformFactory / SignalQueue ──▶ engine buffer
//! engine "data ready" ──▶ EpochExtractor ──▶ epochs ──▶ ToneAnalyzer / callbacks
//! ```
//!
//! ## Crate Structure
//!
//! - **`waveform`**: stimulus descriptions, `WaveformFactory` and resumable `Generator`s.
//! - **`queue`**: `SignalQueue`, a repeatable playlist with inter-trial gaps and trial events.
//! - **`engine`**: the `Engine` capability trait and `MockEngine`, a loopback simulator.
//! - **`output`**: continuous, epoch, queued and digital output drivers.
//! - **`input`**: epoch extraction from the acquired stream.
//! - **`calibration`**: volt/SPL calibrations, tone analysis and calibration sweeps.
//! - **`config`**: Figment-based configuration loading.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the aggregate `PsiError`.

pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod logging;
pub mod output;
pub mod queue;
pub mod waveform;

pub use error::{AppResult, PsiError};
