//! Application-wide error type.
//!
//! Each module defines its own `thiserror` enum close to the code that raises
//! it. `PsiError` consolidates them, along with configuration and I/O
//! failures, so callers that drive several modules can use `?` throughout:
//!
//! - **`Waveform`**: invalid stimulus parameters or reading past the end of a waveform.
//! - **`Queue`**: bad repetitions, unknown entries, mixed sampling rates.
//! - **`Engine`**: unknown channels, out-of-range buffer access, engine state.
//! - **`Input`**: zero-length epoch windows.
//! - **`Output`**: driver state-machine misuse, channel conflicts, underruns.
//! - **`Calibration`**: rejected tones and incomplete sweeps.
//! - **`Config`** / **`Configuration`**: unreadable or semantically invalid configuration.

use thiserror::Error;

use crate::calibration::CalibrationError;
use crate::engine::EngineError;
use crate::input::InputError;
use crate::output::OutputError;
use crate::queue::QueueError;
use crate::waveform::WaveformError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PsiError>;

/// Any error raised by the library.
#[derive(Error, Debug)]
pub enum PsiError {
    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Waveform construction or generation failure.
    #[error("Waveform error: {0}")]
    Waveform(#[from] WaveformError),

    /// Queue failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Epoch extractor construction failure.
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    /// Output driver failure.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// Tone analysis or sweep failure.
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}
