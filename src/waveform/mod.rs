//! Waveform factories and resumable generators.
//!
//! A [`WaveformFactory`] is an immutable description of a signal bound to an
//! output sampling rate and calibration. Each call to
//! [`WaveformFactory::generator`] returns a fresh [`Generator`] that yields
//! the signal in arbitrary chunk sizes; the concatenation of the chunks is
//! identical to generating everything in one call.
//!
//! # Signal kinds
//!
//! | Kind | Length | Level |
//! |------|--------|-------|
//! | Tone | optional duration | dB through the channel calibration at the tone frequency |
//! | Chirp | duration | dB, calibrated at the instantaneous frequency |
//! | Noise | optional duration | dB at the reference frequency, seeded Gaussian |
//! | Silence | optional duration | zeros |
//! | Samples | length of the buffer | as given |
//!
//! Tones accept a cosine-squared rise/fall ramp (see [`CosineRamp`]).

mod envelope;
mod generator;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::Calibration;

pub use envelope::CosineRamp;
pub use generator::Generator;

/// Errors raised while building or running a waveform.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaveformError {
    /// Frequency not representable at the output sampling rate.
    #[error("Frequency {frequency} Hz must be non-negative and below Nyquist ({nyquist} Hz)")]
    InvalidFrequency {
        /// Requested frequency (Hz)
        frequency: f64,
        /// Half the sampling rate (Hz)
        nyquist: f64,
    },

    /// A parameter is out of range.
    #[error("Invalid waveform parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// What is wrong with it
        message: String,
    },

    /// Samples were requested after the waveform finished.
    #[error("Waveform exhausted after {produced} samples")]
    Exhausted {
        /// Samples generated before completion
        produced: u64,
    },
}

/// Serializable description of a stimulus.
///
/// Levels are in dB as interpreted by the channel calibration: dB SPL for an
/// acoustic calibration, attenuation re the reference voltage for
/// [`FlatCalibration::as_attenuation`](crate::calibration::FlatCalibration::as_attenuation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StimulusSpec {
    /// Sinusoid.
    Tone {
        /// Frequency (Hz)
        frequency: f64,
        /// Level (dB)
        #[serde(default)]
        level: f64,
        /// Starting phase (radians)
        #[serde(default)]
        phase: f64,
        /// +1 or -1
        #[serde(default = "default_polarity")]
        polarity: i8,
        /// Length in seconds; unbounded when absent
        #[serde(default)]
        duration: Option<f64>,
        /// Cosine-squared ramp length at each end (s)
        #[serde(default)]
        rise_time: Option<f64>,
    },
    /// Linear frequency sweep.
    Chirp {
        /// Frequency at the first sample (Hz)
        start_frequency: f64,
        /// Frequency at the last sample (Hz)
        end_frequency: f64,
        /// Level (dB)
        #[serde(default)]
        level: f64,
        /// Length in seconds
        duration: f64,
    },
    /// Gaussian white noise.
    Noise {
        /// RMS level (dB)
        #[serde(default)]
        level: f64,
        /// Frequency at which the calibration is evaluated (Hz)
        #[serde(default = "default_noise_reference")]
        reference_frequency: f64,
        /// RNG seed; equal seeds give identical noise
        #[serde(default)]
        seed: u64,
        /// Length in seconds; unbounded when absent
        #[serde(default)]
        duration: Option<f64>,
    },
    /// Zeros.
    Silence {
        /// Length in seconds; unbounded when absent
        #[serde(default)]
        duration: Option<f64>,
    },
}

fn default_polarity() -> i8 {
    1
}

fn default_noise_reference() -> f64 {
    1000.0
}

impl StimulusSpec {
    /// Tone at `frequency` and `level` lasting `duration` seconds.
    pub fn tone(frequency: f64, level: f64, duration: f64) -> Self {
        Self::Tone {
            frequency,
            level,
            phase: 0.0,
            polarity: 1,
            duration: Some(duration),
            rise_time: None,
        }
    }

    /// Silence lasting `duration` seconds.
    pub fn silence(duration: f64) -> Self {
        Self::Silence {
            duration: Some(duration),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SignalKind {
    Tone {
        amplitude: f64,
        frequency: f64,
        phase: f64,
    },
    Chirp {
        start_frequency: f64,
        end_frequency: f64,
        level: f64,
        calibration: Arc<dyn Calibration>,
    },
    Noise {
        rms: f64,
        seed: u64,
    },
    Silence,
    Samples(Arc<[f64]>),
}

/// Immutable, shareable description of a waveform at a fixed sampling rate.
#[derive(Debug, Clone)]
pub struct WaveformFactory {
    fs: f64,
    kind: SignalKind,
    n_samples: Option<u64>,
    envelope: Option<CosineRamp>,
}

impl WaveformFactory {
    /// Bind `spec` to a sampling rate and channel calibration.
    pub fn new(
        spec: &StimulusSpec,
        fs: f64,
        calibration: Arc<dyn Calibration>,
    ) -> Result<Self, WaveformError> {
        check_rate(fs)?;

        match spec {
            StimulusSpec::Tone {
                frequency,
                level,
                phase,
                polarity,
                duration,
                rise_time,
            } => {
                check_frequency(*frequency, fs)?;
                if !matches!(polarity, 1 | -1) {
                    return Err(WaveformError::InvalidParameter {
                        name: "polarity",
                        message: format!("must be 1 or -1, got {polarity}"),
                    });
                }
                let n_samples = duration.map(|d| samples_for("duration", d, fs)).transpose()?;
                let envelope = match rise_time {
                    Some(rise) => Some(CosineRamp::new(samples_for("rise_time", *rise, fs)?, n_samples)?),
                    None => None,
                };
                let amplitude =
                    calibration.get_sf(*frequency, *level) * std::f64::consts::SQRT_2 * f64::from(*polarity);
                Ok(Self {
                    fs,
                    kind: SignalKind::Tone {
                        amplitude,
                        frequency: *frequency,
                        phase: *phase,
                    },
                    n_samples,
                    envelope,
                })
            }
            StimulusSpec::Chirp {
                start_frequency,
                end_frequency,
                level,
                duration,
            } => {
                check_frequency(*start_frequency, fs)?;
                check_frequency(*end_frequency, fs)?;
                Ok(Self {
                    fs,
                    kind: SignalKind::Chirp {
                        start_frequency: *start_frequency,
                        end_frequency: *end_frequency,
                        level: *level,
                        calibration,
                    },
                    n_samples: Some(samples_for("duration", *duration, fs)?),
                    envelope: None,
                })
            }
            StimulusSpec::Noise {
                level,
                reference_frequency,
                seed,
                duration,
            } => Ok(Self {
                fs,
                kind: SignalKind::Noise {
                    rms: calibration.get_sf(*reference_frequency, *level),
                    seed: *seed,
                },
                n_samples: duration.map(|d| samples_for("duration", d, fs)).transpose()?,
                envelope: None,
            }),
            StimulusSpec::Silence { duration } => Ok(Self {
                fs,
                kind: SignalKind::Silence,
                n_samples: duration.map(|d| samples_for("duration", d, fs)).transpose()?,
                envelope: None,
            }),
        }
    }

    /// Factory that plays back a fixed buffer.
    pub fn from_samples(samples: impl Into<Arc<[f64]>>, fs: f64) -> Result<Self, WaveformError> {
        check_rate(fs)?;
        let samples = samples.into();
        Ok(Self {
            fs,
            n_samples: Some(samples.len() as u64),
            kind: SignalKind::Samples(samples),
            envelope: None,
        })
    }

    /// Unbounded silence.
    pub fn silence(fs: f64) -> Result<Self, WaveformError> {
        check_rate(fs)?;
        Ok(Self {
            fs,
            kind: SignalKind::Silence,
            n_samples: None,
            envelope: None,
        })
    }

    /// Fresh generator positioned at the first sample.
    pub fn generator(&self) -> Generator {
        Generator::new(self.clone())
    }

    /// Sampling rate (Hz).
    pub fn fs(&self) -> f64 {
        self.fs
    }

    /// Total samples, or `None` for an unbounded waveform.
    pub fn n_samples(&self) -> Option<u64> {
        self.n_samples
    }

    /// Duration in seconds, or `None` for an unbounded waveform.
    pub fn duration(&self) -> Option<f64> {
        self.n_samples.map(|n| n as f64 / self.fs)
    }

    pub(crate) fn kind(&self) -> &SignalKind {
        &self.kind
    }

    pub(crate) fn envelope(&self) -> Option<&CosineRamp> {
        self.envelope.as_ref()
    }
}

fn check_rate(fs: f64) -> Result<(), WaveformError> {
    if fs.is_finite() && fs > 0.0 {
        Ok(())
    } else {
        Err(WaveformError::InvalidParameter {
            name: "fs",
            message: format!("sampling rate must be positive, got {fs}"),
        })
    }
}

fn check_frequency(frequency: f64, fs: f64) -> Result<(), WaveformError> {
    let nyquist = fs / 2.0;
    if frequency.is_finite() && frequency >= 0.0 && frequency < nyquist {
        Ok(())
    } else {
        Err(WaveformError::InvalidFrequency { frequency, nyquist })
    }
}

fn samples_for(name: &'static str, seconds: f64, fs: f64) -> Result<u64, WaveformError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(WaveformError::InvalidParameter {
            name,
            message: format!("must be a non-negative number of seconds, got {seconds}"),
        });
    }
    Ok((seconds * fs).round() as u64)
}
