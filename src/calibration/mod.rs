//! Acoustic calibration and tone analysis.
//!
//! A [`Calibration`] maps between volts at a channel and sound pressure level
//! (dB re 20 µPa) for a given frequency. Output channels use it to turn a
//! requested level into a peak amplitude; input channels use it to turn a
//! measured RMS voltage into SPL.
//!
//! | Type | Sensitivity |
//! |------|-------------|
//! | [`FlatCalibration`] | single value, all frequencies |
//! | [`PointCalibration`] | measured points, linear interpolation in frequency |
//!
//! Sensitivity is expressed in dB(V/Pa). The tone analysis side of the module
//! lives in [`tone`] and the windowed single-bin estimators in [`spectral`].

pub mod spectral;
pub mod tone;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;
use crate::input::InputError;
use crate::output::OutputError;
use crate::queue::QueueError;
use crate::waveform::WaveformError;

pub use spectral::{db, dbi, flattop_window, tone_conv, tone_power_conv, REFERENCE_PRESSURE};
pub use tone::{
    process_tone, tone_calibration, tone_power, tone_sens, tone_spl, ToneAnalyzer, ToneCriteria,
    ToneMeasurement, ToneRow, ToneSweepConfig, ToneTable,
};

/// Errors raised while analysing tones or running a calibration sweep.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// The tone did not clear the noise floor by the required margin.
    #[error("Power at {frequency} Hz has an SNR of {snr:.2} dB, below the minimum of {min_snr:.2} dB")]
    NoiseFloor {
        /// Tone frequency (Hz)
        frequency: f64,
        /// Measured signal-to-noise ratio (dB)
        snr: f64,
        /// Required minimum (dB)
        min_snr: f64,
    },

    /// Harmonic distortion exceeded the allowed percentage.
    #[error("Total harmonic distortion at {frequency} Hz is {thd:.2}%, above the maximum of {max_thd:.2}%")]
    Distortion {
        /// Tone frequency (Hz)
        frequency: f64,
        /// Measured THD (%)
        thd: f64,
        /// Allowed maximum (%)
        max_thd: f64,
    },

    /// An SNR threshold was given without a silence recording to measure against.
    #[error("A silence recording is required to check SNR at {frequency} Hz")]
    MissingNoiseFloor {
        /// Tone frequency (Hz)
        frequency: f64,
    },

    /// Signal and silence recordings have different lengths.
    #[error("Silence recording has {actual} samples per repetition, expected {expected}")]
    ShapeMismatch {
        /// Samples per repetition in the tone recording
        expected: usize,
        /// Samples per repetition in the silence recording
        actual: usize,
    },

    /// Nothing to analyse.
    #[error("Signal contains no samples")]
    EmptySignal,

    /// A point calibration could not be built from the given data.
    #[error("Invalid calibration points: {0}")]
    InvalidPoints(String),

    /// Sweep parameters are unusable.
    #[error("Invalid sweep configuration: {0}")]
    InvalidSweep(String),

    /// The acquisition did not deliver every expected epoch in time.
    #[error("Calibration sweep incomplete on {channel}: received {received} of {expected} epochs")]
    Incomplete {
        /// Input channel that fell short
        channel: String,
        /// Epochs received
        received: usize,
        /// Epochs expected
        expected: usize,
    },

    /// Engine failure during the sweep.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Output failure during the sweep.
    #[error(transparent)]
    Output(#[from] OutputError),

    /// Queue failure while scheduling the sweep.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Tone could not be generated at the output rate.
    #[error(transparent)]
    Waveform(#[from] WaveformError),

    /// Epoch window could not be cut at the input rate.
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Volts ↔ SPL conversion for a channel.
pub trait Calibration: fmt::Debug + Send + Sync {
    /// Sensitivity at `frequency`, in dB(V/Pa).
    fn get_sens(&self, frequency: f64) -> f64;

    /// SPL (dB re 20 µPa) produced by `rms` volts at `frequency`.
    fn get_spl(&self, frequency: f64, rms: f64) -> f64 {
        db(rms) - self.get_sens(frequency) - db(REFERENCE_PRESSURE)
    }

    /// RMS volts needed to produce `spl` at `frequency`.
    fn get_sf(&self, frequency: f64, spl: f64) -> f64 {
        dbi(spl + self.get_sens(frequency) + db(REFERENCE_PRESSURE))
    }
}

/// Frequency-independent calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatCalibration {
    sensitivity: f64,
}

impl FlatCalibration {
    /// Calibration with the given sensitivity in dB(V/Pa).
    pub fn new(sensitivity: f64) -> Self {
        Self { sensitivity }
    }

    /// Calibration where "SPL" is attenuation relative to `vrms`.
    ///
    /// A level of 0 produces `vrms` volts RMS, -20 produces `vrms / 10`.
    pub fn as_attenuation(vrms: f64) -> Self {
        Self::new(db(vrms) - db(REFERENCE_PRESSURE))
    }

    /// Attenuation calibration referenced to 1 V RMS.
    pub fn unity() -> Self {
        Self::as_attenuation(1.0)
    }

    /// Sensitivity in dB(V/Pa).
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }
}

impl Calibration for FlatCalibration {
    fn get_sens(&self, _frequency: f64) -> f64 {
        self.sensitivity
    }
}

/// Sensitivity measured at discrete frequencies.
///
/// Between points the sensitivity is interpolated linearly; outside the
/// measured range the nearest point is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCalibration {
    frequencies: Vec<f64>,
    sensitivities: Vec<f64>,
}

impl PointCalibration {
    /// Build from paired frequency and sensitivity lists. Points are sorted by frequency.
    pub fn new(frequencies: Vec<f64>, sensitivities: Vec<f64>) -> Result<Self, CalibrationError> {
        if frequencies.len() != sensitivities.len() {
            return Err(CalibrationError::InvalidPoints(format!(
                "{} frequencies but {} sensitivities",
                frequencies.len(),
                sensitivities.len()
            )));
        }
        if frequencies.is_empty() {
            return Err(CalibrationError::InvalidPoints("no points".to_string()));
        }
        if frequencies.iter().chain(&sensitivities).any(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidPoints(
                "non-finite frequency or sensitivity".to_string(),
            ));
        }

        let mut points: Vec<(f64, f64)> = frequencies.into_iter().zip(sensitivities).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (frequencies, sensitivities) = points.into_iter().unzip();

        Ok(Self {
            frequencies,
            sensitivities,
        })
    }

    /// Measured frequencies, ascending.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Sensitivities matching [`Self::frequencies`].
    pub fn sensitivities(&self) -> &[f64] {
        &self.sensitivities
    }
}

impl Calibration for PointCalibration {
    fn get_sens(&self, frequency: f64) -> f64 {
        let n = self.frequencies.len();
        let upper = self.frequencies.partition_point(|&f| f < frequency);
        if upper == 0 {
            return self.sensitivities[0];
        }
        if upper == n {
            return self.sensitivities[n - 1];
        }
        let (f0, f1) = (self.frequencies[upper - 1], self.frequencies[upper]);
        let (s0, s1) = (self.sensitivities[upper - 1], self.sensitivities[upper]);
        if f1 == f0 {
            return s0;
        }
        s0 + (s1 - s0) * (frequency - f0) / (f1 - f0)
    }
}

/// Serializable choice of channel calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationConfig {
    /// Levels are attenuation in dB re `vrms`.
    Attenuation {
        /// Reference voltage (V RMS)
        #[serde(default = "default_vrms")]
        vrms: f64,
    },
    /// Single sensitivity in dB(V/Pa).
    Flat {
        /// Sensitivity (dB(V/Pa))
        sensitivity: f64,
    },
    /// Measured sensitivity curve.
    Points {
        /// Frequencies (Hz)
        frequencies: Vec<f64>,
        /// Sensitivities (dB(V/Pa))
        sensitivities: Vec<f64>,
    },
}

fn default_vrms() -> f64 {
    1.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self::Attenuation { vrms: 1.0 }
    }
}

impl CalibrationConfig {
    /// Instantiate the calibration.
    pub fn build(&self) -> Result<Arc<dyn Calibration>, CalibrationError> {
        Ok(match self {
            Self::Attenuation { vrms } => {
                if !(vrms.is_finite() && *vrms > 0.0) {
                    return Err(CalibrationError::InvalidPoints(format!(
                        "reference voltage must be positive, got {vrms}"
                    )));
                }
                Arc::new(FlatCalibration::as_attenuation(*vrms))
            }
            Self::Flat { sensitivity } => Arc::new(FlatCalibration::new(*sensitivity)),
            Self::Points {
                frequencies,
                sensitivities,
            } => Arc::new(PointCalibration::new(frequencies.clone(), sensitivities.clone())?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attenuation_round_trip() {
        let cal = FlatCalibration::as_attenuation(1.0);
        assert!((cal.get_sf(1000.0, 0.0) - 1.0).abs() < 1e-12);
        assert!((cal.get_sf(1000.0, -20.0) - 0.1).abs() < 1e-12);
        assert!((cal.get_spl(1000.0, 0.1) + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_microphone_spl() {
        // 1 V/Pa microphone reading 20 µV is 0 dB SPL, 1 Pa is ~94 dB SPL
        let cal = FlatCalibration::new(0.0);
        assert!(cal.get_spl(1000.0, 20e-6).abs() < 1e-9);
        assert!((cal.get_spl(1000.0, 1.0) - 93.979).abs() < 1e-3);
    }

    #[test]
    fn test_point_interpolation() {
        let cal = PointCalibration::new(vec![2000.0, 1000.0], vec![-10.0, -20.0]).unwrap();
        assert_eq!(cal.frequencies(), &[1000.0, 2000.0]);
        assert!((cal.get_sens(1500.0) + 15.0).abs() < 1e-12);
        assert_eq!(cal.get_sens(500.0), -20.0);
        assert_eq!(cal.get_sens(4000.0), -10.0);
    }

    #[test]
    fn test_calibration_config_from_toml() {
        let config: CalibrationConfig = toml::from_str("type = \"flat\"\nsensitivity = -40.0").unwrap();
        assert_eq!(config, CalibrationConfig::Flat { sensitivity: -40.0 });
        let cal = config.build().unwrap();
        assert_eq!(cal.get_sens(500.0), -40.0);
        assert!(CalibrationConfig::Attenuation { vrms: 0.0 }.build().is_err());
    }

    #[test]
    fn test_point_rejects_mismatched_lengths() {
        let err = PointCalibration::new(vec![1000.0], vec![]).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidPoints(_)));
        assert!(PointCalibration::new(vec![], vec![]).is_err());
    }
}
