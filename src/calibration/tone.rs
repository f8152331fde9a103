//! Tone analysis and swept-frequency calibration.
//!
//! [`process_tone`] measures the RMS of a tone across repetitions with a
//! flat-top single-bin estimator, optionally checking its harmonic
//! distortion and its margin over a silence recording.
//!
//! The sweep entry points build on each other:
//!
//! | Function | Adds |
//! |----------|------|
//! | [`tone_power`] | `rms`, `snr`, `thd` per (input channel, frequency) |
//! | [`tone_spl`] | `spl` from the input channel's calibration |
//! | [`tone_sens`] | `norm_spl` and output `sens` in dB(V/Pa) |
//! | [`tone_calibration`] | a [`PointCalibration`] from the first input's `sens` |
//!
//! Sweeps run on the calling thread. They clone the engine down to the
//! channels involved, play every tone plus a trailing silence through a
//! [`QueuedEpochOutput`], extract one epoch per trial and poll until every
//! epoch has arrived. A threshold failure at one frequency is recorded in
//! that row and the sweep moves on; [`ToneTable::first_error`] recovers the
//! stop-at-first-failure behaviour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::spectral::{db, flattop_window, tone_power_mean, REFERENCE_PRESSURE};
use super::{Calibration, CalibrationError, FlatCalibration, PointCalibration};
use crate::engine::Engine;
use crate::input::{Epoch, EpochExtractor, ExtractionProgress};
use crate::output::{ChannelBindings, NullOutput, QueuedEpochOutput};
use crate::queue::{EntryKey, Metadata, SignalQueue};
use crate::waveform::{StimulusSpec, WaveformFactory};

/// Acceptance thresholds for a tone measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneCriteria {
    /// Minimum signal-to-noise ratio (dB). Requires a silence recording.
    #[serde(default)]
    pub min_snr: Option<f64>,
    /// Maximum total harmonic distortion (%)
    #[serde(default)]
    pub max_thd: Option<f64>,
    /// Highest harmonic included in THD, counting the fundamental as 1
    #[serde(default = "default_thd_harmonics")]
    pub thd_harmonics: usize,
}

fn default_thd_harmonics() -> usize {
    3
}

impl Default for ToneCriteria {
    fn default() -> Self {
        Self {
            min_snr: None,
            max_thd: None,
            thd_harmonics: default_thd_harmonics(),
        }
    }
}

/// Result for one (channel, frequency) pair.
///
/// `snr` and `thd` are NaN unless the matching threshold was requested. The
/// SPL columns stay NaN until filled by [`tone_spl`] and [`tone_sens`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ToneMeasurement {
    /// Tone frequency (Hz)
    pub frequency: f64,
    /// Mean RMS at the fundamental (V)
    pub rms: f64,
    /// Signal-to-noise ratio (dB)
    pub snr: f64,
    /// Total harmonic distortion (%)
    pub thd: f64,
    /// Measured level (dB SPL)
    pub spl: f64,
    /// Level normalized to 0 dB gain and 1 V RMS (dB SPL)
    pub norm_spl: f64,
    /// Output sensitivity (dB(V/Pa))
    pub sens: f64,
}

impl ToneMeasurement {
    fn new(frequency: f64, rms: f64, snr: f64, thd: f64) -> Self {
        Self {
            frequency,
            rms,
            snr,
            thd,
            spl: f64::NAN,
            norm_spl: f64::NAN,
            sens: f64::NAN,
        }
    }
}

/// Analyses tones recorded at a fixed sampling rate.
#[derive(Debug, Clone, Copy)]
pub struct ToneAnalyzer {
    fs: f64,
    criteria: ToneCriteria,
}

impl ToneAnalyzer {
    /// Analyzer for recordings at `fs` Hz.
    pub fn new(fs: f64, criteria: ToneCriteria) -> Self {
        Self { fs, criteria }
    }

    /// Sampling rate (Hz).
    pub fn fs(&self) -> f64 {
        self.fs
    }

    /// Thresholds applied by [`Self::process_tone`].
    pub fn criteria(&self) -> &ToneCriteria {
        &self.criteria
    }

    /// Measure the tone at `frequency` in `signal` (`[repetition, time]`).
    ///
    /// `silence` must have the same number of samples per repetition; the
    /// number of repetitions may differ. The SNR check runs before the THD
    /// check.
    pub fn process_tone(
        &self,
        signal: ArrayView2<'_, f64>,
        frequency: f64,
        silence: Option<ArrayView2<'_, f64>>,
    ) -> Result<ToneMeasurement, CalibrationError> {
        let n = signal.ncols();
        if n == 0 || signal.nrows() == 0 {
            return Err(CalibrationError::EmptySignal);
        }
        let window = flattop_window(n);
        let rms = tone_power_mean(signal, self.fs, frequency, Some(&window));

        let snr = match self.criteria.min_snr {
            Some(min_snr) => {
                let silence =
                    silence.ok_or(CalibrationError::MissingNoiseFloor { frequency })?;
                if silence.ncols() != n {
                    return Err(CalibrationError::ShapeMismatch {
                        expected: n,
                        actual: silence.ncols(),
                    });
                }
                if silence.nrows() == 0 {
                    return Err(CalibrationError::EmptySignal);
                }
                let noise_rms = tone_power_mean(silence, self.fs, frequency, Some(&window));
                let snr = db(rms / noise_rms);
                if snr < min_snr {
                    return Err(CalibrationError::NoiseFloor {
                        frequency,
                        snr,
                        min_snr,
                    });
                }
                snr
            }
            None => f64::NAN,
        };

        let thd = match self.criteria.max_thd {
            Some(max_thd) => {
                let thd = self.harmonic_distortion(signal, frequency, rms, &window);
                if thd > max_thd {
                    return Err(CalibrationError::Distortion {
                        frequency,
                        thd,
                        max_thd,
                    });
                }
                thd
            }
            None => f64::NAN,
        };

        debug!(frequency, rms, snr, thd, "Processed tone");
        Ok(ToneMeasurement::new(frequency, rms, snr, thd))
    }

    /// THD in percent, or NaN when a harmonic would alias.
    fn harmonic_distortion(
        &self,
        signal: ArrayView2<'_, f64>,
        frequency: f64,
        rms: f64,
        window: &[f64],
    ) -> f64 {
        let nyquist = self.fs / 2.0;
        let harmonics: Vec<f64> = (2..=self.criteria.thd_harmonics)
            .map(|k| frequency * k as f64)
            .collect();
        if let Some(&top) = harmonics.iter().find(|&&h| h >= nyquist) {
            warn!(
                frequency,
                harmonic = top,
                nyquist,
                "Harmonic above Nyquist, THD not computed"
            );
            return f64::NAN;
        }
        let power: f64 = harmonics
            .iter()
            .map(|&h| tone_power_mean(signal, self.fs, h, Some(window)).powi(2))
            .sum();
        power.sqrt() / rms * 100.0
    }
}

/// Measure the tone at `frequency` in `signal` (`[repetition, time]`).
pub fn process_tone(
    fs: f64,
    signal: ArrayView2<'_, f64>,
    frequency: f64,
    criteria: &ToneCriteria,
    silence: Option<ArrayView2<'_, f64>>,
) -> Result<ToneMeasurement, CalibrationError> {
    ToneAnalyzer::new(fs, *criteria).process_tone(signal, frequency, silence)
}

/// Parameters shared by the sweep entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneSweepConfig {
    /// Tone level (dB re `vrms`)
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Reference voltage for `gain` (V RMS)
    #[serde(default = "default_vrms")]
    pub vrms: f64,
    /// Repetitions of each tone and of the silence
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Minimum SNR (dB)
    #[serde(default)]
    pub min_snr: Option<f64>,
    /// Maximum THD (%)
    #[serde(default)]
    pub max_thd: Option<f64>,
    /// Highest harmonic included in THD
    #[serde(default = "default_thd_harmonics")]
    pub thd_harmonics: usize,
    /// Tone length (s)
    #[serde(default = "default_duration")]
    pub duration: f64,
    /// Discarded at each end of the tone before analysis (s)
    #[serde(default = "default_trim")]
    pub trim: f64,
    /// Silence after each trial (s)
    #[serde(default = "default_iti")]
    pub iti: f64,
    /// Wait between completion checks (s)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Give up after this long (s)
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Output refill block (s); the driver default when unset
    #[serde(default)]
    pub block_duration: Option<f64>,
}

fn default_gain() -> f64 {
    -40.0
}

fn default_vrms() -> f64 {
    1.0
}

fn default_repetitions() -> u32 {
    2
}

fn default_duration() -> f64 {
    0.1
}

fn default_trim() -> f64 {
    0.01
}

fn default_iti() -> f64 {
    0.01
}

fn default_poll_interval() -> f64 {
    0.1
}

fn default_timeout() -> f64 {
    30.0
}

impl Default for ToneSweepConfig {
    fn default() -> Self {
        Self {
            gain: default_gain(),
            vrms: default_vrms(),
            repetitions: default_repetitions(),
            min_snr: None,
            max_thd: None,
            thd_harmonics: default_thd_harmonics(),
            duration: default_duration(),
            trim: default_trim(),
            iti: default_iti(),
            poll_interval: default_poll_interval(),
            timeout: default_timeout(),
            block_duration: None,
        }
    }
}

impl ToneSweepConfig {
    /// Thresholds in the form [`ToneAnalyzer`] takes.
    pub fn criteria(&self) -> ToneCriteria {
        ToneCriteria {
            min_snr: self.min_snr,
            max_thd: self.max_thd,
            thd_harmonics: self.thd_harmonics,
        }
    }

    /// Check the sweep can be run as configured.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.vrms.is_finite() && self.vrms > 0.0) {
            return Err(format!("vrms must be positive, got {}", self.vrms));
        }
        if self.repetitions == 0 {
            return Err("repetitions must be at least 1".to_string());
        }
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(format!("duration must be positive, got {}", self.duration));
        }
        if !(self.trim >= 0.0 && 2.0 * self.trim < self.duration) {
            return Err(format!(
                "trim of {} s leaves nothing of a {} s tone",
                self.trim, self.duration
            ));
        }
        if !(self.iti.is_finite() && self.iti >= 0.0) {
            return Err(format!("iti must not be negative, got {}", self.iti));
        }
        if !(self.poll_interval > 0.0 && self.timeout > 0.0) {
            return Err("poll_interval and timeout must be positive".to_string());
        }
        if let Some(block) = self.block_duration {
            if !(block.is_finite() && block > 0.0) {
                return Err(format!("block_duration must be positive, got {block}"));
            }
        }
        Ok(())
    }
}

/// One row of a sweep result.
#[derive(Debug)]
pub struct ToneRow {
    /// Input channel that recorded the tone
    pub channel: String,
    /// Tone frequency (Hz)
    pub frequency: f64,
    /// Measurement, or why the tone was rejected
    pub result: Result<ToneMeasurement, CalibrationError>,
}

/// Sweep results keyed by (channel, frequency), in sweep order.
#[derive(Debug, Default)]
pub struct ToneTable {
    rows: Vec<ToneRow>,
}

impl ToneTable {
    /// All rows.
    pub fn rows(&self) -> &[ToneRow] {
        &self.rows
    }

    /// Row for a (channel, frequency) pair.
    pub fn get(&self, channel: &str, frequency: f64) -> Option<&ToneRow> {
        self.rows
            .iter()
            .find(|r| r.channel == channel && r.frequency == frequency)
    }

    /// Successful measurements recorded on `channel`.
    pub fn measurements<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a ToneMeasurement> {
        self.rows
            .iter()
            .filter(move |r| r.channel == channel)
            .filter_map(|r| r.result.as_ref().ok())
    }

    /// First rejected row, in sweep order.
    pub fn first_error(&self) -> Option<&CalibrationError> {
        self.rows.iter().find_map(|r| r.result.as_ref().err())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn for_each_measurement(&mut self, mut f: impl FnMut(&str, &mut ToneMeasurement)) {
        for row in &mut self.rows {
            if let Ok(measurement) = row.result.as_mut() {
                f(&row.channel, measurement);
            }
        }
    }
}

type EpochSink = Arc<Mutex<Vec<Arc<Epoch>>>>;

/// Play each frequency from `ao_channel` and measure it on every input.
pub fn tone_power(
    engine: &dyn Engine,
    frequencies: &[f64],
    ao_channel: &str,
    ai_channels: &[&str],
    config: &ToneSweepConfig,
) -> Result<ToneTable, CalibrationError> {
    config.validate().map_err(CalibrationError::InvalidSweep)?;
    if ai_channels.is_empty() {
        return Err(CalibrationError::InvalidSweep(
            "at least one input channel is required".to_string(),
        ));
    }

    let mut names: Vec<&str> = ai_channels.to_vec();
    names.push(ao_channel);
    let cal_engine = engine.clone_with_channels(&names)?;
    let ao_fs = cal_engine.channel(ao_channel)?.fs;

    let calibration: Arc<dyn Calibration> = Arc::new(FlatCalibration::as_attenuation(config.vrms));
    let gap = (config.iti * ao_fs).round() as usize;
    let mut queue = SignalQueue::new();
    let mut tone_keys = Vec::with_capacity(frequencies.len());
    for &frequency in frequencies {
        let factory = WaveformFactory::new(
            &StimulusSpec::tone(frequency, config.gain, config.duration),
            ao_fs,
            Arc::clone(&calibration),
        )?;
        let mut metadata = Metadata::new();
        metadata.insert("frequency".to_string(), frequency.into());
        let key = queue.append(factory, config.repetitions, gap, metadata)?;
        tone_keys.push((key, frequency));
    }
    let silence = WaveformFactory::new(&StimulusSpec::silence(config.duration), ao_fs, calibration)?;
    let silence_key = queue.append(silence, config.repetitions, gap, Metadata::new())?;
    let expected = queue.count_trials() as usize;

    info!(
        engine = %cal_engine.name(),
        output = %ao_channel,
        inputs = ?ai_channels,
        frequencies = frequencies.len(),
        gain = config.gain,
        "Starting tone sweep"
    );

    let bindings = ChannelBindings::new();
    let background = NullOutput::new("calibration-background", ao_channel, Arc::clone(&cal_engine), &bindings)?;
    let output = QueuedEpochOutput::new(
        "calibration",
        ao_channel,
        Arc::clone(&cal_engine),
        &bindings,
        queue,
        true,
    )?;
    if let Some(block) = config.block_duration {
        background.configure(block)?;
        output.configure(block)?;
    }
    output.setup(&[])?;

    let mut collected: Vec<(String, f64, EpochSink, ExtractionProgress)> = Vec::new();
    for &name in ai_channels {
        let ai_fs = cal_engine.channel(name)?.fs;
        let mut extractor = EpochExtractor::new(ai_fs, config.duration + config.iti)?
            .aligned_to_queue(output.subscribe(), ao_fs)
            .expect_epochs(expected);
        let sink: EpochSink = Arc::new(Mutex::new(Vec::with_capacity(expected)));
        let epochs = Arc::clone(&sink);
        extractor.add_callback(Box::new(move |epoch| epochs.lock().push(epoch)));
        let progress = extractor.progress();
        cal_engine.register_ai_callback(name, extractor.into_ai_callback())?;
        collected.push((name.to_string(), ai_fs, sink, progress));
    }

    background.start()?;
    output.start(0.0, 0.0)?;
    cal_engine.start()?;

    let deadline = Instant::now() + Duration::from_secs_f64(config.timeout);
    let poll = Duration::from_secs_f64(config.poll_interval);
    let waited = loop {
        if collected.iter().all(|(_, _, _, p)| p.is_complete()) {
            break Ok(());
        }
        if Instant::now() >= deadline {
            let (channel, progress) = collected
                .iter()
                .find(|(_, _, _, p)| !p.is_complete())
                .map(|(name, _, _, p)| (name.clone(), p.emitted()))
                .unwrap_or_default();
            break Err(CalibrationError::Incomplete {
                channel,
                received: progress,
                expected,
            });
        }
        std::thread::sleep(poll);
    };
    cal_engine.stop()?;
    background.stop();
    for fault in output.take_faults().into_iter().chain(background.take_faults()) {
        warn!(error = %fault, "Fault during tone sweep");
    }
    waited?;

    let criteria = config.criteria();
    let mut table = ToneTable::default();
    for (channel, ai_fs, sink, _) in &collected {
        let epochs = sink.lock();
        let analyzer = ToneAnalyzer::new(*ai_fs, criteria);
        let start = (config.trim * ai_fs).round() as usize;
        let end = ((config.duration - config.trim) * ai_fs).round() as usize;
        let by_key = group_windows(&epochs, start, end);
        let silence = by_key.get(&silence_key);

        for &(key, frequency) in &tone_keys {
            let result = match by_key.get(&key) {
                Some(signal) => analyzer.process_tone(
                    signal.view(),
                    frequency,
                    silence.map(|s| s.view()),
                ),
                None => Err(CalibrationError::Incomplete {
                    channel: channel.clone(),
                    received: 0,
                    expected: config.repetitions as usize,
                }),
            };
            match &result {
                Ok(m) => debug!(channel = %channel, frequency, rms = m.rms, "Tone measured"),
                Err(e) => warn!(channel = %channel, frequency, error = %e, "Tone rejected"),
            }
            table.rows.push(ToneRow {
                channel: channel.clone(),
                frequency,
                result,
            });
        }
    }

    info!(
        rows = table.len(),
        failed = table.rows.iter().filter(|r| r.result.is_err()).count(),
        "Tone sweep complete"
    );
    Ok(table)
}

/// Stack each entry's epochs, cut to `[start, end)`, into `[repetition, time]`.
fn group_windows(epochs: &[Arc<Epoch>], start: usize, end: usize) -> HashMap<EntryKey, Array2<f64>> {
    let mut rows: HashMap<EntryKey, Vec<&[f64]>> = HashMap::new();
    for epoch in epochs {
        if let Some(key) = epoch.key {
            let end = end.min(epoch.signal.len());
            let start = start.min(end);
            rows.entry(key).or_default().push(&epoch.signal[start..end]);
        }
    }
    rows.into_iter()
        .filter_map(|(key, windows)| {
            let width = windows.iter().map(|w| w.len()).min().unwrap_or(0);
            let data: Vec<f64> = windows.iter().flat_map(|w| w[..width].iter().copied()).collect();
            Array2::from_shape_vec((windows.len(), width), data)
                .ok()
                .map(|signal| (key, signal))
        })
        .collect()
}

/// [`tone_power`], plus SPL from each input channel's calibration.
pub fn tone_spl(
    engine: &dyn Engine,
    frequencies: &[f64],
    ao_channel: &str,
    ai_channels: &[&str],
    config: &ToneSweepConfig,
) -> Result<ToneTable, CalibrationError> {
    let mut table = tone_power(engine, frequencies, ao_channel, ai_channels, config)?;
    let calibrations = ai_channels
        .iter()
        .map(|&name| Ok((name.to_string(), engine.channel(name)?.calibration)))
        .collect::<Result<HashMap<_, _>, CalibrationError>>()?;
    table.for_each_measurement(|channel, m| {
        if let Some(calibration) = calibrations.get(channel) {
            m.spl = calibration.get_spl(m.frequency, m.rms);
        }
    });
    Ok(table)
}

/// [`tone_spl`], plus the output's level at 0 dB gain and 1 V RMS and its
/// sensitivity in dB(V/Pa).
///
/// Each input gives its own estimate of the output sensitivity.
pub fn tone_sens(
    engine: &dyn Engine,
    frequencies: &[f64],
    ao_channel: &str,
    ai_channels: &[&str],
    config: &ToneSweepConfig,
) -> Result<ToneTable, CalibrationError> {
    let mut table = tone_spl(engine, frequencies, ao_channel, ai_channels, config)?;
    let offset = config.gain + db(config.vrms);
    table.for_each_measurement(|_, m| {
        m.norm_spl = m.spl - offset;
        m.sens = -m.norm_spl - db(REFERENCE_PRESSURE);
    });
    Ok(table)
}

/// Output calibration from the sensitivity measured on the first input.
///
/// Rejected frequencies are left out of the curve. If none survive, the
/// first rejection is returned.
pub fn tone_calibration(
    engine: &dyn Engine,
    frequencies: &[f64],
    ao_channel: &str,
    ai_channels: &[&str],
    config: &ToneSweepConfig,
) -> Result<PointCalibration, CalibrationError> {
    let table = tone_sens(engine, frequencies, ao_channel, ai_channels, config)?;
    let Some(&reference) = ai_channels.first() else {
        return Err(CalibrationError::InvalidSweep(
            "at least one input channel is required".to_string(),
        ));
    };
    let (freqs, sens): (Vec<f64>, Vec<f64>) = table
        .measurements(reference)
        .map(|m| (m.frequency, m.sens))
        .unzip();
    if freqs.is_empty() {
        let first = table.rows.into_iter().find_map(|r| r.result.err());
        return Err(first
            .unwrap_or_else(|| CalibrationError::InvalidPoints("no frequencies measured".to_string())));
    }
    PointCalibration::new(freqs, sens)
}
