//! Simulated engine with loopback acquisition.
//!
//! `MockEngine` keeps a bounded output buffer per analog output channel and
//! plays it out on a sample clock. Analog inputs can be wired back to an
//! output (`loopback`), optionally scaled and with added noise, which makes
//! the whole output → acquisition → analysis path testable without hardware.
//!
//! The clock can run on its own thread ([`Engine::start`]) or be stepped by
//! hand with [`MockEngine::advance`], which is what the tests do.
//!
//! ```text
//!   drivers ──append/modify──▶ AO buffer ──advance──▶ played block
//!                                                      │
//!                                        gain + noise  ▼
//!                                                   AI block ──▶ AI callbacks
//! ```
//!
//! When the play position overtakes the write head the missing samples are
//! played as zeros and counted as an underrun.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    AiCallback, AoCallback, CallbackStatus, ChannelInfo, ChannelKind, DiCallback, EdgeEvent,
    Engine, EngineError, EtCallback,
};
use crate::calibration::CalibrationConfig;

/// Analog output channel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AoChannelConfig {
    /// Channel name
    pub name: String,
    /// Level ↔ volts conversion
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

/// Analog input channel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiChannelConfig {
    /// Channel name
    pub name: String,
    /// Volts ↔ level conversion
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Output channel whose played samples this input records
    #[serde(default)]
    pub loopback: Option<String>,
    /// Scale applied to the looped-back signal
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// RMS of uniform noise added to every sample (V)
    #[serde(default)]
    pub noise_rms: f64,
}

/// Configuration for [`MockEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockEngineConfig {
    /// Engine name
    #[serde(default = "default_name")]
    pub name: String,
    /// Sample clock shared by all analog channels (Hz)
    #[serde(default = "default_fs")]
    pub fs: f64,
    /// Analog outputs
    #[serde(default)]
    pub ao_channels: Vec<AoChannelConfig>,
    /// Analog inputs
    #[serde(default)]
    pub ai_channels: Vec<AiChannelConfig>,
    /// Software-timed digital outputs
    #[serde(default)]
    pub do_channels: Vec<String>,
    /// Digital inputs
    #[serde(default)]
    pub di_channels: Vec<String>,
    /// Output buffer length (s)
    #[serde(default = "default_buffer_duration")]
    pub buffer_duration: f64,
    /// Samples played per clock tick, in seconds
    #[serde(default = "default_clock_block_duration")]
    pub clock_block_duration: f64,
    /// Pace the clock thread to wall time instead of running flat out
    #[serde(default)]
    pub realtime: bool,
    /// Keep every played output sample for inspection
    #[serde(default)]
    pub record_output: bool,
    /// Noise seed
    #[serde(default)]
    pub seed: u64,
}

fn default_name() -> String {
    "mock".to_string()
}

fn default_fs() -> f64 {
    100_000.0
}

fn default_gain() -> f64 {
    1.0
}

fn default_buffer_duration() -> f64 {
    1.0
}

fn default_clock_block_duration() -> f64 {
    0.01
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            fs: default_fs(),
            ao_channels: Vec::new(),
            ai_channels: Vec::new(),
            do_channels: Vec::new(),
            di_channels: Vec::new(),
            buffer_duration: default_buffer_duration(),
            clock_block_duration: default_clock_block_duration(),
            realtime: false,
            record_output: false,
            seed: 0,
        }
    }
}

impl MockEngineConfig {
    /// One output looped back into one input at unity gain.
    pub fn loopback(fs: f64, ao: &str, ai: &str) -> Self {
        Self {
            fs,
            ao_channels: vec![AoChannelConfig {
                name: ao.to_string(),
                calibration: CalibrationConfig::default(),
            }],
            ai_channels: vec![AiChannelConfig {
                name: ai.to_string(),
                calibration: CalibrationConfig::default(),
                loopback: Some(ao.to_string()),
                gain: 1.0,
                noise_rms: 0.0,
            }],
            ..Self::default()
        }
    }

    /// Output buffer length in samples.
    pub fn buffer_samples(&self) -> usize {
        (self.buffer_duration * self.fs).round() as usize
    }

    /// Samples played per clock tick.
    pub fn block_samples(&self) -> usize {
        ((self.clock_block_duration * self.fs).round() as usize).max(1)
    }

    /// Check rates, durations, channel names and loopback sources.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.fs.is_finite() && self.fs > 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "sampling rate must be positive, got {}",
                self.fs
            )));
        }
        if self.buffer_samples() == 0 {
            return Err(EngineError::InvalidConfig(
                "buffer_duration must cover at least one sample".to_string(),
            ));
        }
        if !(self.clock_block_duration.is_finite() && self.clock_block_duration > 0.0) {
            return Err(EngineError::InvalidConfig(
                "clock_block_duration must be positive".to_string(),
            ));
        }

        let mut names: Vec<&str> = self
            .ao_channels
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.ai_channels.iter().map(|c| c.name.as_str()))
            .chain(self.do_channels.iter().map(String::as_str))
            .chain(self.di_channels.iter().map(String::as_str))
            .collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(EngineError::InvalidConfig(format!(
                "channel '{}' defined more than once",
                pair[0]
            )));
        }

        for ai in &self.ai_channels {
            if let Some(source) = &ai.loopback {
                if !self.ao_channels.iter().any(|ao| &ao.name == source) {
                    return Err(EngineError::InvalidConfig(format!(
                        "input '{}' loops back from unknown output '{}'",
                        ai.name, source
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Level change on a software-timed digital output.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalEvent {
    /// Line name
    pub line: String,
    /// New level
    pub high: bool,
    /// Time in seconds since the clock started
    pub timestamp: f64,
}

#[derive(Debug)]
struct AoBuffer {
    info: ChannelInfo,
    base: Vec<f64>,
    layers: BTreeMap<String, Vec<f64>>,
    origin: u64,
    position: u64,
    underrun_samples: u64,
    history: Option<Vec<f64>>,
}

impl AoBuffer {
    fn write_head(&self) -> u64 {
        self.origin + self.base.len() as u64
    }

    fn sample_at(&self, offset: u64) -> f64 {
        let index = (offset - self.origin) as usize;
        let base = self.base.get(index).copied().unwrap_or(0.0);
        self.layers
            .values()
            .filter_map(|layer| layer.get(index))
            .fold(base, |acc, v| acc + v)
    }

    fn play(&mut self, n: usize, capacity: usize) -> Vec<f64> {
        let end = self.position + n as u64;
        let write_head = self.write_head();
        if write_head < end {
            let missing = end - write_head;
            self.underrun_samples += missing;
            self.base.resize(self.base.len() + missing as usize, 0.0);
            debug!(channel = %self.info.name, missing, "Output buffer underrun");
        }

        let played: Vec<f64> = (self.position..end).map(|i| self.sample_at(i)).collect();
        if let Some(history) = self.history.as_mut() {
            history.extend_from_slice(&played);
        }
        self.position = end;

        // Drop played samples once they outgrow the buffer
        let stale = (self.position - self.origin) as usize;
        if stale > capacity {
            self.base.drain(..stale);
            for layer in self.layers.values_mut() {
                let n = stale.min(layer.len());
                layer.drain(..n);
            }
            self.origin = self.position;
        }
        played
    }
}

#[derive(Debug)]
struct AiSource {
    info: ChannelInfo,
    loopback: Option<usize>,
    gain: f64,
    noise_rms: f64,
}

#[derive(Debug)]
struct State {
    ao: Vec<AoBuffer>,
    ai: Vec<AiSource>,
    digital_out: BTreeMap<String, bool>,
    digital_in: BTreeMap<String, bool>,
    events: Vec<DigitalEvent>,
    elapsed: u64,
    rng: ChaCha8Rng,
}

impl State {
    fn ao(&self, channel: &str) -> Result<&AoBuffer, EngineError> {
        self.ao
            .iter()
            .find(|b| b.info.name == channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))
    }

    fn ao_mut(&mut self, channel: &str) -> Result<&mut AoBuffer, EngineError> {
        self.ao
            .iter_mut()
            .find(|b| b.info.name == channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))
    }
}

#[derive(Default)]
struct Callbacks {
    ao: Vec<(String, AoCallback)>,
    ai: Vec<(String, AiCallback)>,
    et: Vec<EtCallback>,
    di: Vec<(String, DiCallback)>,
}

struct Shared {
    config: MockEngineConfig,
    capacity: usize,
    buffer_lock: Mutex<()>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
    running: AtomicBool,
}

/// Simulated acquisition engine.
pub struct MockEngine {
    shared: Arc<Shared>,
    clock_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("name", &self.shared.config.name)
            .field("fs", &self.shared.config.fs)
            .field("running", &self.is_running())
            .finish()
    }
}

impl MockEngine {
    /// Build an engine from its configuration.
    pub fn new(config: MockEngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let fs = config.fs;

        let mut ao = Vec::with_capacity(config.ao_channels.len());
        for channel in &config.ao_channels {
            ao.push(AoBuffer {
                info: ChannelInfo {
                    name: channel.name.clone(),
                    kind: ChannelKind::AnalogOutput,
                    fs,
                    calibration: build_calibration(&channel.name, &channel.calibration)?,
                },
                base: Vec::new(),
                layers: BTreeMap::new(),
                origin: 0,
                position: 0,
                underrun_samples: 0,
                history: config.record_output.then(Vec::new),
            });
        }

        let mut ai = Vec::with_capacity(config.ai_channels.len());
        for channel in &config.ai_channels {
            let loopback = channel
                .loopback
                .as_ref()
                .and_then(|source| config.ao_channels.iter().position(|c| &c.name == source));
            ai.push(AiSource {
                info: ChannelInfo {
                    name: channel.name.clone(),
                    kind: ChannelKind::AnalogInput,
                    fs,
                    calibration: build_calibration(&channel.name, &channel.calibration)?,
                },
                loopback,
                gain: channel.gain,
                noise_rms: channel.noise_rms,
            });
        }

        let state = State {
            ao,
            ai,
            digital_out: config.do_channels.iter().map(|n| (n.clone(), false)).collect(),
            digital_in: config.di_channels.iter().map(|n| (n.clone(), false)).collect(),
            events: Vec::new(),
            elapsed: 0,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        };

        info!(
            name = %config.name,
            fs,
            ao = config.ao_channels.len(),
            ai = config.ai_channels.len(),
            "Created mock engine"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                capacity: config.buffer_samples(),
                config,
                buffer_lock: Mutex::new(()),
                state: Mutex::new(state),
                callbacks: Mutex::new(Callbacks::default()),
                running: AtomicBool::new(false),
            }),
            clock_thread: Mutex::new(None),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &MockEngineConfig {
        &self.shared.config
    }

    /// Play `n` samples on every output, deliver the acquired blocks to input
    /// callbacks, then ask outputs to refill.
    pub fn advance(&self, n: usize) {
        self.shared.advance(n);
    }

    /// Invoke every output callback once.
    pub fn service_outputs(&self) {
        self.shared.service_outputs();
    }

    /// Deliver an edge event to the edge callbacks.
    pub fn emit_edge(&self, event: &EdgeEvent) {
        self.shared.emit_edge(event);
    }

    /// Set the level reported on a digital input.
    pub fn set_di_level(&self, channel: &str, high: bool) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        let level = state
            .digital_in
            .get_mut(channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))?;
        *level = high;
        Ok(())
    }

    /// Summed output samples still in the buffer, starting at `offset`.
    pub fn peek_ao(&self, channel: &str, offset: u64, n: usize) -> Result<Vec<f64>, EngineError> {
        let state = self.shared.state.lock();
        let buffer = state.ao(channel)?;
        let end = offset + n as u64;
        if offset < buffer.origin || end > buffer.write_head() {
            return Err(EngineError::OffsetOutOfRange {
                channel: channel.to_string(),
                offset,
                start: buffer.origin,
                end: buffer.write_head(),
            });
        }
        Ok((offset..end).map(|i| buffer.sample_at(i)).collect())
    }

    /// Every sample played on `channel` so far. Empty unless
    /// `record_output` is set.
    pub fn played_ao(&self, channel: &str) -> Result<Vec<f64>, EngineError> {
        let state = self.shared.state.lock();
        Ok(state.ao(channel)?.history.clone().unwrap_or_default())
    }

    /// Zero samples substituted on `channel` because nothing was buffered.
    pub fn underrun_samples(&self, channel: &str) -> Result<u64, EngineError> {
        Ok(self.shared.state.lock().ao(channel)?.underrun_samples)
    }

    /// Level changes on digital outputs, in order.
    pub fn digital_events(&self) -> Vec<DigitalEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Current level of a digital output.
    pub fn digital_level(&self, channel: &str) -> Result<bool, EngineError> {
        self.shared
            .state
            .lock()
            .digital_out
            .get(channel)
            .copied()
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))
    }

    /// Samples clocked since creation.
    pub fn elapsed_samples(&self) -> u64 {
        self.shared.state.lock().elapsed
    }
}

fn build_calibration(
    channel: &str,
    config: &CalibrationConfig,
) -> Result<Arc<dyn crate::calibration::Calibration>, EngineError> {
    config
        .build()
        .map_err(|e| EngineError::InvalidConfig(format!("calibration for '{channel}': {e}")))
}

struct Acquired {
    ai: Vec<(String, Vec<f64>)>,
    di: Vec<(String, Vec<bool>)>,
}

impl Shared {
    fn advance(&self, n: usize) {
        if n == 0 {
            return;
        }
        let acquired = {
            let _guard = self.buffer_lock.lock();
            let mut state = self.state.lock();
            let state = &mut *state;

            let played: Vec<Vec<f64>> = state
                .ao
                .iter_mut()
                .map(|buffer| buffer.play(n, self.capacity))
                .collect();

            let mut ai = Vec::with_capacity(state.ai.len());
            for source in &state.ai {
                let mut block = match source.loopback {
                    Some(index) => played[index].iter().map(|v| v * source.gain).collect(),
                    None => vec![0.0; n],
                };
                if source.noise_rms > 0.0 {
                    // Uniform on [-a, a] has RMS a / sqrt(3)
                    let half_width = source.noise_rms * 3f64.sqrt();
                    for sample in &mut block {
                        *sample += state.rng.gen_range(-half_width..half_width);
                    }
                }
                ai.push((source.info.name.clone(), block));
            }

            let di = state
                .digital_in
                .iter()
                .map(|(name, &high)| (name.clone(), vec![high; n]))
                .collect();

            state.elapsed += n as u64;
            Acquired { ai, di }
        };

        self.dispatch_ai(&acquired.ai);
        self.dispatch_di(&acquired.di);
        self.service_outputs();
    }

    fn dispatch_ai(&self, blocks: &[(String, Vec<f64>)]) {
        let mut callbacks = std::mem::take(&mut self.callbacks.lock().ai);
        callbacks.retain_mut(|(channel, callback)| {
            blocks
                .iter()
                .find(|(name, _)| name == channel)
                .map_or(true, |(_, block)| callback(block.as_slice()) == CallbackStatus::Continue)
        });
        let mut guard = self.callbacks.lock();
        callbacks.append(&mut guard.ai);
        guard.ai = callbacks;
    }

    fn dispatch_di(&self, blocks: &[(String, Vec<bool>)]) {
        let mut callbacks = std::mem::take(&mut self.callbacks.lock().di);
        callbacks.retain_mut(|(channel, callback)| {
            blocks
                .iter()
                .find(|(name, _)| name == channel)
                .map_or(true, |(_, block)| callback(block.as_slice()) == CallbackStatus::Continue)
        });
        let mut guard = self.callbacks.lock();
        callbacks.append(&mut guard.di);
        guard.di = callbacks;
    }

    fn service_outputs(&self) {
        let mut callbacks = std::mem::take(&mut self.callbacks.lock().ao);
        callbacks.retain_mut(|(_, callback)| callback() == CallbackStatus::Continue);
        let mut guard = self.callbacks.lock();
        callbacks.append(&mut guard.ao);
        guard.ao = callbacks;
    }

    fn emit_edge(&self, event: &EdgeEvent) {
        let mut callbacks = std::mem::take(&mut self.callbacks.lock().et);
        callbacks.retain_mut(|callback| callback(event) == CallbackStatus::Continue);
        let mut guard = self.callbacks.lock();
        callbacks.append(&mut guard.et);
        guard.et = callbacks;
    }

    fn info(&self, channel: &str) -> Result<ChannelInfo, EngineError> {
        let state = self.state.lock();
        if let Some(buffer) = state.ao.iter().find(|b| b.info.name == channel) {
            return Ok(buffer.info.clone());
        }
        if let Some(source) = state.ai.iter().find(|s| s.info.name == channel) {
            return Ok(source.info.clone());
        }
        let digital = |kind| ChannelInfo {
            name: channel.to_string(),
            kind,
            fs: self.config.fs,
            calibration: Arc::new(crate::calibration::FlatCalibration::unity()),
        };
        if state.digital_out.contains_key(channel) {
            return Ok(digital(ChannelKind::DigitalOutput));
        }
        if state.digital_in.contains_key(channel) {
            return Ok(digital(ChannelKind::DigitalInput));
        }
        Err(EngineError::UnknownChannel(channel.to_string()))
    }

    fn ensure_kind(&self, channel: &str, kind: ChannelKind) -> Result<(), EngineError> {
        let info = self.info(channel)?;
        if info.kind == kind {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(format!(
                "channel '{channel}' is {:?}, expected {kind:?}",
                info.kind
            )))
        }
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn channel(&self, name: &str) -> Result<ChannelInfo, EngineError> {
        self.shared.info(name)
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        let config = &self.shared.config;
        config
            .ao_channels
            .iter()
            .map(|c| c.name.as_str())
            .chain(config.ai_channels.iter().map(|c| c.name.as_str()))
            .chain(config.do_channels.iter().map(String::as_str))
            .chain(config.di_channels.iter().map(String::as_str))
            .filter_map(|name| self.shared.info(name).ok())
            .collect()
    }

    fn buffer_lock(&self) -> MutexGuard<'_, ()> {
        self.shared.buffer_lock.lock()
    }

    fn get_buffered_samples(&self, channel: &str, offset: u64) -> Result<usize, EngineError> {
        let state = self.shared.state.lock();
        let buffer = state.ao(channel)?;
        Ok(buffer.write_head().saturating_sub(offset.max(buffer.position)) as usize)
    }

    fn get_space_available(&self, channel: &str, offset: u64) -> Result<usize, EngineError> {
        let state = self.shared.state.lock();
        let buffer = state.ao(channel)?;
        let limit = buffer.position + self.shared.capacity as u64;
        Ok(limit.saturating_sub(offset.max(buffer.write_head())) as usize)
    }

    fn hw_ao_position(&self, channel: &str) -> Result<u64, EngineError> {
        Ok(self.shared.state.lock().ao(channel)?.position)
    }

    fn modify_hw_ao(
        &self,
        channel: &str,
        offset: u64,
        samples: &[f64],
        output_id: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        let buffer = state.ao_mut(channel)?;
        let end = offset + samples.len() as u64;
        if offset < buffer.position || end > buffer.write_head() {
            return Err(EngineError::OffsetOutOfRange {
                channel: channel.to_string(),
                offset,
                start: buffer.position,
                end: buffer.write_head(),
            });
        }
        let start = (offset - buffer.origin) as usize;
        let stop = (end - buffer.origin) as usize;
        let layer = buffer.layers.entry(output_id.to_string()).or_default();
        if layer.len() < stop {
            layer.resize(stop, 0.0);
        }
        layer[start..stop].copy_from_slice(samples);
        Ok(())
    }

    fn append_hw_ao(&self, channel: &str, samples: &[f64]) -> Result<(), EngineError> {
        let capacity = self.shared.capacity as u64;
        let mut state = self.shared.state.lock();
        let buffer = state.ao_mut(channel)?;
        let available = (buffer.position + capacity).saturating_sub(buffer.write_head()) as usize;
        if samples.len() > available {
            return Err(EngineError::BufferFull {
                channel: channel.to_string(),
                requested: samples.len(),
                available,
            });
        }
        buffer.base.extend_from_slice(samples);
        Ok(())
    }

    fn register_ao_callback(&self, channel: &str, callback: AoCallback) -> Result<(), EngineError> {
        self.shared.ensure_kind(channel, ChannelKind::AnalogOutput)?;
        self.shared
            .callbacks
            .lock()
            .ao
            .push((channel.to_string(), callback));
        Ok(())
    }

    fn register_ai_callback(&self, channel: &str, callback: AiCallback) -> Result<(), EngineError> {
        self.shared.ensure_kind(channel, ChannelKind::AnalogInput)?;
        self.shared
            .callbacks
            .lock()
            .ai
            .push((channel.to_string(), callback));
        Ok(())
    }

    fn register_et_callback(&self, callback: EtCallback) {
        self.shared.callbacks.lock().et.push(callback);
    }

    fn register_di_callback(&self, channel: &str, callback: DiCallback) -> Result<(), EngineError> {
        self.shared.ensure_kind(channel, ChannelKind::DigitalInput)?;
        self.shared
            .callbacks
            .lock()
            .di
            .push((channel.to_string(), callback));
        Ok(())
    }

    fn fire_sw_do(&self, channel: &str, duration: f64) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if !state.digital_out.contains_key(channel) {
            return Err(EngineError::UnknownChannel(channel.to_string()));
        }
        let timestamp = state.elapsed as f64 / self.shared.config.fs;
        for (high, at) in [(true, timestamp), (false, timestamp + duration)] {
            state.events.push(DigitalEvent {
                line: channel.to_string(),
                high,
                timestamp: at,
            });
        }
        state.digital_out.insert(channel.to_string(), false);
        debug!(channel, duration, "Fired digital output");
        Ok(())
    }

    fn set_sw_do(&self, channel: &str, high: bool) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        let timestamp = state.elapsed as f64 / self.shared.config.fs;
        let level = state
            .digital_out
            .get_mut(channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))?;
        *level = high;
        state.events.push(DigitalEvent {
            line: channel.to_string(),
            high,
            timestamp,
        });
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState {
                engine: self.shared.config.name.clone(),
                state: "already running",
            });
        }

        // Prime output buffers before the first sample plays
        self.shared.service_outputs();

        let shared = Arc::clone(&self.shared);
        let block = shared.config.block_samples();
        let tick = Duration::from_secs_f64(shared.config.clock_block_duration);
        let realtime = shared.config.realtime;
        let handle = thread::Builder::new()
            .name(format!("{}-clock", shared.config.name))
            .spawn(move || {
                while shared.running.load(Ordering::SeqCst) {
                    shared.advance(block);
                    if realtime {
                        thread::sleep(tick);
                    } else {
                        thread::yield_now();
                    }
                }
                debug!("Clock thread exiting");
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                EngineError::InvalidConfig(format!("failed to spawn clock thread: {e}"))
            })?;
        *self.clock_thread.lock() = Some(handle);

        info!(name = %self.shared.config.name, block, realtime, "Started mock engine");
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.clock_thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                warn!("Engine stopped from its own clock thread; not joining");
            } else if let Err(e) = handle.join() {
                error!("Clock thread panicked: {:?}", e);
            }
        }
        info!(
            name = %self.shared.config.name,
            elapsed = self.elapsed_samples(),
            "Stopped mock engine"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn clone_with_channels(&self, channels: &[&str]) -> Result<Arc<dyn Engine>, EngineError> {
        let source = &self.shared.config;
        for name in channels {
            self.shared.info(name)?;
        }
        let keep = |name: &str| channels.contains(&name);

        let ao_channels: Vec<AoChannelConfig> = source
            .ao_channels
            .iter()
            .filter(|c| keep(&c.name))
            .cloned()
            .collect();
        let ai_channels = source
            .ai_channels
            .iter()
            .filter(|c| keep(&c.name))
            .cloned()
            .map(|mut c| {
                if c.loopback.as_deref().is_some_and(|src| !keep(src)) {
                    debug!(channel = %c.name, "Loopback source not cloned; input left unconnected");
                    c.loopback = None;
                }
                c
            })
            .collect();

        let config = MockEngineConfig {
            name: format!("{}-clone", source.name),
            ao_channels,
            ai_channels,
            do_channels: source.do_channels.iter().filter(|c| keep(c)).cloned().collect(),
            di_channels: source.di_channels.iter().filter(|c| keep(c)).cloned().collect(),
            ..source.clone()
        };
        Ok(Arc::new(MockEngine::new(config)?))
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                error!("Error stopping engine on drop: {}", e);
            }
        }
    }
}
