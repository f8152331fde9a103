use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    to_block_samples, to_offset, zero_from, ChannelBinding, ChannelBindings, FaultLog, OutputError,
    OutputMode, OutputState, DEFAULT_BLOCK_DURATION,
};
use crate::engine::{CallbackStatus, ChannelInfo, Engine, EngineError};
use crate::waveform::{Generator, StimulusSpec, WaveformFactory};

/// Something an epoch driver can pull finite blocks from.
pub(super) trait BlockSource: Send + 'static {
    /// Fill the front of `out`; return samples written and whether the source is done.
    fn next_block(&mut self, out: &mut [f64]) -> (usize, bool);

    /// Called when playback begins at `offset`.
    fn align(&mut self, _offset: u64) {}

    /// Called when the output is cleared mid-playback.
    fn abort(&mut self) {}
}

impl BlockSource for Generator {
    fn next_block(&mut self, out: &mut [f64]) -> (usize, bool) {
        let written = if self.is_complete() {
            0
        } else {
            self.fill(out).unwrap_or(0)
        };
        (written, self.is_complete())
    }
}

struct EpochState<S> {
    state: OutputState,
    source: Option<S>,
    offset: u64,
    block_samples: usize,
    scratch: Vec<f64>,
    generation: u64,
}

/// Offset-writing driver core shared by [`EpochOutput`] and
/// [`QueuedEpochOutput`](super::QueuedEpochOutput).
pub(super) struct EpochDriver<S> {
    name: String,
    channel: ChannelInfo,
    engine: Arc<dyn Engine>,
    faults: FaultLog,
    inner: Mutex<EpochState<S>>,
}

impl<S: BlockSource> EpochDriver<S> {
    pub(super) fn new(name: &str, channel: ChannelInfo, engine: Arc<dyn Engine>) -> Self {
        let block_samples = to_block_samples(DEFAULT_BLOCK_DURATION, channel.fs);
        Self {
            name: name.to_string(),
            channel,
            engine,
            faults: FaultLog::new(),
            inner: Mutex::new(EpochState {
                state: OutputState::Unconfigured,
                source: None,
                offset: 0,
                block_samples,
                scratch: Vec::new(),
                generation: 0,
            }),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub(super) fn faults(&self) -> &FaultLog {
        &self.faults
    }

    pub(super) fn state(&self) -> OutputState {
        self.inner.lock().state
    }

    pub(super) fn configure(&self, block_duration: f64) -> Result<(), OutputError> {
        let mut st = self.inner.lock();
        if st.state == OutputState::Active {
            return Err(self.already_active());
        }
        st.block_samples = to_block_samples(block_duration, self.channel.fs);
        Ok(())
    }

    /// Install a new source and move to `Configured`.
    pub(super) fn load(&self, source: S) -> Result<(), OutputError> {
        self.prepare(|slot| {
            *slot = Some(source);
            Ok(())
        })
    }

    /// Update the source in place and move to `Configured`.
    pub(super) fn prepare<R>(
        &self,
        f: impl FnOnce(&mut Option<S>) -> Result<R, OutputError>,
    ) -> Result<R, OutputError> {
        let mut st = self.inner.lock();
        if st.state == OutputState::Active {
            return Err(self.already_active());
        }
        let result = f(&mut st.source)?;
        st.state = OutputState::Configured;
        let block = st.block_samples;
        st.scratch.resize(block, 0.0);
        Ok(result)
    }

    /// Access the source without changing state.
    pub(super) fn with_source<R>(&self, f: impl FnOnce(&mut Option<S>) -> R) -> R {
        f(&mut self.inner.lock().source)
    }

    pub(super) fn start(self: &Arc<Self>, start_time: f64, delay: f64) -> Result<(), OutputError> {
        let generation = {
            let mut st = self.inner.lock();
            match st.state {
                OutputState::Configured => {}
                OutputState::Active => return Err(self.already_active()),
                _ => {
                    return Err(OutputError::NotConfigured {
                        output: self.name.clone(),
                    })
                }
            }
            let offset = to_offset(start_time + delay, self.channel.fs);
            st.offset = offset;
            if let Some(source) = st.source.as_mut() {
                source.align(offset);
            }
            st.state = OutputState::Active;
            st.generation += 1;
            info!(output = %self.name, channel = %self.channel.name, offset, "Starting epoch");
            st.generation
        };

        if self.step(generation) == CallbackStatus::Continue {
            let driver = Arc::clone(self);
            self.engine.register_ao_callback(
                &self.channel.name,
                Box::new(move || driver.step(generation)),
            )?;
        }
        Ok(())
    }

    pub(super) fn clear(&self, end_time: f64, delay: f64) -> Result<(), OutputError> {
        let mut st = self.inner.lock();
        if st.state == OutputState::Unconfigured {
            return Err(OutputError::NotConfigured {
                output: self.name.clone(),
            });
        }
        let offset = to_offset(end_time + delay, self.channel.fs);
        let zeroed = zero_from(self.engine.as_ref(), &self.channel.name, &self.name, offset)?;
        if let Some(source) = st.source.as_mut() {
            source.abort();
        }
        st.state = OutputState::Stopped;
        info!(output = %self.name, offset, zeroed, "Cleared epoch");
        Ok(())
    }

    /// One refill pass. Runs on the engine thread.
    fn step(&self, generation: u64) -> CallbackStatus {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.generation != generation || st.state != OutputState::Active {
            return CallbackStatus::Done;
        }
        let Some(source) = st.source.as_mut() else {
            st.state = OutputState::Stopped;
            return CallbackStatus::Done;
        };

        let (position, buffered) = {
            let _lock = self.engine.buffer_lock();
            let position = self.engine.hw_ao_position(&self.channel.name);
            let buffered = self.engine.get_buffered_samples(&self.channel.name, st.offset);
            match position.and_then(|p| buffered.map(|b| (p, b))) {
                Ok(v) => v,
                Err(e) => {
                    self.fail(e);
                    st.state = OutputState::Stopped;
                    return CallbackStatus::Done;
                }
            }
        };

        if position > st.offset {
            self.underrun(st.offset, position);
            let mut missed = (position - st.offset) as usize;
            while missed > 0 {
                let n = missed.min(st.scratch.len().max(1));
                if st.scratch.len() < n {
                    st.scratch.resize(n, 0.0);
                }
                let (written, done) = source.next_block(&mut st.scratch[..n]);
                missed -= written.min(missed);
                st.offset += written as u64;
                if done {
                    st.state = OutputState::Draining;
                    return CallbackStatus::Done;
                }
                if written == 0 {
                    break;
                }
            }
            st.offset = position;
        }

        let n = st.block_samples.min(buffered);
        if n == 0 {
            return CallbackStatus::Continue;
        }
        if st.scratch.len() < n {
            st.scratch.resize(n, 0.0);
        }
        let (written, done) = source.next_block(&mut st.scratch[..n]);

        match self.write(st.offset, &st.scratch[..written]) {
            Ok(0) => {}
            Ok(skipped) => self.underrun(st.offset, st.offset + skipped),
            Err(e) => self.fail(e),
        }
        st.offset += written as u64;

        if done {
            st.state = OutputState::Draining;
            debug!(output = %self.name, end = st.offset, "Epoch fully buffered");
            CallbackStatus::Done
        } else {
            CallbackStatus::Continue
        }
    }

    /// Write at `offset`, dropping whatever the hardware has already played.
    /// Returns the number of samples dropped.
    fn write(&self, offset: u64, samples: &[f64]) -> Result<u64, EngineError> {
        let _lock = self.engine.buffer_lock();
        let position = self.engine.hw_ao_position(&self.channel.name)?;
        let skip = position.saturating_sub(offset).min(samples.len() as u64);
        let rest = &samples[skip as usize..];
        if !rest.is_empty() {
            self.engine
                .modify_hw_ao(&self.channel.name, offset + skip, rest, &self.name)?;
        }
        Ok(skip)
    }

    fn underrun(&self, offset: u64, position: u64) {
        warn!(
            output = %self.name,
            channel = %self.channel.name,
            offset,
            position,
            "Buffer underrun, skipping ahead"
        );
        self.faults.record(OutputError::BufferUnderrun {
            output: self.name.clone(),
            channel: self.channel.name.clone(),
            offset,
            position,
        });
    }

    fn fail(&self, error: EngineError) {
        warn!(output = %self.name, error = %error, "Engine rejected epoch write");
        self.faults.record(OutputError::Engine(error));
    }

    fn already_active(&self) -> OutputError {
        OutputError::AlreadyActive {
            output: self.name.clone(),
        }
    }
}

/// Plays one finite waveform into already-buffered samples.
///
/// ```no_run
/// use std::sync::Arc;
/// use rust_psi::engine::{Engine, MockEngine, MockEngineConfig};
/// use rust_psi::output::{ChannelBindings, EpochOutput, NullOutput};
/// use rust_psi::waveform::StimulusSpec;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine: Arc<dyn Engine> =
///     Arc::new(MockEngine::new(MockEngineConfig::loopback(100_000.0, "speaker", "mic"))?);
/// let bindings = ChannelBindings::new();
/// let background = NullOutput::new("background", "speaker", Arc::clone(&engine), &bindings)?;
/// background.start()?;
///
/// let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings)?;
/// target.setup(&StimulusSpec::tone(1000.0, -20.0, 0.05))?;
/// let duration = target.start(0.1, 0.0)?;
/// # Ok(())
/// # }
/// ```
pub struct EpochOutput {
    driver: Arc<EpochDriver<Generator>>,
    duration: Mutex<Option<f64>>,
    _binding: ChannelBinding,
}

impl EpochOutput {
    /// Create an epoch output on `channel`, claiming its epoch slot.
    pub fn new(
        name: &str,
        channel: &str,
        engine: Arc<dyn Engine>,
        bindings: &ChannelBindings,
    ) -> Result<Self, OutputError> {
        let info = engine.channel(channel)?;
        let binding = bindings.bind(channel, OutputMode::Epoch, name)?;
        Ok(Self {
            driver: Arc::new(EpochDriver::new(name, info, engine)),
            duration: Mutex::new(None),
            _binding: binding,
        })
    }

    /// Set the refill block length (s).
    pub fn configure(&self, block_duration: f64) -> Result<(), OutputError> {
        self.driver.configure(block_duration)
    }

    /// Load a stimulus built with the channel's rate and calibration.
    pub fn setup(&self, stimulus: &StimulusSpec) -> Result<(), OutputError> {
        let channel = self.driver.channel();
        let factory = WaveformFactory::new(stimulus, channel.fs, Arc::clone(&channel.calibration))?;
        self.setup_factory(factory)
    }

    /// Load a prepared factory.
    pub fn setup_factory(&self, factory: WaveformFactory) -> Result<(), OutputError> {
        let duration = factory.duration().ok_or_else(|| OutputError::UnboundedEpoch {
            output: self.driver.name().to_string(),
        })?;
        self.driver.load(factory.generator())?;
        *self.duration.lock() = Some(duration);
        debug!(output = %self.driver.name(), duration, "Epoch configured");
        Ok(())
    }

    /// Begin playing at `start_time + delay` seconds. Returns the epoch duration.
    pub fn start(&self, start_time: f64, delay: f64) -> Result<f64, OutputError> {
        let duration = (*self.duration.lock()).ok_or_else(|| OutputError::NotConfigured {
            output: self.driver.name().to_string(),
        })?;
        self.driver.start(start_time, delay)?;
        Ok(duration)
    }

    /// Zero this output's samples from `end_time + delay` onward and stop.
    pub fn clear(&self, end_time: f64, delay: f64) -> Result<(), OutputError> {
        self.driver.clear(end_time, delay)
    }

    /// Lifecycle state.
    pub fn state(&self) -> OutputState {
        self.driver.state()
    }

    /// Drain recorded underruns and engine faults.
    pub fn take_faults(&self) -> Vec<OutputError> {
        self.driver.faults().take()
    }

    /// Output name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Channel being driven.
    pub fn channel(&self) -> &ChannelInfo {
        self.driver.channel()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::engine::{MockEngine, MockEngineConfig};
    use crate::output::{ChannelBindings, NullOutput};

    fn engine() -> (Arc<MockEngine>, Arc<dyn Engine>) {
        let mut config = MockEngineConfig::loopback(1000.0, "speaker", "mic");
        config.buffer_duration = 0.1;
        config.record_output = true;
        let mock = Arc::new(MockEngine::new(config).unwrap());
        let engine: Arc<dyn Engine> = mock.clone();
        (mock, engine)
    }

    #[test]
    #[traced_test]
    fn test_underrun_is_logged_and_recorded() {
        let (mock, engine) = engine();
        let bindings = ChannelBindings::new();
        let background = NullOutput::new("background", "speaker", Arc::clone(&engine), &bindings).unwrap();
        background.configure(0.1).unwrap();
        background.start().unwrap();

        let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
        target.configure(0.01).unwrap();
        target
            .setup_factory(WaveformFactory::from_samples(vec![1.0; 100], 1000.0).unwrap())
            .unwrap();
        target.start(0.0, 0.0).unwrap();
        mock.advance(30);

        assert!(logs_contain("Buffer underrun, skipping ahead"));
        assert_eq!(target.take_faults().len(), 1);
        assert_eq!(target.state(), OutputState::Active);
    }

    #[test]
    fn test_draining_epoch_can_be_set_up_again() {
        let (mock, engine) = engine();
        let bindings = ChannelBindings::new();
        let background = NullOutput::new("background", "speaker", Arc::clone(&engine), &bindings).unwrap();
        background.configure(0.1).unwrap();
        background.start().unwrap();

        let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
        target
            .setup_factory(WaveformFactory::from_samples(vec![1.0; 5], 1000.0).unwrap())
            .unwrap();
        target.start(0.0, 0.0).unwrap();
        assert_eq!(target.state(), OutputState::Draining);

        target
            .setup_factory(WaveformFactory::from_samples(vec![2.0; 5], 1000.0).unwrap())
            .unwrap();
        target.start(0.01, 0.0).unwrap();
        mock.advance(20);

        let played = mock.played_ao("speaker").unwrap();
        assert_eq!(&played[..5], &[1.0; 5]);
        assert_eq!(&played[10..15], &[2.0; 5]);
        assert!(played[15..].iter().all(|&s| s == 0.0));
    }
}
