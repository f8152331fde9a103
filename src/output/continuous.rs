use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    to_block_samples, ChannelBinding, ChannelBindings, FaultLog, OutputError, OutputMode,
    OutputState, DEFAULT_BLOCK_DURATION,
};
use crate::engine::{CallbackStatus, ChannelInfo, Engine, EngineError};
use crate::waveform::{Generator, StimulusSpec, WaveformFactory};

struct ContinuousState {
    state: OutputState,
    factory: Option<WaveformFactory>,
    generator: Option<Generator>,
    offset: u64,
    block_samples: usize,
    scratch: Vec<f64>,
    generation: u64,
}

struct ContinuousDriver {
    name: String,
    channel: ChannelInfo,
    engine: Arc<dyn Engine>,
    faults: FaultLog,
    inner: Mutex<ContinuousState>,
}

impl ContinuousDriver {
    /// Top up the buffer. Runs on the engine thread.
    fn step(&self, generation: u64) -> CallbackStatus {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.generation != generation || st.state != OutputState::Active {
            return CallbackStatus::Done;
        }

        let space = {
            let _lock = self.engine.buffer_lock();
            match self.catch_up(st.offset) {
                Ok(offset) => {
                    st.offset = offset;
                    self.engine.get_space_available(&self.channel.name, offset)
                }
                Err(e) => Err(e),
            }
        };
        let space = match space {
            Ok(space) => space,
            Err(e) => return self.fail(st, e),
        };

        let n = st.block_samples.min(space);
        if n == 0 {
            return CallbackStatus::Continue;
        }
        if st.scratch.len() < n {
            st.scratch.resize(n, 0.0);
        }

        let (Some(factory), Some(generator)) = (st.factory.as_ref(), st.generator.as_mut()) else {
            st.state = OutputState::Stopped;
            return CallbackStatus::Done;
        };
        let mut written = 0;
        while written < n {
            if generator.is_complete() {
                *generator = factory.generator();
            }
            written += generator.fill(&mut st.scratch[written..n]).unwrap_or(0);
        }

        let appended = {
            let _lock = self.engine.buffer_lock();
            self.catch_up(st.offset).and_then(|offset| {
                st.offset = offset;
                self.engine.append_hw_ao(&self.channel.name, &st.scratch[..n])
            })
        };
        match appended {
            Ok(()) => {
                st.offset += n as u64;
                CallbackStatus::Continue
            }
            Err(e) => self.fail(st, e),
        }
    }

    /// Move `offset` up to the play position, recording an underrun if the
    /// hardware got there first. Caller holds the buffer lock.
    fn catch_up(&self, offset: u64) -> Result<u64, EngineError> {
        let position = self.engine.hw_ao_position(&self.channel.name)?;
        if position > offset {
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
            return Ok(position);
        }
        Ok(offset)
    }

    fn fail(&self, st: &mut ContinuousState, error: EngineError) -> CallbackStatus {
        warn!(output = %self.name, error = %error, "Continuous output stopped by engine error");
        self.faults.record(OutputError::Engine(error));
        st.state = OutputState::Stopped;
        CallbackStatus::Done
    }
}

/// Keeps a channel's buffer full from one waveform, looping it if finite.
pub struct ContinuousOutput {
    driver: Arc<ContinuousDriver>,
    _binding: ChannelBinding,
}

impl ContinuousOutput {
    /// Create a continuous output on `channel`, claiming its continuous slot.
    pub fn new(
        name: &str,
        channel: &str,
        engine: Arc<dyn Engine>,
        bindings: &ChannelBindings,
    ) -> Result<Self, OutputError> {
        let info = engine.channel(channel)?;
        let binding = bindings.bind(channel, OutputMode::Continuous, name)?;
        let block_samples = to_block_samples(DEFAULT_BLOCK_DURATION, info.fs);
        Ok(Self {
            driver: Arc::new(ContinuousDriver {
                name: name.to_string(),
                channel: info,
                engine,
                faults: FaultLog::new(),
                inner: Mutex::new(ContinuousState {
                    state: OutputState::Unconfigured,
                    factory: None,
                    generator: None,
                    offset: 0,
                    block_samples,
                    scratch: Vec::new(),
                    generation: 0,
                }),
            }),
            _binding: binding,
        })
    }

    /// Set the largest block appended per refill (s).
    pub fn configure(&self, block_duration: f64) -> Result<(), OutputError> {
        let mut st = self.driver.inner.lock();
        if st.state == OutputState::Active {
            return Err(OutputError::AlreadyActive {
                output: self.driver.name.clone(),
            });
        }
        st.block_samples = to_block_samples(block_duration, self.driver.channel.fs);
        Ok(())
    }

    /// Load a stimulus built with the channel's rate and calibration.
    pub fn setup(&self, stimulus: &StimulusSpec) -> Result<(), OutputError> {
        let channel = &self.driver.channel;
        let factory = WaveformFactory::new(stimulus, channel.fs, Arc::clone(&channel.calibration))?;
        self.setup_factory(factory)
    }

    /// Load a prepared factory.
    pub fn setup_factory(&self, factory: WaveformFactory) -> Result<(), OutputError> {
        if factory.n_samples() == Some(0) {
            return Err(OutputError::EmptyWaveform {
                output: self.driver.name.clone(),
            });
        }
        let mut st = self.driver.inner.lock();
        if st.state == OutputState::Active {
            return Err(OutputError::AlreadyActive {
                output: self.driver.name.clone(),
            });
        }
        st.generator = Some(factory.generator());
        st.factory = Some(factory);
        st.state = OutputState::Configured;
        let block = st.block_samples;
        st.scratch.resize(block, 0.0);
        debug!(output = %self.driver.name, "Continuous output configured");
        Ok(())
    }

    /// Begin appending at the channel's write head.
    pub fn start(&self) -> Result<(), OutputError> {
        let driver = &self.driver;
        let generation = {
            let mut st = driver.inner.lock();
            match st.state {
                OutputState::Configured => {}
                OutputState::Active => {
                    return Err(OutputError::AlreadyActive {
                        output: driver.name.clone(),
                    })
                }
                _ => {
                    return Err(OutputError::NotConfigured {
                        output: driver.name.clone(),
                    })
                }
            }
            let channel = &driver.channel.name;
            st.offset = {
                let _lock = driver.engine.buffer_lock();
                let position = driver.engine.hw_ao_position(channel)?;
                position + driver.engine.get_buffered_samples(channel, position)? as u64
            };
            st.state = OutputState::Active;
            st.generation += 1;
            info!(output = %driver.name, channel = %channel, offset = st.offset, "Starting continuous output");
            st.generation
        };

        if driver.step(generation) == CallbackStatus::Continue {
            let callback_driver = Arc::clone(driver);
            driver.engine.register_ao_callback(
                &driver.channel.name,
                Box::new(move || callback_driver.step(generation)),
            )?;
        }
        Ok(())
    }

    /// Stop appending. Samples already buffered still play.
    pub fn stop(&self) {
        let mut st = self.driver.inner.lock();
        if st.state == OutputState::Active {
            st.state = OutputState::Stopped;
            info!(output = %self.driver.name, "Stopped continuous output");
        }
    }

    /// Lifecycle state.
    pub fn state(&self) -> OutputState {
        self.driver.inner.lock().state
    }

    /// Drain recorded underruns and engine faults.
    pub fn take_faults(&self) -> Vec<OutputError> {
        self.driver.faults.take()
    }

    /// Output name.
    pub fn name(&self) -> &str {
        &self.driver.name
    }

    /// Channel being driven.
    pub fn channel(&self) -> &ChannelInfo {
        &self.driver.channel
    }
}

impl Drop for ContinuousOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps a channel's buffer full of zeros so epoch outputs have samples to
/// write into.
pub struct NullOutput {
    output: ContinuousOutput,
}

impl NullOutput {
    /// Create a zero-filling output on `channel`.
    pub fn new(
        name: &str,
        channel: &str,
        engine: Arc<dyn Engine>,
        bindings: &ChannelBindings,
    ) -> Result<Self, OutputError> {
        let output = ContinuousOutput::new(name, channel, engine, bindings)?;
        output.setup_factory(WaveformFactory::silence(output.channel().fs)?)?;
        Ok(Self { output })
    }

    /// Set the largest block appended per refill (s).
    pub fn configure(&self, block_duration: f64) -> Result<(), OutputError> {
        self.output.configure(block_duration)
    }

    /// Begin filling the buffer.
    pub fn start(&self) -> Result<(), OutputError> {
        self.output.start()
    }

    /// Stop filling the buffer.
    pub fn stop(&self) {
        self.output.stop();
    }

    /// Lifecycle state.
    pub fn state(&self) -> OutputState {
        self.output.state()
    }

    /// Drain recorded underruns and engine faults.
    pub fn take_faults(&self) -> Vec<OutputError> {
        self.output.take_faults()
    }
}
