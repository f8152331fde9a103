use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::epoch::{BlockSource, EpochDriver};
use super::{ChannelBinding, ChannelBindings, OutputError, OutputMode, OutputState};
use crate::engine::{ChannelInfo, Engine};
use crate::queue::{Metadata, QueueEvent, SignalQueue};
use crate::waveform::{StimulusSpec, WaveformFactory};

/// One row of a trial list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSetting {
    /// Stimulus played on each repetition
    pub stimulus: StimulusSpec,
    /// Number of repetitions
    #[serde(default = "default_averages")]
    pub averages: u32,
    /// Silence after each repetition (s)
    #[serde(default)]
    pub iti_duration: f64,
    /// Annotations copied onto each extracted epoch
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_averages() -> u32 {
    1
}

impl TrialSetting {
    /// Setting with the given stimulus, repetitions and inter-trial interval.
    pub fn new(stimulus: StimulusSpec, averages: u32, iti_duration: f64) -> Self {
        Self {
            stimulus,
            averages,
            iti_duration,
            metadata: Metadata::new(),
        }
    }
}

struct QueueSource {
    queue: SignalQueue,
    decrement: bool,
}

impl BlockSource for QueueSource {
    fn next_block(&mut self, out: &mut [f64]) -> (usize, bool) {
        self.queue.pop_into(out, self.decrement)
    }

    fn align(&mut self, offset: u64) {
        self.queue.set_offset(offset);
    }

    fn abort(&mut self) {
        self.queue.abort_trial(self.decrement);
    }
}

/// Plays a [`SignalQueue`] into already-buffered samples.
///
/// The driver finishes when the queue is exhausted. With `auto_decrement`
/// off, entries are never consumed and the queue plays until cleared.
pub struct QueuedEpochOutput {
    driver: Arc<EpochDriver<QueueSource>>,
    _binding: ChannelBinding,
}

impl QueuedEpochOutput {
    /// Create a queued output on `channel`, claiming its epoch slot.
    pub fn new(
        name: &str,
        channel: &str,
        engine: Arc<dyn Engine>,
        bindings: &ChannelBindings,
        queue: SignalQueue,
        auto_decrement: bool,
    ) -> Result<Self, OutputError> {
        let info = engine.channel(channel)?;
        let binding = bindings.bind(channel, OutputMode::Epoch, name)?;
        let driver = Arc::new(EpochDriver::new(name, info, engine));
        driver.with_source(|slot| {
            *slot = Some(QueueSource {
                queue,
                decrement: auto_decrement,
            })
        });
        Ok(Self {
            driver,
            _binding: binding,
        })
    }

    /// Set the refill block length (s).
    pub fn configure(&self, block_duration: f64) -> Result<(), OutputError> {
        self.driver.configure(block_duration)
    }

    /// Append one queue entry per setting and become ready to start.
    ///
    /// An empty list is valid when the queue was filled up front. If any
    /// setting is rejected nothing is appended.
    pub fn setup(&self, settings: &[TrialSetting]) -> Result<(), OutputError> {
        let channel = self.driver.channel().clone();
        let mut entries = Vec::with_capacity(settings.len());
        for setting in settings {
            let factory = WaveformFactory::new(
                &setting.stimulus,
                channel.fs,
                Arc::clone(&channel.calibration),
            )?;
            let gap = (setting.iti_duration.max(0.0) * channel.fs).round() as usize;
            entries.push((factory, setting.averages, gap, setting.metadata.clone()));
        }

        self.driver
            .prepare(|slot| {
                let source = slot.as_mut().ok_or_else(|| OutputError::NotConfigured {
                    output: self.driver.name().to_string(),
                })?;
                source.queue.append_all(entries)?;
                debug!(
                    output = %self.driver.name(),
                    entries = source.queue.len(),
                    trials = source.queue.count_trials(),
                    "Queue configured"
                );
                Ok(())
            })
    }

    /// Subscribe to trial events from the queue.
    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        self.driver.with_source(|slot| {
            slot.as_mut()
                .map_or_else(|| mpsc::channel().1, |s| s.queue.subscribe())
        })
    }

    /// Run `f` against the queue.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut SignalQueue) -> R) -> Option<R> {
        self.driver
            .with_source(|slot| slot.as_mut().map(|s| f(&mut s.queue)))
    }

    /// Begin playing at `start_time + delay` seconds.
    ///
    /// Returns the time needed to play the rest of the queue once, or
    /// infinity if it holds an unbounded waveform.
    pub fn start(&self, start_time: f64, delay: f64) -> Result<f64, OutputError> {
        let fs = self.driver.channel().fs;
        let duration = self
            .with_queue(|q| q.remaining_samples())
            .flatten()
            .map_or(f64::INFINITY, |n| n as f64 / fs);
        self.driver.start(start_time, delay)?;
        Ok(duration)
    }

    /// Zero this output's samples from `end_time + delay` onward and stop.
    ///
    /// The trial in progress is abandoned; a later start begins with a
    /// fresh trial.
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
