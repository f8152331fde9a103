//! Output drivers.
//!
//! Drivers keep an engine's analog output buffer fed from a waveform source.
//!
//! | Driver | Source | Buffer access | Finishes |
//! |--------|--------|---------------|----------|
//! | [`ContinuousOutput`] | one waveform, looped if finite | append at write head | never; [`ContinuousOutput::stop`] |
//! | [`NullOutput`] | zeros | append at write head | never |
//! | [`EpochOutput`] | one finite waveform | overwrite at an offset | when the waveform ends |
//! | [`QueuedEpochOutput`] | a [`SignalQueue`](crate::queue::SignalQueue) | overwrite at an offset | when the queue is exhausted |
//!
//! Epoch drivers write into samples another driver has already buffered, so
//! a channel carrying epochs also needs a continuous driver (usually a
//! [`NullOutput`]) keeping its buffer full.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured ──setup──▶ Configured ──start──▶ Active ──source done──▶ Draining
//!                             ▲                   │                       │
//!                             └──────setup────────┴────clear/stop─────────┴──▶ Stopped
//! ```
//!
//! Every driver method takes `&self`; per-driver state sits behind a
//! `parking_lot::Mutex` shared with the engine callback.
//!
//! # Underruns
//!
//! When the hardware play position has passed a driver's write offset the
//! driver records [`OutputError::BufferUnderrun`] in its [`FaultLog`], logs a
//! warning and skips ahead to the play position. The samples that should have
//! played are discarded, keeping later samples on their original schedule.

mod continuous;
mod digital;
mod epoch;
mod queued;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::queue::QueueError;
use crate::waveform::WaveformError;

pub use continuous::{ContinuousOutput, NullOutput};
pub use digital::{Toggle, Trigger};
pub use epoch::EpochOutput;
pub use queued::{QueuedEpochOutput, TrialSetting};

/// Default refill block for epoch drivers (s).
pub const DEFAULT_BLOCK_DURATION: f64 = 2.0;

/// Errors raised by output drivers.
#[derive(Error, Debug)]
pub enum OutputError {
    /// Operation not allowed while the output is playing.
    #[error("Output '{output}' is active")]
    AlreadyActive {
        /// Output name
        output: String,
    },

    /// `start` was called before a successful `setup`.
    #[error("Output '{output}' has not been set up")]
    NotConfigured {
        /// Output name
        output: String,
    },

    /// The hardware played past the driver's write offset.
    #[error("Buffer underrun on '{channel}' for output '{output}': writing at {offset}, hardware at {position}")]
    BufferUnderrun {
        /// Output name
        output: String,
        /// Channel name
        channel: String,
        /// Driver's write offset
        offset: u64,
        /// Hardware play position
        position: u64,
    },

    /// Another output of the same mode already drives the channel.
    #[error("{mode} output already defined for {channel} (by '{existing}')")]
    ChannelInUse {
        /// Channel name
        channel: String,
        /// Output mode
        mode: OutputMode,
        /// Output holding the binding
        existing: String,
    },

    /// Epoch outputs need a waveform with a known end.
    #[error("Output '{output}' needs a finite waveform")]
    UnboundedEpoch {
        /// Output name
        output: String,
    },

    /// A looping output was given a waveform with no samples.
    #[error("Output '{output}' cannot loop an empty waveform")]
    EmptyWaveform {
        /// Output name
        output: String,
    },

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Waveform could not be built.
    #[error(transparent)]
    Waveform(#[from] WaveformError),

    /// Queue rejected an entry.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// No waveform loaded.
    Unconfigured,
    /// Waveform loaded, not yet playing.
    Configured,
    /// Writing to the buffer.
    Active,
    /// Source finished; written samples are still playing out.
    Draining,
    /// Cleared or stopped.
    Stopped,
}

/// How an output writes to its channel. One output per channel and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputMode {
    /// Appends at the write head.
    Continuous,
    /// Overwrites buffered samples.
    Epoch,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuous => write!(f, "continuous"),
            Self::Epoch => write!(f, "epoch"),
        }
    }
}

/// Registry of which output drives each (channel, mode) pair.
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct ChannelBindings {
    inner: Arc<Mutex<HashMap<(String, OutputMode), String>>>,
}

impl ChannelBindings {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `channel` in `mode` for `output`. The claim lasts as long as the
    /// returned binding.
    pub fn bind(
        &self,
        channel: &str,
        mode: OutputMode,
        output: &str,
    ) -> Result<ChannelBinding, OutputError> {
        let mut inner = self.inner.lock();
        let key = (channel.to_string(), mode);
        if let Some(existing) = inner.get(&key) {
            return Err(OutputError::ChannelInUse {
                channel: channel.to_string(),
                mode,
                existing: existing.clone(),
            });
        }
        inner.insert(key, output.to_string());
        debug!(channel, %mode, output, "Bound output");
        Ok(ChannelBinding {
            bindings: self.clone(),
            channel: channel.to_string(),
            mode,
        })
    }

    /// Output currently bound to `channel` in `mode`.
    pub fn bound(&self, channel: &str, mode: OutputMode) -> Option<String> {
        self.inner
            .lock()
            .get(&(channel.to_string(), mode))
            .cloned()
    }
}

/// Claim on a (channel, mode) pair, released on drop.
#[derive(Debug)]
pub struct ChannelBinding {
    bindings: ChannelBindings,
    channel: String,
    mode: OutputMode,
}

impl Drop for ChannelBinding {
    fn drop(&mut self) {
        self.bindings
            .inner
            .lock()
            .remove(&(std::mem::take(&mut self.channel), self.mode));
    }
}

/// Faults recorded by an output's callback, drained by the control side.
#[derive(Debug, Clone, Default)]
pub struct FaultLog {
    inner: Arc<Mutex<Vec<OutputError>>>,
}

impl FaultLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fault.
    pub fn record(&self, fault: OutputError) {
        self.inner.lock().push(fault);
    }

    /// Remove and return every recorded fault.
    pub fn take(&self) -> Vec<OutputError> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Number of faults waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no faults are waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Sample offset for a time in seconds.
fn to_offset(seconds: f64, fs: f64) -> u64 {
    (seconds * fs).round().max(0.0) as u64
}

/// Block size in samples for a duration in seconds.
fn to_block_samples(block_duration: f64, fs: f64) -> usize {
    ((block_duration * fs).round() as usize).max(1)
}

/// Overwrite everything buffered from `offset` on with zeros in `output`'s
/// contribution.
fn zero_from(engine: &dyn Engine, channel: &str, output: &str, offset: u64) -> Result<usize, EngineError> {
    let _guard = engine.buffer_lock();
    let from = offset.max(engine.hw_ao_position(channel)?);
    let n = engine.get_buffered_samples(channel, from)?;
    if n > 0 {
        engine.modify_hw_ao(channel, from, &vec![0.0; n], output)?;
    }
    Ok(n)
}
