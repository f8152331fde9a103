//! Hardware engine abstraction.
//!
//! An [`Engine`] owns the analog output buffers, the acquisition clock and
//! the callback dispatch for a set of channels. Output drivers never touch
//! hardware directly; they ask the engine how much of a channel's buffer is
//! filled from a given offset, then write or overwrite samples there.
//!
//! # Offsets
//!
//! All offsets are absolute sample counts on a channel since the engine
//! started. The hardware play position only moves forward. Samples before it
//! have been played and can no longer be modified.
//!
//! # Locking
//!
//! [`Engine::buffer_lock`] returns a guard serializing buffer inspection and
//! modification across threads. Drivers hold it only around a
//! read-position/modify sequence, never while generating samples.
//!
//! # Callbacks
//!
//! Callbacks run on the engine's acquisition thread. Returning
//! [`CallbackStatus::Done`] unregisters the callback. Callbacks may register
//! further callbacks but must not block.

pub mod mock;

use std::fmt;
use std::sync::Arc;

use parking_lot::MutexGuard;
use thiserror::Error;

use crate::calibration::Calibration;

pub use mock::{MockEngine, MockEngineConfig};

/// Errors reported by an engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Channel name not known to this engine.
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// Write or read outside the modifiable region of the buffer.
    #[error("Offset {offset} on '{channel}' is outside the writable region [{start}, {end})")]
    OffsetOutOfRange {
        /// Channel name
        channel: String,
        /// Requested offset
        offset: u64,
        /// First modifiable sample
        start: u64,
        /// One past the last buffered sample
        end: u64,
    },

    /// No room for appended samples.
    #[error("Buffer full on '{channel}': {requested} samples requested, {available} available")]
    BufferFull {
        /// Channel name
        channel: String,
        /// Samples requested
        requested: usize,
        /// Space available
        available: usize,
    },

    /// Operation not valid in the engine's current run state.
    #[error("Engine '{engine}' is {state}")]
    InvalidState {
        /// Engine name
        engine: String,
        /// Description of the state
        state: &'static str,
    },

    /// Engine was configured inconsistently.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Whether a callback wants to keep receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CallbackStatus {
    /// Keep the callback registered.
    Continue,
    /// Unregister the callback.
    Done,
}

/// Direction and type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Analog output
    AnalogOutput,
    /// Analog input
    AnalogInput,
    /// Software-timed digital output
    DigitalOutput,
    /// Digital input
    DigitalInput,
}

/// Static properties of a channel.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Channel name
    pub name: String,
    /// Channel type
    pub kind: ChannelKind,
    /// Sampling rate (Hz)
    pub fs: f64,
    /// Volts ↔ level conversion
    pub calibration: Arc<dyn Calibration>,
}

/// Digital edge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

/// Timestamped digital edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEvent {
    /// Digital line name
    pub line: String,
    /// Edge direction
    pub edge: Edge,
    /// Time of the edge in seconds since engine start
    pub timestamp: f64,
}

/// Analog output refill request handler.
pub type AoCallback = Box<dyn FnMut() -> CallbackStatus + Send>;
/// Analog input block handler.
pub type AiCallback = Box<dyn FnMut(&[f64]) -> CallbackStatus + Send>;
/// Edge event handler.
pub type EtCallback = Box<dyn FnMut(&EdgeEvent) -> CallbackStatus + Send>;
/// Digital input block handler.
pub type DiCallback = Box<dyn FnMut(&[bool]) -> CallbackStatus + Send>;

/// Buffer-level access to acquisition hardware.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Look up a channel.
    fn channel(&self, name: &str) -> Result<ChannelInfo, EngineError>;

    /// All channels in configuration order.
    fn channels(&self) -> Vec<ChannelInfo>;

    /// Guard serializing buffer inspection and modification.
    fn buffer_lock(&self) -> MutexGuard<'_, ()>;

    /// Samples already buffered on `channel` at or after `offset` (clamped to
    /// the play position).
    fn get_buffered_samples(&self, channel: &str, offset: u64) -> Result<usize, EngineError>;

    /// Room left to append on `channel` when writing continues from `offset`.
    fn get_space_available(&self, channel: &str, offset: u64) -> Result<usize, EngineError>;

    /// Current hardware play position on an output channel.
    fn hw_ao_position(&self, channel: &str) -> Result<u64, EngineError>;

    /// Replace `output_id`'s contribution to already-buffered samples at
    /// `offset`. Contributions from different outputs on one channel sum.
    fn modify_hw_ao(
        &self,
        channel: &str,
        offset: u64,
        samples: &[f64],
        output_id: &str,
    ) -> Result<(), EngineError>;

    /// Extend `channel`'s buffer at its write head.
    fn append_hw_ao(&self, channel: &str, samples: &[f64]) -> Result<(), EngineError>;

    /// Request refills whenever `channel` needs data.
    fn register_ao_callback(&self, channel: &str, callback: AoCallback) -> Result<(), EngineError>;

    /// Receive every acquired block on `channel`.
    fn register_ai_callback(&self, channel: &str, callback: AiCallback) -> Result<(), EngineError>;

    /// Receive edge events from all timing lines.
    fn register_et_callback(&self, callback: EtCallback);

    /// Receive every acquired block on a digital input.
    fn register_di_callback(&self, channel: &str, callback: DiCallback) -> Result<(), EngineError>;

    /// Drive a digital output high for `duration` seconds.
    fn fire_sw_do(&self, channel: &str, duration: f64) -> Result<(), EngineError>;

    /// Set a digital output level.
    fn set_sw_do(&self, channel: &str, high: bool) -> Result<(), EngineError>;

    /// Start the acquisition clock.
    fn start(&self) -> Result<(), EngineError>;

    /// Stop the acquisition clock. Idempotent.
    fn stop(&self) -> Result<(), EngineError>;

    /// Whether the clock is running.
    fn is_running(&self) -> bool;

    /// New, independent engine over a subset of this engine's channels.
    fn clone_with_channels(&self, channels: &[&str]) -> Result<Arc<dyn Engine>, EngineError>;
}
