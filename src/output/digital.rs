use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::OutputError;
use crate::engine::Engine;

/// Default pulse width for [`Trigger::fire`] (s).
pub const DEFAULT_TRIGGER_DURATION: f64 = 0.1;

/// Software-timed pulse on a digital line.
#[derive(Debug)]
pub struct Trigger {
    name: String,
    channel: String,
    duration: f64,
    engine: Arc<dyn Engine>,
}

impl Trigger {
    /// Trigger on `channel` with the default pulse width.
    pub fn new(name: &str, channel: &str, engine: Arc<dyn Engine>) -> Result<Self, OutputError> {
        engine.channel(channel)?;
        Ok(Self {
            name: name.to_string(),
            channel: channel.to_string(),
            duration: DEFAULT_TRIGGER_DURATION,
            engine,
        })
    }

    /// Change the pulse width (s).
    #[must_use]
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Emit one pulse.
    pub fn fire(&self) -> Result<(), OutputError> {
        debug!(trigger = %self.name, channel = %self.channel, "Firing trigger");
        self.engine.fire_sw_do(&self.channel, self.duration)?;
        Ok(())
    }
}

/// Software-controlled level on a digital line.
#[derive(Debug)]
pub struct Toggle {
    name: String,
    channel: String,
    engine: Arc<dyn Engine>,
    high: Mutex<bool>,
}

impl Toggle {
    /// Toggle on `channel`, starting low.
    pub fn new(name: &str, channel: &str, engine: Arc<dyn Engine>) -> Result<Self, OutputError> {
        engine.channel(channel)?;
        Ok(Self {
            name: name.to_string(),
            channel: channel.to_string(),
            engine,
            high: Mutex::new(false),
        })
    }

    /// Drive the line high or low.
    pub fn set(&self, high: bool) -> Result<(), OutputError> {
        let mut level = self.high.lock();
        self.engine.set_sw_do(&self.channel, high)?;
        *level = high;
        debug!(toggle = %self.name, high, "Set toggle");
        Ok(())
    }

    /// Drive the line high.
    pub fn set_high(&self) -> Result<(), OutputError> {
        self.set(true)
    }

    /// Drive the line low.
    pub fn set_low(&self) -> Result<(), OutputError> {
        self.set(false)
    }

    /// Last level written.
    pub fn is_high(&self) -> bool {
        *self.high.lock()
    }
}
