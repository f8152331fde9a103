use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SignalKind, WaveformError, WaveformFactory};

/// Resumable sample source created by [`WaveformFactory::generator`].
///
/// Deterministic kinds compute each sample from its absolute index, so the
/// chunking pattern never affects the output.
#[derive(Debug)]
pub struct Generator {
    factory: WaveformFactory,
    offset: u64,
    noise: Option<GaussianSource>,
}

impl Generator {
    pub(super) fn new(factory: WaveformFactory) -> Self {
        let noise = match factory.kind() {
            SignalKind::Noise { seed, .. } => Some(GaussianSource::new(*seed)),
            _ => None,
        };
        Self {
            factory,
            offset: 0,
            noise,
        }
    }

    /// Fill the front of `out` with the next samples.
    ///
    /// Returns the number written, which is `out.len()` unless the waveform
    /// ends inside this chunk. Calling again after completion is an error.
    pub fn fill(&mut self, out: &mut [f64]) -> Result<usize, WaveformError> {
        if self.is_complete() {
            return Err(WaveformError::Exhausted {
                produced: self.offset,
            });
        }
        let n = match self.remaining() {
            Some(remaining) => out.len().min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => out.len(),
        };
        let fs = self.factory.fs();
        let start = self.offset;
        let out = &mut out[..n];

        match self.factory.kind() {
            SignalKind::Tone {
                amplitude,
                frequency,
                phase,
            } => {
                let step = 2.0 * PI * frequency / fs;
                for (i, sample) in out.iter_mut().enumerate() {
                    let t = (start + i as u64) as f64;
                    *sample = amplitude * (step * t + phase).sin();
                }
            }
            SignalKind::Chirp {
                start_frequency,
                end_frequency,
                level,
                calibration,
            } => {
                let total = self.factory.n_samples().unwrap_or(1).max(1) as f64 / fs;
                let rate = (end_frequency - start_frequency) / total;
                for (i, sample) in out.iter_mut().enumerate() {
                    let t = (start + i as u64) as f64 / fs;
                    let instantaneous = start_frequency + rate * t;
                    let amplitude = calibration.get_sf(instantaneous, *level) * std::f64::consts::SQRT_2;
                    *sample = amplitude * (2.0 * PI * (start_frequency * t + 0.5 * rate * t * t)).sin();
                }
            }
            SignalKind::Noise { rms, .. } => {
                if let Some(source) = self.noise.as_mut() {
                    for sample in out.iter_mut() {
                        *sample = rms * source.next();
                    }
                }
            }
            SignalKind::Silence => out.fill(0.0),
            SignalKind::Samples(samples) => {
                let from = start as usize;
                out.copy_from_slice(&samples[from..from + n]);
            }
        }

        if let Some(envelope) = self.factory.envelope() {
            for (i, sample) in out.iter_mut().enumerate() {
                *sample *= envelope.gain(start + i as u64);
            }
        }

        self.offset += n as u64;
        Ok(n)
    }

    /// Allocate and return the next `n` samples (fewer if the waveform ends).
    pub fn produce(&mut self, n: usize) -> Result<Vec<f64>, WaveformError> {
        let mut out = vec![0.0; n];
        let written = self.fill(&mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Samples generated so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Samples left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.factory
            .n_samples()
            .map(|n| n.saturating_sub(self.offset))
    }

    /// Whether every sample has been produced.
    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Factory this generator was created from.
    pub fn factory(&self) -> &WaveformFactory {
        &self.factory
    }
}

/// Box-Muller standard normal source over a seeded ChaCha stream.
#[derive(Debug)]
struct GaussianSource {
    rng: ChaCha8Rng,
    spare: Option<f64>,
}

impl GaussianSource {
    fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            spare: None,
        }
    }

    fn next(&mut self) -> f64 {
        if let Some(value) = self.spare.take() {
            return value;
        }
        // 1 - u keeps the log argument in (0, 1]
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * PI * u2;
        self.spare = Some(radius * angle.sin());
        radius * angle.cos()
    }
}
