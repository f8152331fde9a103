use std::f64::consts::FRAC_PI_2;

use super::WaveformError;

/// Cosine-squared onset and offset ramp.
///
/// The gain rises from 0 to 1 over the first `rise_samples` samples and falls
/// back to 0 over the last `rise_samples`. Without a total length only the
/// onset is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineRamp {
    rise_samples: u64,
    total_samples: Option<u64>,
}

impl CosineRamp {
    /// Ramp of `rise_samples` at each end of a `total_samples` long waveform.
    pub fn new(rise_samples: u64, total_samples: Option<u64>) -> Result<Self, WaveformError> {
        if let Some(total) = total_samples {
            if rise_samples.saturating_mul(2) > total {
                return Err(WaveformError::InvalidParameter {
                    name: "rise_time",
                    message: format!(
                        "ramp of {rise_samples} samples at each end does not fit in {total} samples"
                    ),
                });
            }
        }
        Ok(Self {
            rise_samples,
            total_samples,
        })
    }

    /// Gain at absolute sample index `i`.
    pub fn gain(&self, i: u64) -> f64 {
        if self.rise_samples == 0 {
            return 1.0;
        }
        let from_end = self
            .total_samples
            .map_or(u64::MAX, |total| total.saturating_sub(i + 1));
        let edge = i.min(from_end);
        if edge >= self.rise_samples {
            1.0
        } else {
            (FRAC_PI_2 * edge as f64 / self.rise_samples as f64).sin().powi(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_is_symmetric() {
        let ramp = CosineRamp::new(10, Some(100)).unwrap();
        assert_eq!(ramp.gain(0), 0.0);
        assert_eq!(ramp.gain(99), 0.0);
        assert!((ramp.gain(5) - 0.5).abs() < 1e-12);
        assert!((ramp.gain(94) - 0.5).abs() < 1e-12);
        assert_eq!(ramp.gain(50), 1.0);
    }

    #[test]
    fn test_onset_only_when_unbounded() {
        let ramp = CosineRamp::new(4, None).unwrap();
        assert_eq!(ramp.gain(0), 0.0);
        assert_eq!(ramp.gain(1_000_000), 1.0);
    }
}
