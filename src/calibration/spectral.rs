//! Windowed single-bin tone estimators and decibel helpers.
//!
//! Tone power is estimated by correlating the signal with a complex
//! exponential at the frequency of interest rather than by taking a full FFT,
//! so the frequency does not need to fall on a bin centre. A flat-top window
//! keeps the amplitude error small when it doesn't.

use std::f64::consts::{PI, SQRT_2};

use ndarray::{ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;

/// Reference pressure for dB SPL (Pa).
pub const REFERENCE_PRESSURE: f64 = 20e-6;

const FLATTOP_COEFFICIENTS: [f64; 5] = [
    0.215_578_95,
    0.416_631_58,
    0.277_263_158,
    0.083_578_947,
    0.006_947_368,
];

/// `20·log10(value)`
pub fn db(value: f64) -> f64 {
    20.0 * value.log10()
}

/// Inverse of [`db`].
pub fn dbi(value: f64) -> f64 {
    10f64.powf(value / 20.0)
}

/// Periodic flat-top window of length `n`.
pub fn flattop_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = 2.0 * PI * i as f64 / n as f64;
            FLATTOP_COEFFICIENTS
                .iter()
                .enumerate()
                .map(|(k, a)| {
                    let term = a * (k as f64 * x).cos();
                    if k % 2 == 0 {
                        term
                    } else {
                        -term
                    }
                })
                .sum()
        })
        .collect()
}

/// Complex amplitude of the component at `frequency`.
///
/// The magnitude is the peak amplitude of the tone. When `window` is given it
/// must have the same length as `signal`; it is normalized by its mean so the
/// estimate keeps unit gain.
pub fn tone_conv(
    signal: ArrayView1<'_, f64>,
    fs: f64,
    frequency: f64,
    window: Option<&[f64]>,
) -> Complex64 {
    let n = signal.len();
    if n == 0 {
        return Complex64::new(0.0, 0.0);
    }
    let step = 2.0 * PI * frequency / fs;
    let window_mean = window.map_or(1.0, |w| w.iter().sum::<f64>() / w.len() as f64);

    let sum: Complex64 = signal
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let weight = window.map_or(1.0, |w| w[i] / window_mean);
            Complex64::from_polar(2.0 * s * weight, -step * i as f64)
        })
        .sum();
    sum / n as f64
}

/// RMS amplitude of the component at `frequency`.
pub fn tone_power_conv(
    signal: ArrayView1<'_, f64>,
    fs: f64,
    frequency: f64,
    window: Option<&[f64]>,
) -> f64 {
    tone_conv(signal, fs, frequency, window).norm() / SQRT_2
}

/// Mean RMS amplitude at `frequency` across the rows (repetitions) of `signal`.
pub fn tone_power_mean(
    signal: ArrayView2<'_, f64>,
    fs: f64,
    frequency: f64,
    window: Option<&[f64]>,
) -> f64 {
    let rows = signal.len_of(Axis(0));
    if rows == 0 {
        return 0.0;
    }
    signal
        .axis_iter(Axis(0))
        .map(|row| tone_power_conv(row, fs, frequency, window))
        .sum::<f64>()
        / rows as f64
}
