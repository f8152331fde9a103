//! Criterion benchmarks for the sample generation hot paths.
//!
//! Output callbacks must produce a block faster than the hardware plays it,
//! so these track how long generating one block takes.
//!
//! Key metrics:
//! - Generator fill throughput per stimulus type and block size
//! - Queue rendering with trial boundaries and gaps inside the block
//! - Single-bin tone estimation used by calibration sweeps
//!
//! Run with: cargo bench --bench waveform

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use rust_psi::calibration::spectral::{flattop_window, tone_power_mean};
use rust_psi::calibration::FlatCalibration;
use rust_psi::queue::{Metadata, QueueOrder, SignalQueue};
use rust_psi::waveform::{StimulusSpec, WaveformFactory};

const FS: f64 = 100_000.0;

/// Benchmark filling blocks from each stimulus type.
fn generator_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("generator_fill");
    let calibration = Arc::new(FlatCalibration::unity());

    let stimuli = vec![
        ("tone", StimulusSpec::tone(1000.0, -20.0, 10.0)),
        (
            "chirp",
            StimulusSpec::Chirp {
                start_frequency: 100.0,
                end_frequency: 40_000.0,
                level: -20.0,
                duration: 10.0,
            },
        ),
        (
            "noise",
            StimulusSpec::Noise {
                level: -20.0,
                reference_frequency: 1000.0,
                seed: 1,
                duration: None,
            },
        ),
    ];

    for block in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(block as u64));
        for (name, spec) in &stimuli {
            let factory = WaveformFactory::new(spec, FS, calibration.clone()).unwrap();
            let mut out = vec![0.0; block];
            group.bench_with_input(BenchmarkId::new(*name, block), &block, |b, _| {
                let mut generator = factory.generator();
                b.iter(|| {
                    if generator.is_complete() {
                        generator = factory.generator();
                    }
                    black_box(generator.fill(&mut out).unwrap());
                });
            });
        }
    }

    group.finish();
}

/// Benchmark rendering a repeating queue of short trials into blocks.
///
/// Small trials with gaps put several trial boundaries in every block, which
/// is the worst case for the queue's bookkeeping.
fn queue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_pop");
    let calibration = Arc::new(FlatCalibration::unity());

    for block in [1_000usize, 10_000, 100_000] {
        let mut queue = SignalQueue::with_order(QueueOrder::Interleaved);
        for frequency in [500.0, 1000.0, 2000.0, 4000.0] {
            let factory =
                WaveformFactory::new(&StimulusSpec::tone(frequency, -20.0, 0.005), FS, calibration.clone())
                    .unwrap();
            queue.append(factory, 1, 500, Metadata::new()).unwrap();
        }
        let mut out = vec![0.0; block];

        group.throughput(Throughput::Elements(block as u64));
        group.bench_with_input(BenchmarkId::new("pop_into", block), &block, |b, _| {
            b.iter(|| {
                // No decrement: the entries rotate forever
                black_box(queue.pop_into(&mut out, false));
            });
        });
    }

    group.finish();
}

/// Benchmark the windowed tone estimator on a `[repetition, time]` recording.
fn tone_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("tone_power");

    for n in [1_000usize, 10_000, 100_000] {
        let signal = Array2::from_shape_fn((4, n), |(_, i)| {
            (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / FS).sin()
        });
        let window = flattop_window(n);
        group.throughput(Throughput::Elements((4 * n) as u64));
        group.bench_with_input(BenchmarkId::new("flattop", n), &n, |b, _| {
            b.iter(|| black_box(tone_power_mean(signal.view(), FS, 1000.0, Some(&window))));
        });
    }

    group.finish();
}

criterion_group!(benches, generator_fill, queue_pop, tone_estimation);
criterion_main!(benches);
