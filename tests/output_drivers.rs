//! Output drivers running against the mock engine's buffers.

use std::sync::Arc;
use std::thread;

use rust_psi::engine::{Engine, EngineError, MockEngine, MockEngineConfig};
use rust_psi::output::{
    ChannelBindings, ContinuousOutput, EpochOutput, NullOutput, OutputError, OutputState,
    QueuedEpochOutput, Toggle, TrialSetting, Trigger,
};
use rust_psi::queue::{Metadata, QueueEvent, SignalQueue};
use rust_psi::waveform::{StimulusSpec, WaveformFactory};

const FS: f64 = 1000.0;

/// 100-sample output buffer, played samples recorded.
fn engine() -> (Arc<MockEngine>, Arc<dyn Engine>) {
    let mut config = MockEngineConfig::loopback(FS, "speaker", "mic");
    config.buffer_duration = 0.1;
    config.record_output = true;
    config.do_channels = vec!["trigger".to_string(), "light".to_string()];
    let mock = Arc::new(MockEngine::new(config).unwrap());
    let engine: Arc<dyn Engine> = mock.clone();
    (mock, engine)
}

fn ones(n: usize) -> WaveformFactory {
    WaveformFactory::from_samples(vec![1.0; n], FS).unwrap()
}

fn background(engine: &Arc<dyn Engine>, bindings: &ChannelBindings, block: f64) -> NullOutput {
    let null = NullOutput::new("background", "speaker", Arc::clone(engine), bindings).unwrap();
    null.configure(block).unwrap();
    null.start().unwrap();
    null
}

#[test]
fn test_epoch_plays_at_requested_offset() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.02);

    let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
    target.configure(0.01).unwrap();
    target.setup_factory(ones(30)).unwrap();
    assert_eq!(target.state(), OutputState::Configured);
    let duration = target.start(0.01, 0.0).unwrap();
    assert!((duration - 0.03).abs() < 1e-12);
    assert_eq!(target.state(), OutputState::Active);

    for _ in 0..10 {
        mock.advance(10);
    }

    let played = mock.played_ao("speaker").unwrap();
    assert_eq!(played.len(), 100);
    assert!(played[..10].iter().all(|&s| s == 0.0));
    assert!(played[10..40].iter().all(|&s| s == 1.0));
    assert!(played[40..].iter().all(|&s| s == 0.0));
    assert_eq!(target.state(), OutputState::Draining);
    assert!(target.take_faults().is_empty());
    assert_eq!(mock.underrun_samples("speaker").unwrap(), 0);
}

#[test]
fn test_clear_silences_remaining_samples() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
    target.setup_factory(ones(50)).unwrap();
    target.start(0.0, 0.0).unwrap();
    mock.advance(10);

    target.clear(0.02, 0.0).unwrap();
    target.clear(0.02, 0.0).unwrap();
    assert_eq!(target.state(), OutputState::Stopped);

    mock.advance(90);
    let played = mock.played_ao("speaker").unwrap();
    assert!(played[..20].iter().all(|&s| s == 1.0));
    assert!(played[20..].iter().all(|&s| s == 0.0));
}

#[test]
fn test_epoch_state_machine_errors() {
    let (_mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
    assert_eq!(target.state(), OutputState::Unconfigured);
    assert!(matches!(target.start(0.0, 0.0), Err(OutputError::NotConfigured { .. })));
    assert!(matches!(target.clear(0.0, 0.0), Err(OutputError::NotConfigured { .. })));
    assert!(matches!(
        target.setup(&StimulusSpec::Silence { duration: None }),
        Err(OutputError::UnboundedEpoch { .. })
    ));

    target.setup_factory(ones(1000)).unwrap();
    target.start(0.0, 0.0).unwrap();
    assert_eq!(target.state(), OutputState::Active);
    assert!(matches!(target.setup_factory(ones(5)), Err(OutputError::AlreadyActive { .. })));
    assert!(matches!(target.start(0.0, 0.0), Err(OutputError::AlreadyActive { .. })));

    let err = EpochOutput::new("masker", "speaker", Arc::clone(&engine), &bindings)
        .err()
        .unwrap();
    assert!(matches!(err, OutputError::ChannelInUse { ref existing, .. } if existing == "target"));

    assert!(matches!(
        EpochOutput::new("nowhere", "headphone", Arc::clone(&engine), &bindings),
        Err(OutputError::Engine(EngineError::UnknownChannel(_)))
    ));
}

#[test]
fn test_late_epoch_skips_ahead_and_keeps_schedule() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let ramp: Vec<f64> = (1..=200).map(f64::from).collect();
    let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
    target.configure(0.01).unwrap();
    target
        .setup_factory(WaveformFactory::from_samples(ramp, FS).unwrap())
        .unwrap();
    target.start(0.0, 0.0).unwrap();

    // Only the first block was written before the hardware moved on
    mock.advance(50);
    mock.advance(10);

    let faults = target.take_faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        faults[0],
        OutputError::BufferUnderrun {
            offset: 10,
            position: 50,
            ..
        }
    ));

    let played = mock.played_ao("speaker").unwrap();
    assert_eq!(&played[..10], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    assert!(played[10..50].iter().all(|&s| s == 0.0));
    // Sample 51 of the waveform plays at offset 50, as scheduled
    assert_eq!(&played[50..53], &[51.0, 52.0, 53.0]);
}

#[test]
fn test_continuous_output_loops_finite_waveform() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let output = ContinuousOutput::new("carrier", "speaker", Arc::clone(&engine), &bindings).unwrap();
    assert!(matches!(output.start(), Err(OutputError::NotConfigured { .. })));

    output.configure(0.01).unwrap();
    assert!(matches!(
        output.setup_factory(WaveformFactory::from_samples(Vec::<f64>::new(), FS).unwrap()),
        Err(OutputError::EmptyWaveform { .. })
    ));
    output
        .setup_factory(WaveformFactory::from_samples(vec![1.0, 2.0, 3.0], FS).unwrap())
        .unwrap();
    output.start().unwrap();
    assert!(matches!(output.start(), Err(OutputError::AlreadyActive { .. })));

    for _ in 0..3 {
        mock.advance(10);
    }
    let played = mock.played_ao("speaker").unwrap();
    let expected: Vec<f64> = (0..30).map(|i| f64::from(i % 3 + 1)).collect();
    assert_eq!(played, expected);

    output.stop();
    assert_eq!(output.state(), OutputState::Stopped);
    mock.advance(20);
    assert_eq!(mock.underrun_samples("speaker").unwrap(), 10);
}

#[test]
fn test_continuous_and_epoch_share_a_channel() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let carrier = ContinuousOutput::new("carrier", "speaker", Arc::clone(&engine), &bindings).unwrap();
    carrier.configure(0.1).unwrap();
    carrier
        .setup_factory(WaveformFactory::from_samples(vec![0.5], FS).unwrap())
        .unwrap();
    carrier.start().unwrap();

    let probe = EpochOutput::new("probe", "speaker", Arc::clone(&engine), &bindings).unwrap();
    probe.setup_factory(ones(10)).unwrap();
    probe.start(0.005, 0.0).unwrap();

    mock.advance(20);
    let played = mock.played_ao("speaker").unwrap();
    assert!(played[..5].iter().all(|&s| s == 0.5));
    assert!(played[5..15].iter().all(|&s| s == 1.5));
    assert!(played[15..].iter().all(|&s| s == 0.5));
}

#[test]
fn test_queued_output_plays_trials_and_reports_offsets() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let mut queue = SignalQueue::new();
    let key = queue.append(ones(5), 2, 3, Metadata::new()).unwrap();
    let trials =
        QueuedEpochOutput::new("trials", "speaker", Arc::clone(&engine), &bindings, queue, true)
            .unwrap();
    let events = trials.subscribe();
    trials.setup(&[]).unwrap();

    let duration = trials.start(0.02, 0.01).unwrap();
    assert!((duration - 0.016).abs() < 1e-12);
    assert_eq!(trials.state(), OutputState::Draining);

    mock.advance(60);
    let played = mock.played_ao("speaker").unwrap();
    let mut expected = vec![0.0; 60];
    expected[30..35].fill(1.0);
    expected[38..43].fill(1.0);
    assert_eq!(played, expected);

    let started: Vec<u64> = events
        .try_iter()
        .filter_map(|event| match event {
            QueueEvent::Started { key: k, offset, .. } if k == key => Some(offset),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![30, 38]);
    assert_eq!(trials.with_queue(|q| q.is_empty()), Some(true));
}

#[test]
fn test_queued_output_from_trial_settings() {
    let (_mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let trials = QueuedEpochOutput::new(
        "trials",
        "speaker",
        Arc::clone(&engine),
        &bindings,
        SignalQueue::new(),
        false,
    )
    .unwrap();
    trials
        .setup(&[TrialSetting::new(StimulusSpec::tone(100.0, -20.0, 0.01), 3, 0.005)])
        .unwrap();
    assert_eq!(trials.with_queue(|q| q.count_trials()), Some(3));

    let duration = trials.start(0.0, 0.0).unwrap();
    assert!((duration - 0.045).abs() < 1e-12);
    // Without decrement the queue never runs dry
    assert_eq!(trials.state(), OutputState::Active);
    trials.clear(0.05, 0.0).unwrap();
    assert_eq!(trials.state(), OutputState::Stopped);
    assert_eq!(trials.with_queue(|q| q.count_trials()), Some(3));
}

#[test]
fn test_rejected_setup_appends_nothing() {
    let (_mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);
    let trials = QueuedEpochOutput::new(
        "trials",
        "speaker",
        Arc::clone(&engine),
        &bindings,
        SignalQueue::new(),
        true,
    )
    .unwrap();

    let good = TrialSetting::new(StimulusSpec::tone(100.0, -20.0, 0.01), 2, 0.0);
    let no_repetitions = TrialSetting::new(StimulusSpec::tone(200.0, -20.0, 0.01), 0, 0.0);
    let err = trials.setup(&[good.clone(), no_repetitions]).unwrap_err();
    assert!(matches!(err, OutputError::Queue(_)));
    assert_eq!(trials.state(), OutputState::Unconfigured);
    assert_eq!(trials.with_queue(|q| q.len()), Some(0));

    // A retry plays the good setting once, not twice
    trials.setup(&[good]).unwrap();
    assert_eq!(trials.with_queue(|q| q.count_trials()), Some(2));
    assert_eq!(trials.state(), OutputState::Configured);
}

#[test]
fn test_clear_abandons_trial_in_progress() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);

    let mut queue = SignalQueue::new();
    queue.append(ones(50), 1, 0, Metadata::new()).unwrap();
    let trials =
        QueuedEpochOutput::new("trials", "speaker", Arc::clone(&engine), &bindings, queue, true)
            .unwrap();
    trials.configure(0.01).unwrap();
    trials.setup(&[]).unwrap();
    trials.start(0.0, 0.0).unwrap();

    mock.advance(10);
    trials.clear(0.01, 0.0).unwrap();
    assert_eq!(trials.with_queue(|q| q.is_empty()), Some(true));

    let silence = StimulusSpec::Silence {
        duration: Some(0.02),
    };
    trials.setup(&[TrialSetting::new(silence, 1, 0.0)]).unwrap();
    trials.start(0.2, 0.0).unwrap();
    for _ in 0..30 {
        mock.advance(10);
    }

    let played = mock.played_ao("speaker").unwrap();
    assert_eq!(played.len(), 310);
    assert!(played[..10].iter().all(|&s| s == 1.0));
    assert!(played[10..].iter().all(|&s| s == 0.0));
}

#[test]
fn test_outputs_on_clock_thread() {
    let (mock, engine) = engine();
    let bindings = ChannelBindings::new();
    let _null = background(&engine, &bindings, 0.1);
    let target = EpochOutput::new("target", "speaker", Arc::clone(&engine), &bindings).unwrap();
    target.setup_factory(ones(30)).unwrap();
    target.start(0.05, 0.0).unwrap();

    engine.start().unwrap();
    while mock.elapsed_samples() < 300 {
        thread::yield_now();
    }
    engine.stop().unwrap();

    let played = mock.played_ao("speaker").unwrap();
    assert!(played.len() >= 300);
    assert_eq!(played.iter().filter(|&&s| s == 1.0).count(), 30);
    assert!(played[50..80].iter().all(|&s| s == 1.0));
    assert_eq!(mock.underrun_samples("speaker").unwrap(), 0);
}

#[test]
fn test_digital_trigger_and_toggle() {
    let (mock, engine) = engine();
    mock.advance(100);

    let trigger = Trigger::new("start", "trigger", Arc::clone(&engine))
        .unwrap()
        .with_duration(0.005);
    trigger.fire().unwrap();
    let events = mock.digital_events();
    assert_eq!(events.len(), 2);
    assert!(events[0].high && !events[1].high);
    assert!((events[0].timestamp - 0.1).abs() < 1e-12);
    assert!((events[1].timestamp - events[0].timestamp - 0.005).abs() < 1e-12);

    let light = Toggle::new("light", "light", Arc::clone(&engine)).unwrap();
    assert!(!light.is_high());
    light.set_high().unwrap();
    assert!(light.is_high());
    assert!(mock.digital_level("light").unwrap());
    light.set_low().unwrap();
    assert!(!mock.digital_level("light").unwrap());

    assert!(Trigger::new("missing", "shutter", Arc::clone(&engine)).is_err());
}
