//! Epoch extraction from a continuous input stream.
//!
//! [`EpochExtractor`] consumes acquired blocks of any size and cuts
//! fixed-length epochs out of them. Epoch starts come from one of:
//!
//! | Alignment | Epoch starts |
//! |-----------|--------------|
//! | contiguous (default) | back to back from sample 0 |
//! | queue | `QueueEvent::Started` offsets, rescaled from the output rate |
//! | markers | [`EpochMarker`]s added with [`EpochExtractor::add_marker`] |
//!
//! Queue and marker alignment can be combined. Completed epochs are handed to
//! every registered callback, in registration order, as a shared
//! `Arc<Epoch>`.
//!
//! The extractor keeps only the samples a pending marker could still need.
//! With no marker pending it retains `history` samples so that markers
//! arriving after their data (edge events, for example) can still be served.
//! Markers whose start has already been discarded are dropped with a warning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::engine::{AiCallback, CallbackStatus};
use crate::queue::{EntryKey, Metadata, QueueEvent};

/// Errors raised when building an extractor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    /// Epochs must hold at least one sample.
    #[error("Epoch length rounds to zero samples at {fs} Hz")]
    EmptyEpoch {
        /// Input sampling rate (Hz)
        fs: f64,
    },
}

/// A fixed-length slice of the input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    /// Samples, `epoch_samples` long
    pub signal: Vec<f64>,
    /// Input-rate offset of the first sample
    pub offset: u64,
    /// Input sampling rate (Hz)
    pub fs: f64,
    /// Queue entry that produced the stimulus, if any
    pub key: Option<EntryKey>,
    /// Stimulus annotations
    pub metadata: Metadata,
}

/// Where an epoch should start.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMarker {
    /// Input-rate sample offset
    pub offset: u64,
    /// Queue entry, if the marker came from a queue
    pub key: Option<EntryKey>,
    /// Annotations copied onto the epoch
    pub metadata: Metadata,
}

impl EpochMarker {
    /// Marker at `offset` with no annotations.
    pub fn at(offset: u64) -> Self {
        Self {
            offset,
            key: None,
            metadata: Metadata::new(),
        }
    }
}

/// Receives each completed epoch.
pub type EpochCallback = Box<dyn FnMut(Arc<Epoch>) + Send>;

/// Shareable view of how many epochs an extractor has produced.
#[derive(Debug, Clone)]
pub struct ExtractionProgress {
    emitted: Arc<AtomicUsize>,
    expected: Option<usize>,
}

impl ExtractionProgress {
    /// Epochs produced so far.
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Epochs the extractor was told to expect.
    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    /// Whether the expected number of epochs has been produced.
    pub fn is_complete(&self) -> bool {
        self.expected.is_some_and(|n| self.emitted() >= n)
    }
}

#[derive(Debug)]
enum Alignment {
    Contiguous { next: u64 },
    Markers,
}

/// Cuts epochs out of a block stream.
pub struct EpochExtractor {
    fs: f64,
    epoch_samples: usize,
    alignment: Alignment,
    markers: VecDeque<EpochMarker>,
    events: Option<(Receiver<QueueEvent>, f64)>,
    backlog: Vec<f64>,
    backlog_start: u64,
    history: usize,
    callbacks: Vec<EpochCallback>,
    progress: ExtractionProgress,
    dropped_markers: u64,
}

impl std::fmt::Debug for EpochExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochExtractor")
            .field("fs", &self.fs)
            .field("epoch_samples", &self.epoch_samples)
            .field("alignment", &self.alignment)
            .field("pending_markers", &self.markers.len())
            .field("emitted", &self.progress.emitted())
            .finish()
    }
}

impl EpochExtractor {
    /// Extractor for `epoch_duration` second epochs at input rate `fs`.
    pub fn new(fs: f64, epoch_duration: f64) -> Result<Self, InputError> {
        Self::with_epoch_samples(fs, (epoch_duration * fs).round().max(0.0) as usize)
    }

    /// Extractor for epochs of exactly `epoch_samples` samples.
    pub fn with_epoch_samples(fs: f64, epoch_samples: usize) -> Result<Self, InputError> {
        if epoch_samples == 0 {
            return Err(InputError::EmptyEpoch { fs });
        }
        Ok(Self {
            fs,
            epoch_samples,
            alignment: Alignment::Contiguous { next: 0 },
            markers: VecDeque::new(),
            events: None,
            backlog: Vec::new(),
            backlog_start: 0,
            history: epoch_samples,
            callbacks: Vec::new(),
            progress: ExtractionProgress {
                emitted: Arc::new(AtomicUsize::new(0)),
                expected: None,
            },
            dropped_markers: 0,
        })
    }

    /// Start epochs at the trials announced on `events`; `output_fs` is the
    /// rate the queue offsets are counted in.
    #[must_use]
    pub fn aligned_to_queue(mut self, events: Receiver<QueueEvent>, output_fs: f64) -> Self {
        self.alignment = Alignment::Markers;
        self.events = Some((events, self.fs / output_fs));
        self
    }

    /// Start epochs only at explicit markers.
    #[must_use]
    pub fn aligned_to_markers(mut self) -> Self {
        self.alignment = Alignment::Markers;
        self
    }

    /// Report completion once `n` epochs have been produced.
    #[must_use]
    pub fn expect_epochs(mut self, n: usize) -> Self {
        self.progress.expected = Some(n);
        self
    }

    /// Samples to retain while no marker is pending.
    #[must_use]
    pub fn with_history(mut self, samples: usize) -> Self {
        self.history = samples;
        self
    }

    /// Register a consumer. Consumers run in registration order.
    pub fn add_callback(&mut self, callback: EpochCallback) {
        self.callbacks.push(callback);
    }

    /// Queue an epoch start. Markers are served in offset order.
    pub fn add_marker(&mut self, marker: EpochMarker) {
        let index = self.markers.partition_point(|m| m.offset <= marker.offset);
        self.markers.insert(index, marker);
    }

    /// Consume one acquired block.
    pub fn push(&mut self, block: &[f64]) {
        self.drain_events();
        self.backlog.extend_from_slice(block);

        match self.alignment {
            Alignment::Contiguous { mut next } => {
                while self.received() >= next + self.epoch_samples as u64 {
                    self.emit(next, None, Metadata::new());
                    next += self.epoch_samples as u64;
                }
                self.alignment = Alignment::Contiguous { next };
            }
            Alignment::Markers => self.emit_markers(),
        }

        self.trim();
    }

    fn drain_events(&mut self) {
        let Some((events, ratio)) = self.events.as_ref() else {
            return;
        };
        let ratio = *ratio;
        let started: Vec<EpochMarker> = events
            .try_iter()
            .filter_map(|event| match event {
                QueueEvent::Started {
                    key,
                    offset,
                    metadata,
                    ..
                } => Some(EpochMarker {
                    offset: (offset as f64 * ratio).round() as u64,
                    key: Some(key),
                    metadata,
                }),
                QueueEvent::Removed { .. } => None,
            })
            .collect();
        for marker in started {
            trace!(offset = marker.offset, "Queued epoch marker");
            self.add_marker(marker);
        }
    }

    fn emit_markers(&mut self) {
        while let Some(marker) = self.markers.front() {
            if marker.offset < self.backlog_start {
                self.dropped_markers += 1;
                warn!(
                    offset = marker.offset,
                    retained_from = self.backlog_start,
                    "Epoch marker arrived after its samples were discarded"
                );
                self.markers.pop_front();
                continue;
            }
            if self.received() < marker.offset + self.epoch_samples as u64 {
                break;
            }
            if let Some(marker) = self.markers.pop_front() {
                self.emit(marker.offset, marker.key, marker.metadata);
            }
        }
    }

    fn emit(&mut self, offset: u64, key: Option<EntryKey>, metadata: Metadata) {
        let start = (offset - self.backlog_start) as usize;
        let epoch = Arc::new(Epoch {
            signal: self.backlog[start..start + self.epoch_samples].to_vec(),
            offset,
            fs: self.fs,
            key,
            metadata,
        });
        for callback in &mut self.callbacks {
            callback(Arc::clone(&epoch));
        }
        let emitted = self.progress.emitted.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(offset, emitted, "Extracted epoch");
    }

    fn trim(&mut self) {
        let received = self.received();
        let keep_from = match (&self.alignment, self.markers.front()) {
            (Alignment::Contiguous { next }, _) => *next,
            (Alignment::Markers, Some(marker)) => marker.offset,
            (Alignment::Markers, None) => received.saturating_sub(self.history as u64),
        };
        let keep_from = keep_from.clamp(self.backlog_start, received);
        let discard = (keep_from - self.backlog_start) as usize;
        if discard > 0 {
            self.backlog.drain(..discard);
            self.backlog_start = keep_from;
        }
    }

    /// Total input samples consumed.
    pub fn received(&self) -> u64 {
        self.backlog_start + self.backlog.len() as u64
    }

    /// Markers waiting for data.
    pub fn pending_markers(&self) -> usize {
        self.markers.len()
    }

    /// Markers dropped because their samples were no longer retained.
    pub fn dropped_markers(&self) -> u64 {
        self.dropped_markers
    }

    /// Samples per epoch.
    pub fn epoch_samples(&self) -> usize {
        self.epoch_samples
    }

    /// Progress handle usable from other threads.
    pub fn progress(&self) -> ExtractionProgress {
        self.progress.clone()
    }

    /// Whether the expected number of epochs has been produced.
    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    /// Wrap the extractor as an engine input callback. The callback
    /// unregisters itself once the expected epochs have been produced.
    pub fn into_ai_callback(mut self) -> AiCallback {
        Box::new(move |block| {
            self.push(block);
            if self.is_complete() {
                CallbackStatus::Done
            } else {
                CallbackStatus::Continue
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn collect(extractor: &mut EpochExtractor) -> Arc<Mutex<Vec<Arc<Epoch>>>> {
        let epochs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&epochs);
        extractor.add_callback(Box::new(move |epoch| sink.lock().push(epoch)));
        epochs
    }

    fn counting(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_contiguous_epochs_across_blocks() {
        let mut extractor = EpochExtractor::with_epoch_samples(1000.0, 4).unwrap().expect_epochs(3);
        let epochs = collect(&mut extractor);
        let data = counting(13);
        for chunk in data.chunks(3) {
            extractor.push(chunk);
        }
        let epochs = epochs.lock();
        assert_eq!(epochs.len(), 3);
        assert_eq!(epochs[1].signal, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(epochs[2].offset, 8);
        assert!(extractor.is_complete());
    }

    #[test]
    fn test_marker_before_data() {
        let mut extractor = EpochExtractor::with_epoch_samples(1000.0, 3).unwrap().aligned_to_markers();
        let epochs = collect(&mut extractor);
        extractor.add_marker(EpochMarker::at(5));
        extractor.push(&counting(7));
        assert!(epochs.lock().is_empty());
        extractor.push(&[7.0, 8.0]);
        assert_eq!(epochs.lock()[0].signal, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_late_marker_served_from_history() {
        let mut extractor = EpochExtractor::with_epoch_samples(1000.0, 2).unwrap()
            .aligned_to_markers()
            .with_history(10);
        let epochs = collect(&mut extractor);
        extractor.push(&counting(20));
        extractor.add_marker(EpochMarker::at(12));
        extractor.add_marker(EpochMarker::at(2));
        extractor.push(&[]);
        assert_eq!(epochs.lock().len(), 1);
        assert_eq!(epochs.lock()[0].signal, vec![12.0, 13.0]);
        assert_eq!(extractor.dropped_markers(), 1);
    }

    #[test]
    fn test_callbacks_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut extractor = EpochExtractor::with_epoch_samples(1000.0, 1).unwrap();
        for id in 0..3 {
            let order = Arc::clone(&order);
            extractor.add_callback(Box::new(move |_| order.lock().push(id)));
        }
        extractor.push(&[1.0]);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_offsets_rescaled() {
        let mut queue = crate::queue::SignalQueue::new();
        let factory = crate::waveform::WaveformFactory::from_samples(vec![0.0; 4], 1000.0).unwrap();
        let key = queue.append(factory, 1, 0, Metadata::new()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut extractor = EpochExtractor::with_epoch_samples(500.0, 2).unwrap().aligned_to_queue(rx, 1000.0);
        let epochs = collect(&mut extractor);
        tx.send(QueueEvent::Started {
            key,
            offset: 10,
            repetition: 1,
            metadata: Metadata::new(),
        })
        .unwrap();
        extractor.push(&counting(8));
        let epochs = epochs.lock();
        assert_eq!(epochs[0].offset, 5);
        assert_eq!(epochs[0].signal, vec![5.0, 6.0]);
        assert_eq!(epochs[0].key, Some(key));
    }

    #[test]
    fn test_backlog_stays_bounded() {
        let mut extractor = EpochExtractor::with_epoch_samples(1000.0, 100).unwrap();
        for _ in 0..1000 {
            extractor.push(&[0.0; 37]);
        }
        assert!(extractor.backlog.len() < 100);
    }

    #[test]
    fn test_zero_length_epochs_rejected() {
        assert_eq!(
            EpochExtractor::new(1000.0, 0.0).unwrap_err(),
            InputError::EmptyEpoch { fs: 1000.0 }
        );
        // 0.4 ms rounds to zero samples at 1 kHz
        assert!(EpochExtractor::new(1000.0, 0.0004).is_err());
        assert_eq!(EpochExtractor::new(1000.0, 0.0006).unwrap().epoch_samples(), 1);
    }
}
