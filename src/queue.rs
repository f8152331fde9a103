//! Ordered playlist of stimulus trials.
//!
//! A [`SignalQueue`] holds entries of (waveform, repetitions, inter-trial
//! gap, metadata) and renders them into a contiguous sample stream on demand.
//! Every repetition is followed by its gap of zeros. When a trial starts the
//! queue publishes a [`QueueEvent::Started`] carrying the absolute output
//! offset of its first sample, which is what input-side extractors align to.
//!
//! # Ordering
//!
//! | Order | Next trial after a repetition finishes |
//! |-------|----------------------------------------|
//! | [`QueueOrder::Fifo`] | same entry until its repetitions run out |
//! | [`QueueOrder::Interleaved`] | next entry, cycling round-robin |
//!
//! # Decrement
//!
//! [`SignalQueue::pop_buffer`] takes a `decrement` flag. When set, each
//! completed repetition (waveform plus gap) reduces the entry's remaining
//! count and the entry is removed once it reaches zero. When clear the queue
//! repeats without consuming entries, leaving removal to the caller.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

use crate::waveform::{Generator, WaveformFactory};

/// Free-form trial annotations carried from the queue to extracted epochs.
pub type Metadata = Map<String, Value>;

/// Errors raised by queue operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// An entry needs at least one repetition.
    #[error("Entry must have at least one repetition")]
    InvalidRepetitions,

    /// An entry that produces no samples at all would never advance the stream.
    #[error("Entry produces no samples (empty waveform and no inter-trial gap)")]
    EmptyEntry,

    /// Waveform sampling rate does not match the queue.
    #[error("Waveform sampled at {actual} Hz does not match queue rate {expected} Hz")]
    RateMismatch {
        /// Queue rate (Hz)
        expected: f64,
        /// Waveform rate (Hz)
        actual: f64,
    },

    /// No entry with that key.
    #[error("No queue entry with key {0}")]
    UnknownKey(EntryKey),
}

/// Stable handle for a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(u64);

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// First sample of a trial was produced.
    Started {
        /// Entry being played
        key: EntryKey,
        /// Absolute output sample offset of the first sample
        offset: u64,
        /// 1-based repetition number for this entry
        repetition: u32,
        /// Entry metadata
        metadata: Metadata,
    },
    /// Entry left the queue after its last repetition.
    Removed {
        /// Entry that was removed
        key: EntryKey,
    },
}

/// Trial ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// Play all repetitions of an entry before moving on.
    #[default]
    Fifo,
    /// Rotate through entries one repetition at a time.
    Interleaved,
}

/// A scheduled stimulus.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    key: EntryKey,
    factory: WaveformFactory,
    remaining: u32,
    played: u32,
    gap: usize,
    metadata: Metadata,
}

impl QueueEntry {
    /// Entry handle.
    pub fn key(&self) -> EntryKey {
        self.key
    }

    /// Waveform played by each repetition.
    pub fn factory(&self) -> &WaveformFactory {
        &self.factory
    }

    /// Repetitions still to play.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Repetitions completed so far.
    pub fn played(&self) -> u32 {
        self.played
    }

    /// Zero samples after each repetition.
    pub fn inter_trial_gap(&self) -> usize {
        self.gap
    }

    /// Entry annotations.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Debug, Default)]
enum Cursor {
    #[default]
    Idle,
    Playing(Generator),
    Gap(usize),
}

/// Ordered, repeatable stimulus playlist.
#[derive(Debug)]
pub struct SignalQueue {
    fs: Option<f64>,
    order: QueueOrder,
    entries: VecDeque<QueueEntry>,
    cursor: Cursor,
    offset: u64,
    next_key: u64,
    listeners: Vec<Sender<QueueEvent>>,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalQueue {
    /// Empty first-in first-out queue.
    pub fn new() -> Self {
        Self::with_order(QueueOrder::Fifo)
    }

    /// Empty queue with the given ordering.
    pub fn with_order(order: QueueOrder) -> Self {
        Self {
            fs: None,
            order,
            entries: VecDeque::new(),
            cursor: Cursor::Idle,
            offset: 0,
            next_key: 0,
            listeners: Vec::new(),
        }
    }

    /// Schedule `repetitions` plays of `factory`, each followed by `gap` zeros.
    ///
    /// All entries must share one sampling rate; the first entry fixes it.
    pub fn append(
        &mut self,
        factory: WaveformFactory,
        repetitions: u32,
        gap: usize,
        metadata: Metadata,
    ) -> Result<EntryKey, QueueError> {
        self.fs = Some(check_entry(self.fs, &factory, repetitions, gap)?);

        let key = EntryKey(self.next_key);
        self.next_key += 1;
        self.entries.push_back(QueueEntry {
            key,
            factory,
            remaining: repetitions,
            played: 0,
            gap,
            metadata,
        });
        debug!(%key, repetitions, gap, "Queued entry");
        Ok(key)
    }

    /// Append several entries at once. Either all are queued or, if any is
    /// rejected, the queue is left untouched.
    pub fn append_all(
        &mut self,
        entries: Vec<(WaveformFactory, u32, usize, Metadata)>,
    ) -> Result<Vec<EntryKey>, QueueError> {
        entries
            .iter()
            .try_fold(self.fs, |fs, (factory, repetitions, gap, _)| {
                check_entry(fs, factory, *repetitions, *gap).map(Some)
            })?;
        entries
            .into_iter()
            .map(|(factory, repetitions, gap, metadata)| {
                self.append(factory, repetitions, gap, metadata)
            })
            .collect()
    }

    /// Remove an entry. If it is playing, the rest of its trial is dropped.
    pub fn remove(&mut self, key: EntryKey) -> Result<QueueEntry, QueueError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.key == key)
            .ok_or(QueueError::UnknownKey(key))?;
        if index == 0 {
            self.cursor = Cursor::Idle;
        }
        let entry = self
            .entries
            .remove(index)
            .ok_or(QueueError::UnknownKey(key))?;
        self.publish(QueueEvent::Removed { key });
        Ok(entry)
    }

    /// Subscribe to trial events. Dropped receivers are pruned automatically.
    pub fn subscribe(&mut self) -> Receiver<QueueEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.push(tx);
        rx
    }

    /// Render up to `n` samples.
    ///
    /// Returns the samples and whether the queue is now exhausted. The
    /// returned buffer is shorter than `n` only when the queue ran out.
    pub fn pop_buffer(&mut self, n: usize, decrement: bool) -> (Vec<f64>, bool) {
        let mut out = vec![0.0; n];
        let (written, exhausted) = self.pop_into(&mut out, decrement);
        out.truncate(written);
        (out, exhausted)
    }

    /// Render into `out` without allocating. See [`Self::pop_buffer`].
    pub fn pop_into(&mut self, out: &mut [f64], decrement: bool) -> (usize, bool) {
        let base = self.offset;
        let mut written = 0;

        while written < out.len() {
            match std::mem::take(&mut self.cursor) {
                Cursor::Idle => {
                    let Some(head) = self.entries.front() else {
                        break;
                    };
                    let event = QueueEvent::Started {
                        key: head.key,
                        offset: base + written as u64,
                        repetition: head.played + 1,
                        metadata: head.metadata.clone(),
                    };
                    trace!(key = %head.key, offset = base + written as u64, "Trial started");
                    self.cursor = Cursor::Playing(head.factory.generator());
                    self.publish(event);
                }
                Cursor::Playing(mut generator) => {
                    if !generator.is_complete() {
                        written += generator.fill(&mut out[written..]).unwrap_or(0);
                    }
                    self.cursor = if generator.is_complete() {
                        Cursor::Gap(self.entries.front().map_or(0, QueueEntry::inter_trial_gap))
                    } else {
                        Cursor::Playing(generator)
                    };
                }
                Cursor::Gap(remaining) => {
                    let n = remaining.min(out.len() - written);
                    out[written..written + n].fill(0.0);
                    written += n;
                    if remaining == n {
                        self.finish_repetition(decrement);
                    } else {
                        self.cursor = Cursor::Gap(remaining - n);
                    }
                }
            }
        }

        self.offset += written as u64;
        (written, self.is_exhausted())
    }

    /// Abandon the trial in progress, if any.
    ///
    /// The interrupted repetition counts as played; with `decrement` it is
    /// also consumed. The next pop starts a fresh trial.
    pub fn abort_trial(&mut self, decrement: bool) -> bool {
        if matches!(self.cursor, Cursor::Idle) {
            return false;
        }
        self.cursor = Cursor::Idle;
        if let Some(head) = self.entries.front() {
            debug!(key = %head.key, played = head.played, "Trial aborted");
        }
        self.finish_repetition(decrement);
        true
    }

    fn finish_repetition(&mut self, decrement: bool) {
        let Some(head) = self.entries.front_mut() else {
            return;
        };
        head.played += 1;
        if decrement {
            head.remaining = head.remaining.saturating_sub(1);
            if head.remaining == 0 {
                let key = head.key;
                self.entries.pop_front();
                debug!(%key, "Entry finished");
                self.publish(QueueEvent::Removed { key });
                return;
            }
        }
        if self.order == QueueOrder::Interleaved {
            self.entries.rotate_left(1);
        }
    }

    fn publish(&mut self, event: QueueEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// No entries left and nothing mid-trial.
    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty() && matches!(self.cursor, Cursor::Idle)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total repetitions still to play across all entries.
    pub fn count_trials(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.remaining)).sum()
    }

    /// Samples needed to play everything remaining with decrement on, or
    /// `None` if any entry is unbounded.
    pub fn remaining_samples(&self) -> Option<u64> {
        self.entries.iter().try_fold(0u64, |acc, e| {
            e.factory
                .n_samples()
                .map(|n| acc + u64::from(e.remaining) * (n + e.gap as u64))
        })
    }

    /// Look up an entry.
    pub fn get(&self, key: EntryKey) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Entries in play order.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Absolute offset of the next sample to be rendered.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Align the queue's sample counter with an output buffer offset.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Ordering policy.
    pub fn order(&self) -> QueueOrder {
        self.order
    }

    /// Sampling rate shared by all entries, once one has been added.
    pub fn fs(&self) -> Option<f64> {
        self.fs
    }
}

/// Validate an entry against the queue rate; returns the rate it fixes.
fn check_entry(
    fs: Option<f64>,
    factory: &WaveformFactory,
    repetitions: u32,
    gap: usize,
) -> Result<f64, QueueError> {
    if repetitions == 0 {
        return Err(QueueError::InvalidRepetitions);
    }
    if factory.n_samples() == Some(0) && gap == 0 {
        return Err(QueueError::EmptyEntry);
    }
    match fs {
        Some(fs) if (fs - factory.fs()).abs() > f64::EPSILON * fs => Err(QueueError::RateMismatch {
            expected: fs,
            actual: factory.fs(),
        }),
        Some(fs) => Ok(fs),
        None => Ok(factory.fs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, start: f64) -> WaveformFactory {
        let samples: Vec<f64> = (0..n).map(|i| start + i as f64).collect();
        WaveformFactory::from_samples(samples, 1000.0).unwrap()
    }

    fn started(events: &Receiver<QueueEvent>) -> Vec<(EntryKey, u64, u32)> {
        events
            .try_iter()
            .filter_map(|e| match e {
                QueueEvent::Started {
                    key,
                    offset,
                    repetition,
                    ..
                } => Some((key, offset, repetition)),
                QueueEvent::Removed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_gap_after_every_repetition() {
        let mut queue = SignalQueue::new();
        queue.append(ramp(3, 1.0), 2, 2, Metadata::new()).unwrap();
        let (samples, exhausted) = queue.pop_buffer(20, true);
        assert_eq!(samples, vec![1.0, 2.0, 3.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0]);
        assert!(exhausted);
    }

    #[test]
    fn test_gap_spans_calls() {
        let mut queue = SignalQueue::new();
        let key = queue.append(ramp(2, 1.0), 1, 3, Metadata::new()).unwrap();
        let (first, exhausted) = queue.pop_buffer(3, true);
        assert_eq!(first, vec![1.0, 2.0, 0.0]);
        assert!(!exhausted);
        assert_eq!(queue.get(key).map(QueueEntry::remaining), Some(1));
        let (rest, exhausted) = queue.pop_buffer(3, true);
        assert_eq!(rest, vec![0.0, 0.0]);
        assert!(exhausted);
    }

    #[test]
    fn test_without_decrement_entries_persist() {
        let mut queue = SignalQueue::new();
        let key = queue.append(ramp(2, 1.0), 1, 0, Metadata::new()).unwrap();
        let (samples, exhausted) = queue.pop_buffer(6, false);
        assert_eq!(samples, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert!(!exhausted);
        assert_eq!(queue.get(key).map(QueueEntry::played), Some(3));
        assert_eq!(queue.count_trials(), 1);
    }

    #[test]
    fn test_started_offsets_are_absolute() {
        let mut queue = SignalQueue::new();
        let events = queue.subscribe();
        let a = queue.append(ramp(4, 1.0), 2, 1, Metadata::new()).unwrap();
        let b = queue.append(ramp(2, 10.0), 1, 0, Metadata::new()).unwrap();
        queue.set_offset(1000);
        queue.pop_buffer(4, true);
        queue.pop_buffer(100, true);
        assert_eq!(started(&events), vec![(a, 1000, 1), (a, 1005, 2), (b, 1010, 1)]);
    }

    #[test]
    fn test_interleaved_rotates() {
        let mut queue = SignalQueue::with_order(QueueOrder::Interleaved);
        queue.append(ramp(1, 1.0), 2, 0, Metadata::new()).unwrap();
        queue.append(ramp(1, 5.0), 2, 0, Metadata::new()).unwrap();
        let (samples, exhausted) = queue.pop_buffer(10, true);
        assert_eq!(samples, vec![1.0, 5.0, 1.0, 5.0]);
        assert!(exhausted);
    }

    #[test]
    fn test_remove_playing_entry() {
        let mut queue = SignalQueue::new();
        let a = queue.append(ramp(4, 1.0), 1, 0, Metadata::new()).unwrap();
        queue.append(ramp(1, 9.0), 1, 0, Metadata::new()).unwrap();
        queue.pop_buffer(2, true);
        queue.remove(a).unwrap();
        let (rest, _) = queue.pop_buffer(4, true);
        assert_eq!(rest, vec![9.0]);
        assert_eq!(queue.remove(a).unwrap_err(), QueueError::UnknownKey(a));
    }

    #[test]
    fn test_append_validation() {
        let mut queue = SignalQueue::new();
        assert_eq!(
            queue.append(ramp(2, 0.0), 0, 0, Metadata::new()).unwrap_err(),
            QueueError::InvalidRepetitions
        );
        assert_eq!(
            queue.append(ramp(0, 0.0), 1, 0, Metadata::new()).unwrap_err(),
            QueueError::EmptyEntry
        );
        queue.append(ramp(1, 0.0), 1, 0, Metadata::new()).unwrap();
        let other_rate = WaveformFactory::from_samples(vec![0.0], 2000.0).unwrap();
        assert!(matches!(
            queue.append(other_rate, 1, 0, Metadata::new()),
            Err(QueueError::RateMismatch { .. })
        ));
    }

    #[test]
    fn test_remaining_samples() {
        let mut queue = SignalQueue::new();
        queue.append(ramp(10, 0.0), 3, 5, Metadata::new()).unwrap();
        queue.append(ramp(4, 0.0), 1, 0, Metadata::new()).unwrap();
        assert_eq!(queue.remaining_samples(), Some(49));
        assert_eq!(queue.count_trials(), 4);
    }

    #[test]
    fn test_append_all_is_all_or_nothing() {
        let mut queue = SignalQueue::new();
        let err = queue
            .append_all(vec![
                (ramp(3, 0.0), 1, 0, Metadata::new()),
                (ramp(3, 0.0), 0, 0, Metadata::new()),
            ])
            .unwrap_err();
        assert_eq!(err, QueueError::InvalidRepetitions);
        assert!(queue.is_empty());
        assert_eq!(queue.fs(), None);

        let other_rate = WaveformFactory::from_samples(vec![1.0], 2000.0).unwrap();
        assert!(queue
            .append_all(vec![
                (ramp(3, 0.0), 1, 0, Metadata::new()),
                (other_rate, 1, 0, Metadata::new()),
            ])
            .is_err());
        assert!(queue.is_empty());

        let keys = queue
            .append_all(vec![
                (ramp(3, 0.0), 2, 0, Metadata::new()),
                (ramp(2, 0.0), 1, 1, Metadata::new()),
            ])
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(queue.count_trials(), 3);
    }

    #[test]
    fn test_abort_trial_restarts_next_repetition() {
        let mut queue = SignalQueue::new();
        assert!(!queue.abort_trial(true));

        queue.append(ramp(4, 1.0), 2, 0, Metadata::new()).unwrap();
        let (samples, _) = queue.pop_buffer(2, true);
        assert_eq!(samples, vec![1.0, 2.0]);

        assert!(queue.abort_trial(true));
        assert_eq!(queue.count_trials(), 1);
        let (samples, _) = queue.pop_buffer(4, true);
        assert_eq!(samples, vec![1.0, 2.0, 3.0, 4.0]);

        // Finishing the last repetition leaves nothing to abort
        queue.pop_buffer(1, true);
        assert!(queue.is_exhausted());
        assert!(!queue.abort_trial(true));
    }
}
