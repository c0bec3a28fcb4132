//! The quantized trigger scheduler that sits between grid presses and the strips.
//!
//! Presses are snapped forward to the next grid line in PPQ, converted to an absolute
//! sample time from the tempo snapshot, and queued sorted by target sample. The engine
//! drains the queue prefix each block and splits rendering around the hits, which is
//! what makes triggers land sample-accurately inside a block.
//!
//! One rule keeps downbeats predictable: a strip holds at most one pending trigger
//! (the gate-closed rule). Re-presses while a trigger is waiting are dropped silently.

use atomic_float::AtomicF64;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// A scheduled trigger waiting for its grid line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantisedTrigger {
    /// Absolute engine sample at which the trigger fires
    pub target_sample_global: i64,
    /// The grid-snapped musical position of the trigger
    pub target_ppq: f64,
    /// Index of the strip to trigger
    pub strip_index: i32,
    /// Column pressed on the grid
    pub column: i32,
}

/// PPQ-indexed, sample-indexed trigger queue
/// # Attributes
/// * `tempo_bpm`: Tempo snapshot used for PPQ to sample conversion
/// * `quantize_division`: Grid resolution as a division of a bar (1..64)
/// * `sample_rate`: Engine sample rate in Hz
/// * `current_sample`: Absolute sample counter advanced once per block
/// * `current_ppq`: Musical position advanced in lock step with `current_sample`
/// * `pending`: Sorted pending triggers, locked for control-thread inserts
pub struct QuantizationClock {
    tempo_bpm: AtomicF64,
    quantize_division: AtomicU32,
    sample_rate: AtomicF64,
    current_sample: AtomicI64,
    current_ppq: AtomicF64,
    pending: Mutex<Vec<QuantisedTrigger>>,
}

impl QuantizationClock {
    /// Constructor with a sample rate; tempo defaults to 120 and the grid to eighths
    pub fn new(sample_rate: f64) -> Self {
        Self {
            tempo_bpm: AtomicF64::new(120.0),
            quantize_division: AtomicU32::new(8),
            sample_rate: AtomicF64::new(sample_rate),
            current_sample: AtomicI64::new(0),
            current_ppq: AtomicF64::new(0.0),
            pending: Mutex::new(Vec::with_capacity(64)),
        }
    }

    /// Setter for the tempo snapshot in BPM
    pub fn set_tempo(&self, bpm: f64) {
        if bpm > 0.0 {
            self.tempo_bpm.store(bpm, Ordering::Release);
        }
    }

    /// Getter for the tempo snapshot in BPM
    pub fn tempo(&self) -> f64 {
        self.tempo_bpm.load(Ordering::Acquire)
    }

    /// Setter for the grid resolution as a bar division (clamped to 1..=64)
    pub fn set_quantize_division(&self, division: u32) {
        self.quantize_division
            .store(division.clamp(1, 64), Ordering::Release);
    }

    /// Getter for the grid resolution
    pub fn quantize_division(&self) -> u32 {
        self.quantize_division.load(Ordering::Acquire)
    }

    /// The grid spacing in beats: a bar of 4 beats divided by the quantize division
    pub fn quant_beats(&self) -> f64 {
        4.0 / self.quantize_division() as f64
    }

    /// Setter for the engine sample rate
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.sample_rate.store(sample_rate, Ordering::Release);
    }

    /// The absolute sample position of the clock
    pub fn current_sample(&self) -> i64 {
        self.current_sample.load(Ordering::Acquire)
    }

    /// The musical position of the clock in quarter notes
    pub fn current_ppq(&self) -> f64 {
        self.current_ppq.load(Ordering::Acquire)
    }

    /// Samples per quarter note at the current tempo
    pub fn samples_per_quarter(&self) -> f64 {
        60.0 / self.tempo() * self.sample_rate.load(Ordering::Acquire)
    }

    /// Advance the clock to a new absolute sample and PPQ pair.
    /// Called once per block by the engine; the two always move together.
    pub fn advance_to(&self, sample: i64, ppq: f64) {
        self.current_sample.store(sample, Ordering::Release);
        self.current_ppq.store(ppq, Ordering::Release);
    }

    /// Hard-set the musical position without touching the sample counter
    /// (used when the host reports a transport jump)
    pub fn set_ppq(&self, ppq: f64) {
        self.current_ppq.store(ppq, Ordering::Release);
    }

    /// Schedule a trigger for `strip_index` / `column` at the next grid line after
    /// `current_ppq`. Dropped silently if the strip already has a pending trigger.
    pub fn schedule_trigger(&self, strip_index: i32, column: i32, current_ppq: f64) {
        let quant_beats = self.quant_beats();

        // snap up to the next grid line, then re-snap through a round to kill the
        // floating point drift that ceil() accumulates on long timelines
        let next_grid_ppq = (current_ppq / quant_beats).ceil() * quant_beats;
        let next_grid_ppq = (next_grid_ppq / quant_beats).round() * quant_beats;

        let mut pending = self.pending.lock();

        // gate closed: one pending trigger per strip, later presses lose
        if pending.iter().any(|t| t.strip_index == strip_index) {
            return;
        }

        let samples_per_quarter = self.samples_per_quarter();
        let snapshot_sample = self.current_sample();
        let delta_samples = (next_grid_ppq - current_ppq) * samples_per_quarter;
        let target_sample = snapshot_sample + delta_samples.round() as i64;
        // never schedule into the past
        let target_sample = target_sample.max(snapshot_sample);

        let trigger = QuantisedTrigger {
            target_sample_global: target_sample,
            target_ppq: next_grid_ppq,
            strip_index,
            column,
        };

        // upper-bound insertion keeps the queue sorted and same-sample triggers in
        // press order
        let position = pending.partition_point(|t| t.target_sample_global <= target_sample);
        pending.insert(position, trigger);
    }

    /// Remove and return every pending trigger with `target_sample < block_end`,
    /// in firing order.
    pub fn take_events_before(&self, block_end: i64) -> Vec<QuantisedTrigger> {
        let mut events = Vec::new();
        self.take_events_before_into(block_end, &mut events);
        events
    }

    /// Drain the same prefix into a caller-owned buffer, so the audio thread can
    /// reuse one allocation across blocks.
    pub fn take_events_before_into(&self, block_end: i64, out: &mut Vec<QuantisedTrigger>) {
        let mut pending = self.pending.lock();
        let split = pending.partition_point(|t| t.target_sample_global < block_end);
        out.extend(pending.drain(..split));
    }

    /// Drop any pending trigger for one strip (trigger cancellation)
    pub fn clear_pending_for_strip(&self, strip_index: i32) {
        self.pending.lock().retain(|t| t.strip_index != strip_index);
    }

    /// Drop all pending triggers (transport stop)
    pub fn clear_all_pending(&self) {
        self.pending.lock().clear();
    }

    /// Whether a strip currently has a trigger waiting
    pub fn has_pending_for_strip(&self, strip_index: i32) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|t| t.strip_index == strip_index)
    }

    /// Number of triggers currently queued
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::QuantizationClock;

    #[test]
    fn test_grid_snap() {
        // tempo 120, quantize 8 -> half-beat grid; a press at 0.37 lands on 0.5
        let clock = QuantizationClock::new(48_000.0);
        clock.set_tempo(120.0);
        clock.set_quantize_division(8);
        clock.advance_to(0, 0.37);

        clock.schedule_trigger(0, 5, 0.37);
        let events = clock.take_events_before(i64::MAX);
        assert_eq!(events.len(), 1);
        assert!((events[0].target_ppq - 0.5).abs() < 1e-9);

        // target sample equals (0.5 - 0.37) quarter notes at 24000 samples each
        let expected = ((0.5 - 0.37) * 24_000.0).round() as i64;
        assert!((events[0].target_sample_global - expected).abs() <= 1);
    }

    #[test]
    fn test_on_grid_press_fires_immediately() {
        let clock = QuantizationClock::new(48_000.0);
        clock.advance_to(1000, 2.0);
        clock.schedule_trigger(1, 0, 2.0);
        let events = clock.take_events_before(1001);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target_sample_global, 1000);
    }

    #[test]
    fn test_gate_closed_drops_second_press() {
        let clock = QuantizationClock::new(48_000.0);
        clock.set_quantize_division(4);
        clock.advance_to(0, 0.1);

        clock.schedule_trigger(3, 4, 0.1);
        clock.schedule_trigger(3, 7, 0.2);

        let events = clock.take_events_before(i64::MAX);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].column, 4);
        assert!((events[0].target_ppq - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_different_strips_keep_own_triggers() {
        let clock = QuantizationClock::new(48_000.0);
        clock.advance_to(0, 0.1);
        clock.schedule_trigger(0, 1, 0.1);
        clock.schedule_trigger(1, 2, 0.1);
        assert_eq!(clock.pending_count(), 2);
    }

    #[test]
    fn test_events_delivered_in_order() {
        let clock = QuantizationClock::new(48_000.0);
        clock.set_quantize_division(16);
        clock.advance_to(0, 0.0);
        // strip 2 and strip 1 both land 2400 samples out (0.1 beats to their grid
        // lines), strip 0 lands at 3600; same-sample events keep insertion order
        clock.schedule_trigger(2, 0, 0.9);
        clock.schedule_trigger(0, 0, 0.1);
        clock.schedule_trigger(1, 0, 0.4);

        let events = clock.take_events_before(i64::MAX);
        assert_eq!(events.len(), 3);
        for pair in events.windows(2) {
            assert!(pair[0].target_sample_global <= pair[1].target_sample_global);
        }
        let order: Vec<i32> = events.iter().map(|e| e.strip_index).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_take_events_is_prefix_only() {
        let clock = QuantizationClock::new(48_000.0);
        clock.set_quantize_division(4);
        clock.advance_to(0, 0.5);
        clock.schedule_trigger(0, 0, 0.5); // lands at beat 1, 12000 samples out
        clock.schedule_trigger(1, 0, 1.5); // lands at beat 2, also 12000 samples out

        // only events inside the block window come out
        let early = clock.take_events_before(1_000);
        assert!(early.is_empty());
        assert_eq!(clock.pending_count(), 2);

        let all = clock.take_events_before(i64::MAX);
        assert_eq!(all.len(), 2);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_clear_pending_for_strip() {
        let clock = QuantizationClock::new(48_000.0);
        clock.advance_to(0, 0.1);
        clock.schedule_trigger(0, 1, 0.1);
        clock.schedule_trigger(1, 2, 0.1);
        clock.clear_pending_for_strip(0);
        assert!(!clock.has_pending_for_strip(0));
        assert!(clock.has_pending_for_strip(1));
    }

    #[test]
    fn test_never_schedules_into_past() {
        let clock = QuantizationClock::new(48_000.0);
        clock.advance_to(500_000, 10.01);
        clock.schedule_trigger(0, 0, 10.01);
        let events = clock.take_events_before(i64::MAX);
        assert!(events[0].target_sample_global >= 500_000);
    }
}
