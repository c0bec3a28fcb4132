//! Direction modes for the strip playback kernel.
//!
//! `map_direction` turns a raw, monotonically advancing loop position into the
//! audible read position for the selected mode. The deterministic modes are pure
//! functions; the random modes keep a small amount of per-strip state (the chosen
//! slice bucket, the walk position, the stutter window) that is re-rolled when the
//! quantize segment changes. Every strip owns its own seeded generator, so strips
//! never share randomness and a strip's behaviour does not depend on how many
//! other strips are running.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sample_buffer::NUM_COLUMNS;

/// How the raw loop position maps to the audible read position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionMode {
    /// Straight through, wrapping at the loop end
    #[default]
    Normal,
    /// Mirrored within the loop
    Reverse,
    /// Forward then backward with period twice the loop
    PingPong,
    /// A random 16-slice bucket per quantize segment, with a downbeat bias
    Random,
    /// A bucket that steps a small random distance each quantize segment
    RandomWalk,
    /// A stuttering slice window with its own retrigger rate and speed ramp
    RandomSlice,
}

impl DirectionMode {
    /// Map a stored parameter index back to a direction mode
    pub fn from_index(index: u32) -> Self {
        match index {
            1 => DirectionMode::Reverse,
            2 => DirectionMode::PingPong,
            3 => DirectionMode::Random,
            4 => DirectionMode::RandomWalk,
            5 => DirectionMode::RandomSlice,
            _ => DirectionMode::Normal,
        }
    }
}

/// Fade-in applied to each stutter retrigger, in samples
const RETRIGGER_FADE_SAMPLES: f64 = 64.0;

/// Stutter rate options for RandomSlice, in beats
const SLICE_QUANT_CHOICES: [f64; 5] = [2.0, 1.0, 0.5, 0.25, 0.125];

/// Speed ramp pairs for RandomSlice: (start, end) playback rates
const SLICE_SPEED_PAIRS: [(f64, f64); 5] =
    [(1.0, 1.0), (0.5, 1.0), (1.0, 0.5), (2.0, 1.0), (-1.0, 1.0)];

/// Per-strip state for the random direction modes
/// # Attributes
/// * `rng`: The strip's private generator, seeded at construction
/// * `random_segment` / `walk_segment` / `slice_segment`: The quantize segment the
///   mode state was last rolled for; a change triggers a re-roll
pub struct DirectionState {
    rng: StdRng,
    random_segment: i64,
    random_bucket: usize,
    walk_segment: i64,
    walk_bucket: usize,
    slice_segment: i64,
    slice_quant_beats: f64,
    slice_window_start: usize,
    slice_window_len: usize,
    slice_speed_start: f64,
    slice_speed_end: f64,
    slice_start_ppq: f64,
}

impl DirectionState {
    /// Constructor seeding the generator from the strip index, a golden-ratio hash
    /// and the wall clock, so two strips (and two runs) never line up.
    pub fn new(strip_index: usize) -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seed = (strip_index as u64 + 1)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ millis;
        Self::with_seed(seed)
    }

    /// Constructor with an explicit seed, used by tests for reproducibility
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            random_segment: i64::MIN,
            random_bucket: 0,
            walk_segment: i64::MIN,
            walk_bucket: 0,
            slice_segment: i64::MIN,
            slice_quant_beats: 0.25,
            slice_window_start: 0,
            slice_window_len: 1,
            slice_speed_start: 1.0,
            slice_speed_end: 1.0,
            slice_start_ppq: 0.0,
        }
    }

    /// Forget all rolled state so the next sample re-rolls (called on trigger)
    pub fn reset(&mut self) {
        self.random_segment = i64::MIN;
        self.walk_segment = i64::MIN;
        self.slice_segment = i64::MIN;
    }

    /// Map a raw loop position to the audible position for `mode`.
    ///
    /// Returns `(position, gain)`; gain is 1 except for RandomSlice retriggers,
    /// which fade in over a few samples to stay click free.
    /// # Parameters
    /// * `raw_position`: Monotonic position in frames from the loop start
    /// * `loop_length`: Loop length in frames
    /// * `quantize_beats`: Grid spacing driving the random re-rolls
    /// * `beats_for_loop`: Musical length of the loop, for beat <-> frame conversion
    /// * `ppq`: Current host position in quarter notes
    pub fn map_direction(
        &mut self,
        mode: DirectionMode,
        raw_position: f64,
        loop_length: f64,
        quantize_beats: f64,
        beats_for_loop: f64,
        ppq: f64,
    ) -> (f64, f64) {
        if loop_length <= 0.0 {
            return (0.0, 1.0);
        }

        match mode {
            DirectionMode::Normal => (raw_position.rem_euclid(loop_length), 1.0),
            DirectionMode::Reverse => {
                let wrapped = raw_position.rem_euclid(loop_length);
                ((loop_length - wrapped).rem_euclid(loop_length), 1.0)
            }
            DirectionMode::PingPong => {
                let period = 2.0 * loop_length;
                let p = raw_position.rem_euclid(period);
                if p < loop_length {
                    (p, 1.0)
                } else {
                    (period - p, 1.0)
                }
            }
            DirectionMode::Random => {
                let segment = Self::segment_index(ppq, quantize_beats);
                if segment != self.random_segment {
                    self.random_segment = segment;
                    self.random_bucket = self.roll_random_bucket();
                }
                (
                    self.bucket_position(self.random_bucket, raw_position, loop_length),
                    1.0,
                )
            }
            DirectionMode::RandomWalk => {
                let segment = Self::segment_index(ppq, quantize_beats);
                if segment != self.walk_segment {
                    self.walk_segment = segment;
                    let delta: i32 = *[-2, -1, 1, 2]
                        .get(self.rng.gen_range(0..4))
                        .unwrap_or(&1);
                    let next = self.walk_bucket as i32 + delta;
                    self.walk_bucket =
                        next.rem_euclid(NUM_COLUMNS as i32) as usize;
                }
                (
                    self.bucket_position(self.walk_bucket, raw_position, loop_length),
                    1.0,
                )
            }
            DirectionMode::RandomSlice => {
                self.map_random_slice(loop_length, beats_for_loop, ppq)
            }
        }
    }

    fn segment_index(ppq: f64, quantize_beats: f64) -> i64 {
        if quantize_beats <= 0.0 {
            return 0;
        }
        (ppq / quantize_beats).floor() as i64
    }

    /// Pick the next Random-mode bucket: 30% a downbeat anchor, 45% uniform,
    /// 25% a short walk from the current bucket.
    fn roll_random_bucket(&mut self) -> usize {
        let roll: f64 = self.rng.gen();
        if roll < 0.30 {
            let anchors = [0_usize, 4, 8, 12];
            anchors[self.rng.gen_range(0..anchors.len())]
        } else if roll < 0.75 {
            self.rng.gen_range(0..NUM_COLUMNS)
        } else {
            let delta: i32 = *[-2, -1, 1, 2].get(self.rng.gen_range(0..4)).unwrap_or(&1);
            (self.random_bucket as i32 + delta).rem_euclid(NUM_COLUMNS as i32) as usize
        }
    }

    /// Position inside a 16-slice bucket: the bucket start plus the raw position
    /// wrapped to one slice
    fn bucket_position(&self, bucket: usize, raw_position: f64, loop_length: f64) -> f64 {
        let slice_len = loop_length / NUM_COLUMNS as f64;
        let within = raw_position.rem_euclid(slice_len.max(1.0));
        (bucket as f64 * slice_len + within).rem_euclid(loop_length)
    }

    fn map_random_slice(
        &mut self,
        loop_length: f64,
        beats_for_loop: f64,
        ppq: f64,
    ) -> (f64, f64) {
        let segment = Self::segment_index(ppq, self.slice_quant_beats);
        if segment != self.slice_segment {
            // a new stutter: roll the retrigger rate, window and speed ramp
            self.slice_quant_beats =
                SLICE_QUANT_CHOICES[self.rng.gen_range(0..SLICE_QUANT_CHOICES.len())];
            // the segment counter tracks the freshly rolled rate
            self.slice_segment = Self::segment_index(ppq, self.slice_quant_beats);
            self.slice_window_start = self.rng.gen_range(0..NUM_COLUMNS);
            self.slice_window_len = self.rng.gen_range(1..=4);
            let (start, end) =
                SLICE_SPEED_PAIRS[self.rng.gen_range(0..SLICE_SPEED_PAIRS.len())];
            self.slice_speed_start = start;
            self.slice_speed_end = end;
            // the boundary is detected on the first sample past it, so starting the
            // stutter here is at most one sample late
            self.slice_start_ppq = ppq;
        }

        let beats_for_loop = if beats_for_loop > 0.0 { beats_for_loop } else { 4.0 };
        let frames_per_beat = loop_length / beats_for_loop;
        let elapsed_beats = (ppq - self.slice_start_ppq).max(0.0);
        let elapsed_frames = elapsed_beats * frames_per_beat;
        let duration_frames = (self.slice_quant_beats * frames_per_beat).max(1.0);

        // closed-form distance under a linearly interpolated speed ramp
        let s0 = self.slice_speed_start;
        let s1 = self.slice_speed_end;
        let travelled =
            s0 * elapsed_frames + (s1 - s0) * elapsed_frames * elapsed_frames / (2.0 * duration_frames);

        let slice_len = loop_length / NUM_COLUMNS as f64;
        let window_frames = (self.slice_window_len as f64 * slice_len).max(1.0);
        let position = (self.slice_window_start as f64 * slice_len
            + travelled.rem_euclid(window_frames))
        .rem_euclid(loop_length);

        let gain = (elapsed_frames / RETRIGGER_FADE_SAMPLES).clamp(0.0, 1.0);
        (position, gain)
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectionMode, DirectionState};
    use test_case::test_case;

    fn map(state: &mut DirectionState, mode: DirectionMode, raw: f64, ppq: f64) -> f64 {
        state.map_direction(mode, raw, 16_000.0, 0.5, 4.0, ppq).0
    }

    #[test]
    fn test_normal_wraps() {
        let mut state = DirectionState::with_seed(1);
        assert_eq!(map(&mut state, DirectionMode::Normal, 1_000.0, 0.0), 1_000.0);
        assert_eq!(map(&mut state, DirectionMode::Normal, 17_000.0, 0.0), 1_000.0);
    }

    #[test]
    fn test_reverse_mirrors() {
        let mut state = DirectionState::with_seed(1);
        assert_eq!(map(&mut state, DirectionMode::Reverse, 1_000.0, 0.0), 15_000.0);
    }

    #[test]
    fn test_ping_pong_reflects() {
        let mut state = DirectionState::with_seed(1);
        // spec scenario: loop of 16000 frames, 24000 elapsed -> reflected to 8000
        assert_eq!(
            map(&mut state, DirectionMode::PingPong, 24_000.0, 0.0),
            8_000.0
        );
        // still inside the forward half
        assert_eq!(
            map(&mut state, DirectionMode::PingPong, 9_000.0, 0.0),
            9_000.0
        );
    }

    #[test_case(DirectionMode::Random)]
    #[test_case(DirectionMode::RandomWalk)]
    fn random_modes_stay_in_loop(mode: DirectionMode) {
        let mut state = DirectionState::with_seed(7);
        for i in 0..10_000 {
            let ppq = i as f64 * 0.003;
            let pos = map(&mut state, mode, i as f64 * 1.7, ppq);
            assert!((0.0..16_000.0).contains(&pos), "{mode:?} escaped: {pos}");
        }
    }

    #[test]
    fn random_bucket_stable_within_segment() {
        let mut state = DirectionState::with_seed(3);
        // two positions inside the same half-beat segment share a bucket: their
        // slice-relative offsets differ by exactly the raw delta
        let slice = 16_000.0 / 16.0;
        let a = map(&mut state, DirectionMode::Random, 100.0, 0.1);
        let b = map(&mut state, DirectionMode::Random, 200.0, 0.2);
        let delta = (b - a).rem_euclid(slice);
        assert!((delta - 100.0).abs() < 1e-9 || (delta - (slice - 100.0)).abs() < 1e-9);
    }

    #[test]
    fn random_slice_fades_in_on_retrigger() {
        let mut state = DirectionState::with_seed(11);
        // first sample of a stutter has zero gain, later samples approach 1
        let (_, gain_start) = state.map_direction(
            DirectionMode::RandomSlice,
            0.0,
            16_000.0,
            0.5,
            4.0,
            1.0,
        );
        assert!(gain_start < 0.1);
        let (_, gain_later) = state.map_direction(
            DirectionMode::RandomSlice,
            0.0,
            16_000.0,
            0.5,
            4.0,
            1.0 + 0.05,
        );
        assert!(gain_later >= gain_start);
    }

    #[test]
    fn random_slice_positions_stay_in_loop() {
        let mut state = DirectionState::with_seed(5);
        for i in 0..20_000 {
            let ppq = i as f64 * 0.0007;
            let (pos, gain) =
                state.map_direction(DirectionMode::RandomSlice, 0.0, 16_000.0, 0.5, 4.0, ppq);
            assert!((0.0..16_000.0).contains(&pos));
            assert!((0.0..=1.0).contains(&gain));
        }
    }

    #[test]
    fn seeded_strips_differ() {
        let mut a = DirectionState::with_seed(100);
        let mut b = DirectionState::with_seed(200);
        let mut diverged = false;
        for i in 0..64 {
            let ppq = i as f64 * 0.5;
            if map(&mut a, DirectionMode::Random, 0.0, ppq)
                != map(&mut b, DirectionMode::Random, 0.0, ppq)
            {
                diverged = true;
                break;
            }
        }
        assert!(diverged);
    }
}
