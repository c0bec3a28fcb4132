//! Continuous live-input capture.
//!
//! The recorder writes every input block into a stereo ring, sized once at prepare
//! time so capture never allocates. `capture_loop` then cuts the most recent N bars
//! out of the ring and bakes an equal-power crossfade between the loop tail and the
//! audio that preceded the loop start, so the resulting sample wraps without a seam.

use crate::delay_buffer::DelayBuffer;
use crate::sample_buffer::{SampleBuffer, SampleLoadError};

/// Slowest tempo the ring must be able to hold 8 bars at
const MIN_TEMPO_BPM: f64 = 40.0;

/// Bars of audio the ring is sized for at the minimum tempo
const RING_BARS: f64 = 8.0;

/// Sizing safety factor over the nominal 8 bars
const RING_SAFETY: f64 = 1.5;

/// Hard bounds on the ring allocation in frames
const MIN_RING_FRAMES: usize = 2_000_000;
const MAX_RING_FRAMES: usize = 8_000_000;

/// Default length of the baked loop crossfade
const DEFAULT_CROSSFADE_MS: f32 = 10.0;

/// Always-on input capture ring with loop extraction
/// # Attributes
/// * `left`, `right`: The stereo capture rings
/// * `sample_rate`: Engine sample rate, set in prepare
/// * `crossfade_ms`: Length of the loop-seam crossfade baked on capture
pub struct LiveRecorder {
    left: DelayBuffer,
    right: DelayBuffer,
    sample_rate: f64,
    crossfade_ms: f32,
}

impl LiveRecorder {
    /// Constructor; the ring is a token size until `prepare` is called
    pub fn new() -> Self {
        Self {
            left: DelayBuffer::new(1),
            right: DelayBuffer::new(1),
            sample_rate: 44_100.0,
            crossfade_ms: DEFAULT_CROSSFADE_MS,
        }
    }

    /// Allocate the ring for a sample rate. Sized for 8 bars at the minimum
    /// tempo with headroom, clamped to keep the allocation sane.
    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        let frames = (RING_BARS * 4.0 * (60.0 / MIN_TEMPO_BPM) * sample_rate * RING_SAFETY)
            as usize;
        let frames = frames.clamp(MIN_RING_FRAMES, MAX_RING_FRAMES);
        self.left = DelayBuffer::new(frames);
        self.right = DelayBuffer::new(frames);
    }

    /// Setter for the baked crossfade length in milliseconds
    pub fn set_crossfade_ms(&mut self, crossfade_ms: f32) {
        self.crossfade_ms = crossfade_ms.clamp(0.0, 500.0);
    }

    /// Write one frame of input into the ring
    pub fn process_input(&mut self, left: f32, right: f32) {
        self.left.write(left);
        self.right.write(right);
    }

    /// Capacity of the ring in frames
    pub fn ring_frames(&self) -> usize {
        self.left.len()
    }

    /// Cut the most recent `bars` bars at `tempo_bpm` out of the ring as a new
    /// sample, with the loop seam crossfade baked in.
    ///
    /// Walks backward from the write head: the last `loop_frames` samples are the
    /// loop, and the `crossfade_frames` before those are the pre-roll blended into
    /// the loop tail.
    pub fn capture_loop(
        &self,
        tempo_bpm: f64,
        bars: u32,
    ) -> Result<SampleBuffer, SampleLoadError> {
        let tempo = if tempo_bpm > 0.0 { tempo_bpm } else { 120.0 };
        let loop_frames = ((60.0 / tempo) * self.sample_rate * 4.0 * bars.max(1) as f64) as usize;
        let crossfade_frames =
            ((self.crossfade_ms as f64 * 0.001 * self.sample_rate) as usize).max(1);

        if loop_frames == 0 || loop_frames + crossfade_frames > self.ring_frames() {
            return Err(SampleLoadError::TooLong(loop_frames));
        }

        let mut out_left = vec![0.0_f32; loop_frames];
        let mut out_right = vec![0.0_f32; loop_frames];

        // delay 0 is the newest sample; the loop start sits loop_frames - 1 back
        for i in 0..loop_frames {
            let delay = loop_frames - 1 - i;
            out_left[i] = self.left.read(delay);
            out_right[i] = self.right.read(delay);
        }

        // bake the seam: blend the loop tail toward the pre-roll that preceded the
        // loop start, so tail -> start wraps continuously
        let fade_len = crossfade_frames.min(loop_frames);
        for i in 0..fade_len {
            let t = (i + 1) as f32 / fade_len as f32;
            let fade_in = (t * std::f32::consts::FRAC_PI_2).sin().sqrt();
            let fade_out = (t * std::f32::consts::FRAC_PI_2).cos().sqrt();

            let tail_index = loop_frames - fade_len + i;
            // pre-roll runs from (loop_frames + fade_len - 1) back samples ago
            let preroll_delay = loop_frames + fade_len - 1 - i;
            out_left[tail_index] =
                out_left[tail_index] * fade_out + self.left.read(preroll_delay) * fade_in;
            out_right[tail_index] =
                out_right[tail_index] * fade_out + self.right.read(preroll_delay) * fade_in;
        }

        SampleBuffer::from_channels(vec![out_left, out_right], self.sample_rate as f32)
    }
}

impl Default for LiveRecorder {
    fn default() -> Self {
        Self::new()
    }
}
