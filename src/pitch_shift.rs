//! Delay-line pitch shifter used by the strip output stage.
//!
//! Two read taps sweep a short delay window at the rate difference implied by the
//! pitch ratio, 180 degrees apart, each weighted by a Hann lobe of its own tap phase
//! so one tap is always silent while the other wraps. This keeps playback speed
//! untouched while shifting pitch, which is what lets a strip stay locked to the
//! host timeline with pitch applied on top.

use crate::delay_buffer::DelayBuffer;

/// Pitch ratio below which the shifter bypasses entirely
const BYPASS_SEMITONES: f32 = 0.01;

/// Sweep window length in seconds
const WINDOW_SECONDS: f32 = 0.05;

/// Stereo two-tap delay-line pitch shifter
/// # Attributes
/// * `delay_left`, `delay_right`: Per-channel delay rings
/// * `phase`: Normalized 0..1 position of the first tap in the sweep window
/// * `window_samples`: Sweep window length at the current sample rate
/// * `smoothed_semitones`: Single-pole smoothed pitch amount, so jumps glide
/// * `smoothing_coefficient`: Per-sample coefficient of the pitch smoother
pub struct PitchShifter {
    delay_left: DelayBuffer,
    delay_right: DelayBuffer,
    phase: f32,
    window_samples: f32,
    sample_rate: f32,
    smoothed_semitones: f32,
    smoothing_coefficient: f32,
}

impl PitchShifter {
    /// Constructor; buffers are token sized until `prepare` runs
    pub fn new() -> Self {
        Self {
            delay_left: DelayBuffer::new(1),
            delay_right: DelayBuffer::new(1),
            phase: 0.0,
            window_samples: 1.0,
            sample_rate: 44_100.0,
            smoothed_semitones: 0.0,
            smoothing_coefficient: 0.0,
        }
    }

    /// Allocate the delay window for a sample rate
    pub fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.window_samples = (WINDOW_SECONDS * sample_rate).max(32.0);
        let capacity = self.window_samples as usize + 4;
        self.delay_left = DelayBuffer::new(capacity);
        self.delay_right = DelayBuffer::new(capacity);
        self.set_smoothing_ms(20.0);
        self.reset();
    }

    /// Setter for the pitch smoothing time constant in milliseconds
    pub fn set_smoothing_ms(&mut self, milliseconds: f32) {
        let samples = (milliseconds * 0.001 * self.sample_rate).max(1.0);
        self.smoothing_coefficient = (-1.0 / samples).exp();
    }

    /// Clear delay state and snap the smoother
    pub fn reset(&mut self) {
        self.delay_left.clear();
        self.delay_right.clear();
        self.phase = 0.0;
        self.smoothed_semitones = 0.0;
    }

    /// Process one stereo frame with a target shift in semitones.
    /// Near-zero shifts bypass, but keep writing the rings so engaging the shifter
    /// later has history to read.
    pub fn process(&mut self, left: f32, right: f32, semitones: f32) -> (f32, f32) {
        self.delay_left.write(left);
        self.delay_right.write(right);

        self.smoothed_semitones = self.smoothed_semitones * self.smoothing_coefficient
            + semitones * (1.0 - self.smoothing_coefficient);

        if self.smoothed_semitones.abs() < BYPASS_SEMITONES {
            return (left, right);
        }

        let ratio = 2.0_f32.powf(self.smoothed_semitones / 12.0);
        // the taps sweep at the rate difference; upward shifts sweep toward the
        // write head, downward shifts away from it
        self.phase += (1.0 - ratio) / self.window_samples;
        self.phase -= self.phase.floor();

        let tap_a = self.phase;
        let tap_b = {
            let t = self.phase + 0.5;
            t - t.floor()
        };

        let gain_a = (std::f32::consts::PI * tap_a).sin();
        let gain_b = (std::f32::consts::PI * tap_b).sin();

        let delay_a = tap_a * (self.window_samples - 2.0);
        let delay_b = tap_b * (self.window_samples - 2.0);

        let out_left = self.delay_left.read_fractional(delay_a) * gain_a
            + self.delay_left.read_fractional(delay_b) * gain_b;
        let out_right = self.delay_right.read_fractional(delay_a) * gain_a
            + self.delay_right.read_fractional(delay_b) * gain_b;

        (out_left, out_right)
    }
}

impl Default for PitchShifter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PitchShifter;

    /// Count zero crossings of a rendered signal as a cheap frequency estimate
    fn crossings(signal: &[f32]) -> usize {
        signal
            .windows(2)
            .filter(|w| (w[0] <= 0.0 && w[1] > 0.0) || (w[0] >= 0.0 && w[1] < 0.0))
            .count()
    }

    #[test]
    fn test_bypass_passes_input_through() {
        let mut shifter = PitchShifter::new();
        shifter.prepare(48_000.0);
        for i in 0..1000 {
            let x = (i as f32 * 0.05).sin();
            let (l, r) = shifter.process(x, -x, 0.0);
            assert_eq!(l, x);
            assert_eq!(r, -x);
        }
    }

    #[test]
    fn test_octave_up_doubles_frequency() {
        let mut shifter = PitchShifter::new();
        shifter.prepare(48_000.0);

        let freq = 220.0_f32;
        let mut output = Vec::new();
        for i in 0..48_000 {
            let x = (std::f32::consts::TAU * freq * i as f32 / 48_000.0).sin();
            let (l, _) = shifter.process(x, x, 12.0);
            output.push(l);
        }

        // skip the first quarter second while the smoother glides up
        let settled = &output[12_000..];
        let input_crossings = (freq * 2.0 * settled.len() as f32 / 48_000.0) as usize;
        let measured = crossings(settled);
        // the shifted signal should cross about twice as often as the input would
        let expected = input_crossings * 2;
        let tolerance = expected / 5;
        assert!(
            measured.abs_diff(expected) <= tolerance,
            "measured {measured} crossings, expected about {expected}"
        );
    }

    #[test]
    fn test_output_stays_finite_and_bounded() {
        let mut shifter = PitchShifter::new();
        shifter.prepare(48_000.0);
        for i in 0..20_000 {
            let x = (i as f32 * 0.11).sin();
            let (l, r) = shifter.process(x, x, -7.3);
            assert!(l.is_finite() && r.is_finite());
            // two Hann-weighted taps can sum to at most sqrt(2) of the input peak
            assert!(l.abs() <= 1.5 && r.abs() <= 1.5);
        }
    }
}
