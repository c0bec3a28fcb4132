//! Equal-power fade envelope generator.
//!
//! A `Crossfader` produces a per-sample gain following a quarter-sine curve, used
//! wherever two signals hand over: inner loop wrap, retrigger blend, group choke.
//! Re-starting a fade that is already running picks up from the current gain rather
//! than snapping back to the edge, which is what keeps re-fades click free.

use std::f32::consts::FRAC_PI_2;

/// Direction of a running fade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FadeDirection {
    /// Gain rising 0 -> 1
    In,
    /// Gain falling 1 -> 0
    Out,
}

/// Equal-power fade envelope with resumable restarts
/// # Attributes
/// * `active`: Whether a fade is currently running
/// * `current_gain`: The gain produced by the most recent call to `next_gain`
/// * `samples_remaining`: Samples left before the fade completes
/// * `total_samples`: Total length of the running fade
/// * `direction`: Whether the gain is rising or falling
#[derive(Debug, Clone)]
pub struct Crossfader {
    active: bool,
    current_gain: f32,
    samples_remaining: u32,
    total_samples: u32,
    direction: FadeDirection,
}

impl Default for Crossfader {
    fn default() -> Self {
        Self::new()
    }
}

impl Crossfader {
    /// Constructor for an idle crossfader (gain 1, no fade running)
    pub fn new() -> Self {
        Self {
            active: false,
            current_gain: 1.0,
            samples_remaining: 0,
            total_samples: 0,
            direction: FadeDirection::In,
        }
    }

    /// Begin a fade over `num_samples` samples.
    ///
    /// If a fade is already active and `force_restart_from_edge` is false, the new fade
    /// starts from the current gain: the remaining sample count is mapped back through
    /// the sine curve so there is no discontinuity. Otherwise the fade starts at the
    /// appropriate edge (0 for a fade in, 1 for a fade out).
    pub fn start(&mut self, fade_in: bool, num_samples: u32, force_restart_from_edge: bool) {
        let num_samples = num_samples.max(1);
        let direction = if fade_in {
            FadeDirection::In
        } else {
            FadeDirection::Out
        };

        if self.active && !force_restart_from_edge {
            // solve ratio for the current gain on the new curve so the gain is continuous
            let clamped = self.current_gain.clamp(0.0, 1.0);
            let ratio = match direction {
                FadeDirection::In => clamped.asin() / FRAC_PI_2,
                FadeDirection::Out => clamped.acos() / FRAC_PI_2,
            };
            self.samples_remaining =
                ((1.0 - ratio) * num_samples as f32).round().max(1.0) as u32;
        } else {
            self.current_gain = if fade_in { 0.0 } else { 1.0 };
            self.samples_remaining = num_samples;
        }

        self.total_samples = num_samples;
        self.direction = direction;
        self.active = true;
    }

    /// Step the fade by one sample and return the gain for that sample.
    /// An inactive fader always returns 1.0.
    pub fn next_gain(&mut self) -> f32 {
        if !self.active {
            return 1.0;
        }

        let ratio = 1.0 - self.samples_remaining as f32 / self.total_samples as f32;
        self.current_gain = match self.direction {
            FadeDirection::In => (ratio * FRAC_PI_2).sin(),
            FadeDirection::Out => (ratio * FRAC_PI_2).cos(),
        };

        self.samples_remaining = self.samples_remaining.saturating_sub(1);
        if self.samples_remaining == 0 {
            self.active = false;
            self.current_gain = match self.direction {
                FadeDirection::In => 1.0,
                FadeDirection::Out => 0.0,
            };
        }

        self.current_gain
    }

    /// Whether a fade is currently running
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The gain produced by the most recent step (1.0 when idle)
    pub fn current_gain(&self) -> f32 {
        if self.active {
            self.current_gain
        } else {
            1.0
        }
    }

    /// Cancel any running fade and return to the idle gain of 1.0
    pub fn reset(&mut self) {
        self.active = false;
        self.current_gain = 1.0;
        self.samples_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::Crossfader;

    #[test]
    fn test_idle_returns_unity() {
        let mut fader = Crossfader::new();
        for _ in 0..16 {
            assert_eq!(fader.next_gain(), 1.0);
        }
    }

    #[test]
    fn test_fade_in_monotonic() {
        let mut fader = Crossfader::new();
        fader.start(true, 64, true);
        let mut last = -1.0;
        for _ in 0..64 {
            let g = fader.next_gain();
            assert!(g >= last);
            last = g;
        }
        assert!(!fader.is_active());
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_fade_out_reaches_zero() {
        let mut fader = Crossfader::new();
        fader.start(false, 32, true);
        let mut g = 1.0;
        for _ in 0..32 {
            g = fader.next_gain();
        }
        assert_eq!(g, 0.0);
        assert!(!fader.is_active());
    }

    #[test]
    fn test_refade_resumes_from_current_gain() {
        let mut fader = Crossfader::new();
        fader.start(false, 100, true);
        for _ in 0..50 {
            fader.next_gain();
        }
        let mid = fader.current_gain();

        // restart as a fade out again without forcing the edge
        fader.start(false, 100, false);
        let next = fader.next_gain();
        // gain continues from the middle of the curve rather than snapping to 1
        assert!((next - mid).abs() < 0.05);
    }

    #[test]
    fn test_equal_power_sum() {
        // fade in and fade out gains are sin/cos of the same angle, so the
        // squared sum stays 1 through the whole fade
        let mut fade_in = Crossfader::new();
        let mut fade_out = Crossfader::new();
        fade_in.start(true, 128, true);
        fade_out.start(false, 128, true);
        for _ in 0..128 {
            let a = fade_in.next_gain();
            let b = fade_out.next_gain();
            assert!((a * a + b * b - 1.0).abs() < 1e-5);
        }
    }
}
