//! Closed-form scratch ramps.
//!
//! Scratch gestures move the read head to a target along a shaped ramp. Every
//! profile here is a closed-form travel curve with its matching rate envelope (the
//! curve's derivative), so one evaluation per sample is enough, restarting from a
//! new anchor is clean, and the ramp always lands exactly on its target.

use fast_math::exp;

/// Hard limit on the instantaneous scratch rate, in multiples of unity speed
pub const SCRATCH_RATE_LIMIT: f64 = 2.5;

/// Steepness of the forward scratch exponential
pub const FORWARD_K: f32 = 7.0;

/// Map the scratch amount parameter (0..100) to a gesture time in seconds:
/// a 1.7 power curve over three seconds, floored at 15 ms so a ramp always
/// has room to fade.
pub fn seconds_from_amount(percent: f32) -> f32 {
    let normalized = (percent / 100.0).clamp(0.0, 1.0);
    (normalized.powf(1.7) * 3.0).clamp(0.015, 3.0)
}

/// The travel curve of a ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchProfile {
    /// Fast start, exponential settle; the forward (press) gesture
    Exponential,
    /// Ease in and out; the release gesture for loop, gate and one-shot strips
    Smoothstep,
    /// Slow start power curve; the release gesture for grain strips
    Power,
}

impl ScratchProfile {
    /// Fraction of the total distance travelled at progress `p`
    fn travel(self, p: f32) -> f32 {
        match self {
            ScratchProfile::Exponential => {
                (1.0 - exp(-FORWARD_K * p)) / (1.0 - exp(-FORWARD_K))
            }
            ScratchProfile::Smoothstep => p * p * (3.0 - 2.0 * p),
            ScratchProfile::Power => p.powf(1.6),
        }
    }

    /// The rate envelope at progress `p`: the derivative of `travel`, normalized
    /// so its integral over 0..1 is 1
    fn envelope(self, p: f32) -> f32 {
        match self {
            ScratchProfile::Exponential => {
                FORWARD_K * exp(-FORWARD_K * p) / (1.0 - exp(-FORWARD_K))
            }
            ScratchProfile::Smoothstep => 6.0 * p * (1.0 - p),
            ScratchProfile::Power => 1.6 * p.powf(0.6),
        }
    }

    /// The peak of the rate envelope, used by the feasibility clamp
    fn peak_envelope(self) -> f64 {
        match self {
            // envelope is maximal at p = 0
            ScratchProfile::Exponential => {
                FORWARD_K as f64 / (1.0 - exp(-FORWARD_K) as f64)
            }
            // maximal at p = 0.5
            ScratchProfile::Smoothstep => 1.5,
            // maximal at p = 1
            ScratchProfile::Power => 1.6,
        }
    }
}

/// A running scratch ramp from one read position to another
/// # Attributes
/// * `start_position`, `end_position`: Read head endpoints in frames
/// * `duration_samples`: Total ramp length after the feasibility clamp
/// * `elapsed_samples`: Samples consumed so far
/// * `profile`: Travel curve in use
#[derive(Debug, Clone)]
pub struct ScratchRamp {
    start_position: f64,
    end_position: f64,
    duration_samples: f64,
    elapsed_samples: f64,
    profile: ScratchProfile,
    active: bool,
}

impl ScratchRamp {
    /// Constructor for an idle ramp
    pub fn new() -> Self {
        Self {
            start_position: 0.0,
            end_position: 0.0,
            duration_samples: 0.0,
            elapsed_samples: 0.0,
            profile: ScratchProfile::Smoothstep,
            active: false,
        }
    }

    /// The shortest duration over which `distance` frames can be covered without
    /// the peak rate exceeding [`SCRATCH_RATE_LIMIT`].
    pub fn feasible_duration(distance: f64, requested_samples: f64, profile: ScratchProfile) -> f64 {
        let minimum = distance.abs() * profile.peak_envelope() / SCRATCH_RATE_LIMIT;
        requested_samples.max(minimum).max(1.0)
    }

    /// Start a ramp; the duration is extended to the feasibility minimum when the
    /// request is too fast for the distance.
    pub fn start(
        &mut self,
        start_position: f64,
        end_position: f64,
        requested_samples: f64,
        profile: ScratchProfile,
    ) {
        let distance = end_position - start_position;
        self.start_position = start_position;
        self.end_position = end_position;
        self.duration_samples = Self::feasible_duration(distance, requested_samples, profile);
        self.elapsed_samples = 0.0;
        self.profile = profile;
        self.active = true;
    }

    /// Step the ramp one sample.
    /// Returns `(position, rate)` where rate is in frames per sample, clamped to
    /// the scratch limit. Returns `None` once the ramp has landed.
    pub fn advance(&mut self) -> Option<(f64, f64)> {
        if !self.active {
            return None;
        }

        self.elapsed_samples += 1.0;
        let p = (self.elapsed_samples / self.duration_samples).min(1.0) as f32;

        let distance = self.end_position - self.start_position;
        let position = self.start_position + distance * self.profile.travel(p) as f64;
        let average_rate = distance / self.duration_samples;
        let rate = (average_rate * self.profile.envelope(p) as f64)
            .clamp(-SCRATCH_RATE_LIMIT, SCRATCH_RATE_LIMIT);

        if p >= 1.0 {
            self.active = false;
            return Some((self.end_position, rate));
        }
        Some((position, rate))
    }

    /// Whether the ramp is still travelling
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The target the ramp is heading for
    pub fn end_position(&self) -> f64 {
        self.end_position
    }

    /// The ramp length in samples after the feasibility clamp
    pub fn duration_samples(&self) -> f64 {
        self.duration_samples
    }

    /// Progress through the ramp in 0..1
    pub fn progress(&self) -> f64 {
        if self.duration_samples <= 0.0 {
            1.0
        } else {
            (self.elapsed_samples / self.duration_samples).min(1.0)
        }
    }

    /// Abandon the ramp where it stands
    pub fn cancel(&mut self) {
        self.active = false;
    }
}

impl Default for ScratchRamp {
    fn default() -> Self {
        Self::new()
    }
}
