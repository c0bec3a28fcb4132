//! Sixteen-step per-strip parameter modulator.
//!
//! Each strip owns one sequencer that modulates a single target parameter from the
//! strip's current column index: column n reads step (n + offset) mod 16. The engine
//! applies the value transiently around each rendered segment (snapshot, modify,
//! process, restore), so the stored parameter never drifts.

use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Number of steps in the sequencer
pub const NUM_STEPS: usize = 16;

/// The parameter a sequencer modulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModTarget {
    /// Sequencer disabled
    #[default]
    None,
    /// Strip volume, attenuating only
    Volume,
    /// Stereo position, +/- full width
    Pan,
    /// Pitch shift, +/- 12 semitones
    Pitch,
    /// Playback speed, +/- one octave of rate
    Speed,
    /// Filter cutoff, multiplicative in octaves
    Cutoff,
    /// Filter resonance
    Resonance,
    /// Grain size, additive milliseconds
    GrainSize,
    /// Grain spawn density
    GrainDensity,
    /// Grain pitch offset
    GrainPitch,
    /// Grain pitch jitter depth
    GrainPitchJitter,
    /// Grain stereo spread
    GrainSpread,
    /// Grain timing jitter
    GrainJitter,
    /// Grain read position scatter
    GrainRandom,
    /// Grain arp depth
    GrainArp,
    /// Grain cloud delay depth
    GrainCloud,
    /// Grain emitter rate
    GrainEmitter,
    /// Grain envelope shape
    GrainEnvelope,
}

impl ModTarget {
    /// Map a stored parameter index back to a target
    pub fn from_index(index: u32) -> Self {
        use ModTarget::*;
        match index {
            1 => Volume,
            2 => Pan,
            3 => Pitch,
            4 => Speed,
            5 => Cutoff,
            6 => Resonance,
            7 => GrainSize,
            8 => GrainDensity,
            9 => GrainPitch,
            10 => GrainPitchJitter,
            11 => GrainSpread,
            12 => GrainJitter,
            13 => GrainRandom,
            14 => GrainArp,
            15 => GrainCloud,
            16 => GrainEmitter,
            17 => GrainEnvelope,
            _ => None,
        }
    }

    /// The parameter index for this target
    pub fn to_index(self) -> u32 {
        use ModTarget::*;
        match self {
            None => 0,
            Volume => 1,
            Pan => 2,
            Pitch => 3,
            Speed => 4,
            Cutoff => 5,
            Resonance => 6,
            GrainSize => 7,
            GrainDensity => 8,
            GrainPitch => 9,
            GrainPitchJitter => 10,
            GrainSpread => 11,
            GrainJitter => 12,
            GrainRandom => 13,
            GrainArp => 14,
            GrainCloud => 15,
            GrainEmitter => 16,
            GrainEnvelope => 17,
        }
    }
}

/// Shaping applied to the raw step value before depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModCurve {
    /// Steps used as stored
    #[default]
    Linear,
    /// Squared, weighting the low end
    Exponential,
    /// Smoothstep, easing both ends
    Smooth,
}

impl ModCurve {
    /// Map a stored parameter index back to a curve mode
    pub fn from_index(index: u32) -> Self {
        match index {
            1 => ModCurve::Exponential,
            2 => ModCurve::Smooth,
            _ => ModCurve::Linear,
        }
    }

    fn shape(self, raw: f32) -> f32 {
        match self {
            ModCurve::Linear => raw,
            ModCurve::Exponential => raw * raw,
            ModCurve::Smooth => raw * raw * (3.0 - 2.0 * raw),
        }
    }
}

/// One strip's step modulator. All fields are atomic: the control thread edits
/// steps while the audio thread reads a value per segment.
pub struct ModSequencer {
    target: AtomicU32,
    bipolar: AtomicBool,
    curve: AtomicU32,
    depth: AtomicF32,
    offset: AtomicI32,
    steps: [AtomicF32; NUM_STEPS],
}

impl Default for ModSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModSequencer {
    /// Constructor for a disabled sequencer with all steps at 0.5
    pub fn new() -> Self {
        Self {
            target: AtomicU32::new(ModTarget::None.to_index()),
            bipolar: AtomicBool::new(false),
            curve: AtomicU32::new(0),
            depth: AtomicF32::new(1.0),
            offset: AtomicI32::new(0),
            steps: std::array::from_fn(|_| AtomicF32::new(0.5)),
        }
    }

    /// Setter for the modulation target
    pub fn set_target(&self, target: ModTarget) {
        self.target.store(target.to_index(), Ordering::Release);
    }

    /// Getter for the modulation target
    pub fn target(&self) -> ModTarget {
        ModTarget::from_index(self.target.load(Ordering::Acquire))
    }

    /// Setter for bipolar mode (steps read as -1..1 instead of 0..1)
    pub fn set_bipolar(&self, bipolar: bool) {
        self.bipolar.store(bipolar, Ordering::Release);
    }

    /// Setter for the step shaping curve
    pub fn set_curve(&self, curve: ModCurve) {
        self.curve.store(curve as u32, Ordering::Release);
    }

    /// Setter for modulation depth, clamped to 0..1
    pub fn set_depth(&self, depth: f32) {
        self.depth.store(depth.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the step offset, clamped to -15..15
    pub fn set_offset(&self, offset: i32) {
        self.offset.store(offset.clamp(-15, 15), Ordering::Release);
    }

    /// Setter for one step value, clamped to 0..1
    pub fn set_step(&self, index: usize, value: f32) {
        if let Some(step) = self.steps.get(index) {
            step.store(value.clamp(0.0, 1.0), Ordering::Release);
        }
    }

    /// Getter for one step value
    pub fn step(&self, index: usize) -> f32 {
        self.steps
            .get(index)
            .map_or(0.0, |s| s.load(Ordering::Acquire))
    }

    /// The step index read for a column, after the offset and a double mod that
    /// keeps negative offsets in range
    pub fn step_index_for_column(&self, column: i32) -> usize {
        let offset = self.offset.load(Ordering::Acquire);
        (((column + offset) % NUM_STEPS as i32 + NUM_STEPS as i32) % NUM_STEPS as i32) as usize
    }

    /// The modulation value for a column: the shaped step, made signed when
    /// bipolar, scaled by depth. Returns `None` when the sequencer is disabled.
    pub fn value_for_column(&self, column: i32) -> Option<(ModTarget, f32)> {
        let target = self.target();
        if target == ModTarget::None {
            return None;
        }

        let raw = self.step(self.step_index_for_column(column));
        let shaped = ModCurve::from_index(self.curve.load(Ordering::Acquire)).shape(raw);
        let signed = if self.bipolar.load(Ordering::Acquire) {
            2.0 * shaped - 1.0
        } else {
            shaped
        };
        Some((target, signed * self.depth.load(Ordering::Acquire)))
    }
}

#[cfg(test)]
mod tests {
    use super::{ModCurve, ModSequencer, ModTarget};
    use test_case::test_case;

    #[test]
    fn test_disabled_returns_none() {
        let sequencer = ModSequencer::new();
        assert!(sequencer.value_for_column(4).is_none());
    }

    #[test_case(0, 0, 0)]
    #[test_case(5, 3, 8)]
    #[test_case(15, 3, 2)]
    #[test_case(0, -3, 13)]
    #[test_case(2, -15, 3)]
    fn test_step_index_wraps(column: i32, offset: i32, expected: usize) {
        let sequencer = ModSequencer::new();
        sequencer.set_offset(offset);
        assert_eq!(sequencer.step_index_for_column(column), expected);
    }

    #[test]
    fn test_unipolar_value() {
        let sequencer = ModSequencer::new();
        sequencer.set_target(ModTarget::Pan);
        sequencer.set_step(3, 0.75);
        sequencer.set_depth(0.5);
        let (target, value) = sequencer.value_for_column(3).unwrap();
        assert_eq!(target, ModTarget::Pan);
        assert!((value - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_bipolar_value() {
        let sequencer = ModSequencer::new();
        sequencer.set_target(ModTarget::Pitch);
        sequencer.set_bipolar(true);
        sequencer.set_depth(1.0);
        sequencer.set_step(0, 0.0);
        sequencer.set_step(1, 1.0);
        assert!((sequencer.value_for_column(0).unwrap().1 + 1.0).abs() < 1e-6);
        assert!((sequencer.value_for_column(1).unwrap().1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_curve_shaping() {
        let sequencer = ModSequencer::new();
        sequencer.set_target(ModTarget::Cutoff);
        sequencer.set_step(0, 0.5);
        sequencer.set_curve(ModCurve::Exponential);
        let (_, value) = sequencer.value_for_column(0).unwrap();
        assert!((value - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_target_index_roundtrip() {
        for index in 0..=17 {
            assert_eq!(ModTarget::from_index(index).to_index(), index);
        }
    }
}
