//! Tempo-locked gate modulation and the swing timeline warp.
//!
//! The gate is an amplitude shaper driven straight from the host beat position, so it
//! never drifts: gain is a pure function of (ppq, shape, speed, amount, envelope).
//! Swing is centralized here as a single mapping from host PPQ to a swung PPQ; both
//! the per-sample playback path and pattern recording use it, so the two can never
//! disagree about where an off-beat sits.

/// The waveform of the gate modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateShape {
    /// Raised cosine, full at the downbeat
    #[default]
    Sine,
    /// Triangle, full at the downbeat
    Triangle,
    /// Square with softened edges (edge width grows with the envelope parameter)
    Square,
}

impl GateShape {
    /// Map a stored parameter index back to a gate shape
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => GateShape::Sine,
            1 => GateShape::Triangle,
            _ => GateShape::Square,
        }
    }
}

/// The raw 0..1 gate waveform at `phase` within one gate cycle.
/// All shapes are 1.0 at phase 0 so the downbeat is never attenuated.
fn shape_value(shape: GateShape, phase: f32, envelope: f32) -> f32 {
    match shape {
        GateShape::Sine => 0.5 + 0.5 * (std::f32::consts::TAU * phase).cos(),
        GateShape::Triangle => (1.0 - 2.0 * phase).abs(),
        GateShape::Square => {
            // soft edges stop the square clicking; width scales with the envelope
            let edge = 0.01 + envelope * 0.24;
            if phase < 0.5 - edge {
                1.0
            } else if phase < 0.5 {
                let t = (0.5 - phase) / edge;
                smoothstep(t)
            } else if phase < 1.0 - edge {
                0.0
            } else {
                let t = (phase - (1.0 - edge)) / edge;
                smoothstep(t)
            }
        }
    }
}

fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// The gate gain for a beat position.
/// # Parameters
/// * `ppq`: swung host position in quarter notes
/// * `shape`: gate waveform
/// * `speed`: gate cycles per beat
/// * `amount`: modulation depth, 0 bypasses
/// * `envelope`: edge / curve morph; 0 gives a hard pumping curve, 1 a gentle one
pub fn gate_gain(ppq: f64, shape: GateShape, speed: f32, amount: f32, envelope: f32) -> f32 {
    if amount <= 0.0 || speed <= 0.0 {
        return 1.0;
    }

    let cycle = ppq * speed as f64;
    let phase = (cycle - cycle.floor()) as f32;

    // curve exponent runs 3.2 (choppy) down to 0.8 (soft) across the envelope range
    let exponent = 3.2 + (0.8 - 3.2) * envelope.clamp(0.0, 1.0);
    let shaped = shape_value(shape, phase, envelope).powf(exponent);

    1.0 - amount.clamp(0.0, 1.0) * (1.0 - shaped)
}

/// Warp a host beat position onto the swung timeline.
///
/// `division` is the number of subdivisions per beat that carry the swing (2 for
/// swung eighths, 4 for sixteenths). At full `amount` the off-beat lands a third of
/// a subdivision late, the classic 2:1 triplet feel. The map is continuous,
/// monotonic and the identity at `amount` 0, so positions can be compared across it.
pub fn apply_swing(ppq: f64, amount: f32, division: u32) -> f64 {
    if amount <= 0.0 || division == 0 {
        return ppq;
    }

    let step = 1.0 / division as f64;
    let pair = 2.0 * step;
    let base = (ppq / pair).floor() * pair;
    let p = ppq - base;

    // the off-beat is delayed by up to a third of a step
    let knee = step * (1.0 + amount.clamp(0.0, 1.0) as f64 / 3.0);
    let warped = if p < knee {
        p / knee * step
    } else {
        step + (p - knee) / (pair - knee) * step
    };

    base + warped
}

#[cfg(test)]
mod tests {
    use super::{apply_swing, gate_gain, GateShape};
    use test_case::test_case;

    #[test_case(GateShape::Sine)]
    #[test_case(GateShape::Triangle)]
    #[test_case(GateShape::Square)]
    fn downbeat_is_never_attenuated(shape: GateShape) {
        let g = gate_gain(4.0, shape, 1.0, 1.0, 0.5);
        assert!((g - 1.0).abs() < 1e-3, "{shape:?} downbeat gain {g}");
    }

    #[test]
    fn zero_amount_bypasses() {
        for i in 0..32 {
            let ppq = i as f64 * 0.13;
            assert_eq!(gate_gain(ppq, GateShape::Square, 2.0, 0.0, 0.5), 1.0);
        }
    }

    #[test]
    fn full_square_reaches_silence() {
        // mid cycle a full-depth square closes completely
        let g = gate_gain(0.6, GateShape::Square, 1.0, 1.0, 0.0);
        assert!(g < 1e-3, "closed gain {g}");
    }

    #[test]
    fn gain_stays_in_range() {
        for shape in [GateShape::Sine, GateShape::Triangle, GateShape::Square] {
            for i in 0..200 {
                let g = gate_gain(i as f64 * 0.031, shape, 3.0, 0.8, 0.7);
                assert!((0.0..=1.0001).contains(&g));
            }
        }
    }

    #[test]
    fn swing_identity_at_zero() {
        for i in 0..16 {
            let ppq = i as f64 * 0.37;
            assert_eq!(apply_swing(ppq, 0.0, 2), ppq);
        }
    }

    #[test]
    fn swing_delays_offbeat() {
        // at full swing with eighth subdivisions, the off-beat (0.5) maps earlier on
        // the swung timeline, i.e. the musical off-beat happens later in host time
        let swung = apply_swing(0.5, 1.0, 2);
        assert!(swung < 0.5);
        // the host position that reaches the musical off-beat is a sixth of a beat late
        let knee = apply_swing(0.5 * (1.0 + 1.0 / 3.0), 1.0, 2);
        assert!((knee - 0.5).abs() < 1e-9);
    }

    #[test]
    fn swing_is_monotonic_and_continuous() {
        let mut last = -1.0;
        for i in 0..1000 {
            let ppq = i as f64 * 0.004;
            let swung = apply_swing(ppq, 0.7, 4);
            assert!(swung >= last, "swing not monotonic at {ppq}");
            last = swung;
        }
        // pair boundaries map to themselves
        assert!((apply_swing(1.0, 0.7, 2) - 1.0).abs() < 1e-9);
        assert!((apply_swing(2.0, 0.7, 2) - 2.0).abs() < 1e-9);
    }
}
