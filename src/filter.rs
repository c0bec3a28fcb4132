#![allow(dead_code)]
//! A module implementing the per-strip filter: a topology-preserving-transform
//! state-variable filter, 12 dB/oct, switchable between lowpass, bandpass and
//! highpass outputs. One instance per channel; coefficients are shared.

/// Which of the state variable outputs the strip mixes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// 12 dB/oct lowpass
    #[default]
    Lowpass,
    /// Bandpass, unity gain at the cutoff
    Bandpass,
    /// 12 dB/oct highpass
    Highpass,
}

impl FilterType {
    /// Map a stored parameter index back to a filter type
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => FilterType::Lowpass,
            1 => FilterType::Bandpass,
            _ => FilterType::Highpass,
        }
    }
}

/// The pre-warped coefficients of the state variable filter
/// Recomputed on cutoff or resonance changes, not per sample
#[derive(Debug, Clone, Copy)]
pub struct SvfCoefficients {
    g: f32,
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
}

impl SvfCoefficients {
    /// Generate coefficients from cutoff frequency, resonance Q and sample rate.
    /// The cutoff is clamped below Nyquist so tan() stays finite.
    pub fn new(cutoff_hz: f32, q: f32, sample_rate: f32) -> Self {
        let cutoff = cutoff_hz.clamp(10.0, sample_rate * 0.49);
        let g = (std::f32::consts::PI * cutoff / sample_rate).tan();
        let k = 1.0 / q.max(0.05);
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;
        Self { g, k, a1, a2, a3 }
    }
}

/// One channel of the state variable filter
/// # Attributes
/// * `coeffs`: The shared coefficient set
/// * `ic1eq`, `ic2eq`: The two integrator states of the TPT structure
#[derive(Debug, Clone)]
pub struct StateVariableFilter {
    coeffs: SvfCoefficients,
    ic1eq: f32,
    ic2eq: f32,
}

impl StateVariableFilter {
    /// Constructor with an initial cutoff, Q and sample rate
    pub fn new(cutoff_hz: f32, q: f32, sample_rate: f32) -> Self {
        Self {
            coeffs: SvfCoefficients::new(cutoff_hz, q, sample_rate),
            ic1eq: 0.0,
            ic2eq: 0.0,
        }
    }

    /// Recompute the coefficients for new cutoff / resonance settings
    pub fn set_coefficients(&mut self, coeffs: SvfCoefficients) {
        self.coeffs = coeffs;
    }

    /// Zero the integrator states (used when a sample is swapped out)
    pub fn reset(&mut self) {
        self.ic1eq = 0.0;
        self.ic2eq = 0.0;
    }

    /// Process one sample and return the selected output
    pub fn process(&mut self, input: f32, filter_type: FilterType) -> f32 {
        let SvfCoefficients { g: _, k, a1, a2, a3 } = self.coeffs;

        let v3 = input - self.ic2eq;
        let v1 = a1 * self.ic1eq + a2 * v3;
        let v2 = self.ic2eq + a2 * self.ic1eq + a3 * v3;

        self.ic1eq = 2.0 * v1 - self.ic1eq;
        self.ic2eq = 2.0 * v2 - self.ic2eq;

        match filter_type {
            FilterType::Lowpass => v2,
            FilterType::Bandpass => v1,
            FilterType::Highpass => input - k * v1 - v2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterType, StateVariableFilter, SvfCoefficients};

    /// RMS of a sine run through the filter after settling
    fn measure_gain(cutoff: f32, freq: f32, filter_type: FilterType) -> f32 {
        let sample_rate = 48_000.0;
        let mut filter = StateVariableFilter::new(cutoff, 0.707, sample_rate);
        let mut sum_sq = 0.0;
        let mut count = 0;
        for i in 0..9600 {
            let x = (std::f32::consts::TAU * freq * i as f32 / sample_rate).sin();
            let y = filter.process(x, filter_type);
            // skip the first fifth to let the filter settle
            if i >= 1920 {
                sum_sq += y * y;
                count += 1;
            }
        }
        (sum_sq / count as f32).sqrt() / (0.5_f32).sqrt()
    }

    #[test]
    fn test_lowpass_passes_low_rejects_high() {
        let pass = measure_gain(1000.0, 100.0, FilterType::Lowpass);
        let reject = measure_gain(1000.0, 10_000.0, FilterType::Lowpass);
        assert!(pass > 0.9, "passband gain {pass}");
        assert!(reject < 0.1, "stopband gain {reject}");
    }

    #[test]
    fn test_highpass_passes_high_rejects_low() {
        let pass = measure_gain(1000.0, 10_000.0, FilterType::Highpass);
        let reject = measure_gain(1000.0, 100.0, FilterType::Highpass);
        assert!(pass > 0.9, "passband gain {pass}");
        assert!(reject < 0.1, "stopband gain {reject}");
    }

    #[test]
    fn test_bandpass_peaks_at_cutoff() {
        let at_cutoff = measure_gain(1000.0, 1000.0, FilterType::Bandpass);
        let below = measure_gain(1000.0, 50.0, FilterType::Bandpass);
        let above = measure_gain(1000.0, 15_000.0, FilterType::Bandpass);
        assert!(at_cutoff > below && at_cutoff > above);
    }

    #[test]
    fn test_extreme_cutoff_stays_finite() {
        let coeffs = SvfCoefficients::new(100_000.0, 20.0, 48_000.0);
        let mut filter = StateVariableFilter::new(20.0, 0.1, 48_000.0);
        filter.set_coefficients(coeffs);
        for i in 0..4800 {
            let y = filter.process((i as f32 * 0.37).sin(), FilterType::Lowpass);
            assert!(y.is_finite());
        }
    }
}
