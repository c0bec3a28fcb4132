//! Spectral-flux onset detection for the transient slice map.
//!
//! When a strip runs in transient slice mode, each of its 16 columns should land on
//! a nearby attack instead of the bare uniform grid. This module analyses the sample
//! once on the control thread (at load, or when the mode is switched on): a short-time
//! magnitude spectrum, positive spectral flux between frames, peak picking against an
//! adaptive threshold, then each uniform column start snaps to the closest onset
//! within half a column. Columns with no onset nearby keep their uniform position.

use crate::sample_buffer::{SampleBuffer, NUM_COLUMNS};
use rustfft::{num_complex::Complex, FftPlanner};

/// Analysis frame length in samples
const FRAME_SIZE: usize = 1024;

/// Hop between analysis frames
const HOP_SIZE: usize = 512;

/// Peak threshold: a frame must exceed the local mean flux by this factor
const THRESHOLD_RATIO: f32 = 1.4;

/// Frames either side used for the local mean
const THRESHOLD_SPAN: usize = 8;

/// Compute the per-frame positive spectral flux of the mono mix
fn spectral_flux(buffer: &SampleBuffer) -> Vec<f32> {
    let frames = buffer.len_frames();
    if frames < FRAME_SIZE * 2 {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FRAME_SIZE);

    // precomputed Hann window for the analysis frames
    let window: Vec<f32> = (0..FRAME_SIZE)
        .map(|i| {
            let x = i as f32 / FRAME_SIZE as f32;
            0.5 - 0.5 * (std::f32::consts::TAU * x).cos()
        })
        .collect();

    let num_frames = (frames - FRAME_SIZE) / HOP_SIZE + 1;
    let mut previous_mags = vec![0.0_f32; FRAME_SIZE / 2];
    let mut flux = Vec::with_capacity(num_frames);
    let mut scratch = vec![Complex::new(0.0_f32, 0.0_f32); FRAME_SIZE];

    for frame_index in 0..num_frames {
        let start = frame_index * HOP_SIZE;
        for (i, bin) in scratch.iter_mut().enumerate() {
            *bin = Complex::new(buffer.mono_at(start + i) * window[i], 0.0);
        }
        fft.process(&mut scratch);

        let mut frame_flux = 0.0;
        for (bin, prev) in scratch[..FRAME_SIZE / 2].iter().zip(previous_mags.iter_mut()) {
            let mag = bin.norm();
            let rise = mag - *prev;
            if rise > 0.0 {
                frame_flux += rise;
            }
            *prev = mag;
        }
        flux.push(frame_flux);
    }

    flux
}

/// Pick onset sample positions out of a flux curve: local maxima that clear an
/// adaptive threshold of the surrounding mean flux.
fn pick_onsets(flux: &[f32]) -> Vec<usize> {
    let mut onsets = Vec::new();
    for i in 1..flux.len().saturating_sub(1) {
        if flux[i] <= flux[i - 1] || flux[i] < flux[i + 1] {
            continue;
        }
        let lo = i.saturating_sub(THRESHOLD_SPAN);
        let hi = (i + THRESHOLD_SPAN).min(flux.len() - 1);
        let mean: f32 = flux[lo..=hi].iter().sum::<f32>() / (hi - lo + 1) as f32;
        if flux[i] > mean * THRESHOLD_RATIO {
            // the attack sits at the start of the frame that produced the rise
            onsets.push(i * HOP_SIZE);
        }
    }
    onsets
}

/// Build the 16-entry transient slice map for a sample.
///
/// Each entry is the sample index a column triggers at: the nearest detected onset
/// within half a column width of the uniform grid position, or the uniform position
/// itself when no onset is close enough. Entry 0 is always 0 so the first column
/// stays the sample start.
pub fn compute_slice_map(buffer: &SampleBuffer) -> [usize; NUM_COLUMNS] {
    let frames = buffer.len_frames();
    let mut map = std::array::from_fn(|i| i * frames / NUM_COLUMNS);
    if frames < FRAME_SIZE * 2 {
        return map;
    }

    let onsets = pick_onsets(&spectral_flux(buffer));
    if onsets.is_empty() {
        return map;
    }

    let half_column = frames / (NUM_COLUMNS * 2);
    for (column, slot) in map.iter_mut().enumerate().skip(1) {
        let uniform = column * frames / NUM_COLUMNS;
        // onsets are sorted by construction; find the closest one
        let partition = onsets.partition_point(|&o| o < uniform);
        let mut best: Option<usize> = None;
        for candidate in onsets[partition.saturating_sub(1)..(partition + 1).min(onsets.len())]
            .iter()
            .copied()
        {
            let distance = candidate.abs_diff(uniform);
            if distance <= half_column
                && best.map_or(true, |b| distance < b.abs_diff(uniform))
            {
                best = Some(candidate);
            }
        }
        if let Some(onset) = best {
            *slot = onset;
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::compute_slice_map;
    use crate::sample_buffer::{SampleBuffer, NUM_COLUMNS};

    /// A click train: silence with loud bursts at known positions
    fn click_buffer(frames: usize, clicks: &[usize]) -> SampleBuffer {
        let mut data = vec![0.0_f32; frames];
        for &click in clicks {
            for i in 0..256 {
                if click + i < frames {
                    // decaying noise burst, deterministic
                    data[click + i] = (1.0 - i as f32 / 256.0)
                        * if i % 2 == 0 { 0.9 } else { -0.9 };
                }
            }
        }
        SampleBuffer::from_channels(vec![data], 48_000.0).unwrap()
    }

    #[test]
    fn test_short_sample_uses_uniform_grid() {
        let buffer = SampleBuffer::from_channels(vec![vec![0.1; 512]], 48_000.0).unwrap();
        let map = compute_slice_map(&buffer);
        for (i, &start) in map.iter().enumerate() {
            assert_eq!(start, i * 512 / NUM_COLUMNS);
        }
    }

    #[test]
    fn test_silence_keeps_uniform_grid() {
        let buffer = SampleBuffer::from_channels(vec![vec![0.0; 96_000]], 48_000.0).unwrap();
        let map = compute_slice_map(&buffer);
        for (i, &start) in map.iter().enumerate() {
            assert_eq!(start, i * 96_000 / NUM_COLUMNS);
        }
    }

    #[test]
    fn test_clicks_pull_columns_toward_onsets() {
        let frames = 160_000;
        // place a click slightly after the column 4 uniform position
        let uniform_4 = 4 * frames / NUM_COLUMNS;
        let click = uniform_4 + 1500;
        let buffer = click_buffer(frames, &[click]);

        let map = compute_slice_map(&buffer);
        let distance = map[4].abs_diff(click);
        // the detected onset is frame-quantized; it must land within one hop of
        // the click and closer to it than the uniform grid was
        assert!(distance <= 1024, "column 4 mapped to {}", map[4]);
        assert!(map[4] != uniform_4);
    }

    #[test]
    fn test_first_column_is_sample_start() {
        let buffer = click_buffer(160_000, &[40_000, 80_000]);
        let map = compute_slice_map(&buffer);
        assert_eq!(map[0], 0);
    }

    #[test]
    fn test_map_is_monotonic_for_spread_clicks() {
        let frames = 320_000;
        let clicks: Vec<usize> = (1..8).map(|i| i * frames / 8 + 900).collect();
        let buffer = click_buffer(frames, &clicks);
        let map = compute_slice_map(&buffer);
        for pair in map.windows(2) {
            assert!(pair[0] <= pair[1], "slice map went backwards: {map:?}");
        }
    }
}
