//! A module containing the per-strip sample storage: a 1 or 2 channel float buffer
//! with the validation applied on load, uniform column addressing and the
//! zero-crossing snap used to de-click trigger targets.
//!
//! A buffer is always built completely (file read, format conversion, validation)
//! before it is handed to a strip, so a failed load never leaves a strip half-changed.

use hound::{SampleFormat, WavReader};
use std::path::Path;
use thiserror::Error;

/// Number of trigger columns a sample is divided into
pub const NUM_COLUMNS: usize = 16;

/// Upper sample rate bound accepted on load
pub const MAX_SAMPLE_RATE_HZ: u32 = 384_000;

/// Upper length bound accepted on load (about 38 minutes at 44.1 kHz)
pub const MAX_LENGTH_FRAMES: usize = 100_000_000;

/// Upper channel count bound accepted on load
pub const MAX_CHANNELS: usize = 8;

/// Errors produced while loading a sample into a strip.
/// All of these leave the target strip untouched.
#[derive(Debug, Error)]
pub enum SampleLoadError {
    /// The file could not be opened or decoded
    #[error("could not read wav file: {0}")]
    Wav(#[from] hound::Error),
    /// The declared sample rate is zero or above [`MAX_SAMPLE_RATE_HZ`]
    #[error("sample rate {0} Hz is outside the supported range")]
    InvalidSampleRate(u32),
    /// The file decoded to zero frames
    #[error("sample contains no frames")]
    Empty,
    /// The file decoded to more than [`MAX_LENGTH_FRAMES`] frames
    #[error("sample is too long ({0} frames)")]
    TooLong(usize),
    /// The file has more than [`MAX_CHANNELS`] channels
    #[error("too many channels ({0})")]
    TooManyChannels(usize),
}

/// A stereo (or mono) float sample buffer owned by a strip
/// # Attributes
/// * `channels`: 1 or 2 de-interleaved channels of f32 samples, equal length
/// * `sample_rate`: The rate the file was recorded at, kept for speed compensation
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: f32,
}

impl SampleBuffer {
    /// Constructor for an empty buffer (no sample loaded)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a buffer from de-interleaved channel data, applying the load validation.
    /// Sources with more than two channels keep their first two; mono stays mono
    /// and is duplicated to both output channels at read time.
    pub fn from_channels(
        channels: Vec<Vec<f32>>,
        sample_rate: f32,
    ) -> Result<Self, SampleLoadError> {
        if channels.is_empty() || channels[0].is_empty() {
            return Err(SampleLoadError::Empty);
        }
        if channels.len() > MAX_CHANNELS {
            return Err(SampleLoadError::TooManyChannels(channels.len()));
        }
        if sample_rate <= 0.0 || sample_rate > MAX_SAMPLE_RATE_HZ as f32 {
            return Err(SampleLoadError::InvalidSampleRate(sample_rate as u32));
        }
        let frames = channels[0].len();
        if frames > MAX_LENGTH_FRAMES {
            return Err(SampleLoadError::TooLong(frames));
        }

        let kept: Vec<Vec<f32>> = channels.into_iter().take(2).collect();
        // channel lengths must agree; truncate to the shortest
        let min_len = kept.iter().map(|c| c.len()).min().unwrap_or(0);
        if min_len == 0 {
            return Err(SampleLoadError::Empty);
        }
        let kept = kept
            .into_iter()
            .map(|mut c| {
                c.truncate(min_len);
                c
            })
            .collect();

        Ok(Self {
            channels: kept,
            sample_rate,
        })
    }

    /// Load and validate a wav file, converting any integer bit depth to f32.
    /// The whole file is read into a temporary before any conversion, so an error
    /// part way through decoding never produces a partial buffer.
    pub fn from_wav_file(path: impl AsRef<Path>) -> Result<Self, SampleLoadError> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();

        if spec.sample_rate == 0 || spec.sample_rate > MAX_SAMPLE_RATE_HZ {
            return Err(SampleLoadError::InvalidSampleRate(spec.sample_rate));
        }
        if spec.channels as usize > MAX_CHANNELS {
            return Err(SampleLoadError::TooManyChannels(spec.channels as usize));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<f32>, hound::Error>>()?,
            SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<Vec<f32>, hound::Error>>()?
            }
        };

        let num_channels = spec.channels as usize;
        if num_channels == 0 || interleaved.len() < num_channels {
            return Err(SampleLoadError::Empty);
        }

        let frames = interleaved.len() / num_channels;
        let mut channels: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); num_channels];
        for frame in interleaved.chunks_exact(num_channels) {
            for (channel, value) in channels.iter_mut().zip(frame) {
                channel.push(*value);
            }
        }

        Self::from_channels(channels, spec.sample_rate as f32)
    }

    /// Number of frames in the buffer (0 when empty)
    pub fn len_frames(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    /// Number of channels held (1 or 2, or 0 when empty)
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// The source sample rate of the loaded audio
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Boolean function returning whether no sample is loaded
    pub fn is_empty(&self) -> bool {
        self.len_frames() == 0
    }

    /// Borrow one channel's samples. Returns an empty slice for a missing channel
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map_or(&[], |c| c.as_slice())
    }

    /// Read a single sample with the frame index wrapped to the buffer length.
    /// Returns 0 for an empty buffer or out of range channel.
    pub fn read_wrapped(&self, channel: usize, frame: isize) -> f32 {
        let len = self.len_frames() as isize;
        if len == 0 {
            return 0.0;
        }
        let Some(data) = self.channels.get(channel) else {
            return 0.0;
        };
        let wrapped = ((frame % len) + len) % len;
        data[wrapped as usize]
    }

    /// The signed mono value at a frame: the channel average, used for
    /// zero-crossing detection so both channels weigh in.
    pub fn mono_at(&self, frame: usize) -> f32 {
        if self.channels.is_empty() || frame >= self.len_frames() {
            return 0.0;
        }
        let sum: f32 = self.channels.iter().map(|c| c[frame]).sum();
        sum / self.channels.len() as f32
    }

    /// The frame where a uniform column begins: `col * len / 16`
    pub fn uniform_column_start(&self, column: usize) -> f64 {
        let column = column.min(NUM_COLUMNS);
        column as f64 * self.len_frames() as f64 / NUM_COLUMNS as f64
    }

    /// Snap a target frame to the nearest zero crossing within +/- `window` frames.
    ///
    /// Scans the signed mono signal for a sign change; when none exists in the
    /// window, falls back to the frame with the smallest absolute sample, which is
    /// the quietest place to cut.
    pub fn snap_to_zero_crossing(&self, target: f64, window: usize) -> f64 {
        let len = self.len_frames();
        if len < 2 || window == 0 {
            return target;
        }

        let centre = (target.round() as usize).min(len - 1);
        let lo = centre.saturating_sub(window);
        let hi = (centre + window).min(len - 2);

        let mut best_crossing: Option<usize> = None;
        let mut best_distance = usize::MAX;
        let mut quietest = centre;
        let mut quietest_level = self.mono_at(centre).abs();

        for frame in lo..=hi {
            let a = self.mono_at(frame);
            let b = self.mono_at(frame + 1);
            if (a <= 0.0 && b > 0.0) || (a >= 0.0 && b < 0.0) {
                let distance = frame.abs_diff(centre);
                if distance < best_distance {
                    best_distance = distance;
                    best_crossing = Some(frame);
                }
            }
            let level = a.abs();
            if level < quietest_level {
                quietest_level = level;
                quietest = frame;
            }
        }

        match best_crossing {
            Some(frame) => frame as f64,
            None => quietest as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SampleBuffer, SampleLoadError, MAX_CHANNELS};

    fn sine_buffer(frames: usize, period: usize) -> SampleBuffer {
        let data: Vec<f32> = (0..frames)
            .map(|i| (i as f32 / period as f32 * std::f32::consts::TAU).sin())
            .collect();
        SampleBuffer::from_channels(vec![data], 48_000.0).unwrap()
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(
            SampleBuffer::from_channels(vec![], 48_000.0),
            Err(SampleLoadError::Empty)
        ));
        assert!(matches!(
            SampleBuffer::from_channels(vec![vec![]], 48_000.0),
            Err(SampleLoadError::Empty)
        ));
    }

    #[test]
    fn test_bad_sample_rate_rejected() {
        let err = SampleBuffer::from_channels(vec![vec![0.0; 8]], 0.0);
        assert!(matches!(err, Err(SampleLoadError::InvalidSampleRate(_))));
        let err = SampleBuffer::from_channels(vec![vec![0.0; 8]], 500_000.0);
        assert!(matches!(err, Err(SampleLoadError::InvalidSampleRate(_))));
    }

    #[test]
    fn test_too_many_channels_rejected() {
        let channels = vec![vec![0.0_f32; 4]; MAX_CHANNELS + 1];
        assert!(matches!(
            SampleBuffer::from_channels(channels, 48_000.0),
            Err(SampleLoadError::TooManyChannels(_))
        ));
    }

    #[test]
    fn test_multichannel_folds_to_stereo() {
        let channels = vec![vec![0.0_f32; 4]; 6];
        let buffer = SampleBuffer::from_channels(channels, 48_000.0).unwrap();
        assert_eq!(buffer.num_channels(), 2);
    }

    #[test]
    fn test_read_wrapped() {
        let buffer =
            SampleBuffer::from_channels(vec![vec![1.0, 2.0, 3.0, 4.0]], 48_000.0).unwrap();
        assert_eq!(buffer.read_wrapped(0, 0), 1.0);
        assert_eq!(buffer.read_wrapped(0, 5), 2.0);
        assert_eq!(buffer.read_wrapped(0, -1), 4.0);
        // out of range channel reads silence
        assert_eq!(buffer.read_wrapped(3, 0), 0.0);
    }

    #[test]
    fn test_uniform_column_start() {
        let buffer = SampleBuffer::from_channels(vec![vec![0.0; 1600]], 48_000.0).unwrap();
        assert_eq!(buffer.uniform_column_start(0), 0.0);
        assert_eq!(buffer.uniform_column_start(8), 800.0);
        assert_eq!(buffer.uniform_column_start(16), 1600.0);
    }

    #[test]
    fn test_zero_cross_snap_finds_crossing() {
        let buffer = sine_buffer(4800, 480);
        // the sine crosses zero every 240 frames; aim near one and check the snap
        let snapped = buffer.snap_to_zero_crossing(250.0, 34);
        let level = buffer.mono_at(snapped as usize).abs();
        assert!(level < 0.02, "snapped to level {level}");
        assert!((snapped - 240.0).abs() <= 1.0);
    }

    #[test]
    fn test_zero_cross_snap_fallback_quietest() {
        // all-positive signal has no crossing; the snap picks the smallest value
        let data: Vec<f32> = (0..100).map(|i| 1.0 + (i as f32 - 50.0).abs()).collect();
        let buffer = SampleBuffer::from_channels(vec![data], 48_000.0).unwrap();
        let snapped = buffer.snap_to_zero_crossing(40.0, 20);
        assert_eq!(snapped, 50.0);
    }
}
