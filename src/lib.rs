//! A crate containing the real-time engine of a grid-controlled sample slicing
//! instrument and the thin plugin shell around it.
//! GridSamplerPlugin is the plugin, using the NIH-plug framework to build to the
//! VST3 and CLAP formats; it owns an [`engine::Engine`] and forwards the host
//! transport snapshot into it each block.
//! load_wav_float() and write_wav_float() move f32 samples in and out of .wav
//! files for the strips and for the offline render tests.
#![warn(missing_docs)]

pub mod crossfade;
pub mod delay_buffer;
pub mod direction;
pub mod engine;
pub mod filter;
pub mod gate;
pub mod grain;
pub mod interpolators;
pub mod live_record;
pub mod mod_sequencer;
pub mod pattern;
pub mod pitch_shift;
pub mod quantize;
pub mod resample;
pub mod sample_buffer;
pub mod scratch;
pub mod strip;
pub mod transient;

use std::num::NonZeroU32;
use std::sync::Arc;

use hound::{Error, SampleFormat, WavReader, WavSpec, WavWriter};
use nih_plug::prelude::*;

use crate::engine::{Engine, PositionInfo};

/// The struct used for the main plugin.
/// # Attributes
/// * `params`: An Arc containing an instance of `GridSamplerParams`
/// * `engine`: The audio engine holding the strips, scheduler and recorders
/// * `input_left` / `input_right`: Pre-copied input, since the engine reads the
///   live input while writing the same host buffer
struct GridSamplerPlugin {
    params: Arc<GridSamplerParams>,
    engine: Engine,
    input_left: Vec<f32>,
    input_right: Vec<f32>,
}

/// The parameters for the main plugin, returned in an Arc type.
#[derive(Params)]
struct GridSamplerParams {
    /// The master output gain. Stored as linear gain while the values are
    /// displayed in decibels, same treatment as the rest of the parameter tree
    /// the engine exposes through its setters.
    #[id = "gain"]
    pub gain: FloatParam,
}

impl Default for GridSamplerPlugin {
    fn default() -> Self {
        Self {
            params: Arc::new(GridSamplerParams::default()),
            engine: Engine::new(),
            input_left: Vec::new(),
            input_right: Vec::new(),
        }
    }
}

impl Default for GridSamplerParams {
    fn default() -> Self {
        Self {
            // linear gain with dB display needs logarithmic smoothing
            gain: FloatParam::new(
                "Master",
                util::db_to_gain(0.0),
                FloatRange::Skewed {
                    min: util::db_to_gain(-60.0),
                    max: util::db_to_gain(6.0),
                    factor: FloatRange::gain_skew_factor(-60.0, 6.0),
                },
            )
            .with_smoother(SmoothingStyle::Logarithmic(50.0))
            .with_unit(" dB")
            .with_value_to_string(formatters::v2s_f32_gain_to_db(2))
            .with_string_to_value(formatters::s2v_f32_gain_to_db()),
        }
    }
}

impl Plugin for GridSamplerPlugin {
    const NAME: &'static str = "Grid Sampler";
    const VENDOR: &'static str = "Grid Sampler";
    const URL: &'static str = env!("CARGO_PKG_HOMEPAGE");
    const EMAIL: &'static str = "info@example.com";

    const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    const AUDIO_IO_LAYOUTS: &'static [AudioIOLayout] = &[AudioIOLayout {
        main_input_channels: NonZeroU32::new(2),
        main_output_channels: NonZeroU32::new(2),

        ..AudioIOLayout::const_default()
    }];

    const MIDI_INPUT: MidiConfig = MidiConfig::None;
    const MIDI_OUTPUT: MidiConfig = MidiConfig::None;
    const SAMPLE_ACCURATE_AUTOMATION: bool = true;

    type SysExMessage = ();
    type BackgroundTask = ();

    fn params(&self) -> Arc<dyn Params> {
        self.params.clone()
    }

    fn initialize(
        &mut self,
        _audio_io_layout: &AudioIOLayout,
        buffer_config: &BufferConfig,
        _context: &mut impl InitContext<Self>,
    ) -> bool {
        let max_block = buffer_config.max_buffer_size as usize;
        self.engine
            .prepare_to_play(buffer_config.sample_rate as f64, max_block);
        self.input_left = vec![0.0; max_block];
        self.input_right = vec![0.0; max_block];
        true
    }

    fn reset(&mut self) {
        // called from the audio thread; stopping strips does not allocate
        self.engine.stop_all_strips();
    }

    fn process(
        &mut self,
        buffer: &mut Buffer,
        _aux: &mut AuxiliaryBuffers,
        context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        let transport = context.transport();
        let position = PositionInfo {
            is_playing: transport.playing,
            ppq: transport.pos_beats(),
            tempo: transport.tempo,
            time_signature: transport
                .time_sig_numerator
                .zip(transport.time_sig_denominator),
        };

        self.engine
            .set_master_volume(self.params.gain.smoothed.next());

        let frames = buffer.samples();
        let channel_slices = buffer.as_slice();
        if channel_slices.len() < 2 || frames > self.input_left.len() {
            return ProcessStatus::Normal;
        }

        // the engine reads the live input while writing the same host buffer, so
        // the input is copied out first
        self.input_left[..frames].copy_from_slice(&channel_slices[0][..frames]);
        self.input_right[..frames].copy_from_slice(&channel_slices[1][..frames]);

        let (left, rest) = channel_slices.split_at_mut(1);
        self.engine.process(
            &self.input_left[..frames],
            &self.input_right[..frames],
            &mut left[0][..frames],
            &mut rest[0][..frames],
            &position,
        );

        ProcessStatus::Normal
    }
}

impl ClapPlugin for GridSamplerPlugin {
    const CLAP_ID: &'static str = "com.example.grid-sampler";
    const CLAP_DESCRIPTION: Option<&'static str> =
        Some("Real-time engine of a grid-controlled sample slicing instrument");
    const CLAP_MANUAL_URL: Option<&'static str> = Some(Self::URL);
    const CLAP_SUPPORT_URL: Option<&'static str> = None;

    const CLAP_FEATURES: &'static [ClapFeature] =
        &[ClapFeature::Instrument, ClapFeature::Sampler, ClapFeature::Stereo];
}

impl Vst3Plugin for GridSamplerPlugin {
    const VST3_CLASS_ID: [u8; 16] = *b"GridSamplerEngin";

    const VST3_SUBCATEGORIES: &'static [Vst3SubCategory] =
        &[Vst3SubCategory::Instrument, Vst3SubCategory::InstrumentSampler];
}

/// loads a wav file from string path and returns a result type possibly containing
/// a vector of float samples (interleaved as stored in the file)
/// # Returns
/// * A result type containing either a vector of f32 samples or a hound error
/// # Parameters
/// * `path`: A string containing the relative path to the file to be loaded (must
///   include .wav file extension)
pub fn load_wav_float(path: &str) -> Result<Vec<f32>, Error> {
    let mut reader = WavReader::open(path)?;
    let mut samples: Vec<f32> = vec![];

    for sample in reader.samples::<f32>() {
        match sample {
            Ok(s) => samples.push(s),
            Err(e) => return Err(e),
        };
    }

    Ok(samples)
}

/// writes to a wav file at string path from float samples
/// # Parameters
/// * `path`: A string containing the relative path to the file to be written to
///   (must include .wav file extension)
/// * `samples`: A vector of f32 samples which will be written to the file
/// * `channels`: 1 for mono, 2 for interleaved stereo
pub fn write_wav_float(path: &str, samples: &[f32], channels: u16) -> Result<(), Error> {
    let spec = WavSpec {
        channels,
        sample_rate: 44100,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()
}

nih_export_vst3!(GridSamplerPlugin);
nih_export_clap!(GridSamplerPlugin);

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, PositionInfo};
    use crate::sample_buffer::SampleBuffer;
    use crate::{load_wav_float, write_wav_float};

    #[test]
    fn wav_float_roundtrip() {
        let mut path = std::env::temp_dir();
        path.push("grid_sampler_roundtrip.wav");
        let path = path.to_str().unwrap().to_owned();

        let samples: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.031).sin() * 0.5).collect();
        write_wav_float(&path, &samples, 1).unwrap();
        let loaded = load_wav_float(&path).unwrap();

        assert_eq!(loaded.len(), samples.len());
        for (a, b) in samples.iter().zip(loaded.iter()) {
            assert_eq!(a, b);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wav_file_loads_incorrectly() {
        assert!(load_wav_float("doesnt/exist.wav").is_err());
    }

    #[test]
    #[ignore]
    // Renders a few bars of a triggered strip to a wav file for listening, not a
    // real assertion test
    fn render_engine_demo() {
        let mut engine = Engine::new();
        engine.prepare_to_play(48_000.0, 1_024);

        let data: Vec<f32> = (0..96_000)
            .map(|i| (std::f32::consts::TAU * 220.0 * i as f32 / 48_000.0).sin() * 0.5)
            .collect();
        engine
            .strip(0)
            .set_sample(SampleBuffer::from_channels(vec![data], 48_000.0).unwrap());
        engine.trigger_strip_with_quantization(0, 0, false);

        let mut interleaved = Vec::new();
        let mut ppq = 0.0;
        for _ in 0..400 {
            let mut left = vec![0.0_f32; 1_024];
            let mut right = vec![0.0_f32; 1_024];
            let position = PositionInfo {
                is_playing: true,
                ppq: Some(ppq),
                tempo: Some(120.0),
                time_signature: Some((4, 4)),
            };
            engine.process(&[], &[], &mut left, &mut right, &position);
            for (l, r) in left.iter().zip(right.iter()) {
                interleaved.push(*l);
                interleaved.push(*r);
            }
            ppq += 1_024.0 * 2.0 / 48_000.0;
        }

        write_wav_float("tests/debug/engine_demo.wav", &interleaved, 2).unwrap();
    }
}
