//! The per-strip playback kernel.
//!
//! A strip pairs one sample buffer with everything needed to perform it from a grid
//! row: sample-accurate triggering with click-free blends, a playback position that
//! is a pure function of the host timeline while anchored, direction modes, an
//! inner loop with equal-power seam crossfade, scratch ramps on press and release,
//! a step sequencer, the grain engine, a state variable filter and tempo-locked
//! gate modulation.
//!
//! Threading follows one rule: everything the control thread may touch is an atomic
//! cell, the sample buffer and filter settings live behind the strip lock (taken
//! once per process call and by loaders), and the remaining playback state belongs
//! to the audio thread alone.
#![allow(dead_code)]

use atomic_float::{AtomicF32, AtomicF64};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::crossfade::Crossfader;
use crate::direction::{DirectionMode, DirectionState};
use crate::filter::{FilterType, StateVariableFilter, SvfCoefficients};
use crate::gate::{apply_swing, gate_gain, GateShape};
use crate::grain::{
    ArpMode, GrainGesture, GrainParams, GrainRenderContext, GrainVoicePool,
};
use crate::pitch_shift::PitchShifter;
use crate::resample::ResampleQuality;
use crate::sample_buffer::{SampleBuffer, NUM_COLUMNS};
use crate::scratch::{seconds_from_amount, ScratchProfile, ScratchRamp};
use crate::transient::compute_slice_map;

/// Zero-crossing search window for trigger targets, in seconds (0.7 ms)
const ZERO_CROSS_WINDOW_SECONDS: f64 = 0.0007;

/// Time constant of the volume / pan / speed smoothers, in seconds
const PARAM_SMOOTHING_SECONDS: f64 = 0.05;

/// Speed deviation beyond which the PPQ anchor is suspended
const ANCHOR_SPEED_EPSILON: f32 = 1e-3;

/// Steps in the step-mode pattern (four bars of sixteenths)
pub const STEP_PATTERN_LENGTH: usize = 64;

/// How a strip responds to a trigger and to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    /// Play from the column to the loop end, then stop
    OneShot,
    /// Loop between the loop columns, phase locked to the host
    #[default]
    Loop,
    /// Like Loop, but only sounds while the button is held
    Gate,
    /// The step pattern retriggers columns on a sixteenth grid
    Step,
    /// The grain engine renders instead of the linear read
    Grain,
}

impl PlayMode {
    /// Map a stored parameter index back to a play mode
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => PlayMode::OneShot,
            2 => PlayMode::Gate,
            3 => PlayMode::Step,
            4 => PlayMode::Grain,
            _ => PlayMode::Loop,
        }
    }

    /// The parameter index for this play mode
    pub fn to_index(self) -> u32 {
        match self {
            PlayMode::OneShot => 0,
            PlayMode::Loop => 1,
            PlayMode::Gate => 2,
            PlayMode::Step => 3,
            PlayMode::Grain => 4,
        }
    }
}

/// Host position snapshot a strip renders against, per segment
#[derive(Debug, Clone, Copy)]
pub struct StripRenderContext {
    /// Engine sample rate in Hz
    pub sample_rate: f64,
    /// Host tempo in BPM
    pub tempo: f64,
    /// Host PPQ at the first sample of the segment
    pub ppq: f64,
    /// Absolute engine sample of the first sample of the segment
    pub global_sample: i64,
    /// Whether the host transport is rolling
    pub host_playing: bool,
    /// Whether `ppq` is real host position (false means free-running fallback)
    pub ppq_valid: bool,
    /// Grid spacing in beats, for the random direction modes
    pub quant_beats: f64,
}

/// State shared with the control thread under the strip lock:
/// the sample itself plus the non-atomic filter settings.
struct StripShared {
    sample: SampleBuffer,
    slice_map: [usize; NUM_COLUMNS],
    filter_cutoff_hz: f32,
    filter_resonance: f32,
}

/// Audio-thread-only playback state
struct Kernel {
    // trigger anchor
    trigger_offset_ratio: f64,
    trigger_ppq: f64,
    trigger_sample_global: i64,
    samples_elapsed: f64,
    // smoothed parameters
    smoothed_volume: f32,
    smoothed_pan: f32,
    smoothed_speed: f32,
    smoothing_coefficient: f32,
    // retrigger blends
    blend_old_position: f64,
    blend_remaining: u32,
    blend_total: u32,
    output_blend: Crossfader,
    held_output: (f32, f32),
    // stopping fade
    stop_fade: Crossfader,
    stopping: bool,
    // scratch
    scratch: ScratchRamp,
    scratch_forward: bool,
    tape_stop: bool,
    frozen_position: f64,
    // step mode
    last_step_index: i64,
    // anchor suspension bookkeeping
    anchor_suspended: bool,
    // last seen transport, for the legacy free trigger
    last_tempo: f64,
    last_ppq: f64,
    last_global_sample: i64,
    sample_rate: f64,
    last_rendered: (f32, f32),
    // processors
    direction: DirectionState,
    filters: [StateVariableFilter; 2],
    filter_coefficients: SvfCoefficients,
    pitch_shifter: PitchShifter,
    grain_pool: GrainVoicePool,
    gesture: GrainGesture,
}

/// One strip of the instrument
pub struct Strip {
    index: usize,
    shared: Mutex<StripShared>,
    kernel: Kernel,

    // transport-facing state
    playing: AtomicBool,
    ppq_anchored: AtomicBool,
    ppq_offset_beats: AtomicF64,
    playback_position: AtomicF64,
    current_column: AtomicI32,
    display_speed: AtomicF32,
    button_held: AtomicBool,
    held_button: AtomicI32,

    // control parameters
    volume: AtomicF32,
    pan: AtomicF32,
    playback_speed: AtomicF32,
    pitch_shift_semitones: AtomicF32,
    scratch_amount: AtomicF32,
    swing_amount: AtomicF32,
    swing_division: AtomicU32,
    gate_amount: AtomicF32,
    gate_speed: AtomicF32,
    gate_envelope: AtomicF32,
    gate_shape: AtomicU32,
    play_mode: AtomicU32,
    direction_mode: AtomicU32,
    loop_start_col: AtomicI32,
    loop_end_col: AtomicI32,
    beats_per_loop: AtomicF64,
    transient_slice_mode: AtomicBool,
    filter_enabled: AtomicBool,
    filter_type: AtomicU32,
    resample_quality: AtomicU32,
    crossfade_ms: AtomicF32,
    trigger_fade_ms: AtomicF32,

    // grain parameters
    grain_size_ms: AtomicF32,
    grain_density: AtomicF32,
    grain_pitch: AtomicF32,
    grain_pitch_jitter: AtomicF32,
    grain_spread: AtomicF32,
    grain_jitter: AtomicF32,
    grain_random: AtomicF32,
    grain_arp_mode: AtomicU32,
    grain_arp_amount: AtomicF32,
    grain_arp_bipolar: AtomicBool,
    grain_cloud: AtomicF32,
    grain_emitter: AtomicF32,
    grain_envelope: AtomicF32,
    grain_reverse: AtomicBool,
    grain_sync_size: AtomicBool,

    // step pattern
    step_pattern: [AtomicBool; STEP_PATTERN_LENGTH],
    step_bars: AtomicU32,
    step_view_page: AtomicU32,
    step_current: AtomicI32,
}

impl Strip {
    /// Constructor; the strip is silent until a sample is installed
    pub fn new(index: usize) -> Self {
        Self {
            index,
            shared: Mutex::new(StripShared {
                sample: SampleBuffer::empty(),
                slice_map: [0; NUM_COLUMNS],
                filter_cutoff_hz: 18_000.0,
                filter_resonance: 0.707,
            }),
            kernel: Kernel {
                trigger_offset_ratio: 0.0,
                trigger_ppq: 0.0,
                trigger_sample_global: 0,
                samples_elapsed: 0.0,
                smoothed_volume: 0.8,
                smoothed_pan: 0.0,
                smoothed_speed: 1.0,
                smoothing_coefficient: 0.0,
                blend_old_position: 0.0,
                blend_remaining: 0,
                blend_total: 0,
                output_blend: Crossfader::new(),
                held_output: (0.0, 0.0),
                stop_fade: Crossfader::new(),
                stopping: false,
                scratch: ScratchRamp::new(),
                scratch_forward: false,
                tape_stop: false,
                frozen_position: 0.0,
                last_step_index: i64::MIN,
                anchor_suspended: false,
                last_tempo: 120.0,
                last_ppq: 0.0,
                last_global_sample: 0,
                sample_rate: 44_100.0,
                last_rendered: (0.0, 0.0),
                direction: DirectionState::new(index),
                filters: [
                    StateVariableFilter::new(18_000.0, 0.707, 44_100.0),
                    StateVariableFilter::new(18_000.0, 0.707, 44_100.0),
                ],
                filter_coefficients: SvfCoefficients::new(18_000.0, 0.707, 44_100.0),
                pitch_shifter: PitchShifter::new(),
                grain_pool: GrainVoicePool::new(index as u64 + 1),
                gesture: GrainGesture::new(),
            },
            playing: AtomicBool::new(false),
            ppq_anchored: AtomicBool::new(false),
            ppq_offset_beats: AtomicF64::new(0.0),
            playback_position: AtomicF64::new(0.0),
            current_column: AtomicI32::new(0),
            display_speed: AtomicF32::new(0.0),
            button_held: AtomicBool::new(false),
            held_button: AtomicI32::new(-1),
            volume: AtomicF32::new(0.8),
            pan: AtomicF32::new(0.0),
            playback_speed: AtomicF32::new(1.0),
            pitch_shift_semitones: AtomicF32::new(0.0),
            scratch_amount: AtomicF32::new(0.0),
            swing_amount: AtomicF32::new(0.0),
            swing_division: AtomicU32::new(2),
            gate_amount: AtomicF32::new(0.0),
            gate_speed: AtomicF32::new(1.0),
            gate_envelope: AtomicF32::new(0.5),
            gate_shape: AtomicU32::new(0),
            play_mode: AtomicU32::new(PlayMode::Loop.to_index()),
            direction_mode: AtomicU32::new(0),
            loop_start_col: AtomicI32::new(0),
            loop_end_col: AtomicI32::new(NUM_COLUMNS as i32),
            beats_per_loop: AtomicF64::new(-1.0),
            transient_slice_mode: AtomicBool::new(false),
            filter_enabled: AtomicBool::new(false),
            filter_type: AtomicU32::new(0),
            resample_quality: AtomicU32::new(ResampleQuality::Sinc16.to_index()),
            crossfade_ms: AtomicF32::new(10.0),
            trigger_fade_ms: AtomicF32::new(5.0),
            grain_size_ms: AtomicF32::new(250.0),
            grain_density: AtomicF32::new(0.35),
            grain_pitch: AtomicF32::new(0.0),
            grain_pitch_jitter: AtomicF32::new(0.0),
            grain_spread: AtomicF32::new(0.0),
            grain_jitter: AtomicF32::new(0.0),
            grain_random: AtomicF32::new(0.0),
            grain_arp_mode: AtomicU32::new(0),
            grain_arp_amount: AtomicF32::new(0.0),
            grain_arp_bipolar: AtomicBool::new(false),
            grain_cloud: AtomicF32::new(0.0),
            grain_emitter: AtomicF32::new(0.0),
            grain_envelope: AtomicF32::new(0.0),
            grain_reverse: AtomicBool::new(false),
            grain_sync_size: AtomicBool::new(false),
            step_pattern: std::array::from_fn(|_| AtomicBool::new(false)),
            step_bars: AtomicU32::new(1),
            step_view_page: AtomicU32::new(0),
            step_current: AtomicI32::new(0),
        }
    }

    /// Allocate rate-dependent state. Called once before audio runs.
    pub fn prepare_to_play(&mut self, sample_rate: f64) {
        self.kernel.sample_rate = sample_rate;
        self.kernel.smoothing_coefficient =
            (-1.0 / (PARAM_SMOOTHING_SECONDS * sample_rate)).exp() as f32;
        self.kernel.pitch_shifter.prepare(sample_rate as f32);
        self.kernel.grain_pool.prepare(sample_rate);
        let shared = self.shared.lock();
        self.kernel.filter_coefficients = SvfCoefficients::new(
            shared.filter_cutoff_hz,
            shared.filter_resonance,
            sample_rate as f32,
        );
    }

    // ----- sample management (control thread) -----

    /// Install a validated sample buffer, replacing whatever is loaded.
    /// The slice map recomputes when transient slice mode is on.
    pub fn set_sample(&self, sample: SampleBuffer) {
        let slice_map = if self.transient_slice_mode.load(Ordering::Acquire) {
            compute_slice_map(&sample)
        } else {
            let frames = sample.len_frames();
            std::array::from_fn(|i| i * frames / NUM_COLUMNS)
        };
        let mut shared = self.shared.lock();
        shared.sample = sample;
        shared.slice_map = slice_map;
        drop(shared);
        self.playing.store(false, Ordering::Release);
        self.playback_position.store(0.0, Ordering::Release);
    }

    /// Load a wav file into the strip. The strip is only touched after the whole
    /// file has been read and validated.
    pub fn load_sample_from_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), crate::sample_buffer::SampleLoadError> {
        let sample = SampleBuffer::from_wav_file(path)?;
        self.set_sample(sample);
        Ok(())
    }

    /// Remove the loaded sample
    pub fn clear_sample(&self) {
        self.set_sample(SampleBuffer::empty());
        self.playing.store(false, Ordering::Release);
    }

    /// Whether a sample is loaded
    pub fn has_sample(&self) -> bool {
        !self.shared.lock().sample.is_empty()
    }

    /// Frames in the loaded sample (0 when empty)
    pub fn sample_length_frames(&self) -> usize {
        self.shared.lock().sample.len_frames()
    }

    /// Toggle transient slice mode; switching it on recomputes the map for the
    /// loaded sample so the map can never be stale for the buffer under it.
    pub fn set_transient_slice_mode(&self, enabled: bool) {
        self.transient_slice_mode.store(enabled, Ordering::Release);
        let mut shared = self.shared.lock();
        if enabled {
            shared.slice_map = compute_slice_map(&shared.sample);
        } else {
            let frames = shared.sample.len_frames();
            shared.slice_map = std::array::from_fn(|i| i * frames / NUM_COLUMNS);
        }
    }

    // ----- parameter setters (control thread, atomic) -----

    /// Setter for strip volume, 0..1
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for stereo position, -1..1
    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan.clamp(-1.0, 1.0), Ordering::Release);
    }

    /// Setter for playback speed; unity keeps the PPQ anchor engaged
    pub fn set_playback_speed(&self, speed: f32) {
        self.playback_speed
            .store(speed.clamp(0.125, 4.0), Ordering::Release);
    }

    /// Setter for the output pitch shift in semitones
    pub fn set_pitch_shift(&self, semitones: f32) {
        self.pitch_shift_semitones
            .store(semitones.clamp(-24.0, 24.0), Ordering::Release);
    }

    /// Setter for the scratch amount percentage, 0..100
    pub fn set_scratch_amount(&self, percent: f32) {
        self.scratch_amount
            .store(percent.clamp(0.0, 100.0), Ordering::Release);
    }

    /// Setter for swing depth, 0..1
    pub fn set_swing_amount(&self, amount: f32) {
        self.swing_amount
            .store(amount.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the swing subdivision (per beat)
    pub fn set_swing_division(&self, division: u32) {
        self.swing_division
            .store(division.clamp(1, 8), Ordering::Release);
    }

    /// Setter for gate depth, 0..1
    pub fn set_gate_amount(&self, amount: f32) {
        self.gate_amount
            .store(amount.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for gate rate in cycles per beat
    pub fn set_gate_speed(&self, speed: f32) {
        self.gate_speed.store(speed.clamp(0.25, 16.0), Ordering::Release);
    }

    /// Setter for the gate envelope morph, 0..1
    pub fn set_gate_envelope(&self, envelope: f32) {
        self.gate_envelope
            .store(envelope.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the gate waveform
    pub fn set_gate_shape(&self, shape: GateShape) {
        self.gate_shape.store(shape as u32, Ordering::Release);
    }

    /// Setter for the play mode
    pub fn set_play_mode(&self, mode: PlayMode) {
        self.play_mode.store(mode.to_index(), Ordering::Release);
    }

    /// Getter for the play mode
    pub fn play_mode(&self) -> PlayMode {
        PlayMode::from_index(self.play_mode.load(Ordering::Acquire))
    }

    /// Setter for the direction mode
    pub fn set_direction_mode(&self, mode: DirectionMode) {
        self.direction_mode.store(mode as u32, Ordering::Release);
    }

    /// Set the inner loop columns; the pair is sanitized so start < end
    pub fn set_loop_columns(&self, start: i32, end: i32) {
        let start = start.clamp(0, NUM_COLUMNS as i32 - 1);
        let end = end.clamp(start + 1, NUM_COLUMNS as i32);
        self.loop_start_col.store(start, Ordering::Release);
        self.loop_end_col.store(end, Ordering::Release);
    }

    /// Getter for the inner loop columns
    pub fn loop_columns(&self) -> (i32, i32) {
        (
            self.loop_start_col.load(Ordering::Acquire),
            self.loop_end_col.load(Ordering::Acquire),
        )
    }

    /// Setter for the loop's musical length in beats; -1 selects the 4-beat auto
    pub fn set_beats_per_loop(&self, beats: f64) {
        let beats = if beats <= 0.0 { -1.0 } else { beats };
        self.beats_per_loop.store(beats, Ordering::Release);
    }

    /// The effective musical loop length: the stored value, or 4 beats for auto
    pub fn beats_for_loop(&self) -> f64 {
        let beats = self.beats_per_loop.load(Ordering::Acquire);
        if beats <= 0.0 {
            4.0
        } else {
            beats
        }
    }

    /// Change the loop's musical length while preserving the audible phase.
    ///
    /// The PPQ offset is re-solved so the normalized loop phase at `host_ppq` is
    /// identical before and after the change.
    pub fn set_beats_per_loop_at_ppq(&self, new_beats: f64, host_ppq: f64) {
        let new_beats = if new_beats <= 0.0 { 4.0 } else { new_beats };
        let old_beats = self.beats_for_loop();
        let old_offset = self.ppq_offset_beats.load(Ordering::Acquire);
        let phase = ((host_ppq + old_offset).rem_euclid(old_beats)) / old_beats;
        let new_offset = (phase * new_beats - host_ppq).rem_euclid(new_beats);
        self.beats_per_loop.store(new_beats, Ordering::Release);
        self.ppq_offset_beats.store(new_offset, Ordering::Release);
    }

    /// Setter for filter cutoff and resonance (under the strip lock)
    pub fn set_filter(&self, cutoff_hz: f32, resonance: f32) {
        let mut shared = self.shared.lock();
        shared.filter_cutoff_hz = cutoff_hz.clamp(20.0, 20_000.0);
        shared.filter_resonance = resonance.clamp(0.1, 20.0);
    }

    /// Enable or disable the filter
    pub fn set_filter_enabled(&self, enabled: bool) {
        self.filter_enabled.store(enabled, Ordering::Release);
    }

    /// Setter for the filter output type
    pub fn set_filter_type(&self, filter_type: FilterType) {
        self.filter_type.store(filter_type as u32, Ordering::Release);
    }

    /// Setter for the main read interpolation quality
    pub fn set_resample_quality(&self, quality: ResampleQuality) {
        self.resample_quality
            .store(quality.to_index(), Ordering::Release);
    }

    /// Setter for the grain voice interpolation quality
    pub fn set_grain_quality(&mut self, quality: ResampleQuality) {
        self.kernel.grain_pool.set_quality(quality);
    }

    /// Setter for the inner loop crossfade length in milliseconds
    pub fn set_crossfade_ms(&self, milliseconds: f32) {
        self.crossfade_ms
            .store(milliseconds.clamp(0.0, 100.0), Ordering::Release);
    }

    /// Setter for the retrigger blend length in milliseconds
    pub fn set_trigger_fade_ms(&self, milliseconds: f32) {
        self.trigger_fade_ms
            .store(milliseconds.clamp(0.0, 100.0), Ordering::Release);
    }

    /// Setter for the pitch shifter smoothing time in milliseconds
    pub fn set_pitch_smoothing_ms(&mut self, milliseconds: f32) {
        self.kernel.pitch_shifter.set_smoothing_ms(milliseconds);
    }

    // grain parameter setters

    /// Setter for the nominal grain size in milliseconds
    pub fn set_grain_size_ms(&self, size: f32) {
        self.grain_size_ms.store(size.clamp(10.0, 2400.0), Ordering::Release);
    }

    /// Setter for grain density, 0..1
    pub fn set_grain_density(&self, density: f32) {
        self.grain_density
            .store(density.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for grain pitch offset in semitones
    pub fn set_grain_pitch(&self, semitones: f32) {
        self.grain_pitch
            .store(semitones.clamp(-24.0, 24.0), Ordering::Release);
    }

    /// Setter for grain pitch jitter in semitones
    pub fn set_grain_pitch_jitter(&self, semitones: f32) {
        self.grain_pitch_jitter
            .store(semitones.clamp(0.0, 24.0), Ordering::Release);
    }

    /// Setter for grain spread, 0..1
    pub fn set_grain_spread(&self, spread: f32) {
        self.grain_spread
            .store(spread.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for grain size jitter, 0..1
    pub fn set_grain_jitter(&self, jitter: f32) {
        self.grain_jitter
            .store(jitter.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for grain position scatter, 0..1
    pub fn set_grain_random(&self, random: f32) {
        self.grain_random
            .store(random.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the grain arp mode
    pub fn set_grain_arp_mode(&self, mode: ArpMode) {
        self.grain_arp_mode.store(mode as u32, Ordering::Release);
    }

    /// Setter for the grain arp amount, 0..1
    pub fn set_grain_arp_amount(&self, amount: f32) {
        self.grain_arp_amount
            .store(amount.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the extra bipolar arp pitch
    pub fn set_grain_arp_bipolar(&self, enabled: bool) {
        self.grain_arp_bipolar.store(enabled, Ordering::Release);
    }

    /// Setter for the cloud delay depth, 0..1
    pub fn set_grain_cloud(&self, cloud: f32) {
        self.grain_cloud
            .store(cloud.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the emitter drive, 0..1
    pub fn set_grain_emitter(&self, emitter: f32) {
        self.grain_emitter
            .store(emitter.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the grain envelope shaping, 0..1
    pub fn set_grain_envelope(&self, envelope: f32) {
        self.grain_envelope
            .store(envelope.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for reversed grain playback
    pub fn set_grain_reverse(&self, reverse: bool) {
        self.grain_reverse.store(reverse, Ordering::Release);
    }

    /// Setter for tempo-synced grain size
    pub fn set_grain_sync_size(&self, enabled: bool) {
        self.grain_sync_size.store(enabled, Ordering::Release);
    }

    // step pattern

    /// Set one step of the step-mode pattern
    pub fn set_step(&self, index: usize, on: bool) {
        if let Some(step) = self.step_pattern.get(index) {
            step.store(on, Ordering::Release);
        }
    }

    /// Getter for one step of the step-mode pattern
    pub fn step(&self, index: usize) -> bool {
        self.step_pattern
            .get(index)
            .map_or(false, |s| s.load(Ordering::Acquire))
    }

    /// Setter for the pattern length in bars, 1..4
    pub fn set_step_bars(&self, bars: u32) {
        self.step_bars.store(bars.clamp(1, 4), Ordering::Release);
    }

    /// Setter for the page of the pattern shown on the grid
    pub fn set_step_view_page(&self, page: u32) {
        self.step_view_page.store(page.min(3), Ordering::Release);
    }

    /// The step the pattern is currently on
    pub fn current_step(&self) -> i32 {
        self.step_current.load(Ordering::Acquire)
    }

    // ----- telemetry -----

    /// Whether the strip is sounding
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// The audible read head in frames
    pub fn playback_position(&self) -> f64 {
        self.playback_position.load(Ordering::Acquire)
    }

    /// The column the read head is inside, 0..15
    pub fn current_column(&self) -> i32 {
        self.current_column.load(Ordering::Acquire)
    }

    /// One bit per column for the grid LEDs: the playhead column while playing
    pub fn led_mask(&self) -> u16 {
        if !self.is_playing() {
            return 0;
        }
        1u16 << self.current_column().clamp(0, 15) as u16
    }

    /// The effective playback rate including scratch, for display
    pub fn display_speed(&self) -> f32 {
        self.display_speed.load(Ordering::Acquire)
    }

    /// Normalized grain read positions for the grid preview
    pub fn grain_preview(&self) -> [f32; 8] {
        let length = self.shared.lock().sample.len_frames() as f64;
        self.kernel.grain_pool.preview_positions(length)
    }

    /// Number of sounding grain voices
    pub fn active_grain_voices(&self) -> usize {
        self.kernel.grain_pool.active_voice_count()
    }

    // ----- modulation hooks (engine, audio thread) -----

    /// Snapshot the value a modulation target would overwrite
    pub fn mod_snapshot(&self, target: crate::mod_sequencer::ModTarget) -> f32 {
        use crate::mod_sequencer::ModTarget::*;
        match target {
            None => 0.0,
            Volume => self.volume.load(Ordering::Acquire),
            Pan => self.pan.load(Ordering::Acquire),
            Pitch => self.pitch_shift_semitones.load(Ordering::Acquire),
            Speed => self.playback_speed.load(Ordering::Acquire),
            Cutoff => self.shared.lock().filter_cutoff_hz,
            Resonance => self.shared.lock().filter_resonance,
            GrainSize => self.grain_size_ms.load(Ordering::Acquire),
            GrainDensity => self.grain_density.load(Ordering::Acquire),
            GrainPitch => self.grain_pitch.load(Ordering::Acquire),
            GrainPitchJitter => self.grain_pitch_jitter.load(Ordering::Acquire),
            GrainSpread => self.grain_spread.load(Ordering::Acquire),
            GrainJitter => self.grain_jitter.load(Ordering::Acquire),
            GrainRandom => self.grain_random.load(Ordering::Acquire),
            GrainArp => self.grain_arp_amount.load(Ordering::Acquire),
            GrainCloud => self.grain_cloud.load(Ordering::Acquire),
            GrainEmitter => self.grain_emitter.load(Ordering::Acquire),
            GrainEnvelope => self.grain_envelope.load(Ordering::Acquire),
        }
    }

    /// Apply a modulation value on top of a snapshot, with the per-target scale
    pub fn apply_modulation(
        &self,
        target: crate::mod_sequencer::ModTarget,
        snapshot: f32,
        value: f32,
    ) {
        use crate::mod_sequencer::ModTarget::*;
        match target {
            None => {}
            Volume => self.set_volume(snapshot + value),
            Pan => self.set_pan(snapshot + value),
            Pitch => self.set_pitch_shift(snapshot + value * 12.0),
            Speed => self.set_playback_speed(snapshot * 2.0_f32.powf(value)),
            Cutoff => {
                let resonance = self.shared.lock().filter_resonance;
                self.set_filter(snapshot * 2.0_f32.powf(2.5 * value), resonance);
            }
            Resonance => {
                let cutoff = self.shared.lock().filter_cutoff_hz;
                self.set_filter(cutoff, snapshot + value * 6.0);
            }
            GrainSize => self.set_grain_size_ms(snapshot + value * 600.0),
            GrainDensity => self.set_grain_density(snapshot + value),
            GrainPitch => self.set_grain_pitch(snapshot + value * 12.0),
            GrainPitchJitter => self.set_grain_pitch_jitter(snapshot + value * 12.0),
            GrainSpread => self.set_grain_spread(snapshot + value),
            GrainJitter => self.set_grain_jitter(snapshot + value),
            GrainRandom => self.set_grain_random(snapshot + value),
            GrainArp => self.set_grain_arp_amount(snapshot + value),
            GrainCloud => self.set_grain_cloud(snapshot + value),
            GrainEmitter => self.set_grain_emitter(snapshot + value),
            GrainEnvelope => self.set_grain_envelope(snapshot + value),
        }
    }

    /// Restore a snapshot taken by `mod_snapshot`
    pub fn restore_modulation(&self, target: crate::mod_sequencer::ModTarget, snapshot: f32) {
        use crate::mod_sequencer::ModTarget::*;
        match target {
            None => {}
            Cutoff => {
                let resonance = self.shared.lock().filter_resonance;
                self.set_filter(snapshot, resonance);
            }
            Resonance => {
                let cutoff = self.shared.lock().filter_cutoff_hz;
                self.set_filter(cutoff, snapshot);
            }
            Volume => self.volume.store(snapshot, Ordering::Release),
            Pan => self.pan.store(snapshot, Ordering::Release),
            Pitch => self.pitch_shift_semitones.store(snapshot, Ordering::Release),
            Speed => self.playback_speed.store(snapshot, Ordering::Release),
            GrainSize => self.grain_size_ms.store(snapshot, Ordering::Release),
            GrainDensity => self.grain_density.store(snapshot, Ordering::Release),
            GrainPitch => self.grain_pitch.store(snapshot, Ordering::Release),
            GrainPitchJitter => self.grain_pitch_jitter.store(snapshot, Ordering::Release),
            GrainSpread => self.grain_spread.store(snapshot, Ordering::Release),
            GrainJitter => self.grain_jitter.store(snapshot, Ordering::Release),
            GrainRandom => self.grain_random.store(snapshot, Ordering::Release),
            GrainArp => self.grain_arp_amount.store(snapshot, Ordering::Release),
            GrainCloud => self.grain_cloud.store(snapshot, Ordering::Release),
            GrainEmitter => self.grain_emitter.store(snapshot, Ordering::Release),
            GrainEnvelope => self.grain_envelope.store(snapshot, Ordering::Release),
        }
    }

    // ----- triggering (audio thread) -----

    /// Sample-accurate trigger: jump playback to `column` with the trigger
    /// reference anchored at (`global_sample`, `ppq`).
    ///
    /// For looping modes this builds the timeline anchor that makes position a
    /// pure function of host PPQ. A press on a held column with scratch engaged
    /// starts a forward scratch ramp instead of jumping.
    pub fn trigger_at_sample(
        &mut self,
        column: i32,
        tempo: f64,
        global_sample: i64,
        ppq: f64,
        ppq_valid: bool,
    ) {
        let shared = self.shared.lock();
        if shared.sample.is_empty() {
            return;
        }

        let sample_length = shared.sample.len_frames() as f64;
        let transient_mode = self.transient_slice_mode.load(Ordering::Acquire);
        let zero_cross_window =
            ((ZERO_CROSS_WINDOW_SECONDS * self.kernel.sample_rate) as usize).max(1);
        let target = column_target_frames(&shared, column, transient_mode, zero_cross_window);
        let (loop_start, loop_length) = self.loop_bounds(sample_length);
        let beats_for_loop = self.beats_for_loop();
        let play_mode = self.play_mode();
        let kernel = &mut self.kernel;

        let was_playing = self.playing.load(Ordering::Acquire);
        let scratch_amount = self.scratch_amount.load(Ordering::Acquire);
        let hold_scratch = scratch_amount > 0.0
            && self.button_held.load(Ordering::Acquire)
            && self.held_button.load(Ordering::Acquire) == column
            && was_playing;

        // click-free handover from the old read head
        if was_playing && !matches!(play_mode, PlayMode::Step | PlayMode::Grain) {
            let fade_samples = (self.trigger_fade_ms.load(Ordering::Acquire) as f64
                * 0.001
                * kernel.sample_rate)
                .max(1.0) as u32;
            kernel.blend_old_position = self.playback_position.load(Ordering::Acquire);
            kernel.blend_total = fade_samples;
            kernel.blend_remaining = fade_samples;
            kernel.held_output = kernel.last_rendered;
            kernel.output_blend.start(true, fade_samples, true);
        }

        kernel.trigger_sample_global = global_sample;
        kernel.trigger_ppq = ppq;
        kernel.trigger_offset_ratio = if loop_length > 0.0 {
            ((target - loop_start) / loop_length).clamp(0.0, 1.0)
        } else {
            0.0
        };
        kernel.samples_elapsed = 0.0;
        kernel.last_tempo = tempo;

        if play_mode != PlayMode::OneShot && ppq_valid {
            // timeline anchor: position becomes a pure function of host PPQ
            let beat_in_loop = kernel.trigger_offset_ratio * beats_for_loop;
            let offset = (beat_in_loop - ppq).rem_euclid(beats_for_loop);
            self.ppq_offset_beats.store(offset, Ordering::Release);
            self.ppq_anchored.store(true, Ordering::Release);
        } else {
            self.ppq_anchored.store(false, Ordering::Release);
        }
        kernel.anchor_suspended = false;

        if play_mode == PlayMode::Grain {
            kernel.gesture.set_target_center(target);
        }

        if hold_scratch {
            let current = self.playback_position.load(Ordering::Acquire);
            let duration = seconds_from_amount(scratch_amount) as f64 * kernel.sample_rate;
            kernel
                .scratch
                .start(current, target, duration, ScratchProfile::Exponential);
            kernel.scratch_forward = true;
            kernel.tape_stop = false;
        } else {
            kernel.scratch.cancel();
            kernel.scratch_forward = false;
            kernel.tape_stop = false;
            self.playback_position.store(target, Ordering::Release);
        }

        kernel.direction.reset();
        kernel.stopping = false;
        kernel.stop_fade.reset();
        self.playing.store(true, Ordering::Release);
    }

    /// Legacy free trigger with no scheduled sample: anchors against the last
    /// transport snapshot the strip rendered with.
    pub fn trigger(&mut self, column: i32) {
        let tempo = self.kernel.last_tempo;
        let sample = self.kernel.last_global_sample;
        let ppq = self.kernel.last_ppq;
        self.trigger_at_sample(column, tempo, sample, ppq, true);
    }

    /// Record a grid press on this strip. Grain strips feed the gesture; every
    /// mode records the hold for scratch-on-hold and gate semantics.
    pub fn press_button(&mut self, column: i32) {
        self.button_held.store(true, Ordering::Release);
        self.held_button.store(column, Ordering::Release);
        if self.play_mode() == PlayMode::Grain {
            let shared = self.shared.lock();
            if !shared.sample.is_empty() {
                let transient_mode = self.transient_slice_mode.load(Ordering::Acquire);
                let window =
                    ((ZERO_CROSS_WINDOW_SECONDS * self.kernel.sample_rate) as usize).max(1);
                let target = column_target_frames(&shared, column, transient_mode, window);
                let scratch = self.scratch_amount.load(Ordering::Acquire);
                let sample_rate = self.kernel.sample_rate;
                self.kernel.gesture.press(column, target, scratch, sample_rate);
            }
        }
    }

    /// Record a grid release. Gate strips stop; strips with scratch engaged start
    /// the reverse ramp back to the host timeline; grain strips update the gesture.
    pub fn release_button(&mut self, column: i32) {
        if self.held_button.load(Ordering::Acquire) == column {
            self.button_held.store(false, Ordering::Release);
            self.held_button.store(-1, Ordering::Release);
        }

        let play_mode = self.play_mode();
        if play_mode == PlayMode::Grain {
            self.kernel.gesture.release(column);
        }

        if !self.playing.load(Ordering::Acquire) {
            return;
        }

        if play_mode == PlayMode::Gate {
            self.stop_with_fade(
                (0.005 * self.kernel.sample_rate) as u32,
            );
            return;
        }

        let scratch_amount = self.scratch_amount.load(Ordering::Acquire);
        let scratch_engaged =
            self.kernel.tape_stop || self.kernel.scratch_forward || self.kernel.scratch.is_active();
        if scratch_amount > 0.0
            && scratch_engaged
            && matches!(play_mode, PlayMode::Loop | PlayMode::Grain)
        {
            self.start_reverse_scratch(scratch_amount, play_mode);
        } else if self.kernel.tape_stop {
            // released a completed scratch with no reverse ramp configured
            self.kernel.tape_stop = false;
        }
    }

    /// Build and start the release ramp that returns the read head to the host
    /// timeline. The landing target is the timeline position at ramp end, so the
    /// strip comes back exactly on phase; the duration is iterated once against
    /// the feasibility clamp because extending the ramp moves the target too.
    fn start_reverse_scratch(&mut self, scratch_amount: f32, play_mode: PlayMode) {
        let shared = self.shared.lock();
        if shared.sample.is_empty() {
            return;
        }
        let sample_length = shared.sample.len_frames() as f64;
        drop(shared);

        let (loop_start, loop_length) = self.loop_bounds(sample_length);
        let beats_for_loop = self.beats_for_loop();
        let offset = self.ppq_offset_beats.load(Ordering::Acquire);
        let kernel = &mut self.kernel;

        let profile = match play_mode {
            PlayMode::Grain => ScratchProfile::Power,
            _ => ScratchProfile::Smoothstep,
        };

        let current = self.playback_position.load(Ordering::Acquire);
        let beats_per_sample = kernel.last_tempo / 60.0 / kernel.sample_rate;
        let mut duration = seconds_from_amount(scratch_amount) as f64 * kernel.sample_rate;

        // landing target depends on the duration, which depends on the distance;
        // two passes settle well within a sample
        let mut target = current;
        for _ in 0..2 {
            let future_ppq = kernel.last_ppq + duration * beats_per_sample;
            let phase = (future_ppq + offset).rem_euclid(beats_for_loop) / beats_for_loop;
            target = loop_start + phase * loop_length;
            duration = ScratchRamp::feasible_duration(target - current, duration, profile);
        }

        kernel.scratch.start(current, target, duration, profile);
        kernel.scratch_forward = false;
        kernel.tape_stop = false;
    }

    /// Begin a short fade-out, after which the strip goes silent
    pub fn stop_with_fade(&mut self, fade_samples: u32) {
        if !self.playing.load(Ordering::Acquire) || self.kernel.stopping {
            return;
        }
        self.kernel.stopping = true;
        self.kernel.stop_fade.start(false, fade_samples.max(1), false);
    }

    /// Silence the strip immediately (no fade)
    pub fn stop_immediate(&mut self) {
        self.playing.store(false, Ordering::Release);
        self.ppq_anchored.store(false, Ordering::Release);
        self.kernel.stopping = false;
        self.kernel.stop_fade.reset();
        self.kernel.scratch.cancel();
        self.kernel.tape_stop = false;
        self.kernel.grain_pool.reset();
        self.display_speed.store(0.0, Ordering::Release);
    }

    /// The inner loop bounds in frames for the loaded sample length
    fn loop_bounds(&self, sample_length: f64) -> (f64, f64) {
        let start_col = self.loop_start_col.load(Ordering::Acquire) as f64;
        let end_col = self.loop_end_col.load(Ordering::Acquire) as f64;
        let loop_start = start_col / NUM_COLUMNS as f64 * sample_length;
        let loop_length = ((end_col - start_col) / NUM_COLUMNS as f64 * sample_length).max(1.0);
        (loop_start, loop_length)
    }

    // ----- rendering -----

    /// Render one segment, adding into the output slices.
    /// The strip lock is taken once here; loaders contend only during a swap.
    pub fn process(&mut self, out_left: &mut [f32], out_right: &mut [f32], ctx: &StripRenderContext) {
        let frames = out_left.len().min(out_right.len());
        if frames == 0 {
            return;
        }

        let shared = self.shared.lock();

        let sample_length = shared.sample.len_frames() as f64;
        let stereo = shared.sample.num_channels() > 1;
        let (loop_start, loop_length) = self.loop_bounds(sample_length);
        let beats_for_loop = self.beats_for_loop();
        let beats_per_sample = ctx.tempo / 60.0 / ctx.sample_rate;
        let play_mode = self.play_mode();
        let transient_mode = self.transient_slice_mode.load(Ordering::Acquire);
        let zero_cross_window =
            ((ZERO_CROSS_WINDOW_SECONDS * ctx.sample_rate) as usize).max(1);

        let kernel = &mut self.kernel;
        kernel.last_tempo = ctx.tempo;
        kernel.last_ppq = ctx.ppq;
        kernel.last_global_sample = ctx.global_sample;
        kernel.sample_rate = ctx.sample_rate;

        if shared.sample.is_empty() || !self.playing.load(Ordering::Acquire) {
            return;
        }

        // one coefficient update per segment is plenty for filter sweeps
        kernel.filter_coefficients = SvfCoefficients::new(
            shared.filter_cutoff_hz,
            shared.filter_resonance,
            ctx.sample_rate as f32,
        );
        kernel.filters[0].set_coefficients(kernel.filter_coefficients);
        kernel.filters[1].set_coefficients(kernel.filter_coefficients);
        let direction_mode =
            DirectionMode::from_index(self.direction_mode.load(Ordering::Acquire));
        let quality =
            ResampleQuality::from_index(self.resample_quality.load(Ordering::Acquire));
        let pitch_semitones = self.pitch_shift_semitones.load(Ordering::Acquire);
        let swing_amount = self.swing_amount.load(Ordering::Acquire);
        let swing_division = self.swing_division.load(Ordering::Acquire);
        let gate_amount = self.gate_amount.load(Ordering::Acquire);
        let gate_speed = self.gate_speed.load(Ordering::Acquire);
        let gate_envelope = self.gate_envelope.load(Ordering::Acquire);
        let gate_shape = GateShape::from_index(self.gate_shape.load(Ordering::Acquire));
        let filter_enabled = self.filter_enabled.load(Ordering::Acquire);
        let filter_type = FilterType::from_index(self.filter_type.load(Ordering::Acquire));
        let crossfade_samples =
            (self.crossfade_ms.load(Ordering::Acquire) as f64 * 0.001 * ctx.sample_rate).max(0.0);
        let target_volume = self.volume.load(Ordering::Acquire);
        let target_pan = self.pan.load(Ordering::Acquire);
        let target_speed = self.playback_speed.load(Ordering::Acquire);
        let step_bars = self.step_bars.load(Ordering::Acquire) as i64;

        // speed away from unity suspends the anchor; unity re-anchors from the
        // audible position so nothing jumps
        let speed_deviates = (target_speed - 1.0).abs() > ANCHOR_SPEED_EPSILON;
        if speed_deviates && self.ppq_anchored.load(Ordering::Acquire) {
            let position = self.playback_position.load(Ordering::Acquire);
            kernel.trigger_ppq = ctx.ppq;
            kernel.trigger_offset_ratio =
                ((position - loop_start) / loop_length).clamp(0.0, 1.0);
            kernel.samples_elapsed = 0.0;
            kernel.anchor_suspended = true;
            self.ppq_anchored.store(false, Ordering::Release);
        } else if !speed_deviates && kernel.anchor_suspended {
            let position = self.playback_position.load(Ordering::Acquire);
            let ratio = ((position - loop_start) / loop_length).clamp(0.0, 1.0);
            let beat_in_loop = ratio * beats_for_loop;
            let offset = (beat_in_loop - ctx.ppq).rem_euclid(beats_for_loop);
            self.ppq_offset_beats.store(offset, Ordering::Release);
            self.ppq_anchored.store(true, Ordering::Release);
            kernel.anchor_suspended = false;
        }

        let anchored = self.ppq_anchored.load(Ordering::Acquire);
        let ppq_offset = self.ppq_offset_beats.load(Ordering::Acquire);

        let grain_params_base = GrainParams {
            size_ms: self.grain_size_ms.load(Ordering::Acquire),
            density: self.grain_density.load(Ordering::Acquire),
            pitch_semitones: self.grain_pitch.load(Ordering::Acquire),
            pitch_jitter: self.grain_pitch_jitter.load(Ordering::Acquire),
            spread: self.grain_spread.load(Ordering::Acquire),
            jitter: self.grain_jitter.load(Ordering::Acquire),
            random: self.grain_random.load(Ordering::Acquire),
            arp_mode: ArpMode::from_index(self.grain_arp_mode.load(Ordering::Acquire)),
            arp_amount: self.grain_arp_amount.load(Ordering::Acquire),
            arp_bipolar: self.grain_arp_bipolar.load(Ordering::Acquire),
            cloud: self.grain_cloud.load(Ordering::Acquire),
            emitter: self.grain_emitter.load(Ordering::Acquire),
            envelope: self.grain_envelope.load(Ordering::Acquire),
            reverse: self.grain_reverse.load(Ordering::Acquire),
            tempo_sync_size: self.grain_sync_size.load(Ordering::Acquire),
        };
        let scratch_for_scene = self.scratch_amount.load(Ordering::Acquire) > 1e-3;

        let smoothing = kernel.smoothing_coefficient;
        let mut last_rate = 0.0_f32;

        for i in 0..frames {
            let ppq_now = ctx.ppq + i as f64 * beats_per_sample;
            let swung_ppq = apply_swing(ppq_now, swing_amount, swing_division);

            kernel.smoothed_volume =
                kernel.smoothed_volume * smoothing + target_volume * (1.0 - smoothing);
            kernel.smoothed_pan = kernel.smoothed_pan * smoothing + target_pan * (1.0 - smoothing);
            kernel.smoothed_speed =
                kernel.smoothed_speed * smoothing + target_speed * (1.0 - smoothing);

            // step mode retriggers on its sixteenth grid
            if play_mode == PlayMode::Step {
                let step_index =
                    (swung_ppq * 4.0).floor() as i64 % (16 * step_bars).max(1);
                let step_index = if step_index < 0 {
                    step_index + 16 * step_bars
                } else {
                    step_index
                };
                if step_index != kernel.last_step_index {
                    kernel.last_step_index = step_index;
                    self.step_current.store(step_index as i32, Ordering::Release);
                    if self.step_pattern[step_index as usize].load(Ordering::Acquire) {
                        let column = (step_index % NUM_COLUMNS as i64) as i32;
                        let target = column_target_frames(
                            &shared,
                            column,
                            transient_mode,
                            zero_cross_window,
                        );
                        kernel.trigger_offset_ratio = if loop_length > 0.0 {
                            ((target - loop_start) / loop_length).clamp(0.0, 1.0)
                        } else {
                            0.0
                        };
                        kernel.trigger_ppq = ppq_now;
                        kernel.samples_elapsed = 0.0;
                        let fade = (self.trigger_fade_ms.load(Ordering::Acquire) as f64
                            * 0.001
                            * ctx.sample_rate)
                            .max(1.0) as u32;
                        kernel.blend_old_position =
                            self.playback_position.load(Ordering::Acquire);
                        kernel.blend_total = fade;
                        kernel.blend_remaining = fade;
                    }
                }
            }

            // resolve the audible position for this sample
            let mut effective_rate = kernel.smoothed_speed as f64;
            let mut dir_gain = 1.0_f64;
            let absolute_position;

            if kernel.tape_stop {
                absolute_position = kernel.frozen_position;
                effective_rate = 0.0;
            } else if kernel.scratch.is_active() {
                match kernel.scratch.advance() {
                    Some((position, rate)) => {
                        absolute_position = position.clamp(0.0, sample_length - 1.0);
                        effective_rate = rate;
                        if !kernel.scratch.is_active() && kernel.scratch_forward {
                            // a completed press scratch parks the head while held
                            if self.button_held.load(Ordering::Acquire) {
                                kernel.tape_stop = true;
                                kernel.frozen_position = position;
                            }
                            kernel.scratch_forward = false;
                        }
                    }
                    None => {
                        absolute_position = self.playback_position.load(Ordering::Acquire);
                    }
                }
            } else {
                let raw = if ctx.ppq_valid && anchored {
                    // unwrapped so ping-pong sees a monotonic ramp
                    (swung_ppq + ppq_offset) / beats_for_loop * loop_length
                } else if ctx.ppq_valid {
                    let elapsed_beats = ppq_now - kernel.trigger_ppq;
                    kernel.trigger_offset_ratio * loop_length
                        + elapsed_beats / beats_for_loop
                            * loop_length
                            * kernel.smoothed_speed as f64
                } else {
                    let raw = kernel.trigger_offset_ratio * loop_length + kernel.samples_elapsed;
                    kernel.samples_elapsed += kernel.smoothed_speed as f64;
                    raw
                };

                // one-shots end at the loop edges instead of wrapping
                if play_mode == PlayMode::OneShot && (raw < 0.0 || raw >= loop_length) {
                    self.playing.store(false, Ordering::Release);
                    self.ppq_anchored.store(false, Ordering::Release);
                    break;
                }

                let (position_in_loop, gain) = kernel.direction.map_direction(
                    direction_mode,
                    raw,
                    loop_length,
                    ctx.quant_beats,
                    beats_for_loop,
                    ppq_now,
                );
                dir_gain = gain;
                absolute_position =
                    (loop_start + position_in_loop).clamp(0.0, (sample_length - 1.0).max(0.0));
            }

            // read the sample (or the grain engine) at the resolved position
            let (mut left, mut right);
            if play_mode == PlayMode::Grain {
                let center = kernel.gesture.advance_center(absolute_position);
                let shaped = kernel.gesture.shape_params(&grain_params_base);
                let grain_ctx = GrainRenderContext {
                    ppq: swung_ppq,
                    tempo: ctx.tempo,
                    sample_rate: ctx.sample_rate,
                    transport_step: effective_rate,
                    scene_active: scratch_for_scene && kernel.gesture.held_count() > 0,
                };
                let rendered = kernel.grain_pool.render_at_sample(
                    &shared.sample,
                    &kernel.gesture,
                    &shaped,
                    center,
                    loop_length,
                    &grain_ctx,
                );
                left = rendered.0;
                right = rendered.1;
            } else {
                left = read_with_loop_fade(
                    &shared.sample,
                    quality,
                    0,
                    absolute_position,
                    loop_start,
                    loop_length,
                    crossfade_samples,
                );
                right = if stereo {
                    read_with_loop_fade(
                        &shared.sample,
                        quality,
                        1,
                        absolute_position,
                        loop_start,
                        loop_length,
                        crossfade_samples,
                    )
                } else {
                    left
                };

                // sample-space retrigger blend: the old read head plays out under
                // the new one with equal-power gains
                if kernel.blend_remaining > 0 {
                    let t = 1.0 - kernel.blend_remaining as f32 / kernel.blend_total as f32;
                    let new_gain = (t * std::f32::consts::FRAC_PI_2).sin();
                    let old_gain = (t * std::f32::consts::FRAC_PI_2).cos();

                    let old_left = read_with_loop_fade(
                        &shared.sample,
                        quality,
                        0,
                        kernel.blend_old_position,
                        loop_start,
                        loop_length,
                        crossfade_samples,
                    );
                    let old_right = if stereo {
                        read_with_loop_fade(
                            &shared.sample,
                            quality,
                            1,
                            kernel.blend_old_position,
                            loop_start,
                            loop_length,
                            crossfade_samples,
                        )
                    } else {
                        old_left
                    };

                    left = left * new_gain + old_left * old_gain;
                    right = right * new_gain + old_right * old_gain;

                    kernel.blend_old_position = (kernel.blend_old_position
                        + effective_rate)
                        .clamp(0.0, (sample_length - 1.0).max(0.0));
                    kernel.blend_remaining -= 1;
                }
            }

            left *= dir_gain as f32;
            right *= dir_gain as f32;

            // output pitch shift rides on top of the timeline-locked read
            if pitch_semitones.abs() >= 0.01 {
                let shifted = kernel.pitch_shifter.process(left, right, pitch_semitones);
                left = shifted.0;
                right = shifted.1;
            } else {
                // keep the shifter rings primed for a smooth engage
                let _ = kernel.pitch_shifter.process(left, right, 0.0);
            }

            if filter_enabled {
                left = kernel.filters[0].process(left, filter_type);
                right = kernel.filters[1].process(right, filter_type);
            }

            let gate = gate_gain(swung_ppq, gate_shape, gate_speed, gate_amount, gate_envelope);
            left *= gate;
            right *= gate;

            // output-space trigger blend: the held pre-trigger output fades out
            // under the fresh signal
            if kernel.output_blend.is_active() {
                let new_gain = kernel.output_blend.next_gain();
                let old_gain = (1.0 - new_gain * new_gain).max(0.0).sqrt();
                left = left * new_gain + kernel.held_output.0 * old_gain;
                right = right * new_gain + kernel.held_output.1 * old_gain;
            }

            if kernel.stopping {
                let stop_gain = kernel.stop_fade.next_gain();
                left *= stop_gain;
                right *= stop_gain;
                if !kernel.stop_fade.is_active() {
                    kernel.stopping = false;
                    self.playing.store(false, Ordering::Release);
                    self.ppq_anchored.store(false, Ordering::Release);
                }
            }

            // constant-power pan and the smoothed volume
            let pan_angle = (kernel.smoothed_pan + 1.0) * std::f32::consts::FRAC_PI_4;
            left *= pan_angle.cos() * kernel.smoothed_volume;
            right *= pan_angle.sin() * kernel.smoothed_volume;

            if !left.is_finite() {
                left = 0.0;
            }
            if !right.is_finite() {
                right = 0.0;
            }

            kernel.last_rendered = (left, right);
            last_rate = effective_rate as f32;
            out_left[i] += left;
            out_right[i] += right;

            self.playback_position
                .store(absolute_position, Ordering::Release);
            if !self.playing.load(Ordering::Acquire) {
                break;
            }
        }

        let final_position = self.playback_position.load(Ordering::Acquire);
        if sample_length > 0.0 {
            let column = ((final_position / sample_length) * NUM_COLUMNS as f64) as i32;
            self.current_column
                .store(column.clamp(0, NUM_COLUMNS as i32 - 1), Ordering::Release);
        }
        self.display_speed.store(last_rate, Ordering::Release);
    }
}

/// The frame a column points at: the transient slice map when the mode is on,
/// otherwise the uniform grid, snapped to the nearest zero crossing.
fn column_target_frames(
    shared: &StripShared,
    column: i32,
    transient_mode: bool,
    zero_cross_window: usize,
) -> f64 {
    let column = column.clamp(0, NUM_COLUMNS as i32 - 1) as usize;
    let raw = if transient_mode {
        shared.slice_map[column] as f64
    } else {
        shared.sample.uniform_column_start(column)
    };
    shared.sample.snap_to_zero_crossing(raw, zero_cross_window)
}

/// Read one channel at a position, applying the inner-loop seam crossfade.
///
/// Inside the fade zone at the loop end the read blends toward the pre-roll just
/// before the loop start, with equal-power square-root curves, so the wrap back to
/// the start is seamless.
fn read_with_loop_fade(
    sample: &SampleBuffer,
    quality: ResampleQuality,
    channel: usize,
    absolute_position: f64,
    loop_start: f64,
    loop_length: f64,
    crossfade_samples: f64,
) -> f32 {
    let current = quality.read(sample, channel, absolute_position);

    let sample_length = sample.len_frames() as f64;
    let inner_loop = loop_length < sample_length - 1.0;
    if !inner_loop || crossfade_samples < 2.0 {
        return current;
    }

    let position_in_loop = absolute_position - loop_start;
    let fade_start = loop_length - crossfade_samples;
    if position_in_loop < fade_start || position_in_loop >= loop_length {
        return current;
    }

    let t = ((position_in_loop - fade_start) / (crossfade_samples - 1.0)).clamp(0.0, 1.0);
    let preroll_position =
        (loop_start - crossfade_samples + t * crossfade_samples).rem_euclid(sample_length);
    let preroll = quality.read(sample, channel, preroll_position);

    let fade_in = ((t as f32) * std::f32::consts::FRAC_PI_2).sin().sqrt();
    let fade_out = (1.0 - fade_in * fade_in).max(0.0).sqrt();
    current * fade_out + preroll * fade_in
}
