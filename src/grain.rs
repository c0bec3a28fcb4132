//! The granular voice engine.
//!
//! A module containing three parts:
//!
//! Gesture:
//!     The transient state induced by holding 1 to 3 columns on a grain strip.
//!     One held column freezes the emitter centre at the column (ramped there when
//!     scratch is engaged). Two held columns form a grip whose span widens
//!     density, spread and jitter. Three held columns turn the newest press into a
//!     size control swept across the span. Releasing falls back a level.
//!
//! Voice pool:
//!     A fixed pool of grain voices spawned by an accumulator at a rate derived
//!     from density, emitter drive and the current grain size. Each voice reads the
//!     strip sample at its own position and step, shaped by a Blackman-Harris
//!     envelope, panned constant-power.
//!
//! Scene:
//!     Tempo-locked modulation while columns are held: a per-step pulse whose rate
//!     follows the held count, and a per-step remap of the emitter centre across the
//!     held columns. Post-voice, a cloud delay thickens the output, and a neutral
//!     blend crossfades back to the plain sample read when nothing granular is
//!     actually engaged.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::delay_buffer::DelayBuffer;
use crate::resample::ResampleQuality;
use crate::sample_buffer::SampleBuffer;
use crate::scratch::seconds_from_amount;

/// Number of voices in the pool
pub const GRAIN_POOL_SIZE: usize = 32;

/// Shortest allowed grain in samples
const MIN_GRAIN_SAMPLES: f64 = 32.0;

/// Longest grain size parameter in milliseconds
const MAX_GRAIN_MS: f32 = 2400.0;

/// Envelope lookup table length
const ENVELOPE_TABLE_SIZE: usize = 2048;

/// Cloud delay capacity in seconds
const CLOUD_DELAY_SECONDS: f64 = 2.0;

/// Spawn rate bounds in grains per sample
const SPAWN_RATE_MIN: f64 = 0.000_05;
const SPAWN_RATE_MAX: f64 = 0.24;

/// Host divisions (in beats) that a tempo-synced grain size snaps to
const SYNC_DIVISIONS_BEATS: [f64; 14] = [
    1.0 / 64.0,
    1.0 / 48.0,
    1.0 / 32.0,
    1.0 / 24.0,
    1.0 / 16.0,
    1.0 / 12.0,
    1.0 / 8.0,
    1.0 / 6.0,
    1.0 / 4.0,
    1.0 / 3.0,
    1.0 / 2.0,
    2.0 / 3.0,
    1.0,
    2.0,
];

/// Beat grids (in beats) the size jitter re-rolls on, indexed by jitter amount
const JITTER_GRIDS_BEATS: [f64; 6] = [
    1.0 / 32.0,
    1.0 / 24.0,
    1.0 / 16.0,
    1.0 / 12.0,
    1.0 / 8.0,
    1.0 / 4.0,
];

/// Grain size bounds the jitter can roll between
const JITTER_SIZE_MIN_MS: f32 = 30.0;
const JITTER_SIZE_MAX_MS: f32 = 600.0;

/// The arpeggio pattern applied to spawned grain pitches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArpMode {
    /// No arp interval
    #[default]
    Off,
    /// Octave hops
    Octave,
    /// Root, fifth, octave power chord
    Power,
    /// Up then down a small figure
    Zigzag,
    /// Major scale degrees
    Major,
    /// Natural minor scale degrees
    Minor,
    /// Minor pentatonic degrees
    Pentatonic,
}

impl ArpMode {
    /// Map a stored parameter index back to an arp mode
    pub fn from_index(index: u32) -> Self {
        match index {
            1 => ArpMode::Octave,
            2 => ArpMode::Power,
            3 => ArpMode::Zigzag,
            4 => ArpMode::Major,
            5 => ArpMode::Minor,
            6 => ArpMode::Pentatonic,
            _ => ArpMode::Off,
        }
    }

    /// The semitone pattern the arp steps through
    pub fn pattern(self) -> &'static [f32] {
        match self {
            ArpMode::Off => &[0.0],
            ArpMode::Octave => &[0.0, 12.0, 0.0, -12.0],
            ArpMode::Power => &[0.0, 7.0, 12.0],
            ArpMode::Zigzag => &[0.0, 3.0, 7.0, 12.0, 7.0, 3.0],
            ArpMode::Major => &[0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 11.0, 12.0],
            ArpMode::Minor => &[0.0, 2.0, 3.0, 5.0, 7.0, 8.0, 10.0, 12.0],
            ArpMode::Pentatonic => &[0.0, 3.0, 5.0, 7.0, 10.0, 12.0],
        }
    }
}

/// Snapshot of the grain parameters a strip hands the pool for one segment
#[derive(Debug, Clone, Copy)]
pub struct GrainParams {
    /// Nominal grain size in milliseconds
    pub size_ms: f32,
    /// Spawn density, 0..1
    pub density: f32,
    /// Pitch offset applied to every grain, in semitones
    pub pitch_semitones: f32,
    /// Random pitch scatter depth, in semitones
    pub pitch_jitter: f32,
    /// Stereo and positional spread, 0..1
    pub spread: f32,
    /// Size jitter depth, 0..1
    pub jitter: f32,
    /// Read position scatter across the loop, 0..1
    pub random: f32,
    /// Arp pattern
    pub arp_mode: ArpMode,
    /// Probability a spawn takes its arp interval, 0..1
    pub arp_amount: f32,
    /// Extra bipolar pitch within the arp pattern range
    pub arp_bipolar: bool,
    /// Cloud delay depth, 0..1
    pub cloud: f32,
    /// Emitter drive: clusters and multiplies spawns, 0..1
    pub emitter: f32,
    /// Envelope edge shaping, 0..1
    pub envelope: f32,
    /// Play grains reversed
    pub reverse: bool,
    /// Snap grain size to host divisions
    pub tempo_sync_size: bool,
}

impl Default for GrainParams {
    fn default() -> Self {
        Self {
            size_ms: 250.0,
            density: 0.35,
            pitch_semitones: 0.0,
            pitch_jitter: 0.0,
            spread: 0.0,
            jitter: 0.0,
            random: 0.0,
            arp_mode: ArpMode::Off,
            arp_amount: 0.0,
            arp_bipolar: false,
            cloud: 0.0,
            emitter: 0.0,
            envelope: 0.0,
            reverse: false,
            tempo_sync_size: false,
        }
    }
}

impl GrainParams {
    /// How far the parameter set sits from a plain sample read, 0 (neutral) to 1.
    /// Drives the neutral blend and the loudness compensation.
    pub fn deviation(&self) -> f32 {
        let size_dev = ((self.size_ms - 250.0).abs() / MAX_GRAIN_MS).min(1.0);
        [
            size_dev,
            (self.density - 0.35).abs(),
            (self.pitch_semitones.abs() / 12.0).min(1.0),
            (self.pitch_jitter / 12.0).min(1.0),
            self.spread,
            self.jitter,
            self.random,
            self.arp_amount,
            self.cloud,
            self.emitter,
            self.envelope,
            if self.reverse { 1.0 } else { 0.0 },
        ]
        .into_iter()
        .fold(0.0, f32::max)
    }
}

/// One held column of a grain gesture: the column index and the frame it targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeldColumn {
    /// The grid column being held
    pub column: i32,
    /// The frame the column points at in the strip sample
    pub target_frames: f64,
}

/// The three-hold size mapping: the newest press sweeps a size range whose base
/// and width both grow with the span of held columns.
pub fn three_hold_size_ms(min_col: i32, max_col: i32, size_col: i32) -> f32 {
    let span = (max_col - min_col).max(1) as f32;
    let span_norm = span / 15.0;
    let t = ((size_col - min_col) as f32 / span).clamp(0.0, 1.0);
    let shaped = t.powf(1.35);
    let base = 140.0 + 420.0 * span_norm;
    let sweep = 900.0 + 1200.0 * span_norm;
    (base + sweep * shaped).min(MAX_GRAIN_MS)
}

/// The gesture state machine for a grain strip
/// # Attributes
/// * `held`: Currently held columns in press order, at most three
/// * `freeze`: Whether the emitter centre is frozen at the gesture target
/// * `current_center` / `target_center`: The emitter centre and where it is headed
/// * `ramp_step`: Frames the centre moves per sample while ramping
#[derive(Debug, Clone, Default)]
pub struct GrainGesture {
    held: Vec<HeldColumn>,
    freeze: bool,
    current_center: f64,
    target_center: f64,
    ramp_step: f64,
}

impl GrainGesture {
    /// Constructor for an idle gesture
    pub fn new() -> Self {
        Self {
            held: Vec::with_capacity(3),
            ..Default::default()
        }
    }

    /// Press a column. `scratch_amount` decides whether the centre ramps to the
    /// new target (smooth, gesture-timed) or snaps.
    pub fn press(
        &mut self,
        column: i32,
        target_frames: f64,
        scratch_amount: f32,
        sample_rate: f64,
    ) {
        self.held.retain(|h| h.column != column);
        if self.held.len() == 3 {
            self.held.remove(0);
        }
        self.held.push(HeldColumn {
            column,
            target_frames,
        });

        self.freeze = true;
        self.target_center = target_frames;
        if scratch_amount > 1e-3 {
            let ramp_seconds = seconds_from_amount(scratch_amount) as f64;
            let ramp_samples = (ramp_seconds * sample_rate).max(1.0);
            self.ramp_step = (self.target_center - self.current_center) / ramp_samples;
        } else {
            self.current_center = target_frames;
            self.ramp_step = 0.0;
        }
    }

    /// Release a column. With holds remaining the gesture falls back to the newest
    /// of them; with none the freeze lifts and the centre follows the timeline.
    pub fn release(&mut self, column: i32) {
        self.held.retain(|h| h.column != column);
        match self.held.last() {
            Some(newest) => {
                self.target_center = newest.target_frames;
                self.ramp_step = 0.0;
                self.current_center = newest.target_frames;
            }
            None => {
                self.freeze = false;
                self.ramp_step = 0.0;
            }
        }
    }

    /// Drop all holds (strip stop / sample swap)
    pub fn clear(&mut self) {
        self.held.clear();
        self.freeze = false;
        self.ramp_step = 0.0;
    }

    /// Advance the centre ramp one sample and return the effective emitter
    /// centre: the frozen (possibly ramping) centre, or the timeline position
    /// when nothing is held.
    pub fn advance_center(&mut self, timeline_position: f64) -> f64 {
        if !self.freeze {
            self.current_center = timeline_position;
            return timeline_position;
        }

        if self.ramp_step != 0.0 {
            let before = self.current_center;
            self.current_center += self.ramp_step;
            // landed when the step carries the centre past the target
            if (self.target_center - before).signum() != (self.target_center - self.current_center).signum()
                || (self.target_center - self.current_center).abs() < self.ramp_step.abs()
            {
                self.current_center = self.target_center;
                self.ramp_step = 0.0;
            }
        }
        self.current_center
    }

    /// Number of columns held
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// The held columns in press order
    pub fn held(&self) -> &[HeldColumn] {
        &self.held
    }

    /// Whether the centre is frozen by a hold
    pub fn is_frozen(&self) -> bool {
        self.freeze
    }

    /// The centre the gesture is heading for
    pub fn target_center(&self) -> f64 {
        self.target_center
    }

    /// Re-anchor the gesture target (used when a trigger lands on a grain strip)
    pub fn set_target_center(&mut self, target_frames: f64) {
        self.target_center = target_frames;
        if self.ramp_step == 0.0 {
            self.current_center = target_frames;
        }
    }

    /// Shape the base parameters through the grip gestures.
    /// Two holds widen density, spread and jitter with the span; three holds turn
    /// the newest press into the size control and re-seat the envelope. The base
    /// is untouched, so releasing a grip restores the stored parameters exactly.
    pub fn shape_params(&self, base: &GrainParams) -> GrainParams {
        let mut shaped = *base;
        match self.held.len() {
            2 => {
                let a = self.held[0].column;
                let b = self.held[1].column;
                let span_norm = (a - b).unsigned_abs() as f32 / 15.0;
                shaped.density = (base.density + 0.5 * span_norm).min(1.0);
                shaped.spread = (base.spread + 0.4 * span_norm).min(1.0);
                shaped.jitter = (base.jitter + 0.3 * span_norm).min(1.0);
            }
            3 => {
                let min_col = self.held.iter().map(|h| h.column).min().unwrap_or(0);
                let max_col = self.held.iter().map(|h| h.column).max().unwrap_or(0);
                let size_col = self.held[2].column;
                let span_norm = (max_col - min_col).max(1) as f32 / 15.0;
                let t = ((size_col - min_col) as f32 / (max_col - min_col).max(1) as f32)
                    .clamp(0.0, 1.0);
                let shaped_t = t.powf(1.35);

                shaped.size_ms = three_hold_size_ms(min_col, max_col, size_col);
                shaped.density = (0.4 + 0.4 * shaped_t).min(1.0);
                shaped.spread = (base.spread + 0.4 * span_norm).min(1.0);
                shaped.jitter = (base.jitter + 0.25 * shaped_t).min(1.0);
                shaped.envelope = (0.3 + 0.5 * shaped_t).min(1.0);
            }
            _ => {}
        }
        shaped
    }
}

/// One voice of the pool
#[derive(Debug, Clone, Copy, Default)]
struct GrainVoice {
    active: bool,
    age: u32,
    length: u32,
    read_position: f64,
    step: f64,
    pan_left: f32,
    pan_right: f32,
}

/// Per-sample context the strip passes into the pool render
#[derive(Debug, Clone, Copy)]
pub struct GrainRenderContext {
    /// Host position in quarter notes at this sample
    pub ppq: f64,
    /// Host tempo in BPM
    pub tempo: f64,
    /// Engine sample rate
    pub sample_rate: f64,
    /// The strip's base playback step (speed with direction), grains ride on it
    pub transport_step: f64,
    /// Whether the scratch scene is engaged (holds + scratch amount)
    pub scene_active: bool,
}

/// The fixed grain voice pool with its spawn scheduler and post effects
pub struct GrainVoicePool {
    voices: [GrainVoice; GRAIN_POOL_SIZE],
    search_cursor: usize,
    spawn_accumulator: f64,
    arp_step: usize,
    bloom_phase: f32,
    envelope_table: Vec<f32>,
    cloud_left: DelayBuffer,
    cloud_right: DelayBuffer,
    neutral_blend: f32,
    jittered_size_ms: f32,
    jitter_group: i64,
    quality: ResampleQuality,
    sample_rate: f64,
    rng: StdRng,
}

impl GrainVoicePool {
    /// Constructor; delay buffers are token sized until `prepare` runs
    pub fn new(seed: u64) -> Self {
        // 3-term Blackman-Harris (a0 0.35875, a1 0.48829, a2 0.14128, a3 0.01168)
        let envelope_table = (0..ENVELOPE_TABLE_SIZE)
            .map(|i| {
                let x = i as f32 / (ENVELOPE_TABLE_SIZE - 1) as f32;
                let w = std::f32::consts::TAU * x;
                0.35875 - 0.48829 * w.cos() + 0.14128 * (2.0 * w).cos()
                    - 0.01168 * (3.0 * w).cos()
            })
            .collect();

        Self {
            voices: [GrainVoice::default(); GRAIN_POOL_SIZE],
            search_cursor: 0,
            spawn_accumulator: 0.0,
            arp_step: 0,
            bloom_phase: 0.0,
            envelope_table,
            cloud_left: DelayBuffer::new(1),
            cloud_right: DelayBuffer::new(1),
            neutral_blend: 0.0,
            jittered_size_ms: 0.0,
            jitter_group: i64::MIN,
            quality: ResampleQuality::Linear,
            sample_rate: 44_100.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Allocate the cloud delay for a sample rate
    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        let capacity = (CLOUD_DELAY_SECONDS * sample_rate) as usize;
        self.cloud_left = DelayBuffer::new(capacity);
        self.cloud_right = DelayBuffer::new(capacity);
    }

    /// Setter for the per-voice interpolation quality
    pub fn set_quality(&mut self, quality: ResampleQuality) {
        self.quality = quality;
    }

    /// Kill all voices and clear the cloud (sample swap, strip stop)
    pub fn reset(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.active = false;
        }
        self.spawn_accumulator = 0.0;
        self.cloud_left.clear();
        self.cloud_right.clear();
        self.neutral_blend = 0.0;
    }

    /// Number of currently sounding voices
    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    /// Normalized read positions of up to 8 sounding voices, for grid LED preview
    pub fn preview_positions(&self, sample_length: f64) -> [f32; 8] {
        let mut preview = [0.0_f32; 8];
        if sample_length <= 0.0 {
            return preview;
        }
        for (slot, voice) in preview
            .iter_mut()
            .zip(self.voices.iter().filter(|v| v.active))
        {
            *slot = (voice.read_position / sample_length).fract() as f32;
        }
        preview
    }

    /// The grain size after tempo sync and jitter, the size actually spawned
    fn effective_size_ms(&mut self, params: &GrainParams, ctx: &GrainRenderContext) -> f32 {
        let mut size_ms = params.size_ms.clamp(10.0, MAX_GRAIN_MS);

        if params.tempo_sync_size && ctx.tempo > 0.0 {
            size_ms = snap_size_to_divisions(size_ms, ctx.tempo);
        }

        if params.jitter > 1e-3 {
            // re-roll the size at each boundary of the jitter grid
            let grid_index = ((params.jitter * (JITTER_GRIDS_BEATS.len() as f32 - 0.01)) as usize)
                .min(JITTER_GRIDS_BEATS.len() - 1);
            let grid = JITTER_GRIDS_BEATS[grid_index];
            let group = (ctx.ppq / grid).floor() as i64;
            if group != self.jitter_group {
                self.jitter_group = group;
                let lo = size_ms + (JITTER_SIZE_MIN_MS - size_ms) * params.jitter;
                let hi = size_ms + (JITTER_SIZE_MAX_MS - size_ms) * params.jitter;
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                let mut rolled = self.rng.gen_range(lo..=hi.max(lo + 1.0));
                if params.tempo_sync_size && ctx.tempo > 0.0 {
                    rolled = snap_size_to_divisions(rolled, ctx.tempo);
                }
                self.jittered_size_ms = rolled;
            }
            if self.jittered_size_ms > 0.0 {
                size_ms = self.jittered_size_ms;
            }
        }

        size_ms
    }

    /// Spawn one voice reading around `center`
    fn spawn_voice(
        &mut self,
        buffer: &SampleBuffer,
        params: &GrainParams,
        center: f64,
        loop_length: f64,
        size_ms: f32,
        ctx: &GrainRenderContext,
    ) {
        let sample_length = buffer.len_frames() as f64;
        if sample_length <= 0.0 {
            return;
        }

        let size_samples = (size_ms as f64 * 0.001 * ctx.sample_rate)
            .clamp(MIN_GRAIN_SAMPLES, MAX_GRAIN_MS as f64 * 0.001 * ctx.sample_rate);

        // cyclic search for a free slot, stealing the oldest voice when full
        let mut chosen = None;
        for offset in 0..GRAIN_POOL_SIZE {
            let index = (self.search_cursor + offset) % GRAIN_POOL_SIZE;
            if !self.voices[index].active {
                chosen = Some(index);
                break;
            }
        }
        let index = chosen.unwrap_or_else(|| {
            self.voices
                .iter()
                .enumerate()
                .max_by_key(|(_, v)| v.age)
                .map(|(i, _)| i)
                .unwrap_or(0)
        });
        self.search_cursor = (index + 1) % GRAIN_POOL_SIZE;

        // read position scattered by spread around the centre plus a loop-wide
        // scatter from the random parameter
        let spread_offset =
            params.spread as f64 * self.rng.gen_range(-1.0..=1.0) * size_samples;
        let random_offset = params.random as f64
            * loop_length.max(1.0)
            * self.rng.gen_range(-1.0..=1.0)
            * 0.24;
        let read_position = (center + spread_offset + random_offset).rem_euclid(sample_length);

        // pitch: base, jitter scatter, then the arp interval
        let mut semitones =
            params.pitch_semitones + params.pitch_jitter * self.rng.gen_range(-1.0..=1.0);
        if params.arp_mode != ArpMode::Off && params.arp_amount > 1e-3 {
            let pattern = params.arp_mode.pattern();
            let interval = pattern[self.arp_step % pattern.len()];
            self.arp_step = self.arp_step.wrapping_add(1);
            if self.rng.gen::<f32>() < params.arp_amount {
                semitones += interval;
            }
            if params.arp_bipolar {
                let range = pattern.iter().fold(0.0_f32, |a, &b| a.max(b.abs()));
                semitones +=
                    self.rng.gen_range(-1.0..=1.0) * range * params.arp_amount;
            }
            self.bloom_phase = (self.bloom_phase + 0.013) % 1.0;
        }

        let reverse = if params.random > 1e-3 {
            self.rng.gen::<f32>() < params.random * 0.88
        } else {
            params.reverse
        };

        let direction = if reverse { -1.0 } else { 1.0 };
        let base_step = if ctx.transport_step.abs() > 1e-9 {
            ctx.transport_step.abs()
        } else {
            1.0
        };
        let step = direction * 2.0_f64.powf(semitones as f64 / 12.0) * base_step;

        // constant-power pan from a random angle inside the spread
        let pan = self.rng.gen_range(-1.0..=1.0) * params.spread;
        let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;

        self.voices[index] = GrainVoice {
            active: true,
            age: 0,
            length: size_samples as u32,
            read_position,
            step,
            pan_left: angle.cos(),
            pan_right: angle.sin(),
        };
    }

    /// Render one output sample of the pool.
    ///
    /// `center` is the emitter centre already resolved by the gesture;
    /// `loop_length` bounds the scatter of the random parameter.
    #[allow(clippy::too_many_arguments)]
    pub fn render_at_sample(
        &mut self,
        buffer: &SampleBuffer,
        gesture: &GrainGesture,
        params: &GrainParams,
        center: f64,
        loop_length: f64,
        ctx: &GrainRenderContext,
    ) -> (f32, f32) {
        if buffer.is_empty() {
            return (0.0, 0.0);
        }

        let size_ms = self.effective_size_ms(params, ctx);
        let size_samples = (size_ms as f64 * 0.001 * ctx.sample_rate).max(MIN_GRAIN_SAMPLES);

        // the scratch scene remaps the centre across the held columns per step
        let (scene_center, scene_density_mul) = if ctx.scene_active && gesture.held_count() >= 1
        {
            scene_remap(gesture, center, ctx)
        } else {
            (center, 1.0)
        };

        // spawn scheduling: accumulate an effective rate, spawn on overflow
        let emitter_drive = (params.emitter as f64).powf(1.8);
        let base_rate =
            (0.72 + 4.6 * params.density as f64 + 8.0 * emitter_drive) / size_samples;
        let rate = (base_rate * scene_density_mul).clamp(SPAWN_RATE_MIN, SPAWN_RATE_MAX);
        self.spawn_accumulator += rate;

        let max_spawns_per_sample = 1 + (5.0 * emitter_drive).round() as usize;
        let mut spawned = 0;
        while self.spawn_accumulator >= 1.0 && spawned < max_spawns_per_sample {
            self.spawn_accumulator -= 1.0;
            self.spawn_voice(buffer, params, scene_center, loop_length, size_ms, ctx);
            spawned += 1;
        }
        if spawned == max_spawns_per_sample {
            // drop the backlog rather than burst later
            self.spawn_accumulator = self.spawn_accumulator.min(1.0);
        }

        // render the sounding voices
        let sample_length = buffer.len_frames() as f64;
        let stereo = buffer.num_channels() > 1;
        let mut left = 0.0_f32;
        let mut right = 0.0_f32;

        for voice in self.voices.iter_mut() {
            if !voice.active {
                continue;
            }

            let gain = self.envelope_table
                [(((voice.age as f32 / voice.length.max(1) as f32)
                    * (ENVELOPE_TABLE_SIZE - 1) as f32) as usize)
                    .min(ENVELOPE_TABLE_SIZE - 1)];
            let gain = if params.envelope > 1e-3 {
                let x = voice.age as f32 / voice.length.max(1) as f32;
                let edge_distance = x.min(1.0 - x);
                gain * (edge_distance / 0.5).powf(params.envelope * 2.0)
            } else {
                gain
            };

            let sample_left = self.quality.read(buffer, 0, voice.read_position);
            let sample_right = if stereo {
                self.quality.read(buffer, 1, voice.read_position)
            } else {
                sample_left
            };

            left += sample_left * gain * voice.pan_left;
            right += sample_right * gain * voice.pan_right;

            voice.read_position = (voice.read_position + voice.step).rem_euclid(sample_length);
            voice.age += 1;
            if voice.age >= voice.length {
                voice.active = false;
            }
        }

        // cloud delay: a short thickening tap with cloud-scaled feedback and mix
        if params.cloud > 1e-3 {
            let delay_samples = (0.35 * ctx.sample_rate) as f32;
            let feedback = 0.12 + (0.95 - 0.12) * params.cloud;
            let mix = (0.08 + 0.82 * params.cloud).min(0.9);

            let wet_left = self.cloud_left.read_fractional(delay_samples);
            let wet_right = self.cloud_right.read_fractional(delay_samples);
            self.cloud_left.write(left + wet_left * feedback);
            self.cloud_right.write(right + wet_right * feedback);

            left = left * (1.0 - mix) + wet_left * mix;
            right = right * (1.0 - mix) + wet_right * mix;
        } else {
            // keep the ring primed so engaging the cloud has history
            self.cloud_left.write(left);
            self.cloud_right.write(right);
        }

        // neutral blend: with no gesture and nothing granular engaged, fall back
        // to the plain resampled read so the strip sounds like a normal sampler
        let deviation = params.deviation();
        let neutral_target = if gesture.held_count() == 0 && !ctx.scene_active {
            (1.0 - deviation).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.neutral_blend += 0.01 * (neutral_target - self.neutral_blend);

        if self.neutral_blend > 1e-3 {
            let direct_left = self.quality.read(buffer, 0, center);
            let direct_right = if stereo {
                self.quality.read(buffer, 1, center)
            } else {
                direct_left
            };
            left = left * (1.0 - self.neutral_blend) + direct_left * self.neutral_blend;
            right = right * (1.0 - self.neutral_blend) + direct_right * self.neutral_blend;
        }

        // loudness compensation rises with effect activity, capped at 2.2
        let compensation = (1.0 + deviation * 1.2).min(2.2);
        left *= compensation;
        right *= compensation;

        if !left.is_finite() {
            left = 0.0;
        }
        if !right.is_finite() {
            right = 0.0;
        }
        (left, right)
    }
}

/// Snap a grain size to the nearest host division at a tempo
fn snap_size_to_divisions(size_ms: f32, tempo: f64) -> f32 {
    let beat_ms = 60_000.0 / tempo;
    let size_beats = size_ms as f64 / beat_ms;
    let mut best = SYNC_DIVISIONS_BEATS[0];
    let mut best_distance = f64::MAX;
    for &division in SYNC_DIVISIONS_BEATS.iter() {
        let distance = (division - size_beats).abs();
        if distance < best_distance {
            best_distance = distance;
            best = division;
        }
    }
    (best * beat_ms) as f32
}

/// The scratch-scene centre remap: a tempo pulse whose rate follows the held
/// count, stepping the centre through the held columns (and their midpoint).
fn scene_remap(gesture: &GrainGesture, center: f64, ctx: &GrainRenderContext) -> (f64, f64) {
    let held = gesture.held();
    let step_beats = match held.len() {
        1 => 0.5,        // eighths
        2 => 0.25,       // sixteenths
        _ => 1.0 / 6.0,  // twenty-fourths
    };

    let step_position = ctx.ppq / step_beats;
    let step_index = step_position.floor() as i64;
    let phase = step_position - step_position.floor();
    let pulse_exponent = if held.len() >= 3 { 2.8 } else { 2.0 };
    let pulse = (1.0 - phase).powf(pulse_exponent);

    let remapped = match held.len() {
        1 => center,
        2 => {
            let a = held[0].target_frames;
            let b = held[1].target_frames;
            match step_index.rem_euclid(3) {
                0 => a,
                1 => b,
                _ => (a + b) * 0.5,
            }
        }
        _ => {
            let a = held[0].target_frames;
            let b = held[1].target_frames;
            let c = held[2].target_frames;
            let mid = (a + b + c) / 3.0;
            // a permutation keyed on the held columns picks one of six orders
            let key: i64 = held
                .iter()
                .map(|h| h.column as i64)
                .fold(0, |acc, col| acc.wrapping_mul(31).wrapping_add(col));
            let sequences: [[f64; 4]; 6] = [
                [a, b, c, mid],
                [a, c, b, mid],
                [b, a, mid, c],
                [b, mid, a, c],
                [c, mid, b, a],
                [mid, a, c, b],
            ];
            let sequence = sequences[key.rem_euclid(6) as usize];
            sequence[step_index.rem_euclid(4) as usize]
        }
    };

    // the pulse leans spawn density into the front of each step
    let density_mul = 0.35 + 1.3 * pulse;
    (remapped, density_mul)
}

#[cfg(test)]
mod tests {
    use super::{
        three_hold_size_ms, ArpMode, GrainGesture, GrainParams, GrainRenderContext,
        GrainVoicePool, GRAIN_POOL_SIZE,
    };
    use crate::sample_buffer::SampleBuffer;
    use once_cell::sync::Lazy;

    static NOISE_BUFFER: Lazy<SampleBuffer> = Lazy::new(|| {
        // deterministic pseudo-noise so spawned grains always find signal
        let data: Vec<f32> = (0..48_000)
            .map(|i| ((i as f32 * 12.9898).sin() * 43_758.547).fract() - 0.5)
            .collect();
        SampleBuffer::from_channels(vec![data], 48_000.0).unwrap()
    });

    fn context() -> GrainRenderContext {
        GrainRenderContext {
            ppq: 0.0,
            tempo: 120.0,
            sample_rate: 48_000.0,
            transport_step: 1.0,
            scene_active: false,
        }
    }

    #[test]
    fn test_three_hold_size_formula() {
        // held columns 3 and 12 with the size control at 12: span 9, t = 1
        let size = three_hold_size_ms(3, 12, 12);
        let span_norm = 9.0 / 15.0;
        let expected = 140.0 + 420.0 * span_norm + (900.0 + 1200.0 * span_norm);
        assert!((size - expected).abs() < 1e-3, "size {size} vs {expected}");
        assert!((size - 2012.0).abs() < 0.5);
    }

    #[test]
    fn test_three_hold_size_clamped() {
        // a full-width span with the control at the top would exceed the cap
        let size = three_hold_size_ms(0, 15, 15);
        assert_eq!(size, 2400.0);
    }

    #[test]
    fn test_voice_count_never_exceeds_pool() {
        let mut pool = GrainVoicePool::new(42);
        pool.prepare(48_000.0);
        let gesture = GrainGesture::new();
        let params = GrainParams {
            density: 1.0,
            emitter: 1.0,
            size_ms: 30.0,
            ..GrainParams::default()
        };
        let mut ctx = context();
        for i in 0..20_000 {
            ctx.ppq = i as f64 / 24_000.0;
            pool.render_at_sample(&NOISE_BUFFER, &gesture, &params, 10_000.0, 48_000.0, &ctx);
            assert!(pool.active_voice_count() <= GRAIN_POOL_SIZE);
        }
        // at full density the pool should actually be busy
        assert!(pool.active_voice_count() > 0);
    }

    #[test]
    fn test_pool_produces_audio() {
        let mut pool = GrainVoicePool::new(7);
        pool.prepare(48_000.0);
        let gesture = GrainGesture::new();
        let params = GrainParams {
            density: 0.8,
            ..GrainParams::default()
        };
        let mut ctx = context();
        let mut energy = 0.0_f64;
        for i in 0..48_000 {
            ctx.ppq = i as f64 / 24_000.0;
            let (l, r) =
                pool.render_at_sample(&NOISE_BUFFER, &gesture, &params, 10_000.0, 48_000.0, &ctx);
            energy += (l * l + r * r) as f64;
            assert!(l.is_finite() && r.is_finite());
        }
        assert!(energy > 0.01, "pool rendered silence");
    }

    #[test]
    fn test_gesture_hold_ladder() {
        let mut gesture = GrainGesture::new();
        assert!(!gesture.is_frozen());

        gesture.press(3, 3_000.0, 0.0, 48_000.0);
        assert!(gesture.is_frozen());
        assert_eq!(gesture.held_count(), 1);
        assert_eq!(gesture.advance_center(999.0), 3_000.0);

        gesture.press(7, 7_000.0, 0.0, 48_000.0);
        gesture.press(12, 12_000.0, 0.0, 48_000.0);
        assert_eq!(gesture.held_count(), 3);

        // a fourth press evicts the oldest hold
        gesture.press(14, 14_000.0, 0.0, 48_000.0);
        assert_eq!(gesture.held_count(), 3);
        assert_eq!(gesture.held()[0].column, 7);

        gesture.release(14);
        gesture.release(12);
        gesture.release(7);
        assert!(!gesture.is_frozen());
        // centre follows the timeline again
        assert_eq!(gesture.advance_center(555.0), 555.0);
    }

    #[test]
    fn test_gesture_ramp_with_scratch() {
        let mut gesture = GrainGesture::new();
        gesture.press(0, 0.0, 0.0, 48_000.0);
        gesture.release(0);
        gesture.press(8, 8_000.0, 50.0, 48_000.0);

        // with scratch engaged the centre moves smoothly, not a snap
        let first = gesture.advance_center(0.0);
        assert!(first < 8_000.0);
        let mut centre = first;
        for _ in 0..200_000 {
            centre = gesture.advance_center(0.0);
            if centre == 8_000.0 {
                break;
            }
        }
        assert_eq!(centre, 8_000.0);
    }

    #[test]
    fn test_two_hold_grip_widens() {
        let mut gesture = GrainGesture::new();
        gesture.press(2, 2_000.0, 0.0, 48_000.0);
        gesture.press(14, 14_000.0, 0.0, 48_000.0);
        let base = GrainParams::default();
        let shaped = gesture.shape_params(&base);
        assert!(shaped.density > base.density);
        assert!(shaped.spread > base.spread);
        assert!(shaped.jitter > base.jitter);
        // size untouched by the two-hold grip
        assert_eq!(shaped.size_ms, base.size_ms);
    }

    #[test]
    fn test_three_hold_restores_on_release() {
        let mut gesture = GrainGesture::new();
        let base = GrainParams::default();
        gesture.press(3, 3_000.0, 0.0, 48_000.0);
        gesture.press(7, 7_000.0, 0.0, 48_000.0);
        gesture.press(12, 12_000.0, 0.0, 48_000.0);
        let shaped = gesture.shape_params(&base);
        assert!((shaped.size_ms - 2012.0).abs() < 0.5);

        gesture.release(12);
        let back = gesture.shape_params(&base);
        // base size is back once the grip drops to two holds
        assert_eq!(back.size_ms, base.size_ms);
    }

    #[test]
    fn test_neutral_blend_settles_toward_direct() {
        let mut pool = GrainVoicePool::new(9);
        pool.prepare(48_000.0);
        let gesture = GrainGesture::new();
        // everything neutral: deviation only from density's distance to rest
        let params = GrainParams::default();
        let mut ctx = context();
        for i in 0..10_000 {
            ctx.ppq = i as f64 / 24_000.0;
            pool.render_at_sample(&NOISE_BUFFER, &gesture, &params, 1_000.0, 48_000.0, &ctx);
        }
        assert!(pool.neutral_blend > 0.9, "blend {}", pool.neutral_blend);
    }

    #[test]
    fn test_arp_patterns_are_nonempty() {
        for index in 0..=6 {
            let mode = ArpMode::from_index(index);
            assert!(!mode.pattern().is_empty());
        }
    }

    #[test]
    fn test_preview_positions_normalized() {
        let mut pool = GrainVoicePool::new(3);
        pool.prepare(48_000.0);
        let gesture = GrainGesture::new();
        let params = GrainParams {
            density: 1.0,
            ..GrainParams::default()
        };
        let mut ctx = context();
        for i in 0..4_800 {
            ctx.ppq = i as f64 / 24_000.0;
            pool.render_at_sample(&NOISE_BUFFER, &gesture, &params, 24_000.0, 48_000.0, &ctx);
        }
        for position in pool.preview_positions(48_000.0) {
            assert!((0.0..=1.0).contains(&position));
        }
    }
}
