//! Engine orchestration: the piece between the host callback and the strips.
//!
//! Each block the engine locks its musical clock to the host position snapshot,
//! drains the quantized trigger queue for the block, and renders the strips in
//! segments split around the trigger offsets so every trigger lands on its exact
//! sample. Around each segment the per-strip mod sequencer is applied transiently.
//! Triggering a strip chokes the other members of its group, live input is kept in
//! the capture ring, pattern recorders replay their takes as fresh quantized
//! triggers, and the final mix is swept for non-finite samples before the host
//! sees it.

use atomic_float::AtomicF32;
use std::sync::atomic::Ordering;

use crate::live_record::LiveRecorder;
use crate::mod_sequencer::ModSequencer;
use crate::pattern::{PatternEvent, PatternRecorder};
use crate::quantize::{QuantisedTrigger, QuantizationClock};
use crate::resample::ResampleQuality;
use crate::strip::{Strip, StripRenderContext};

/// Number of strips in the instrument
pub const NUM_STRIPS: usize = 8;

/// Number of pattern recorders
pub const NUM_PATTERNS: usize = 4;

/// Fade length used when a group choke stops a strip, in seconds
const GROUP_STOP_FADE_SECONDS: f64 = 0.005;

/// PPQ distance treated as a backward transport jump
const TRANSPORT_JUMP_BEATS: f64 = 4.0;

/// The host position snapshot handed to each `process` call.
/// Fields the host cannot provide stay `None` and the engine free-runs on the
/// last known tempo.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionInfo {
    /// Whether the host transport is rolling
    pub is_playing: bool,
    /// Host position in quarter notes, when known
    pub ppq: Option<f64>,
    /// Host tempo in BPM, when known
    pub tempo: Option<f64>,
    /// Host time signature, when known
    pub time_signature: Option<(i32, i32)>,
}

/// A choke group: strips that silence each other
#[derive(Debug, Clone)]
pub struct Group {
    /// Strip indices belonging to the group
    pub members: Vec<usize>,
    /// Output gain applied to members
    pub gain: f32,
    /// Whether the whole group is muted
    pub muted: bool,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            gain: 1.0,
            muted: false,
        }
    }
}

/// The audio engine: strips, scheduler, groups, recorders and the master mix
pub struct Engine {
    strips: Vec<Strip>,
    mod_sequencers: Vec<ModSequencer>,
    groups: Vec<Group>,
    strip_group: [i32; NUM_STRIPS],
    clock: QuantizationClock,
    patterns: Vec<PatternRecorder>,
    live: LiveRecorder,

    master_volume: AtomicF32,
    input_monitor: AtomicF32,

    sample_rate: f64,
    global_sample: i64,
    current_beat: f64,
    host_was_playing: bool,

    // reusable audio-thread buffers, sized in prepare_to_play
    scratch_left: Vec<f32>,
    scratch_right: Vec<f32>,
    monitor_left: Vec<f32>,
    monitor_right: Vec<f32>,
    event_scratch: Vec<QuantisedTrigger>,
    pattern_scratch: Vec<PatternEvent>,
}

impl Engine {
    /// Constructor; `prepare_to_play` must run before audio
    pub fn new() -> Self {
        Self {
            strips: (0..NUM_STRIPS).map(Strip::new).collect(),
            mod_sequencers: (0..NUM_STRIPS).map(|_| ModSequencer::new()).collect(),
            groups: (0..NUM_STRIPS).map(|i| Group {
                members: vec![i],
                ..Group::default()
            })
            .collect(),
            strip_group: std::array::from_fn(|i| i as i32),
            clock: QuantizationClock::new(44_100.0),
            patterns: (0..NUM_PATTERNS).map(|_| PatternRecorder::new()).collect(),
            live: LiveRecorder::new(),
            master_volume: AtomicF32::new(0.9),
            input_monitor: AtomicF32::new(0.0),
            sample_rate: 44_100.0,
            global_sample: 0,
            current_beat: 0.0,
            host_was_playing: false,
            scratch_left: Vec::new(),
            scratch_right: Vec::new(),
            monitor_left: Vec::new(),
            monitor_right: Vec::new(),
            event_scratch: Vec::new(),
            pattern_scratch: Vec::new(),
        }
    }

    /// Allocate every buffer the audio path needs. Nothing below `process`
    /// allocates after this returns.
    pub fn prepare_to_play(&mut self, sample_rate: f64, max_block_size: usize) {
        self.sample_rate = sample_rate;
        self.clock.set_sample_rate(sample_rate);
        for strip in self.strips.iter_mut() {
            strip.prepare_to_play(sample_rate);
        }
        self.live.prepare(sample_rate);
        self.scratch_left = vec![0.0; max_block_size];
        self.scratch_right = vec![0.0; max_block_size];
        self.monitor_left = vec![0.0; max_block_size];
        self.monitor_right = vec![0.0; max_block_size];
        self.event_scratch = Vec::with_capacity(NUM_STRIPS * 4);
        self.pattern_scratch = Vec::with_capacity(256);
    }

    // ----- peer surface -----

    /// Borrow one strip
    pub fn strip(&self, index: usize) -> &Strip {
        &self.strips[index]
    }

    /// Mutably borrow one strip
    pub fn strip_mut(&mut self, index: usize) -> &mut Strip {
        &mut self.strips[index]
    }

    /// Borrow one strip's mod sequencer
    pub fn mod_sequencer(&self, index: usize) -> &ModSequencer {
        &self.mod_sequencers[index]
    }

    /// The scheduler, for peers that talk to it directly
    pub fn clock(&self) -> &QuantizationClock {
        &self.clock
    }

    /// The engine's current musical position in quarter notes
    pub fn current_beat(&self) -> f64 {
        self.current_beat
    }

    /// The absolute sample counter
    pub fn global_sample(&self) -> i64 {
        self.global_sample
    }

    /// Trigger a strip from a grid press, through the quantize grid or free.
    /// The press is also fed to any recording pattern.
    pub fn trigger_strip_with_quantization(
        &mut self,
        strip_index: usize,
        column: i32,
        use_quantize: bool,
    ) {
        if strip_index >= self.strips.len() {
            return;
        }
        for pattern in self.patterns.iter() {
            pattern.record_event(strip_index as i32, column, true, self.current_beat);
        }
        self.strips[strip_index].press_button(column);

        if use_quantize {
            self.clock
                .schedule_trigger(strip_index as i32, column, self.current_beat);
        } else {
            self.enforce_group_exclusivity(strip_index, false);
            self.strips[strip_index].trigger(column);
        }
    }

    /// Schedule a quantized trigger without the press bookkeeping
    pub fn schedule_quantized_trigger(&self, strip_index: i32, column: i32, current_ppq: f64) {
        self.clock.schedule_trigger(strip_index, column, current_ppq);
    }

    /// Handle a grid release: gesture/gate/scratch release plus pattern recording
    pub fn release_strip(&mut self, strip_index: usize, column: i32) {
        if strip_index >= self.strips.len() {
            return;
        }
        for pattern in self.patterns.iter() {
            pattern.record_event(strip_index as i32, column, false, self.current_beat);
        }
        self.strips[strip_index].release_button(column);
    }

    /// Drop a strip's pending quantized trigger (cancellation)
    pub fn clear_pending_triggers_for_strip(&self, strip_index: i32) {
        self.clock.clear_pending_for_strip(strip_index);
    }

    /// Stop every other member of the triggered strip's group.
    ///
    /// Membership is repaired on the way: a strip whose recorded group no longer
    /// lists it is re-added before the choke, so the choke always sees it.
    pub fn enforce_group_exclusivity(&mut self, strip_index: usize, immediate_stop: bool) {
        let Some(&group_index) = self.strip_group.get(strip_index) else {
            return;
        };
        if group_index < 0 || group_index as usize >= self.groups.len() {
            return;
        }
        let group_index = group_index as usize;
        if !self.groups[group_index].members.contains(&strip_index) {
            self.groups[group_index].members.push(strip_index);
        }

        let fade_samples = (GROUP_STOP_FADE_SECONDS * self.sample_rate) as u32;
        // indexed walk instead of an iterator so the strips stay borrowable
        for position in 0..self.groups[group_index].members.len() {
            let member = self.groups[group_index].members[position];
            if member == strip_index || member >= self.strips.len() {
                continue;
            }
            if self.strips[member].is_playing() {
                if immediate_stop {
                    self.strips[member].stop_immediate();
                } else {
                    self.strips[member].stop_with_fade(fade_samples);
                }
                self.clock.clear_pending_for_strip(member as i32);
            }
        }
    }

    /// Assign a strip to a group (or -1 for no choke group)
    pub fn set_strip_group(&mut self, strip_index: usize, group_index: i32) {
        if strip_index >= NUM_STRIPS {
            return;
        }
        // remove from the old group's membership
        if let Some(&old) = self.strip_group.get(strip_index) {
            if old >= 0 {
                if let Some(group) = self.groups.get_mut(old as usize) {
                    group.members.retain(|&m| m != strip_index);
                }
            }
        }
        self.strip_group[strip_index] = group_index;
        if group_index >= 0 {
            if let Some(group) = self.groups.get_mut(group_index as usize) {
                if !group.members.contains(&strip_index) {
                    group.members.push(strip_index);
                }
            }
        }
    }

    /// Setter for a group's output gain
    pub fn set_group_gain(&mut self, group_index: usize, gain: f32) {
        if let Some(group) = self.groups.get_mut(group_index) {
            group.gain = gain.clamp(0.0, 2.0);
        }
    }

    /// Mute or unmute a whole group
    pub fn set_group_muted(&mut self, group_index: usize, muted: bool) {
        if let Some(group) = self.groups.get_mut(group_index) {
            group.muted = muted;
        }
    }

    /// Stop every strip with the short group fade
    pub fn stop_all_strips(&mut self) {
        let fade_samples = (GROUP_STOP_FADE_SECONDS * self.sample_rate) as u32;
        for strip in self.strips.iter_mut() {
            if strip.is_playing() {
                strip.stop_with_fade(fade_samples);
            }
        }
        self.clock.clear_all_pending();
    }

    // ----- configuration -----

    /// Setter for the master output gain
    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume
            .store(volume.clamp(0.0, 2.0), Ordering::Release);
    }

    /// Setter for the quantize grid as a bar division
    pub fn set_quantize_division(&self, division: u32) {
        self.clock.set_quantize_division(division);
    }

    /// Setter for the inner-loop crossfade on all strips, in milliseconds
    pub fn set_crossfade_ms(&self, milliseconds: f32) {
        for strip in self.strips.iter() {
            strip.set_crossfade_ms(milliseconds);
        }
    }

    /// Setter for the retrigger fade on all strips, in milliseconds
    pub fn set_trigger_fade_ms(&self, milliseconds: f32) {
        for strip in self.strips.iter() {
            strip.set_trigger_fade_ms(milliseconds);
        }
    }

    /// Setter for the input monitor gain
    pub fn set_input_monitor_gain(&self, gain: f32) {
        self.input_monitor
            .store(gain.clamp(0.0, 1.0), Ordering::Release);
    }

    /// Setter for the pitch smoothing time on all strips
    pub fn set_pitch_smoothing_ms(&mut self, milliseconds: f32) {
        for strip in self.strips.iter_mut() {
            strip.set_pitch_smoothing_ms(milliseconds);
        }
    }

    /// Setter for the swing subdivision on all strips
    pub fn set_swing_division(&self, division: u32) {
        for strip in self.strips.iter() {
            strip.set_swing_division(division);
        }
    }

    /// Setter for the grain interpolation quality on all strips
    pub fn set_grain_quality(&mut self, quality: ResampleQuality) {
        for strip in self.strips.iter_mut() {
            strip.set_grain_quality(quality);
        }
    }

    // ----- patterns -----

    /// Begin recording grid presses into a pattern slot
    pub fn start_pattern_recording(&self, index: usize) {
        if let Some(pattern) = self.patterns.get(index) {
            pattern.start_recording(self.current_beat);
        }
    }

    /// Stop recording a pattern slot; playback arms from the next beat
    pub fn stop_pattern_recording(&self, index: usize) {
        if let Some(pattern) = self.patterns.get(index) {
            pattern.stop_recording(self.current_beat);
        }
    }

    /// Re-arm playback of a stored pattern
    pub fn play_pattern(&self, index: usize) {
        if let Some(pattern) = self.patterns.get(index) {
            pattern.start_playback(self.current_beat);
        }
    }

    /// Stop a pattern's playback, keeping the take
    pub fn stop_pattern(&self, index: usize) {
        if let Some(pattern) = self.patterns.get(index) {
            pattern.stop_playback();
        }
    }

    /// Erase a pattern slot entirely
    pub fn clear_pattern(&self, index: usize) {
        if let Some(pattern) = self.patterns.get(index) {
            pattern.clear();
        }
    }

    /// Borrow a pattern recorder
    pub fn pattern(&self, index: usize) -> &PatternRecorder {
        &self.patterns[index]
    }

    /// Cut the last `bars` bars of live input into a strip as its new sample
    pub fn capture_loop_to_strip(
        &self,
        strip_index: usize,
        bars: u32,
    ) -> Result<(), crate::sample_buffer::SampleLoadError> {
        let sample = self.live.capture_loop(self.clock.tempo(), bars)?;
        if let Some(strip) = self.strips.get(strip_index) {
            strip.set_sample(sample);
        }
        Ok(())
    }

    // ----- the block pipeline -----

    /// Render one host block.
    /// `input_*` may be empty (no live input); `output_*` are overwritten.
    pub fn process(
        &mut self,
        input_left: &[f32],
        input_right: &[f32],
        output_left: &mut [f32],
        output_right: &mut [f32],
        position: &PositionInfo,
    ) {
        let frames = output_left.len().min(output_right.len());
        if frames == 0 || frames > self.scratch_left.len() {
            // prepare_to_play has not run for this block size
            output_left.fill(0.0);
            output_right.fill(0.0);
            return;
        }

        // 1. tempo and musical position lock to the host snapshot
        if let Some(tempo) = position.tempo {
            if tempo > 0.0 {
                self.clock.set_tempo(tempo);
            }
        }
        let beats_per_sample = self.clock.tempo() / 60.0 / self.sample_rate;
        let ppq_valid = position.ppq.is_some();
        if let Some(host_ppq) = position.ppq {
            // a backward jump larger than a bar re-syncs and drops stale triggers
            if host_ppq < self.current_beat - TRANSPORT_JUMP_BEATS {
                self.clock.clear_all_pending();
            }
            self.current_beat = host_ppq;
            self.clock.set_ppq(host_ppq);
        }

        // transport falling edge silences everything
        if self.host_was_playing && !position.is_playing {
            self.stop_all_strips();
        }
        self.host_was_playing = position.is_playing;

        // 2 & 3. live input into the monitor scratch and the capture ring
        let monitor_gain = self.input_monitor.load(Ordering::Acquire);
        for i in 0..frames {
            let in_left = input_left.get(i).copied().unwrap_or(0.0);
            // a mono input feeds both sides
            let in_right = input_right.get(i).copied().unwrap_or(in_left);
            self.monitor_left[i] = in_left;
            self.monitor_right[i] = in_right;
            self.live.process_input(in_left, in_right);
        }

        // 4. start from silence
        output_left[..frames].fill(0.0);
        output_right[..frames].fill(0.0);

        if position.is_playing {
            // 5. drain this block's triggers
            let block_end = self.global_sample + frames as i64;
            let mut events = std::mem::take(&mut self.event_scratch);
            events.clear();
            self.clock.take_events_before_into(block_end, &mut events);

            // 6. walk the events in order, rendering up to each offset first
            let mut processed = 0_usize;
            let mut index = 0_usize;
            while index < events.len() {
                let offset = ((events[index].target_sample_global - self.global_sample)
                    .max(0) as usize)
                    .min(frames);
                if offset > processed {
                    self.render_segment(
                        processed,
                        offset,
                        output_left,
                        output_right,
                        beats_per_sample,
                        ppq_valid,
                    );
                    processed = offset;
                }
                // fire every event that lands on this offset, in queue order
                while index < events.len() {
                    let event_offset = ((events[index].target_sample_global
                        - self.global_sample)
                        .max(0) as usize)
                        .min(frames);
                    if event_offset != offset {
                        break;
                    }
                    self.fire_trigger(&events[index], beats_per_sample, offset, ppq_valid);
                    index += 1;
                }
            }
            self.event_scratch = events;

            // 7. the tail after the last trigger
            if processed < frames {
                self.render_segment(
                    processed,
                    frames,
                    output_left,
                    output_right,
                    beats_per_sample,
                    ppq_valid,
                );
            }
        }

        // 9. the host never sees a non-finite sample
        for i in 0..frames {
            if !output_left[i].is_finite() {
                output_left[i] = 0.0;
            }
            if !output_right[i].is_finite() {
                output_right[i] = 0.0;
            }
        }

        // 10. master gain
        let master = self.master_volume.load(Ordering::Acquire);
        for i in 0..frames {
            output_left[i] *= master;
            output_right[i] *= master;
        }

        // 11. input monitor mix
        if monitor_gain > 0.0 {
            for i in 0..frames {
                output_left[i] += self.monitor_left[i] * monitor_gain;
                output_right[i] += self.monitor_right[i] * monitor_gain;
            }
        }

        // 12. advance engine time; PPQ and samples move together
        let block_start_beat = self.current_beat;
        self.global_sample += frames as i64;
        if position.is_playing {
            self.current_beat += frames as f64 * beats_per_sample;
        }
        self.clock.advance_to(self.global_sample, self.current_beat);

        // 13. pattern playback re-fires recorded presses as quantized triggers
        if position.is_playing {
            self.process_pattern_playback(block_start_beat, self.current_beat);
        }
    }

    /// Render one segment of every strip, with the mod sequencer applied
    /// transiently around each strip's render.
    fn render_segment(
        &mut self,
        start: usize,
        end: usize,
        output_left: &mut [f32],
        output_right: &mut [f32],
        beats_per_sample: f64,
        ppq_valid: bool,
    ) {
        if end <= start {
            return;
        }
        let segment_ppq = self.current_beat + start as f64 * beats_per_sample;
        let segment_sample = self.global_sample + start as i64;
        let ctx = StripRenderContext {
            sample_rate: self.sample_rate,
            tempo: self.clock.tempo(),
            ppq: segment_ppq,
            global_sample: segment_sample,
            host_playing: true,
            ppq_valid,
            quant_beats: self.clock.quant_beats(),
        };

        for (index, strip) in self.strips.iter_mut().enumerate() {
            if !strip.is_playing() {
                continue;
            }

            let modulation = self.mod_sequencers[index].value_for_column(strip.current_column());
            let snapshot = modulation.map(|(target, value)| {
                let snap = strip.mod_snapshot(target);
                strip.apply_modulation(target, snap, value);
                (target, snap)
            });

            self.scratch_left[start..end].fill(0.0);
            self.scratch_right[start..end].fill(0.0);
            strip.process(
                &mut self.scratch_left[start..end],
                &mut self.scratch_right[start..end],
                &ctx,
            );

            if let Some((target, snap)) = snapshot {
                strip.restore_modulation(target, snap);
            }

            // group gain and mute on the way into the mix
            let (gain, muted) = match self.strip_group.get(index) {
                Some(&g) if g >= 0 => self
                    .groups
                    .get(g as usize)
                    .map_or((1.0, false), |group| (group.gain, group.muted)),
                _ => (1.0, false),
            };
            if muted {
                continue;
            }
            for i in start..end {
                output_left[i] += self.scratch_left[i] * gain;
                output_right[i] += self.scratch_right[i] * gain;
            }
        }
    }

    /// Apply one scheduled trigger: group choke first, then the strip jump
    fn fire_trigger(
        &mut self,
        event: &QuantisedTrigger,
        beats_per_sample: f64,
        offset: usize,
        ppq_valid: bool,
    ) {
        let strip_index = event.strip_index as usize;
        if strip_index >= self.strips.len() {
            // the scheduler holds indices, not strip handles; a stale index is
            // dropped silently
            return;
        }

        self.enforce_group_exclusivity(strip_index, false);

        let tempo = self.clock.tempo();
        let trigger_ppq = if ppq_valid {
            event.target_ppq
        } else {
            self.current_beat + offset as f64 * beats_per_sample
        };
        self.strips[strip_index].trigger_at_sample(
            event.column,
            tempo,
            event.target_sample_global,
            trigger_ppq,
            ppq_valid,
        );
    }

    /// Replay pattern events that fall inside the advanced beat window
    fn process_pattern_playback(&mut self, from_beat: f64, to_beat: f64) {
        let mut replayed = std::mem::take(&mut self.pattern_scratch);
        replayed.clear();
        for pattern in self.patterns.iter() {
            pattern.process_events_for_beat_window(from_beat, to_beat, |event| {
                replayed.push(*event);
            });
        }
        for event in replayed.iter() {
            let strip_index = event.strip as usize;
            if strip_index >= self.strips.len() {
                continue;
            }
            if event.is_note_on {
                self.clock
                    .schedule_trigger(event.strip, event.column, self.current_beat);
            } else {
                self.strips[strip_index].release_button(event.column);
            }
        }
        self.pattern_scratch = replayed;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Engine, PositionInfo, NUM_STRIPS};
    use crate::sample_buffer::SampleBuffer;

    const SR: f64 = 48_000.0;

    fn engine_with_samples() -> Engine {
        let mut engine = Engine::new();
        engine.prepare_to_play(SR, 4_096);
        for i in 0..NUM_STRIPS {
            let data = vec![0.5_f32; 96_000];
            engine
                .strip(i)
                .set_sample(SampleBuffer::from_channels(vec![data], SR as f32).unwrap());
        }
        engine
    }

    fn playing_position(ppq: f64) -> PositionInfo {
        PositionInfo {
            is_playing: true,
            ppq: Some(ppq),
            tempo: Some(120.0),
            time_signature: Some((4, 4)),
        }
    }

    /// Render `frames` samples in fixed blocks, returning all output
    fn run(engine: &mut Engine, start_ppq: f64, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let beats_per_sample = 120.0 / 60.0 / SR;
        let mut left = Vec::with_capacity(frames);
        let mut right = Vec::with_capacity(frames);
        let mut ppq = start_ppq;
        let mut remaining = frames;
        while remaining > 0 {
            let block = remaining.min(1_024);
            let mut out_l = vec![0.0_f32; block];
            let mut out_r = vec![0.0_f32; block];
            engine.process(&[], &[], &mut out_l, &mut out_r, &playing_position(ppq));
            left.extend_from_slice(&out_l);
            right.extend_from_slice(&out_r);
            ppq += block as f64 * beats_per_sample;
            remaining -= block;
        }
        (left, right)
    }

    #[test]
    fn test_trigger_fires_sample_accurately_inside_block() {
        let mut engine = engine_with_samples();
        engine.set_quantize_division(8);

        // prime the clock position, then schedule: press at ppq 0.37 lands on 0.5,
        // which is 3120 samples into the stream at 120 bpm
        let mut out_l = vec![0.0_f32; 64];
        let mut out_r = vec![0.0_f32; 64];
        engine.process(&[], &[], &mut out_l, &mut out_r, &playing_position(0.0));

        engine.schedule_quantized_trigger(0, 0, 0.37);

        let (left, _) = run(&mut engine, 64.0 / 24_000.0, 8_192);
        let target = (0.5 - 0.37) * 24_000.0; // samples after the schedule point
        let target_index = target as usize;

        // silent before the grid line, sounding at it
        assert!(left[target_index.saturating_sub(16)].abs() < 1e-6);
        let after: f32 = left[target_index..target_index + 64]
            .iter()
            .map(|s| s.abs())
            .sum();
        assert!(after > 0.0, "no audio after the scheduled trigger");
    }

    #[test]
    fn test_group_choke_stops_other_member() {
        let mut engine = engine_with_samples();
        engine.set_strip_group(0, 0);
        engine.set_strip_group(1, 0);

        engine.trigger_strip_with_quantization(0, 0, false);
        run(&mut engine, 0.0, 2_048);
        assert!(engine.strip(0).is_playing());

        engine.trigger_strip_with_quantization(1, 4, false);
        run(&mut engine, 2_048.0 / 24_000.0, 2_048);
        assert!(!engine.strip(0).is_playing(), "choke left strip 0 running");
        assert!(engine.strip(1).is_playing());
    }

    #[test]
    fn test_strips_without_shared_group_coexist() {
        let mut engine = engine_with_samples();
        engine.trigger_strip_with_quantization(0, 0, false);
        engine.trigger_strip_with_quantization(1, 0, false);
        run(&mut engine, 0.0, 2_048);
        assert!(engine.strip(0).is_playing());
        assert!(engine.strip(1).is_playing());
    }

    #[test]
    fn test_gate_closed_drops_second_press() {
        let mut engine = engine_with_samples();
        engine.set_quantize_division(4);
        engine.trigger_strip_with_quantization(3, 4, true);
        engine.trigger_strip_with_quantization(3, 7, true);
        assert_eq!(engine.clock().pending_count(), 1);
    }

    #[test]
    fn test_master_gain_scales_output() {
        let mut engine = engine_with_samples();
        engine.trigger_strip_with_quantization(0, 0, false);
        let (full, _) = run(&mut engine, 0.0, 2_048);

        let mut engine = engine_with_samples();
        engine.set_master_volume(0.25);
        engine.trigger_strip_with_quantization(0, 0, false);
        let (quarter, _) = run(&mut engine, 0.0, 2_048);

        let full_energy: f32 = full.iter().map(|s| s * s).sum();
        let quarter_energy: f32 = quarter.iter().map(|s| s * s).sum();
        assert!(quarter_energy < full_energy * 0.1);
    }

    #[test]
    fn test_output_finite_with_hostile_sample() {
        let mut engine = Engine::new();
        engine.prepare_to_play(SR, 4_096);
        let mut data = vec![0.5_f32; 48_000];
        for i in (0..data.len()).step_by(97) {
            data[i] = f32::NAN;
        }
        engine
            .strip(0)
            .set_sample(SampleBuffer::from_channels(vec![data], SR as f32).unwrap());
        engine.trigger_strip_with_quantization(0, 0, false);

        let (left, right) = run(&mut engine, 0.0, 8_192);
        for (l, r) in left.iter().zip(right.iter()) {
            assert!(l.is_finite() && r.is_finite());
        }
    }

    #[test]
    fn test_transport_stop_silences_strips() {
        let mut engine = engine_with_samples();
        engine.trigger_strip_with_quantization(0, 0, false);
        run(&mut engine, 0.0, 1_024);
        assert!(engine.strip(0).is_playing());

        // host stops: strips fade and the queue is flushed
        let stopped = PositionInfo {
            is_playing: false,
            ppq: Some(1.0),
            tempo: Some(120.0),
            time_signature: Some((4, 4)),
        };
        let mut out_l = vec![0.0_f32; 1_024];
        let mut out_r = vec![0.0_f32; 1_024];
        engine.process(&[], &[], &mut out_l, &mut out_r, &stopped);
        // the stop fade needs one playing block to run out
        run(&mut engine, 1.0, 1_024);
        assert!(!engine.strip(0).is_playing());
    }

    #[test]
    fn test_input_monitor_mixes_input() {
        let mut engine = engine_with_samples();
        engine.set_input_monitor_gain(1.0);
        let input = vec![0.25_f32; 1_024];
        let mut out_l = vec![0.0_f32; 1_024];
        let mut out_r = vec![0.0_f32; 1_024];
        engine.process(&input, &input, &mut out_l, &mut out_r, &playing_position(0.0));
        assert!((out_l[500] - 0.25).abs() < 1e-6);
        // mono fix-up: an empty right input mirrors the left
        let mut out_l = vec![0.0_f32; 1_024];
        let mut out_r = vec![0.0_f32; 1_024];
        engine.process(&input, &[], &mut out_l, &mut out_r, &playing_position(0.1));
        assert!((out_r[500] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_capture_loop_installs_sample() {
        let mut engine = engine_with_samples();
        // feed two bars of input
        let beats_per_sample = 120.0 / 60.0 / SR;
        let mut ppq = 0.0;
        for _ in 0..200 {
            let input = vec![0.3_f32; 1_024];
            let mut out_l = vec![0.0_f32; 1_024];
            let mut out_r = vec![0.0_f32; 1_024];
            engine.process(&input, &input, &mut out_l, &mut out_r, &playing_position(ppq));
            ppq += 1_024.0 * beats_per_sample;
        }
        engine.strip(2).clear_sample();
        engine.capture_loop_to_strip(2, 1).unwrap();
        // one bar at 120 bpm / 48 kHz
        assert_eq!(engine.strip(2).sample_length_frames(), 96_000);
    }

    #[test]
    fn test_pattern_roundtrip_refires_triggers() {
        let mut engine = engine_with_samples();
        engine.set_quantize_division(16);

        engine.start_pattern_recording(0);
        run(&mut engine, 0.0, 12_000); // to beat 0.5
        engine.trigger_strip_with_quantization(5, 3, true);
        run(&mut engine, 0.5, 84_000); // through beat 4.0
        engine.stop_pattern_recording(0);
        assert!(engine.pattern(0).is_playing());

        // run until the pattern has looped at least once; the replay schedules
        // fresh triggers for strip 5
        engine.strip_mut(5).stop_immediate();
        run(&mut engine, 4.0, 96_000 * 2);
        assert!(
            engine.strip(5).is_playing(),
            "pattern playback never re-triggered the strip"
        );
    }

    #[test]
    fn test_backward_transport_jump_flushes_queue() {
        let mut engine = engine_with_samples();
        run(&mut engine, 20.0, 1_024);
        engine.trigger_strip_with_quantization(0, 0, true);
        assert_eq!(engine.clock().pending_count(), 1);

        // the host loops back to bar 1
        run(&mut engine, 0.0, 1_024);
        assert_eq!(engine.clock().pending_count(), 0);
    }
}
