//! Core DSP Processors
//!
//! This module provides the leaf nodes of the synthesizer graph:
//! oscillators, the state-variable filter, the ADSR envelope, trigger
//! routers, parameter smoothing, the feedback delay, the modulation matrix,
//! and small arithmetic helpers used for wiring.

use crate::graph::{ProcessContext, Processor};
use crate::polyphony::TRIGGER_RESET;
use crate::port::{PortDef, PortSpec, ValueRef};
use crate::rng::Rng;
use core::f64::consts::{PI, TAU};
use libm::Libm;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default one-pole smoothing coefficient for parameter ramps.
pub const DEFAULT_SMOOTHING: f64 = 0.01;

/// Lowest cutoff the filter will accept, in Hz.
pub const MIN_CUTOFF: f64 = 20.0;

/// Distance kept below Nyquist when clamping cutoff, in Hz.
pub const CUTOFF_MARGIN: f64 = 100.0;

// Each noise oscillator takes the next stream off this counter so cloned
// voices don't all play the same noise.
static NOISE_STREAM: AtomicU64 = AtomicU64::new(1);

fn next_noise_rng() -> Rng {
    Rng::from_seed(NOISE_STREAM.fetch_add(1, Ordering::Relaxed))
}

/// Oscillator waveform selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sin,
    Triangle,
    Square,
    DownSaw,
    UpSaw,
    ThreeStep,
    FourStep,
    EightStep,
    ThreePyramid,
    FivePyramid,
    NinePyramid,
    WhiteNoise,
}

impl Waveform {
    pub const COUNT: usize = 12;

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Waveform::Sin,
            1 => Waveform::Triangle,
            2 => Waveform::Square,
            3 => Waveform::DownSaw,
            4 => Waveform::UpSaw,
            5 => Waveform::ThreeStep,
            6 => Waveform::FourStep,
            7 => Waveform::EightStep,
            8 => Waveform::ThreePyramid,
            9 => Waveform::FivePyramid,
            10 => Waveform::NinePyramid,
            _ => Waveform::WhiteNoise,
        }
    }

    /// Display names, in selector order
    pub fn strings() -> &'static [&'static str] {
        &[
            "sin",
            "triangle",
            "square",
            "down saw",
            "up saw",
            "three step",
            "four step",
            "eight step",
            "three pyramid",
            "five pyramid",
            "nine pyramid",
            "white noise",
        ]
    }
}

#[inline]
fn triangle(phase: f64) -> f64 {
    1.0 - 4.0 * Libm::<f64>::fabs(phase - 0.5)
}

#[inline]
fn step_wave(phase: f64, steps: f64) -> f64 {
    let level = Libm::<f64>::floor(phase * steps).min(steps - 1.0);
    -1.0 + 2.0 * level / (steps - 1.0)
}

#[inline]
fn pyramid_wave(phase: f64, levels: f64) -> f64 {
    let quantized = Libm::<f64>::round((triangle(phase) + 1.0) * 0.5 * (levels - 1.0));
    -1.0 + 2.0 * quantized / (levels - 1.0)
}

/// Periodic waveform generator
///
/// Maintains a phase accumulator in [0, 1). A non-zero reset sample zeroes
/// the phase at that sample index; the phase-mod input offsets the lookup
/// phase (used for oscillator cross modulation). Output is in [-1, 1].
/// LFOs are the same processor run at low frequency.
#[derive(Clone)]
pub struct Oscillator {
    phase: f64,
    sample_rate: f64,
    rng: Rng,
    spec: PortSpec,
}

impl Oscillator {
    pub const WAVEFORM: usize = 0;
    pub const FREQUENCY: usize = 1;
    pub const PHASE_MOD: usize = 2;
    pub const RESET: usize = 3;

    pub fn new() -> Self {
        Self {
            phase: 0.0,
            sample_rate: 44100.0,
            rng: next_noise_rng(),
            spec: PortSpec {
                inputs: vec![
                    PortDef::control("waveform"),
                    PortDef::audio("frequency"),
                    PortDef::audio("phase mod"),
                    PortDef::trigger("reset"),
                ],
                outputs: vec![PortDef::audio("audio")],
            },
        }
    }

    #[inline]
    fn sample(&mut self, wave: Waveform, phase: f64) -> f64 {
        match wave {
            Waveform::Sin => Libm::<f64>::sin(phase * TAU),
            Waveform::Triangle => triangle(phase),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::DownSaw => 1.0 - 2.0 * phase,
            Waveform::UpSaw => 2.0 * phase - 1.0,
            Waveform::ThreeStep => step_wave(phase, 3.0),
            Waveform::FourStep => step_wave(phase, 4.0),
            Waveform::EightStep => step_wave(phase, 8.0),
            Waveform::ThreePyramid => pyramid_wave(phase, 3.0),
            Waveform::FivePyramid => pyramid_wave(phase, 5.0),
            Waveform::NinePyramid => pyramid_wave(phase, 9.0),
            Waveform::WhiteNoise => self.rng.next_f64_bipolar(),
        }
    }
}

impl Default for Oscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Oscillator {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let wave = Waveform::from_index(ctx.control(Self::WAVEFORM).round().max(0.0) as usize);

        for i in 0..ctx.frames {
            if ctx.inputs[Self::RESET][i] != 0.0 {
                self.phase = 0.0;
            }

            let lookup = self.phase + ctx.inputs[Self::PHASE_MOD][i];
            let lookup = lookup - Libm::<f64>::floor(lookup);
            let value = self.sample(wave, lookup);
            ctx.outputs[0].as_mut_slice()[i] = value;

            let new_phase = self.phase + ctx.inputs[Self::FREQUENCY][i] / self.sample_rate;
            self.phase = new_phase - Libm::<f64>::floor(new_phase);
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        let mut clone = self.clone();
        // Cloned voices get their own noise stream.
        clone.rng = next_noise_rng();
        Box::new(clone)
    }

    fn type_name(&self) -> &'static str {
        "oscillator"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Filter response selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    LowPass,
    HighPass,
    BandPass,
}

impl FilterMode {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => FilterMode::LowPass,
            1 => FilterMode::HighPass,
            _ => FilterMode::BandPass,
        }
    }

    pub fn strings() -> &'static [&'static str] {
        &["low pass", "high pass", "band pass"]
    }
}

/// State Variable Filter
///
/// A 12dB/oct multimode filter with two integrator states. Mode switching is
/// sample-accurate. Non-finite integrator state resets to zero and the rest
/// of the block is silent.
#[derive(Clone)]
pub struct Filter {
    low: f64,
    band: f64,
    sample_rate: f64,
    spec: PortSpec,
}

impl Filter {
    pub const AUDIO: usize = 0;
    pub const MODE: usize = 1;
    pub const CUTOFF: usize = 2;
    pub const RESONANCE: usize = 3;
    pub const RESET: usize = 4;

    pub fn new() -> Self {
        Self {
            low: 0.0,
            band: 0.0,
            sample_rate: 44100.0,
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("audio"),
                    PortDef::control("mode"),
                    PortDef::audio("cutoff"),
                    PortDef::audio("resonance"),
                    PortDef::trigger("reset"),
                ],
                outputs: vec![PortDef::audio("audio")],
            },
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Filter {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let max_cutoff = 0.5 * self.sample_rate - CUTOFF_MARGIN;

        for i in 0..ctx.frames {
            if ctx.inputs[Self::RESET][i] != 0.0 {
                self.low = 0.0;
                self.band = 0.0;
            }

            let mode = FilterMode::from_index(ctx.inputs[Self::MODE][i].round().max(0.0) as usize);
            let cutoff = ctx.inputs[Self::CUTOFF][i].clamp(MIN_CUTOFF, max_cutoff);
            let q = ctx.inputs[Self::RESONANCE][i].clamp(0.5, 15.0);
            let damp = 1.0 / q;
            // Keeps the integrator poles inside the unit circle across the
            // full Q range: f^2 + 2*f*damp must stay below 4.
            let f_stable = Libm::<f64>::sqrt(damp * damp + 3.6) - damp;
            let f = (2.0 * Libm::<f64>::sin(PI * cutoff / self.sample_rate))
                .min(0.99)
                .min(f_stable);

            let input = ctx.inputs[Self::AUDIO][i];
            self.low += f * self.band;
            let high = input - self.low - damp * self.band;
            self.band += f * high;

            if !self.low.is_finite() || !self.band.is_finite() {
                self.low = 0.0;
                self.band = 0.0;
                ctx.outputs[0].as_mut_slice()[i..ctx.frames].fill(0.0);
                return;
            }

            ctx.outputs[0].as_mut_slice()[i] = match mode {
                FilterMode::LowPass => self.low,
                FilterMode::HighPass => high,
                FilterMode::BandPass => self.band,
            };
        }
    }

    fn reset(&mut self) {
        self.low = 0.0;
        self.band = 0.0;
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "filter"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EnvelopeStage {
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// ADSR Envelope Generator
///
/// Linear segments. A trigger sample starts the attack from the current
/// level; a reset trigger zeroes the level first and fires `finished` at
/// that sample (a freshly allocated voice uses this to propagate its note
/// through the trigger chain). The release starts on the first non-trigger
/// sample where `held` is low, which also covers a note released on the
/// same sample it started. `finished` fires exactly once when a release
/// completes.
#[derive(Clone)]
pub struct Envelope {
    stage: EnvelopeStage,
    value: f64,
    slope: f64,
    sample_rate: f64,
    spec: PortSpec,
}

impl Envelope {
    pub const ATTACK: usize = 0;
    pub const DECAY: usize = 1;
    pub const SUSTAIN: usize = 2;
    pub const RELEASE: usize = 3;
    pub const TRIGGER: usize = 4;
    pub const HELD: usize = 5;

    pub const VALUE: usize = 0;
    pub const FINISHED: usize = 1;
    pub const PHASE: usize = 2;

    pub fn new() -> Self {
        Self {
            stage: EnvelopeStage::Off,
            value: 0.0,
            slope: 0.0,
            sample_rate: 44100.0,
            spec: PortSpec {
                inputs: vec![
                    PortDef::control("attack"),
                    PortDef::control("decay"),
                    PortDef::audio("sustain"),
                    PortDef::control("release"),
                    PortDef::trigger("trigger"),
                    PortDef::audio("held"),
                ],
                outputs: vec![
                    PortDef::audio("value"),
                    PortDef::trigger("finished"),
                    PortDef::control("phase"),
                ],
            },
        }
    }

    fn enter_attack(&mut self, attack_seconds: f64) {
        self.stage = EnvelopeStage::Attack;
        let samples = (attack_seconds * self.sample_rate).max(1.0);
        self.slope = (1.0 - self.value) / samples;
    }

    fn stage_index(&self) -> f64 {
        match self.stage {
            EnvelopeStage::Off => 0.0,
            EnvelopeStage::Attack => 1.0,
            EnvelopeStage::Decay => 2.0,
            EnvelopeStage::Sustain => 3.0,
            EnvelopeStage::Release => 4.0,
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Envelope {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let attack = ctx.control(Self::ATTACK).max(0.0);
        let decay = ctx.control(Self::DECAY).max(0.0);
        let release = ctx.control(Self::RELEASE).max(0.0);

        for i in 0..ctx.frames {
            let mut finished = 0.0;

            let trigger = ctx.inputs[Self::TRIGGER][i];
            if trigger == TRIGGER_RESET {
                self.value = 0.0;
                finished = 1.0;
                self.enter_attack(attack);
            } else if trigger != 0.0 {
                self.enter_attack(attack);
            }

            let held = ctx.inputs[Self::HELD][i];
            let running = matches!(
                self.stage,
                EnvelopeStage::Attack | EnvelopeStage::Decay | EnvelopeStage::Sustain
            );
            if trigger == 0.0 && held <= 0.5 && running {
                self.stage = EnvelopeStage::Release;
                let samples = (release * self.sample_rate).max(1.0);
                self.slope = self.value / samples;
            }

            let sustain = ctx.inputs[Self::SUSTAIN][i].clamp(0.0, 1.0);
            match self.stage {
                EnvelopeStage::Off => {
                    self.value = 0.0;
                }
                EnvelopeStage::Attack => {
                    self.value += self.slope;
                    if self.value >= 1.0 {
                        self.value = 1.0;
                        self.stage = EnvelopeStage::Decay;
                        let samples = (decay * self.sample_rate).max(1.0);
                        self.slope = (1.0 - sustain) / samples;
                    }
                }
                EnvelopeStage::Decay => {
                    self.value -= self.slope;
                    if self.value <= sustain {
                        self.value = sustain;
                        self.stage = EnvelopeStage::Sustain;
                    }
                }
                EnvelopeStage::Sustain => {
                    self.value = sustain;
                }
                EnvelopeStage::Release => {
                    self.value -= self.slope;
                    if self.value <= 0.0 {
                        self.value = 0.0;
                        self.stage = EnvelopeStage::Off;
                        finished = 1.0;
                    }
                }
            }

            ctx.outputs[Self::VALUE].as_mut_slice()[i] = self.value;
            ctx.outputs[Self::FINISHED].as_mut_slice()[i] = finished;
            let phase = self.stage_index();
            ctx.outputs[Self::PHASE].as_mut_slice()[i] = phase;
        }
    }

    fn reset(&mut self) {
        self.stage = EnvelopeStage::Off;
        self.value = 0.0;
        self.slope = 0.0;
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "envelope"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Legato trigger router
///
/// Splits note-on triggers: `retrigger` fires when legato is off or the
/// voice was not already held; `remain` fires when a note-on lands on a
/// held voice with legato on (pitch moves, envelopes keep running).
#[derive(Clone)]
pub struct LegatoFilter {
    last_held: f64,
    spec: PortSpec,
}

impl LegatoFilter {
    pub const LEGATO: usize = 0;
    pub const TRIGGER: usize = 1;
    pub const HELD: usize = 2;

    pub const RETRIGGER: usize = 0;
    pub const REMAIN: usize = 1;

    pub fn new() -> Self {
        Self {
            last_held: 0.0,
            spec: PortSpec {
                inputs: vec![
                    PortDef::control("legato"),
                    PortDef::trigger("trigger"),
                    PortDef::audio("held"),
                ],
                outputs: vec![PortDef::trigger("retrigger"), PortDef::trigger("remain")],
            },
        }
    }
}

impl Default for LegatoFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for LegatoFilter {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let legato = ctx.control(Self::LEGATO) >= 0.5;

        for i in 0..ctx.frames {
            let trigger = ctx.inputs[Self::TRIGGER][i];
            let (retrigger, remain) = if trigger != 0.0 {
                if !legato || self.last_held <= 0.5 {
                    (trigger, 0.0)
                } else {
                    (0.0, trigger)
                }
            } else {
                (0.0, 0.0)
            };
            ctx.outputs[Self::RETRIGGER].as_mut_slice()[i] = retrigger;
            ctx.outputs[Self::REMAIN].as_mut_slice()[i] = remain;
            self.last_held = ctx.inputs[Self::HELD][i];
        }
    }

    fn reset(&mut self) {
        self.last_held = 0.0;
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "legato_filter"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Portamento trigger router
///
/// Emits a `jump` trigger when the pitch slope should snap instead of
/// glide: always when portamento is off, and on non-overlapping notes when
/// portamento is in auto mode.
#[derive(Clone)]
pub struct PortamentoFilter {
    last_held: f64,
    spec: PortSpec,
}

impl PortamentoFilter {
    pub const STATE: usize = 0;
    pub const TRIGGER: usize = 1;
    pub const HELD: usize = 2;

    pub const OFF: usize = 0;
    pub const AUTO: usize = 1;
    pub const ON: usize = 2;

    pub fn new() -> Self {
        Self {
            last_held: 0.0,
            spec: PortSpec {
                inputs: vec![
                    PortDef::control("state"),
                    PortDef::trigger("trigger"),
                    PortDef::audio("held"),
                ],
                outputs: vec![PortDef::trigger("jump")],
            },
        }
    }

    pub fn strings() -> &'static [&'static str] {
        &["off", "auto", "on"]
    }
}

impl Default for PortamentoFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for PortamentoFilter {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let state = ctx.control(Self::STATE).round().max(0.0) as usize;

        for i in 0..ctx.frames {
            let trigger = ctx.inputs[Self::TRIGGER][i];
            let jump = trigger != 0.0
                && (state == Self::OFF || (state == Self::AUTO && self.last_held <= 0.5));
            ctx.outputs[0].as_mut_slice()[i] = if jump { trigger } else { 0.0 };
            self.last_held = ctx.inputs[Self::HELD][i];
        }
    }

    fn reset(&mut self) {
        self.last_held = 0.0;
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "portamento_filter"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Fires when either trigger input fires (first input wins a tie)
#[derive(Clone)]
pub struct TriggerCombiner {
    spec: PortSpec,
}

impl TriggerCombiner {
    pub const A: usize = 0;
    pub const B: usize = 1;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::trigger("a"), PortDef::trigger("b")],
                outputs: vec![PortDef::trigger("out")],
            },
        }
    }
}

impl Default for TriggerCombiner {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for TriggerCombiner {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let a = ctx.inputs[Self::A][i];
            let b = ctx.inputs[Self::B][i];
            ctx.outputs[0].as_mut_slice()[i] = if a != 0.0 { a } else { b };
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "trigger_combiner"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Latches a value signal on each trigger
///
/// Holds the most recently latched `wait` sample on the output until the
/// next trigger. Defers note-frequency updates until the articulation chain
/// says the pitch may move.
#[derive(Clone)]
pub struct TriggerWait {
    latched: f64,
    spec: PortSpec,
}

impl TriggerWait {
    pub const WAIT: usize = 0;
    pub const TRIGGER: usize = 1;

    pub fn new() -> Self {
        Self {
            latched: 0.0,
            spec: PortSpec {
                inputs: vec![PortDef::audio("wait"), PortDef::trigger("trigger")],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for TriggerWait {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for TriggerWait {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            if ctx.inputs[Self::TRIGGER][i] != 0.0 {
                self.latched = ctx.inputs[Self::WAIT][i];
            }
            ctx.outputs[0].as_mut_slice()[i] = self.latched;
        }
    }

    fn reset(&mut self) {
        self.latched = 0.0;
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "trigger_wait"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One-pole lowpass on a shared control scalar
///
/// Ramps toward the target every sample so abrupt knob moves don't click.
/// `set_hard` bypasses the smoothing.
#[derive(Clone)]
pub struct SmoothValue {
    target: ValueRef,
    current: f64,
    alpha: f64,
    spec: PortSpec,
}

impl SmoothValue {
    pub fn new(initial: f64) -> Self {
        Self {
            target: ValueRef::new(initial),
            current: initial,
            alpha: DEFAULT_SMOOTHING,
            spec: PortSpec {
                inputs: vec![],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }

    /// The shared scalar a control writes to
    pub fn value_ref(&self) -> ValueRef {
        self.target.clone()
    }

    /// Set the target and snap to it immediately
    pub fn set_hard(&mut self, value: f64) {
        self.target.set(value);
        self.current = value;
    }
}

impl Processor for SmoothValue {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let target = self.target.get();
        for i in 0..ctx.frames {
            self.current += self.alpha * (target - self.current);
            ctx.outputs[0].as_mut_slice()[i] = self.current;
        }
    }

    fn reset(&mut self) {
        self.current = self.target.get();
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "smooth_value"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Linear ramp toward a target value
///
/// Re-targeting starts a fresh ramp from the current value over
/// `run seconds`; a jump trigger (or the very first target seen) snaps.
/// Carries per-note pitch with portamento.
#[derive(Clone)]
pub struct LinearSlope {
    current: f64,
    step: f64,
    last_target: f64,
    initialized: bool,
    sample_rate: f64,
    spec: PortSpec,
}

impl LinearSlope {
    pub const TARGET: usize = 0;
    pub const RUN_SECONDS: usize = 1;
    pub const TRIGGER_JUMP: usize = 2;

    pub fn new() -> Self {
        Self {
            current: 0.0,
            step: 0.0,
            last_target: 0.0,
            initialized: false,
            sample_rate: 44100.0,
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("target"),
                    PortDef::control("run seconds"),
                    PortDef::trigger("jump"),
                ],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for LinearSlope {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for LinearSlope {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let run = ctx.control(Self::RUN_SECONDS).max(0.0);

        for i in 0..ctx.frames {
            let target = ctx.inputs[Self::TARGET][i];

            if ctx.inputs[Self::TRIGGER_JUMP][i] != 0.0 || !self.initialized {
                self.current = target;
                self.step = 0.0;
                self.initialized = true;
            } else if target != self.last_target {
                let samples = run * self.sample_rate;
                self.step = if samples < 1.0 {
                    target - self.current
                } else {
                    (target - self.current) / samples
                };
            }
            self.last_target = target;

            if self.current != target {
                self.current += self.step;
                let overshot = (self.step > 0.0 && self.current > target)
                    || (self.step < 0.0 && self.current < target)
                    || self.step == 0.0;
                if overshot {
                    self.current = target;
                }
            }
            ctx.outputs[0].as_mut_slice()[i] = self.current;
        }
    }

    fn reset(&mut self) {
        self.current = 0.0;
        self.step = 0.0;
        self.last_target = 0.0;
        self.initialized = false;
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "linear_slope"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// MIDI note number to frequency in Hz (A4 = 69 = 440 Hz)
///
/// Fractional notes land between semitones, so glides stay continuous.
/// The conversion is cached per distinct input sample; steady pitches cost
/// one comparison per sample.
#[derive(Clone)]
pub struct MidiScale {
    last_note: f64,
    last_frequency: f64,
    spec: PortSpec,
}

impl MidiScale {
    pub const MIDI: usize = 0;

    pub fn new() -> Self {
        Self {
            last_note: f64::NAN,
            last_frequency: 0.0,
            spec: PortSpec {
                inputs: vec![PortDef::audio("midi")],
                outputs: vec![PortDef::audio("frequency")],
            },
        }
    }
}

impl Default for MidiScale {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for MidiScale {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let note = ctx.inputs[Self::MIDI][i];
            if note != self.last_note {
                self.last_frequency = 440.0 * Libm::<f64>::pow(2.0, (note - 69.0) / 12.0);
                self.last_note = note;
            }
            ctx.outputs[0].as_mut_slice()[i] = self.last_frequency;
        }
    }

    fn reset(&mut self) {
        self.last_note = f64::NAN;
        self.last_frequency = 0.0;
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "midi_scale"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sample-wise sum of two signals
#[derive(Clone)]
pub struct Add {
    spec: PortSpec,
}

impl Add {
    pub const A: usize = 0;
    pub const B: usize = 1;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::audio("a"), PortDef::audio("b")],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for Add {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Add {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let value = ctx.inputs[Self::A][i] + ctx.inputs[Self::B][i];
            ctx.outputs[0].as_mut_slice()[i] = value;
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "add"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sample-wise product of two signals
#[derive(Clone)]
pub struct Multiply {
    spec: PortSpec,
}

impl Multiply {
    pub const A: usize = 0;
    pub const B: usize = 1;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::audio("a"), PortDef::audio("b")],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for Multiply {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Multiply {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let value = ctx.inputs[Self::A][i] * ctx.inputs[Self::B][i];
            ctx.outputs[0].as_mut_slice()[i] = value;
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "multiply"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Linear interpolation between two signals
#[derive(Clone)]
pub struct Interpolate {
    spec: PortSpec,
}

impl Interpolate {
    pub const FROM: usize = 0;
    pub const TO: usize = 1;
    pub const FRACTION: usize = 2;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("from"),
                    PortDef::audio("to"),
                    PortDef::audio("fraction"),
                ],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for Interpolate {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Interpolate {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let from = ctx.inputs[Self::FROM][i];
            let to = ctx.inputs[Self::TO][i];
            let fraction = ctx.inputs[Self::FRACTION][i];
            ctx.outputs[0].as_mut_slice()[i] = from + (to - from) * fraction;
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "interpolate"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Equal-sum crossfade between two signals
#[derive(Clone)]
pub struct Crossfader {
    spec: PortSpec,
}

impl Crossfader {
    pub const A: usize = 0;
    pub const B: usize = 1;
    pub const MIX: usize = 2;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("a"),
                    PortDef::audio("b"),
                    PortDef::audio("mix"),
                ],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Default for Crossfader {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Crossfader {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let mix = ctx.inputs[Self::MIX][i].clamp(0.0, 1.0);
            let value = ctx.inputs[Self::A][i] * (1.0 - mix) + ctx.inputs[Self::B][i] * mix;
            ctx.outputs[0].as_mut_slice()[i] = value;
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "crossfader"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Hard clamp to a fixed range
#[derive(Clone)]
pub struct Clamp {
    min: f64,
    max: f64,
    spec: PortSpec,
}

impl Clamp {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            spec: PortSpec {
                inputs: vec![PortDef::audio("in")],
                outputs: vec![PortDef::audio("out")],
            },
        }
    }
}

impl Processor for Clamp {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for i in 0..ctx.frames {
            let value = ctx.inputs[0][i].clamp(self.min, self.max);
            ctx.outputs[0].as_mut_slice()[i] = value;
        }
    }

    fn reset(&mut self) {}

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "clamp"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Feedback delay with linear-interpolated fractional reads
///
/// The circular buffer covers `MAX_DELAY_SECONDS`; delay-time changes must
/// be smoothed upstream (the delay reads its time input sample-by-sample).
/// Non-finite state clears the buffer and silences the rest of the block.
#[derive(Clone)]
pub struct Delay {
    buffer: Vec<f64>,
    write: usize,
    sample_rate: f64,
    spec: PortSpec,
}

/// Longest supported delay time, in seconds.
pub const MAX_DELAY_SECONDS: f64 = 1.0;

/// Shortest supported delay time, in seconds.
pub const MIN_DELAY_SECONDS: f64 = 0.01;

impl Delay {
    pub const AUDIO: usize = 0;
    pub const TIME: usize = 1;
    pub const FEEDBACK: usize = 2;
    pub const WET: usize = 3;

    pub fn new() -> Self {
        let sample_rate = 44100.0;
        Self {
            buffer: vec![0.0; Self::buffer_len(sample_rate)],
            write: 0,
            sample_rate,
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("audio"),
                    PortDef::audio("time"),
                    PortDef::audio("feedback"),
                    PortDef::audio("wet"),
                ],
                outputs: vec![PortDef::audio("audio")],
            },
        }
    }

    fn buffer_len(sample_rate: f64) -> usize {
        (MAX_DELAY_SECONDS * sample_rate).ceil() as usize + 1
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Delay {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        let len = self.buffer.len();

        for i in 0..ctx.frames {
            let time = ctx.inputs[Self::TIME][i].clamp(MIN_DELAY_SECONDS, MAX_DELAY_SECONDS);
            let feedback = ctx.inputs[Self::FEEDBACK][i].clamp(-1.0, 1.0);
            let wet = ctx.inputs[Self::WET][i].clamp(0.0, 1.0);

            let mut read_pos = self.write as f64 - time * self.sample_rate;
            if read_pos < 0.0 {
                read_pos += len as f64;
            }
            let index = read_pos as usize % len;
            let next = (index + 1) % len;
            let fraction = read_pos - Libm::<f64>::floor(read_pos);
            let read = self.buffer[index] * (1.0 - fraction) + self.buffer[next] * fraction;

            if !read.is_finite() {
                self.buffer.fill(0.0);
                ctx.outputs[0].as_mut_slice()[i..ctx.frames].fill(0.0);
                return;
            }

            let input = ctx.inputs[Self::AUDIO][i];
            self.buffer[self.write] = input + read * feedback;
            ctx.outputs[0].as_mut_slice()[i] = (1.0 - wet) * input + wet * read;
            self.write = (self.write + 1) % len;
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write = 0;
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.buffer = vec![0.0; Self::buffer_len(sample_rate)];
        self.write = 0;
    }

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "delay"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One modulation routing: source selector, smoothed gain, destination selector
#[derive(Clone)]
struct ModSlot {
    source: ValueRef,
    scale: ValueRef,
    destination: ValueRef,
    smoothed_scale: f64,
}

/// Fixed-slot modulation matrix
///
/// Each slot multiplies a selected source signal by a smoothed gain and
/// accumulates into a selected destination output; slots with the source
/// selector at "off" contribute nothing. Destination outputs are summed
/// into the voice graph with per-destination range gains.
#[derive(Clone)]
pub struct ModMatrix {
    slots: Vec<ModSlot>,
    spec: PortSpec,
}

/// Number of modulation routings.
pub const MOD_SLOTS: usize = 5;

impl ModMatrix {
    // Source input ports, in selector order (selector 0 is "off")
    pub const OSC_1: usize = 0;
    pub const OSC_2: usize = 1;
    pub const LFO_1: usize = 2;
    pub const LFO_2: usize = 3;
    pub const AMP_ENV: usize = 4;
    pub const FIL_ENV: usize = 5;
    pub const NOTE: usize = 6;
    pub const VELOCITY: usize = 7;
    pub const PITCH_WHEEL: usize = 8;
    pub const MOD_WHEEL: usize = 9;

    // Destination output ports
    pub const CUTOFF: usize = 0;
    pub const PITCH: usize = 1;
    pub const AMPLITUDE: usize = 2;
    pub const OSC_MIX: usize = 3;
    pub const RESONANCE: usize = 4;

    const NUM_SOURCES: usize = 10;
    const NUM_DESTINATIONS: usize = 5;

    /// Selector display names for the source controls
    pub fn source_strings() -> &'static [&'static str] {
        &[
            "off",
            "osc 1",
            "osc 2",
            "lfo 1",
            "lfo 2",
            "amp env",
            "fil env",
            "note",
            "velocity",
            "pitch wheel",
            "mod wheel",
        ]
    }

    /// Selector display names for the destination controls
    pub fn destination_strings() -> &'static [&'static str] {
        &["cutoff", "pitch", "amplitude", "osc mix", "resonance"]
    }

    /// Build a matrix over shared (source, scale, destination) selectors
    pub fn new(slots: [(ValueRef, ValueRef, ValueRef); MOD_SLOTS]) -> Self {
        let slots = slots
            .into_iter()
            .map(|(source, scale, destination)| {
                let smoothed_scale = scale.get().clamp(-1.0, 1.0);
                ModSlot {
                    source,
                    scale,
                    destination,
                    smoothed_scale,
                }
            })
            .collect();
        Self {
            slots,
            spec: PortSpec {
                inputs: vec![
                    PortDef::audio("osc 1"),
                    PortDef::audio("osc 2"),
                    PortDef::audio("lfo 1"),
                    PortDef::audio("lfo 2"),
                    PortDef::audio("amp env"),
                    PortDef::audio("fil env"),
                    PortDef::audio("note"),
                    PortDef::audio("velocity"),
                    PortDef::audio("pitch wheel"),
                    PortDef::audio("mod wheel"),
                ],
                outputs: vec![
                    PortDef::audio("cutoff"),
                    PortDef::audio("pitch"),
                    PortDef::audio("amplitude"),
                    PortDef::audio("osc mix"),
                    PortDef::audio("resonance"),
                ],
            },
        }
    }
}

impl Processor for ModMatrix {
    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_, '_>) {
        for output in ctx.outputs.iter_mut() {
            output.fill(0.0, ctx.frames);
        }

        for slot in &mut self.slots {
            let source = slot.source.get().round().max(0.0) as usize;
            if source == 0 || source > Self::NUM_SOURCES {
                continue;
            }
            let destination = (slot.destination.get().round().max(0.0) as usize)
                .min(Self::NUM_DESTINATIONS - 1);
            let target = slot.scale.get().clamp(-1.0, 1.0);

            for i in 0..ctx.frames {
                slot.smoothed_scale += DEFAULT_SMOOTHING * (target - slot.smoothed_scale);
                let value = slot.smoothed_scale * ctx.inputs[source - 1][i];
                ctx.outputs[destination].as_mut_slice()[i] += value;
            }
        }
    }

    fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.smoothed_scale = slot.scale.get().clamp(-1.0, 1.0);
        }
    }

    fn set_sample_rate(&mut self, _: f64) {}

    fn box_clone(&self) -> Box<dyn Processor> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        "mod_matrix"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polyphony::TRIGGER_ON;
    use crate::port::Block;
    use approx::assert_relative_eq;

    const SR: f64 = 44100.0;

    // Run one block through a processor, returning each output as a Vec.
    fn run(processor: &mut dyn Processor, inputs: &[&[f64]], frames: usize) -> Vec<Vec<f64>> {
        let mut outputs: Vec<Block> = (0..processor.port_spec().outputs.len())
            .map(|_| Block::new())
            .collect();
        let mut ctx = ProcessContext {
            inputs,
            outputs: &mut outputs,
            frames,
        };
        processor.process(&mut ctx);
        outputs
            .iter()
            .map(|block| block.as_slice()[..frames].to_vec())
            .collect()
    }

    fn constant(value: f64, frames: usize) -> Vec<f64> {
        vec![value; frames]
    }

    #[test]
    fn test_oscillator_sine_frequency() {
        let mut osc = Oscillator::new();
        osc.set_sample_rate(SR);

        let frames = 200;
        let wave = constant(0.0, frames);
        let freq = constant(441.0, frames); // period of exactly 100 samples
        let pm = constant(0.0, frames);
        let reset = constant(0.0, frames);
        let out = &run(&mut osc, &[&wave, &freq, &pm, &reset], frames)[0];

        let crossings = out.windows(2).filter(|w| w[0] >= 0.0 && w[1] < 0.0).count();
        assert_eq!(crossings, 2);
        assert!(out.iter().all(|s| s.abs() <= 1.0));
        // Phase starts at zero
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_oscillator_reset_zeroes_phase() {
        let mut osc = Oscillator::new();
        osc.set_sample_rate(SR);

        let frames = 32;
        let wave = constant(0.0, frames);
        let freq = constant(2205.0, frames);
        let pm = constant(0.0, frames);
        let mut reset = constant(0.0, frames);
        reset[10] = 1.0;
        let out = &run(&mut osc, &[&wave, &freq, &pm, &reset], frames)[0];

        // At the reset sample the phase is back at zero.
        assert_relative_eq!(out[10], 0.0, epsilon = 1e-12);
        assert!(out[9].abs() > 1e-3);
    }

    #[test]
    fn test_oscillator_waveform_bounds() {
        for index in 0..Waveform::COUNT {
            let mut osc = Oscillator::new();
            osc.set_sample_rate(SR);

            let frames = 256;
            let wave = constant(index as f64, frames);
            let freq = constant(773.0, frames);
            let pm = constant(0.0, frames);
            let reset = constant(0.0, frames);
            let out = &run(&mut osc, &[&wave, &freq, &pm, &reset], frames)[0];
            assert!(
                out.iter().all(|s| s.abs() <= 1.0),
                "waveform {} out of range",
                index
            );
        }
    }

    #[test]
    fn test_midi_scale() {
        let mut scale = MidiScale::new();
        let frames = 4;
        let notes = vec![69.0, 69.0, 81.0, 57.0];
        let out = &run(&mut scale, &[&notes], frames)[0];
        assert_relative_eq!(out[0], 440.0, epsilon = 1e-9);
        assert_relative_eq!(out[2], 880.0, epsilon = 1e-9);
        assert_relative_eq!(out[3], 220.0, epsilon = 1e-9);
    }

    #[test]
    fn test_filter_lowpass_passes_dc() {
        let mut filter = Filter::new();
        filter.set_sample_rate(SR);

        let frames = 256;
        let audio = constant(1.0, frames);
        let mode = constant(0.0, frames);
        let cutoff = constant(2000.0, frames);
        let q = constant(0.7, frames);
        let reset = constant(0.0, frames);

        let mut last = 0.0;
        for _ in 0..20 {
            let out = run(&mut filter, &[&audio, &mode, &cutoff, &q, &reset], frames);
            last = out[0][frames - 1];
        }
        assert_relative_eq!(last, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_filter_highpass_blocks_dc() {
        let mut filter = Filter::new();
        filter.set_sample_rate(SR);

        let frames = 256;
        let audio = constant(1.0, frames);
        let mode = constant(1.0, frames);
        let cutoff = constant(2000.0, frames);
        let q = constant(0.7, frames);
        let reset = constant(0.0, frames);

        let mut last = 1.0;
        for _ in 0..20 {
            let out = run(&mut filter, &[&audio, &mode, &cutoff, &q, &reset], frames);
            last = out[0][frames - 1];
        }
        assert!(last.abs() < 1e-3);
    }

    #[test]
    fn test_filter_non_finite_input_goes_silent() {
        let mut filter = Filter::new();
        filter.set_sample_rate(SR);

        let frames = 16;
        let mut audio = constant(0.5, frames);
        audio[3] = f64::NAN;
        let mode = constant(0.0, frames);
        let cutoff = constant(2000.0, frames);
        let q = constant(0.7, frames);
        let reset = constant(0.0, frames);

        let out = &run(&mut filter, &[&audio, &mode, &cutoff, &q, &reset], frames)[0];
        assert!(out[3..].iter().all(|&s| s == 0.0));

        // Recovered on the next block.
        let audio = constant(0.5, frames);
        let out = &run(&mut filter, &[&audio, &mode, &cutoff, &q, &reset], frames)[0];
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_envelope_attack_decay_sustain() {
        let mut env = Envelope::new();
        env.set_sample_rate(1000.0);

        let frames = 100;
        let attack = constant(0.01, frames); // 10 samples
        let decay = constant(0.02, frames); // 20 samples
        let sustain = constant(0.5, frames);
        let release = constant(0.01, frames);
        let mut trigger = constant(0.0, frames);
        trigger[0] = TRIGGER_ON;
        let held = constant(1.0, frames);

        let out = run(
            &mut env,
            &[&attack, &decay, &sustain, &release, &trigger, &held],
            frames,
        );
        let value = &out[0];

        assert_relative_eq!(value[9], 1.0, epsilon = 1e-9);
        // Decay down to sustain
        assert!(value[15] < 1.0 && value[15] > 0.5);
        assert_relative_eq!(value[40], 0.5, epsilon = 1e-9);
        // Never finished while held
        assert!(out[1].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_envelope_release_and_finished_once() {
        let mut env = Envelope::new();
        env.set_sample_rate(1000.0);

        let frames = 100;
        let attack = constant(0.0, frames);
        let decay = constant(0.0, frames);
        let sustain = constant(1.0, frames);
        let release = constant(0.02, frames); // 20 samples
        let mut trigger = constant(0.0, frames);
        trigger[0] = TRIGGER_ON;
        let mut held = constant(1.0, frames);
        for sample in held.iter_mut().skip(30) {
            *sample = 0.0;
        }

        let out = run(
            &mut env,
            &[&attack, &decay, &sustain, &release, &trigger, &held],
            frames,
        );
        let value = &out[0];
        let finished = &out[1];

        // Monotonically non-increasing after the release starts
        assert!(value.windows(2).skip(30).all(|w| w[1] <= w[0]));
        assert_eq!(value[60], 0.0);
        assert_eq!(finished.iter().filter(|&&s| s != 0.0).count(), 1);
    }

    #[test]
    fn test_envelope_reset_trigger_fires_finished() {
        let mut env = Envelope::new();
        env.set_sample_rate(1000.0);

        let frames = 8;
        let attack = constant(0.1, frames);
        let decay = constant(0.1, frames);
        let sustain = constant(1.0, frames);
        let release = constant(0.1, frames);
        let mut trigger = constant(0.0, frames);
        trigger[2] = TRIGGER_RESET;
        let held = constant(1.0, frames);

        let out = run(
            &mut env,
            &[&attack, &decay, &sustain, &release, &trigger, &held],
            frames,
        );
        assert_eq!(out[1][2], 1.0);
        // Attack restarted from zero
        assert!(out[0][2] < 0.05);
    }

    #[test]
    fn test_legato_filter_routing() {
        let mut legato = LegatoFilter::new();
        let frames = 8;

        // Legato on, voice already held: trigger goes to remain.
        let legato_on = constant(1.0, frames);
        let mut trigger = constant(0.0, frames);
        trigger[4] = TRIGGER_ON;
        let held = constant(1.0, frames);
        let out = run(&mut legato, &[&legato_on, &trigger, &held], frames);
        assert_eq!(out[LegatoFilter::RETRIGGER][4], 0.0);
        assert_eq!(out[LegatoFilter::REMAIN][4], TRIGGER_ON);

        // Legato off: trigger goes to retrigger even when held.
        let mut legato = LegatoFilter::new();
        let legato_off = constant(0.0, frames);
        let out = run(&mut legato, &[&legato_off, &trigger, &held], frames);
        assert_eq!(out[LegatoFilter::RETRIGGER][4], TRIGGER_ON);
        assert_eq!(out[LegatoFilter::REMAIN][4], 0.0);

        // Legato on but voice not previously held: retrigger.
        let mut legato = LegatoFilter::new();
        let mut trigger = constant(0.0, frames);
        trigger[0] = TRIGGER_RESET;
        let out = run(&mut legato, &[&legato_on, &trigger, &held], frames);
        assert_eq!(out[LegatoFilter::RETRIGGER][0], TRIGGER_RESET);
    }

    #[test]
    fn test_portamento_filter_modes() {
        let frames = 4;
        let mut trigger = constant(0.0, frames);
        trigger[1] = TRIGGER_ON;
        let held = constant(1.0, frames);

        // Off: always jump.
        let mut filter = PortamentoFilter::new();
        let state = constant(PortamentoFilter::OFF as f64, frames);
        let out = run(&mut filter, &[&state, &trigger, &held], frames);
        assert_eq!(out[0][1], TRIGGER_ON);

        // On: never jump.
        let mut filter = PortamentoFilter::new();
        let state = constant(PortamentoFilter::ON as f64, frames);
        let out = run(&mut filter, &[&state, &trigger, &held], frames);
        assert!(out[0].iter().all(|&s| s == 0.0));

        // Auto: jump only when the voice was not previously held.
        let mut filter = PortamentoFilter::new();
        let state = constant(PortamentoFilter::AUTO as f64, frames);
        let out = run(&mut filter, &[&state, &trigger, &held], frames);
        assert_eq!(out[0][1], TRIGGER_ON, "fresh note should jump in auto");

        // Same filter, now the voice is held: no jump.
        let mut trigger2 = constant(0.0, frames);
        trigger2[2] = TRIGGER_ON;
        let out = run(&mut filter, &[&state, &trigger2, &held], frames);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_trigger_combiner() {
        let mut combiner = TriggerCombiner::new();
        let frames = 4;
        let a = vec![0.0, 1.0, 0.0, 2.0];
        let b = vec![0.0, 0.0, 3.0, 1.0];
        let out = &run(&mut combiner, &[&a, &b], frames)[0];
        assert_eq!(out, &vec![0.0, 1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_trigger_wait_latches() {
        let mut wait = TriggerWait::new();
        let frames = 6;
        let values = vec![60.0, 61.0, 62.0, 63.0, 64.0, 65.0];
        let trigger = vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let out = &run(&mut wait, &[&values, &trigger], frames)[0];
        assert_eq!(out, &vec![0.0, 61.0, 61.0, 61.0, 64.0, 64.0]);
    }

    #[test]
    fn test_smooth_value_converges() {
        let mut smooth = SmoothValue::new(0.0);
        smooth.value_ref().set(1.0);

        let mut last = 0.0;
        for _ in 0..40 {
            let out = run(&mut smooth, &[], 256);
            last = out[0][255];
        }
        assert_relative_eq!(last, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_smooth_value_set_hard() {
        let mut smooth = SmoothValue::new(0.0);
        smooth.set_hard(2.0);
        let out = run(&mut smooth, &[], 4);
        assert_relative_eq!(out[0][0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_slope_first_target_snaps() {
        let mut slope = LinearSlope::new();
        slope.set_sample_rate(1000.0);

        let frames = 4;
        let target = constant(60.0, frames);
        let run_seconds = constant(0.1, frames);
        let jump = constant(0.0, frames);
        let out = &run(&mut slope, &[&target, &run_seconds, &jump], frames)[0];
        assert_eq!(out[0], 60.0);
    }

    #[test]
    fn test_linear_slope_ramps_then_jumps() {
        let mut slope = LinearSlope::new();
        slope.set_sample_rate(1000.0);

        let frames = 120;
        let run_seconds = constant(0.1, frames); // 100 samples
        let zero = constant(0.0, frames);

        // Establish the starting value.
        let start = constant(60.0, frames);
        run(&mut slope, &[&start, &run_seconds, &zero], frames);

        // Re-target: ramps linearly over 100 samples.
        let target = constant(72.0, frames);
        let out = &run(&mut slope, &[&target, &run_seconds, &zero], frames)[0];
        assert_relative_eq!(out[49], 66.0, epsilon = 0.2);
        assert_relative_eq!(out[110], 72.0, epsilon = 1e-9);

        // Jump trigger snaps instantly.
        let target = constant(48.0, frames);
        let mut jump = constant(0.0, frames);
        jump[0] = 1.0;
        let out = &run(&mut slope, &[&target, &run_seconds, &jump], frames)[0];
        assert_eq!(out[0], 48.0);
    }

    #[test]
    fn test_arithmetic_processors() {
        let frames = 3;
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![10.0, 20.0, 30.0];

        let out = &run(&mut Add::new(), &[&a, &b], frames)[0];
        assert_eq!(out, &vec![11.0, 22.0, 33.0]);

        let out = &run(&mut Multiply::new(), &[&a, &b], frames)[0];
        assert_eq!(out, &vec![10.0, 40.0, 90.0]);

        let fraction = constant(0.5, frames);
        let out = &run(&mut Interpolate::new(), &[&a, &b, &fraction], frames)[0];
        assert_eq!(out, &vec![5.5, 11.0, 16.5]);

        let mix = constant(0.0, frames);
        let out = &run(&mut Crossfader::new(), &[&a, &b, &mix], frames)[0];
        assert_eq!(out, &a);

        let out = &run(&mut Clamp::new(-1.0, 1.0), &[&b], frames)[0];
        assert_eq!(out, &vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_delay_echoes_at_delay_time() {
        let mut delay = Delay::new();
        delay.set_sample_rate(SR);

        let delay_samples = (MIN_DELAY_SECONDS * SR) as usize; // 441
        let frames = 256;
        let time = constant(MIN_DELAY_SECONDS, frames);
        let feedback = constant(0.0, frames);
        let wet = constant(1.0, frames);

        let mut collected = Vec::new();
        for block in 0..4 {
            let mut audio = constant(0.0, frames);
            if block == 0 {
                audio[0] = 1.0;
            }
            let out = run(&mut delay, &[&audio, &time, &feedback, &wet], frames);
            collected.extend_from_slice(&out[0]);
        }

        assert_relative_eq!(collected[delay_samples], 1.0, epsilon = 1e-9);
        assert!(collected[..delay_samples].iter().all(|&s| s.abs() < 1e-9));
    }

    #[test]
    fn test_delay_feedback_repeats() {
        let mut delay = Delay::new();
        delay.set_sample_rate(SR);

        let delay_samples = (MIN_DELAY_SECONDS * SR) as usize;
        let frames = 256;
        let time = constant(MIN_DELAY_SECONDS, frames);
        let feedback = constant(0.5, frames);
        let wet = constant(1.0, frames);

        let mut collected = Vec::new();
        for block in 0..8 {
            let mut audio = constant(0.0, frames);
            if block == 0 {
                audio[0] = 1.0;
            }
            let out = run(&mut delay, &[&audio, &time, &feedback, &wet], frames);
            collected.extend_from_slice(&out[0]);
        }

        assert_relative_eq!(collected[delay_samples], 1.0, epsilon = 1e-9);
        assert_relative_eq!(collected[2 * delay_samples], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_mod_matrix_routes_and_scales() {
        let source = ValueRef::new(1.0); // "osc 1"
        let scale = ValueRef::new(1.0);
        let destination = ValueRef::new(ModMatrix::PITCH as f64);
        let off = || (ValueRef::new(0.0), ValueRef::new(0.0), ValueRef::new(0.0));

        let mut matrix = ModMatrix::new([
            (source, scale, destination),
            off(),
            off(),
            off(),
            off(),
        ]);

        let frames = 4;
        let osc1 = vec![0.25, -0.5, 1.0, 0.0];
        let zeros = constant(0.0, frames);
        let inputs: [&[f64]; 10] = [
            &osc1, &zeros, &zeros, &zeros, &zeros, &zeros, &zeros, &zeros, &zeros, &zeros,
        ];
        let out = run(&mut matrix, &inputs, frames);

        for i in 0..frames {
            assert_relative_eq!(out[ModMatrix::PITCH][i], osc1[i], epsilon = 1e-9);
        }
        assert!(out[ModMatrix::CUTOFF].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mod_matrix_off_slots_contribute_zero() {
        let off = || (ValueRef::new(0.0), ValueRef::new(1.0), ValueRef::new(0.0));
        let mut matrix = ModMatrix::new([off(), off(), off(), off(), off()]);

        let frames = 4;
        let ones = constant(1.0, frames);
        let inputs: [&[f64]; 10] = [
            &ones, &ones, &ones, &ones, &ones, &ones, &ones, &ones, &ones, &ones,
        ];
        let out = run(&mut matrix, &inputs, frames);
        for destination in &out {
            assert!(destination.iter().all(|&s| s == 0.0));
        }
    }
}
