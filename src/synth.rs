//! The Assembled Instrument
//!
//! `Synth` wires the full subtractive voice (articulation triggers, two
//! cross-modulatable oscillators, a multimode filter with its own envelope,
//! the modulation matrix) into a [`VoiceHandler`], follows it with delay,
//! volume and an output clamp, and exposes the whole thing through a named
//! control catalog plus MIDI entry points.

use crate::control::{Control, ControlMap};
use crate::graph::{GraphError, NodeId, PortRef, Router};
use crate::modules::{
    Add, Clamp, Crossfader, Delay, Envelope, Filter, FilterMode, Interpolate, LegatoFilter,
    LinearSlope, MidiScale, ModMatrix, Multiply, Oscillator, PortamentoFilter, SmoothValue,
    TriggerCombiner, TriggerWait, Waveform, MOD_SLOTS,
};
use crate::polyphony::{VoiceHandler, DEFAULT_POLYPHONY};
use crate::port::ValueRef;
use crate::serialize;
use crate::{StdMap, MAX_BLOCK_SIZE, MIDI_SIZE};

const LEGATO_STRINGS: &[&str] = &["off", "on"];

// A unit mod-matrix output moves its destination by these amounts, in the
// destination's native units (MIDI notes for cutoff and pitch).
const CUTOFF_MOD_RANGE: f64 = 48.0;
const PITCH_MOD_RANGE: f64 = 24.0;
const RESONANCE_MOD_RANGE: f64 = 8.0;

const SUSTAIN_CC: u8 = 64;
const MOD_WHEEL_CC: u8 = 1;

/// The polyphonic subtractive synthesizer engine
///
/// Construct once, then drive from the host: `render` on the audio thread,
/// `on_midi` (or the direct note entry points) from the MIDI thread, and
/// control writes from the UI thread, all serialized behind the host's
/// coarse lock.
pub struct Synth {
    graph: Router,
    voices: NodeId,
    output: PortRef,
    controls: ControlMap,
    learned: StdMap<String, u8>,
    pitch_wheel: ValueRef,
    sample_rate: f64,
    block_size: usize,
}

fn insert_control(
    controls: &mut ControlMap,
    name: &str,
    value: &ValueRef,
    min: f64,
    max: f64,
    resolution: u32,
) {
    controls.insert(name.to_string(), Control::new(value, min, max, resolution));
}

fn insert_discrete(
    controls: &mut ControlMap,
    name: &str,
    value: &ValueRef,
    strings: &'static [&'static str],
) {
    controls.insert(name.to_string(), Control::discrete(value, strings));
}

/// Build the voice template: everything evaluated per voice, plus the
/// handful of global processors (smoothed controls, LFOs) voices share.
///
/// Returns the handler, its control catalog, and the pitch-wheel scalar.
fn build_voice_handler(
    sample_rate: f64,
) -> Result<(VoiceHandler, ControlMap, ValueRef), GraphError> {
    let mut handler = VoiceHandler::new(sample_rate);
    let mut controls = ControlMap::new();

    let note = handler.note();
    let velocity = handler.velocity();
    let event = handler.voice_event();
    let held = handler.held();

    // Legato.
    let legato_value = ValueRef::new(0.0);
    let legato = handler.add_voice_processor("legato", LegatoFilter::new());
    handler.bind_value(legato.in_("legato"), &legato_value)?;
    handler.connect(event, legato.in_("trigger"))?;
    handler.connect(held, legato.in_("held"))?;
    insert_discrete(&mut controls, "legato", &legato_value, LEGATO_STRINGS);

    // Amplitude envelope.
    let amp_attack = ValueRef::new(0.01);
    let amp_decay = ValueRef::new(2.0);
    let amp_release = ValueRef::new(0.3);
    let amp_sustain_smooth = SmoothValue::new(1.0);
    let amp_sustain = amp_sustain_smooth.value_ref();
    let sustain_node = handler.add_global_processor("amp sustain", amp_sustain_smooth);

    let amp_env = handler.add_voice_processor("amp env", Envelope::new());
    handler.bind_value(amp_env.in_("attack"), &amp_attack)?;
    handler.bind_value(amp_env.in_("decay"), &amp_decay)?;
    handler.bind_value(amp_env.in_("release"), &amp_release)?;
    handler.connect(sustain_node.out("out"), amp_env.in_("sustain"))?;
    handler.connect(legato.out("retrigger"), amp_env.in_("trigger"))?;
    handler.connect(held, amp_env.in_("held"))?;

    insert_control(&mut controls, "amp attack", &amp_attack, 0.0, 3.0, 128);
    insert_control(&mut controls, "amp decay", &amp_decay, 0.0, 3.0, 128);
    insert_control(&mut controls, "amp sustain", &amp_sustain, 0.0, 1.0, 128);
    insert_control(&mut controls, "amp release", &amp_release, 0.0, 3.0, 128);

    // Voice and frequency resetting logic: the pitch may move on a legato
    // transition or when a fresh allocation restarts the amp envelope.
    let frequency_trigger = handler.add_voice_processor("frequency trigger", TriggerCombiner::new());
    handler.connect(legato.out("remain"), frequency_trigger.in_("a"))?;
    handler.connect(amp_env.out("finished"), frequency_trigger.in_("b"))?;

    let note_wait = handler.add_voice_processor("note wait", TriggerWait::new());
    handler.connect(note, note_wait.in_("wait"))?;
    handler.connect(frequency_trigger.out("out"), note_wait.in_("trigger"))?;

    // Keytracking reference point is the middle of the MIDI range.
    let center_adjust = ValueRef::new(-(MIDI_SIZE as f64) / 2.0);
    let note_from_center = handler.add_voice_processor("note from center", Add::new());
    handler.connect(note_wait.out("out"), note_from_center.in_("a"))?;
    handler.bind_value(note_from_center.in_("b"), &center_adjust)?;

    // Portamento.
    let portamento = ValueRef::new(0.01);
    let portamento_type = ValueRef::new(PortamentoFilter::OFF as f64);
    let portamento_filter =
        handler.add_voice_processor("portamento filter", PortamentoFilter::new());
    handler.bind_value(portamento_filter.in_("state"), &portamento_type)?;
    handler.connect(frequency_trigger.out("out"), portamento_filter.in_("trigger"))?;
    handler.connect(held, portamento_filter.in_("held"))?;

    let current_note = handler.add_voice_processor("current note", LinearSlope::new());
    handler.connect(note_wait.out("out"), current_note.in_("target"))?;
    handler.bind_value(current_note.in_("run seconds"), &portamento)?;
    handler.connect(portamento_filter.out("jump"), current_note.in_("jump"))?;

    insert_control(&mut controls, "portamento", &portamento, 0.0, 0.2, 128);
    insert_discrete(
        &mut controls,
        "portamento type",
        &portamento_type,
        PortamentoFilter::strings(),
    );

    // Pitch bend.
    let pitch_wheel_smooth = SmoothValue::new(0.0);
    let pitch_wheel = pitch_wheel_smooth.value_ref();
    let wheel_node = handler.add_global_processor("pitch wheel", pitch_wheel_smooth);
    let pitch_bend_range = ValueRef::new(2.0);
    let pitch_bend = handler.add_global_processor("pitch bend", Multiply::new());
    handler.connect(wheel_node.out("out"), pitch_bend.in_("a"))?;
    handler.bind_value(pitch_bend.in_("b"), &pitch_bend_range)?;
    insert_control(
        &mut controls,
        "pitch bend range",
        &pitch_bend_range,
        0.0,
        48.0,
        48,
    );

    // Mod wheel.
    let mod_wheel_smooth = SmoothValue::new(0.0);
    let mod_wheel = mod_wheel_smooth.value_ref();
    let mod_wheel_node = handler.add_global_processor("mod wheel", mod_wheel_smooth);
    insert_control(&mut controls, "mod wheel", &mod_wheel, 0.0, 1.0, 128);

    // Modulation matrix. Slot selectors are shared scalars; the matrix is
    // per-voice because its sources include per-voice envelopes.
    let slot_refs: [(ValueRef, ValueRef, ValueRef); MOD_SLOTS] = core::array::from_fn(|i| {
        let source = ValueRef::new(0.0);
        let scale = ValueRef::new(0.0);
        let destination = ValueRef::new(0.0);
        insert_discrete(
            &mut controls,
            &format!("mod source {}", i + 1),
            &source,
            ModMatrix::source_strings(),
        );
        insert_control(
            &mut controls,
            &format!("mod scale {}", i + 1),
            &scale,
            -1.0,
            1.0,
            128,
        );
        insert_discrete(
            &mut controls,
            &format!("mod destination {}", i + 1),
            &destination,
            ModMatrix::destination_strings(),
        );
        (source, scale, destination)
    });
    let matrix = handler.add_voice_processor("mod matrix", ModMatrix::new(slot_refs));

    // Pitch assembly: glided note + bend + matrix pitch offset.
    let bent_note = handler.add_voice_processor("bent note", Add::new());
    handler.connect(current_note.out("out"), bent_note.in_("a"))?;
    handler.connect(pitch_bend.out("out"), bent_note.in_("b"))?;

    let pitch_mod_depth = handler.add_voice_processor("pitch mod depth", Multiply::new());
    handler.connect(matrix.out("pitch"), pitch_mod_depth.in_("a"))?;
    handler.bind_value(pitch_mod_depth.in_("b"), &ValueRef::new(PITCH_MOD_RANGE))?;

    let final_midi = handler.add_voice_processor("final midi", Add::new());
    handler.connect(bent_note.out("out"), final_midi.in_("a"))?;
    handler.connect(pitch_mod_depth.out("out"), final_midi.in_("b"))?;

    // Oscillator 1.
    let wave_strings = Waveform::strings();
    let cross_modulation = ValueRef::new(0.0);
    let oscillator1_waveform = ValueRef::new(3.0); // down saw
    let oscillator1_frequency = handler.add_voice_processor("osc 1 frequency", MidiScale::new());
    handler.connect(final_midi.out("out"), oscillator1_frequency.in_("midi"))?;

    let cross_mod_1 = handler.add_voice_processor("cross mod 1", Multiply::new());
    handler.bind_value(cross_mod_1.in_("b"), &cross_modulation)?;

    let oscillator1 = handler.add_voice_processor("osc 1", Oscillator::new());
    handler.bind_value(oscillator1.in_("waveform"), &oscillator1_waveform)?;
    handler.connect(
        oscillator1_frequency.out("frequency"),
        oscillator1.in_("frequency"),
    )?;
    handler.connect(cross_mod_1.out("out"), oscillator1.in_("phase mod"))?;
    handler.connect(amp_env.out("finished"), oscillator1.in_("reset"))?;
    insert_discrete(&mut controls, "osc 1 waveform", &oscillator1_waveform, wave_strings);

    // Oscillator 2.
    let oscillator2_waveform = ValueRef::new(3.0);
    let oscillator2_transpose = ValueRef::new(-12.0);
    let oscillator2_tune = ValueRef::new(0.0);

    let oscillator2_offset = handler.add_voice_processor("osc 2 offset", Add::new());
    handler.bind_value(oscillator2_offset.in_("a"), &oscillator2_transpose)?;
    handler.bind_value(oscillator2_offset.in_("b"), &oscillator2_tune)?;

    let oscillator2_midi = handler.add_voice_processor("osc 2 midi", Add::new());
    handler.connect(final_midi.out("out"), oscillator2_midi.in_("a"))?;
    handler.connect(oscillator2_offset.out("out"), oscillator2_midi.in_("b"))?;

    let oscillator2_frequency = handler.add_voice_processor("osc 2 frequency", MidiScale::new());
    handler.connect(oscillator2_midi.out("out"), oscillator2_frequency.in_("midi"))?;

    let cross_mod_2 = handler.add_voice_processor("cross mod 2", Multiply::new());
    handler.bind_value(cross_mod_2.in_("b"), &cross_modulation)?;

    let oscillator2 = handler.add_voice_processor("osc 2", Oscillator::new());
    handler.bind_value(oscillator2.in_("waveform"), &oscillator2_waveform)?;
    handler.connect(
        oscillator2_frequency.out("frequency"),
        oscillator2.in_("frequency"),
    )?;
    handler.connect(cross_mod_2.out("out"), oscillator2.in_("phase mod"))?;
    handler.connect(amp_env.out("finished"), oscillator2.in_("reset"))?;

    // Cross modulation runs both ways; the return edge reads the previous
    // block so the pair stays a DAG.
    handler.connect(oscillator1.out("audio"), cross_mod_2.in_("a"))?;
    handler.connect_feedback(oscillator2.out("audio"), cross_mod_1.in_("a"))?;

    insert_discrete(&mut controls, "osc 2 waveform", &oscillator2_waveform, wave_strings);
    insert_control(
        &mut controls,
        "osc 2 transpose",
        &oscillator2_transpose,
        -48.0,
        48.0,
        96,
    );
    insert_control(&mut controls, "osc 2 tune", &oscillator2_tune, -1.0, 1.0, 128);
    insert_control(
        &mut controls,
        "cross modulation",
        &cross_modulation,
        0.0,
        1.0,
        128,
    );

    // Oscillator mix.
    let osc_mix = ValueRef::new(0.5);
    let mix_amount = handler.add_voice_processor("osc mix amount", Add::new());
    handler.bind_value(mix_amount.in_("a"), &osc_mix)?;
    handler.connect(matrix.out("osc mix"), mix_amount.in_("b"))?;

    let oscillator_mix = handler.add_voice_processor("oscillator mix", Crossfader::new());
    handler.connect(oscillator1.out("audio"), oscillator_mix.in_("a"))?;
    handler.connect(oscillator2.out("audio"), oscillator_mix.in_("b"))?;
    handler.connect(mix_amount.out("out"), oscillator_mix.in_("mix"))?;
    insert_control(&mut controls, "osc mix", &osc_mix, 0.0, 1.0, 128);

    // LFOs are global: one pair modulates every voice through the matrix.
    let lfo1_waveform = ValueRef::new(0.0);
    let lfo1_frequency = ValueRef::new(1.0);
    let lfo1 = handler.add_global_processor("lfo 1", Oscillator::new());
    handler.bind_value(lfo1.in_("waveform"), &lfo1_waveform)?;
    handler.bind_value(lfo1.in_("frequency"), &lfo1_frequency)?;
    insert_discrete(&mut controls, "lfo 1 waveform", &lfo1_waveform, wave_strings);
    insert_control(&mut controls, "lfo 1 frequency", &lfo1_frequency, 0.0, 10.0, 128);

    let lfo2_waveform = ValueRef::new(0.0);
    let lfo2_frequency = ValueRef::new(1.0);
    let lfo2 = handler.add_global_processor("lfo 2", Oscillator::new());
    handler.bind_value(lfo2.in_("waveform"), &lfo2_waveform)?;
    handler.bind_value(lfo2.in_("frequency"), &lfo2_frequency)?;
    insert_discrete(&mut controls, "lfo 2 waveform", &lfo2_waveform, wave_strings);
    insert_control(&mut controls, "lfo 2 frequency", &lfo2_frequency, 0.0, 10.0, 128);

    // Filter envelope.
    let filter_attack = ValueRef::new(0.0);
    let filter_decay = ValueRef::new(0.3);
    let filter_sustain = ValueRef::new(1.0);
    let filter_release = ValueRef::new(0.3);

    let filter_envelope = handler.add_voice_processor("fil env", Envelope::new());
    handler.bind_value(filter_envelope.in_("attack"), &filter_attack)?;
    handler.bind_value(filter_envelope.in_("decay"), &filter_decay)?;
    handler.bind_value(filter_envelope.in_("sustain"), &filter_sustain)?;
    handler.bind_value(filter_envelope.in_("release"), &filter_release)?;
    handler.connect(amp_env.out("finished"), filter_envelope.in_("trigger"))?;
    handler.connect(held, filter_envelope.in_("held"))?;

    let filter_envelope_depth = ValueRef::new(12.0);
    let scaled_envelope = handler.add_voice_processor("scaled fil env", Multiply::new());
    handler.connect(filter_envelope.out("value"), scaled_envelope.in_("a"))?;
    handler.bind_value(scaled_envelope.in_("b"), &filter_envelope_depth)?;

    insert_control(&mut controls, "fil attack", &filter_attack, 0.0, 3.0, 128);
    insert_control(&mut controls, "fil decay", &filter_decay, 0.0, 3.0, 128);
    insert_control(&mut controls, "fil sustain", &filter_sustain, 0.0, 1.0, 128);
    insert_control(&mut controls, "fil release", &filter_release, 0.0, 3.0, 128);
    insert_control(
        &mut controls,
        "fil env depth",
        &filter_envelope_depth,
        -127.0,
        127.0,
        127,
    );

    // Keytracking.
    let keytrack_amount = ValueRef::new(0.0);
    let current_keytrack = handler.add_voice_processor("keytrack", Multiply::new());
    handler.connect(note_from_center.out("out"), current_keytrack.in_("a"))?;
    handler.bind_value(current_keytrack.in_("b"), &keytrack_amount)?;
    insert_control(&mut controls, "keytrack", &keytrack_amount, -1.0, 1.0, 128);

    // Cutoff in MIDI-note space, then scaled to Hz.
    let base_cutoff_smooth = SmoothValue::new(92.0);
    let cutoff_value = base_cutoff_smooth.value_ref();
    let base_cutoff = handler.add_global_processor("base cutoff", base_cutoff_smooth);

    let keytracked_cutoff = handler.add_voice_processor("keytracked cutoff", Add::new());
    handler.connect(base_cutoff.out("out"), keytracked_cutoff.in_("a"))?;
    handler.connect(current_keytrack.out("out"), keytracked_cutoff.in_("b"))?;

    let envelope_cutoff = handler.add_voice_processor("envelope cutoff", Add::new());
    handler.connect(keytracked_cutoff.out("out"), envelope_cutoff.in_("a"))?;
    handler.connect(scaled_envelope.out("out"), envelope_cutoff.in_("b"))?;

    let cutoff_mod_depth = handler.add_voice_processor("cutoff mod depth", Multiply::new());
    handler.connect(matrix.out("cutoff"), cutoff_mod_depth.in_("a"))?;
    handler.bind_value(cutoff_mod_depth.in_("b"), &ValueRef::new(CUTOFF_MOD_RANGE))?;

    let midi_cutoff = handler.add_voice_processor("midi cutoff", Add::new());
    handler.connect(envelope_cutoff.out("out"), midi_cutoff.in_("a"))?;
    handler.connect(cutoff_mod_depth.out("out"), midi_cutoff.in_("b"))?;

    let frequency_cutoff = handler.add_voice_processor("frequency cutoff", MidiScale::new());
    handler.connect(midi_cutoff.out("out"), frequency_cutoff.in_("midi"))?;
    insert_control(&mut controls, "cutoff", &cutoff_value, 28.0, 127.0, 128);

    // Resonance with its matrix offset.
    let resonance_value = ValueRef::new(3.0);
    let resonance_mod_depth = handler.add_voice_processor("resonance mod depth", Multiply::new());
    handler.connect(matrix.out("resonance"), resonance_mod_depth.in_("a"))?;
    handler.bind_value(resonance_mod_depth.in_("b"), &ValueRef::new(RESONANCE_MOD_RANGE))?;

    let resonance = handler.add_voice_processor("resonance", Add::new());
    handler.bind_value(resonance.in_("a"), &resonance_value)?;
    handler.connect(resonance_mod_depth.out("out"), resonance.in_("b"))?;
    insert_control(&mut controls, "resonance", &resonance_value, 0.5, 15.0, 128);

    // Filter.
    let filter_type = ValueRef::new(0.0);
    let filter = handler.add_voice_processor("filter", Filter::new());
    handler.connect(oscillator_mix.out("out"), filter.in_("audio"))?;
    handler.bind_value(filter.in_("mode"), &filter_type)?;
    handler.connect(frequency_cutoff.out("frequency"), filter.in_("cutoff"))?;
    handler.connect(resonance.out("out"), filter.in_("resonance"))?;
    handler.connect(amp_env.out("finished"), filter.in_("reset"))?;
    insert_discrete(&mut controls, "filter type", &filter_type, FilterMode::strings());

    // Velocity tracking: interpolate between full level and the velocity.
    let velocity_track = ValueRef::new(0.3);
    let velocity_gain = handler.add_voice_processor("velocity gain", Interpolate::new());
    handler.bind_value(velocity_gain.in_("from"), &ValueRef::new(1.0))?;
    handler.connect(velocity, velocity_gain.in_("to"))?;
    handler.bind_value(velocity_gain.in_("fraction"), &velocity_track)?;
    insert_control(&mut controls, "velocity track", &velocity_track, 0.0, 1.0, 128);

    // Voice output: filtered audio * (envelope + matrix offset) * velocity.
    let amp_total = handler.add_voice_processor("amp total", Add::new());
    handler.connect(amp_env.out("value"), amp_total.in_("a"))?;
    handler.connect(matrix.out("amplitude"), amp_total.in_("b"))?;

    let amp_clamped = handler.add_voice_processor("amp clamp", Clamp::new(0.0, 2.0));
    handler.connect(amp_total.out("out"), amp_clamped.in_("in"))?;

    let amplified = handler.add_voice_processor("amplified", Multiply::new());
    handler.connect(filter.out("audio"), amplified.in_("a"))?;
    handler.connect(amp_clamped.out("out"), amplified.in_("b"))?;

    let voice_output = handler.add_voice_processor("voice output", Multiply::new());
    handler.connect(amplified.out("out"), voice_output.in_("a"))?;
    handler.connect(velocity_gain.out("out"), voice_output.in_("b"))?;

    handler.set_voice_output(voice_output.out("out"));
    handler.set_voice_killer(amp_env.out("value"));

    // Matrix sources. Oscillator edges are feedback: their pitch is itself
    // a matrix destination.
    let note_mod_source = handler.add_voice_processor("note mod source", Multiply::new());
    handler.connect(note_from_center.out("out"), note_mod_source.in_("a"))?;
    handler.bind_value(
        note_mod_source.in_("b"),
        &ValueRef::new(2.0 / MIDI_SIZE as f64),
    )?;

    handler.connect_feedback(oscillator1.out("audio"), matrix.in_("osc 1"))?;
    handler.connect_feedback(oscillator2.out("audio"), matrix.in_("osc 2"))?;
    handler.connect(lfo1.out("audio"), matrix.in_("lfo 1"))?;
    handler.connect(lfo2.out("audio"), matrix.in_("lfo 2"))?;
    handler.connect(amp_env.out("value"), matrix.in_("amp env"))?;
    handler.connect(filter_envelope.out("value"), matrix.in_("fil env"))?;
    handler.connect(note_mod_source.out("out"), matrix.in_("note"))?;
    handler.connect(velocity, matrix.in_("velocity"))?;
    handler.connect(wheel_node.out("out"), matrix.in_("pitch wheel"))?;
    handler.connect(mod_wheel_node.out("out"), matrix.in_("mod wheel"))?;

    Ok((handler, controls, pitch_wheel))
}

impl Synth {
    /// Construct the engine
    ///
    /// `block_size` must be a power of two no larger than
    /// [`MAX_BLOCK_SIZE`]; `sample_rate` must be positive and finite.
    pub fn new(sample_rate: f64, block_size: usize) -> Result<Self, GraphError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(GraphError::InvalidConfig("sample rate must be positive"));
        }
        if block_size == 0 || !block_size.is_power_of_two() || block_size > MAX_BLOCK_SIZE {
            return Err(GraphError::InvalidConfig(
                "block size must be a power of two within the compile-time maximum",
            ));
        }

        let (mut handler, mut controls, pitch_wheel) = build_voice_handler(sample_rate)?;

        let polyphony = handler.polyphony_value();
        polyphony.set(12.0);
        insert_control(&mut controls, "polyphony", &polyphony, 1.0, 32.0, 31);

        handler.finalize_voices(DEFAULT_POLYPHONY)?;

        // Post-voice effects: delay, volume, output clamp.
        let mut graph = Router::new(sample_rate);
        let voices = graph.add("voices", handler);

        let delay_time_smooth = SmoothValue::new(0.06);
        let delay_time = delay_time_smooth.value_ref();
        let delay_time_node = graph.add("delay time", delay_time_smooth);

        let delay_feedback_smooth = SmoothValue::new(-0.3);
        let delay_feedback = delay_feedback_smooth.value_ref();
        let delay_feedback_node = graph.add("delay feedback", delay_feedback_smooth);

        let delay_wet_smooth = SmoothValue::new(0.3);
        let delay_wet = delay_wet_smooth.value_ref();
        let delay_wet_node = graph.add("delay wet", delay_wet_smooth);

        let delay = graph.add("delay", Delay::new());
        graph.connect(voices.out("audio"), delay.in_("audio"))?;
        graph.connect(delay_time_node.out("out"), delay.in_("time"))?;
        graph.connect(delay_feedback_node.out("out"), delay.in_("feedback"))?;
        graph.connect(delay_wet_node.out("out"), delay.in_("wet"))?;

        insert_control(&mut controls, "delay time", &delay_time, 0.01, 1.0, 128);
        insert_control(&mut controls, "delay feedback", &delay_feedback, -1.0, 1.0, 128);
        insert_control(&mut controls, "delay dry/wet", &delay_wet, 0.0, 1.0, 128);

        let volume_smooth = SmoothValue::new(0.6);
        let volume = volume_smooth.value_ref();
        let volume_node = graph.add("volume", volume_smooth);

        let scaled_audio = graph.add("scaled audio", Multiply::new());
        graph.connect(delay.out("audio"), scaled_audio.in_("a"))?;
        graph.connect(volume_node.out("out"), scaled_audio.in_("b"))?;
        insert_control(&mut controls, "volume", &volume, 0.0, 1.0, 128);

        let output_clamp = graph.add("output clamp", Clamp::new(-1.0, 1.0));
        graph.connect(scaled_audio.out("out"), output_clamp.in_("in"))?;

        graph.compile()?;

        Ok(Self {
            graph,
            voices: voices.id(),
            output: output_clamp.out("out"),
            controls,
            learned: StdMap::new(),
            pitch_wheel,
            sample_rate,
            block_size,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Rebuild rate-dependent state; call outside `render`
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            log::warn!("ignoring invalid sample rate {}", sample_rate);
            return;
        }
        self.sample_rate = sample_rate;
        self.graph.set_graph_sample_rate(sample_rate);
    }

    /// Render audio into `buffer`, chunked by the block size
    ///
    /// Never fails and never allocates; every sample written is finite.
    pub fn render(&mut self, buffer: &mut [f64]) {
        let mut start = 0;
        while start < buffer.len() {
            let frames = (buffer.len() - start).min(self.block_size);
            self.graph.process_block(frames);
            let output = self.graph.read(self.output);
            buffer[start..start + frames].copy_from_slice(&output[..frames]);
            start += frames;
        }
    }

    /// Dispatch a 3-byte MIDI message; malformed input is dropped
    pub fn on_midi(&mut self, message: &[u8]) {
        if message.len() < 3 {
            return;
        }
        let (status, data1, data2) = (message[0], message[1], message[2]);
        match status {
            0x80..=0x8F => self.note_off(data1),
            0x90..=0x9F => {
                if data2 == 0 {
                    self.note_off(data1);
                } else {
                    self.note_on(data1, data2 as f64 / 127.0);
                }
            }
            0xB0 => self.control_change(data1, data2),
            // Coarse pitch bend: only the high data byte is honored.
            0xE0 => self.set_pitch_wheel((2.0 * data2 as f64) / 127.0 - 1.0),
            _ => {}
        }
    }

    fn control_change(&mut self, id: u8, value: u8) {
        if id == SUSTAIN_CC {
            if value >= 64 {
                self.sustain_on();
            } else {
                self.sustain_off();
            }
            return;
        }

        if id == MOD_WHEEL_CC {
            if let Some(control) = self.controls.get_mut("mod wheel") {
                control.set_midi(value);
            }
        }

        let learned = self
            .learned
            .iter()
            .find(|(_, &cc)| cc == id)
            .map(|(name, _)| name.clone());
        if let Some(name) = learned {
            if let Some(control) = self.controls.get_mut(&name) {
                control.set_midi(value);
            }
        }
    }

    pub fn note_on(&mut self, note: u8, velocity: f64) {
        if let Some(handler) = self.voice_handler_mut() {
            handler.note_on(note, velocity);
        }
    }

    pub fn note_off(&mut self, note: u8) {
        if let Some(handler) = self.voice_handler_mut() {
            handler.note_off(note);
        }
    }

    pub fn sustain_on(&mut self) {
        if let Some(handler) = self.voice_handler_mut() {
            handler.sustain_on();
        }
    }

    pub fn sustain_off(&mut self) {
        if let Some(handler) = self.voice_handler_mut() {
            handler.sustain_off();
        }
    }

    /// Pitch wheel position in [-1, 1]
    pub fn set_pitch_wheel(&mut self, value: f64) {
        if !value.is_finite() {
            log::warn!("ignoring non-finite pitch wheel value");
            return;
        }
        self.pitch_wheel.set(value.clamp(-1.0, 1.0));
    }

    /// Mod wheel position in [0, 1]
    pub fn set_mod_wheel(&mut self, value: f64) {
        if let Some(control) = self.controls.get_mut("mod wheel") {
            control.set(value);
        }
    }

    /// The voice handler node, for inspection
    pub fn voice_handler_mut(&mut self) -> Option<&mut VoiceHandler> {
        self.graph
            .processor_mut(self.voices)
            .and_then(|processor| processor.as_any_mut().downcast_mut::<VoiceHandler>())
    }

    pub fn controls(&self) -> &ControlMap {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlMap {
        &mut self.controls
    }

    /// Snapshot every control value as JSON
    pub fn save_patch(&self) -> Result<String, serde_json::Error> {
        serialize::patch_to_json(&self.controls)
    }

    /// Apply a JSON patch; unknown names are ignored
    pub fn load_patch(&mut self, json: &str) -> Result<(), serde_json::Error> {
        serialize::patch_from_json(&mut self.controls, json)
    }

    /// Bind a MIDI CC to a control (one control per CC)
    pub fn learn(&mut self, name: &str, cc: u8) {
        if !self.controls.contains_key(name) {
            log::warn!("cannot learn unknown control {:?}", name);
            return;
        }
        self.learned.retain(|_, existing| *existing != cc);
        for control in self.controls.values_mut() {
            if control.midi_learn() == Some(cc) {
                control.set_midi_learn(None);
            }
        }
        self.learned.insert(name.to_string(), cc);
        if let Some(control) = self.controls.get_mut(name) {
            control.set_midi_learn(Some(cc));
        }
    }

    /// Remove a control's CC binding
    pub fn clear_learned(&mut self, name: &str) {
        self.learned.remove(name);
        if let Some(control) = self.controls.get_mut(name) {
            control.set_midi_learn(None);
        }
    }

    pub fn midi_learn_map(&self) -> &StdMap<String, u8> {
        &self.learned
    }

    pub fn save_midi_learn(&self) -> Result<String, serde_json::Error> {
        serialize::midi_learn_to_json(&self.learned)
    }

    pub fn load_midi_learn(&mut self, json: &str) -> Result<(), serde_json::Error> {
        let assignments = serialize::midi_learn_from_json(json)?;
        for (name, cc) in assignments {
            self.learn(&name, cc);
        }
        Ok(())
    }

    /// Tear down playback state: all voices reclaimed, lines cleared
    pub fn reset(&mut self) {
        self.graph.reset();
    }
}
