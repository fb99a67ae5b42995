//! # Katydid: Polyphonic Subtractive Synthesizer Engine
//!
//! > *"A katydid sings by drawing one wing across the other: a small machine
//! > of moving parts producing one voice. Stack enough of them and you get a
//! > chorus."*
//!
//! `katydid` is a Rust library implementing the core of a MIDI-driven
//! polyphonic subtractive synthesizer: a graph of block-rate signal
//! processors assembled into a voice handler that allocates and reclaims
//! voices on note events and renders mono audio in a real-time callback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Synth                                   │  MIDI dispatch, controls,
//! │  - parameter catalog (ControlMap)        │  patch snapshots
//! │  - render() / on_midi()                  │
//! ├──────────────────────────────────────────┤
//! │  VoiceHandler                            │  Voice allocation/stealing,
//! │  - per-voice subgraph × N voices         │  sustain pedal, killer signal
//! │  - shared global processors              │
//! ├──────────────────────────────────────────┤
//! │  Router                                  │  Topologically ordered
//! │  - nodes, cables, feedback edges         │  block scheduling
//! ├──────────────────────────────────────────┤
//! │  Processors                              │  Oscillator, Filter,
//! │  - block-rate process() contract         │  Envelope, Delay, triggers,
//! │  - typed input/output ports              │  smoothing, mod matrix
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Signal conventions
//!
//! | Signal | Range | Description |
//! |--------|-------|-------------|
//! | Audio | ±1.0 | Full-rate sample data |
//! | Control | any | One authoritative sample per block |
//! | Trigger | 0 or event value | Zero except at event samples |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use katydid::prelude::*;
//!
//! // Construct the engine at 44.1kHz with 64-sample blocks.
//! let mut synth = Synth::new(44100.0, 64).unwrap();
//!
//! // Turn a knob and play a note.
//! synth.controls_mut().get_mut("cutoff").unwrap().set(96.0);
//! synth.note_on(69, 1.0);
//!
//! // Pull audio from the real-time callback.
//! let mut buffer = vec![0.0; 64];
//! synth.render(&mut buffer);
//! ```
//!
//! ## Threading
//!
//! The engine owns no threads. The host calls [`Synth::render`] from its
//! audio callback and the remaining entry points from MIDI/UI threads,
//! serialized behind one coarse mutex (knob turns and patch loads contend
//! only at human interaction rates). [`Synth`] is `Send`; `render` performs
//! no heap allocation.
//!
//! ## Module map
//!
//! - [`port`] - Port declarations, audio blocks, shared control scalars
//! - [`graph`] - The `Processor` contract and the `Router` scheduler
//! - [`modules`] - All leaf DSP processors
//! - [`polyphony`] - Voice handling, allocation and stealing
//! - [`control`] - Named, bounded, steppable parameter handles
//! - [`synth`] - The assembled instrument
//! - [`serialize`] - Patch and MIDI-learn snapshots as JSON

pub mod control;
pub mod graph;
pub mod modules;
pub mod polyphony;
pub mod port;
pub mod rng;
pub mod serialize;
pub mod synth;

/// Ordered map used throughout the crate.
///
/// BTreeMap keeps control listings and serialized patches in a stable order,
/// which also keeps renders deterministic across runs.
pub type StdMap<K, V> = std::collections::BTreeMap<K, V>;

/// Largest block size the engine can be constructed with.
pub const MAX_BLOCK_SIZE: usize = 256;

/// Default processing block size.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Number of distinct MIDI note/value steps.
pub const MIDI_SIZE: usize = 128;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::control::{Control, ControlMap};
    pub use crate::graph::{
        GraphError, NodeHandle, NodeId, PortRef, ProcessContext, Processor, Router, StateBank,
    };
    pub use crate::modules::{
        Add, Clamp, Crossfader, Delay, Envelope, Filter, FilterMode, Interpolate, LegatoFilter,
        LinearSlope, MidiScale, ModMatrix, Multiply, Oscillator, PortamentoFilter, SmoothValue,
        TriggerCombiner, TriggerWait, Waveform,
    };
    pub use crate::polyphony::{VoiceHandler, VoiceState, TRIGGER_ON, TRIGGER_RESET};
    pub use crate::port::{Block, PortDef, PortSpec, SignalRate, ValueRef};
    pub use crate::serialize::{
        midi_learn_from_json, midi_learn_to_json, patch_from_json, patch_to_json,
    };
    pub use crate::synth::Synth;
    pub use crate::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIDI_SIZE};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
