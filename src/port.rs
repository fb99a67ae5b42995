//! Port Declarations and Signal Plumbing
//!
//! This module defines the signal-rate conventions, the port declarations a
//! processor publishes, the audio block that every output owns, and the
//! shared scalar (`ValueRef`) that binds named controls to processor inputs.

use crate::MAX_BLOCK_SIZE;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Semantic signal classification for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalRate {
    /// Full-rate sample data, one valid sample per frame
    Audio,

    /// One authoritative sample per block (the first)
    Control,

    /// Zero except at event samples; event samples carry the event value
    Trigger,
}

/// Definition of a single port (input or output)
#[derive(Debug, Clone)]
pub struct PortDef {
    /// Human-readable name (e.g., "cutoff", "audio", "retrigger")
    pub name: &'static str,

    /// Signal rate for documentation and wiring sanity
    pub rate: SignalRate,
}

impl PortDef {
    pub const fn new(name: &'static str, rate: SignalRate) -> Self {
        Self { name, rate }
    }

    pub const fn audio(name: &'static str) -> Self {
        Self::new(name, SignalRate::Audio)
    }

    pub const fn control(name: &'static str) -> Self {
        Self::new(name, SignalRate::Control)
    }

    pub const fn trigger(name: &'static str) -> Self {
        Self::new(name, SignalRate::Trigger)
    }
}

/// Specification of all ports for a processor
///
/// Ports are addressed by position; the declaration order is the port index.
#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<PortDef>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }
}

/// A fixed-capacity audio buffer owned by one output port
///
/// Blocks are allocated once at construction and rewritten every block; a
/// processing pass touches only the first `frames` samples. Feedback readers
/// see the previous block's content because blocks are never cleared between
/// passes.
#[derive(Debug, Clone)]
pub struct Block {
    samples: Vec<f64>,
}

impl Block {
    /// Create a zeroed block of the maximum block size
    pub fn new() -> Self {
        Self {
            samples: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.samples
    }

    /// Fill the first `frames` samples with a constant value
    #[inline]
    pub fn fill(&mut self, value: f64, frames: usize) {
        self.samples[..frames.min(MAX_BLOCK_SIZE)].fill(value);
    }

    /// Zero the whole block
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic f64 for lock-free communication between threads
///
/// Uses AtomicU64 internally since there's no native AtomicF64.
/// Suitable for real-time audio thread communication.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// Create a new atomic f64 with the given initial value
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Get the current value
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set a new value
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// A shared control-rate scalar
///
/// A `ValueRef` is the single parameter source behind a named control: the
/// control writes it from the UI/MIDI side, and any number of processor
/// inputs read it at block boundaries. Cloning a `ValueRef` clones the
/// handle, not the value, so per-voice processor clones keep reading the same
/// knob.
#[derive(Debug, Clone, Default)]
pub struct ValueRef(Arc<AtomicF64>);

impl ValueRef {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicF64::new(value)))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.0.get()
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.0.set(value);
    }
}
