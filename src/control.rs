//! Named Parameter Handles
//!
//! A `Control` is the human-facing side of a parameter source: a named,
//! bounded, steppable handle over the shared scalar a processor reads.
//! Controls with display strings are discrete selectors whose value is the
//! string index.

use crate::port::ValueRef;
use crate::StdMap;

/// Mapping from stable control name to control
pub type ControlMap = StdMap<String, Control>;

/// A named, bounded, steppable handle over a parameter source
#[derive(Clone)]
pub struct Control {
    value: ValueRef,
    min: f64,
    max: f64,
    resolution: u32,
    current: f64,
    display_strings: Option<&'static [&'static str]>,
    midi_learn: Option<u8>,
}

impl Control {
    /// Continuous control over [min, max] with `resolution` MIDI steps
    pub fn new(value: &ValueRef, min: f64, max: f64, resolution: u32) -> Self {
        assert!(max > min, "control range must be non-empty");
        assert!(resolution >= 1, "control resolution must be at least 1");
        Self {
            value: value.clone(),
            min,
            max,
            resolution,
            current: value.get(),
            display_strings: None,
            midi_learn: None,
        }
    }

    /// Discrete selector over a fixed display-string list
    pub fn discrete(value: &ValueRef, strings: &'static [&'static str]) -> Self {
        assert!(strings.len() >= 2, "discrete control needs at least two options");
        let mut control = Self::new(value, 0.0, (strings.len() - 1) as f64, (strings.len() - 1) as u32);
        control.display_strings = Some(strings);
        control
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn value(&self) -> f64 {
        self.current
    }

    pub fn is_discrete(&self) -> bool {
        self.display_strings.is_some()
    }

    /// Bipolar ranges are a presentational hint for UIs
    pub fn is_bipolar(&self) -> bool {
        self.min == -self.max && self.max > 0.0
    }

    pub fn display_strings(&self) -> Option<&'static [&'static str]> {
        self.display_strings
    }

    /// Display string for the current value of a discrete control
    pub fn display_string(&self) -> Option<&'static str> {
        let strings = self.display_strings?;
        strings.get(self.current.round().max(0.0) as usize).copied()
    }

    pub fn midi_learn(&self) -> Option<u8> {
        self.midi_learn
    }

    pub fn set_midi_learn(&mut self, cc: Option<u8>) {
        self.midi_learn = cc;
    }

    /// Set the value, clamped to range (discrete controls round to a step)
    ///
    /// Non-finite input is dropped with a warning; the control keeps its
    /// current value.
    pub fn set(&mut self, value: f64) {
        if !value.is_finite() {
            log::warn!("ignoring non-finite control value {}", value);
            return;
        }
        let mut value = value.clamp(self.min, self.max);
        if self.is_discrete() {
            value = value.round();
        }
        self.current = value;
        self.value.set(value);
    }

    /// Set from a MIDI data byte in [0, 127]
    ///
    /// Quantizes to `round(b * resolution / 127)` steps, then scales into
    /// the range; both endpoints are hit exactly.
    pub fn set_midi(&mut self, byte: u8) {
        let byte = byte.min(127) as f64;
        let resolution = self.resolution as f64;
        let step = (byte * resolution / 127.0).round();
        self.apply_step(step);
    }

    /// Position in the range as a fraction of [0, 1]
    pub fn percentage(&self) -> f64 {
        (self.current - self.min) / (self.max - self.min)
    }

    /// Set from a fraction of the range, snapped to a step
    pub fn set_percentage(&mut self, fraction: f64) {
        if !fraction.is_finite() {
            log::warn!("ignoring non-finite control percentage {}", fraction);
            return;
        }
        let step = (fraction.clamp(0.0, 1.0) * self.resolution as f64).round();
        self.apply_step(step);
    }

    /// Move up one step
    pub fn increment(&mut self) {
        let step = (self.max - self.min) / self.resolution as f64;
        self.set(self.current + step);
    }

    /// Move down one step
    pub fn decrement(&mut self) {
        let step = (self.max - self.min) / self.resolution as f64;
        self.set(self.current - step);
    }

    fn apply_step(&mut self, step: f64) {
        let resolution = self.resolution as f64;
        let value = self.min + step * (self.max - self.min) / resolution;
        self.current = value.clamp(self.min, self.max);
        self.value.set(self.current);
    }
}
