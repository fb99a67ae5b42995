//! Patch and Configuration Snapshots
//!
//! A patch is a flat JSON object mapping control name to number (discrete
//! controls store their step index). Loading applies known names through
//! `Control::set`, ignores unknown names for forward compatibility, and
//! leaves missing names untouched. The MIDI-learn map is a separate flat
//! JSON object mapping control name to CC number.

use crate::control::ControlMap;
use crate::StdMap;
use serde::{Deserialize, Serialize};

/// Serializable snapshot of every control value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSnapshot {
    pub values: StdMap<String, f64>,
}

/// Serializable MIDI-learn assignments (control name to CC number)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MidiLearnSnapshot {
    pub assignments: StdMap<String, u8>,
}

/// Write every control value as a JSON patch
pub fn patch_to_json(controls: &ControlMap) -> Result<String, serde_json::Error> {
    let snapshot = PatchSnapshot {
        values: controls
            .iter()
            .map(|(name, control)| (name.clone(), control.value()))
            .collect(),
    };
    serde_json::to_string_pretty(&snapshot)
}

/// Apply a JSON patch to the control map
///
/// Unknown names are ignored; controls absent from the patch keep their
/// current value.
pub fn patch_from_json(controls: &mut ControlMap, json: &str) -> Result<(), serde_json::Error> {
    let snapshot: PatchSnapshot = serde_json::from_str(json)?;
    for (name, value) in snapshot.values {
        match controls.get_mut(&name) {
            Some(control) => control.set(value),
            None => log::debug!("ignoring unknown patch field {:?}", name),
        }
    }
    Ok(())
}

/// Write the MIDI-learn assignments as JSON
pub fn midi_learn_to_json(
    assignments: &StdMap<String, u8>,
) -> Result<String, serde_json::Error> {
    let snapshot = MidiLearnSnapshot {
        assignments: assignments.clone(),
    };
    serde_json::to_string_pretty(&snapshot)
}

/// Parse MIDI-learn assignments from JSON
pub fn midi_learn_from_json(json: &str) -> Result<StdMap<String, u8>, serde_json::Error> {
    let snapshot: MidiLearnSnapshot = serde_json::from_str(json)?;
    Ok(snapshot.assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use crate::port::ValueRef;

    fn sample_controls() -> ControlMap {
        let mut controls = ControlMap::new();
        controls.insert(
            "cutoff".to_string(),
            Control::new(&ValueRef::new(92.0), 28.0, 127.0, 128),
        );
        controls.insert(
            "volume".to_string(),
            Control::new(&ValueRef::new(0.6), 0.0, 1.0, 128),
        );
        controls.insert(
            "portamento type".to_string(),
            Control::discrete(&ValueRef::new(0.0), &["off", "auto", "on"]),
        );
        controls
    }

    #[test]
    fn test_patch_roundtrip_exact() {
        let mut controls = sample_controls();
        controls.get_mut("cutoff").unwrap().set(101.0);
        controls.get_mut("volume").unwrap().set(0.37);
        controls.get_mut("portamento type").unwrap().set(2.0);

        let json = patch_to_json(&controls).unwrap();

        let mut restored = sample_controls();
        patch_from_json(&mut restored, &json).unwrap();

        assert_eq!(restored.get("cutoff").unwrap().value(), 101.0);
        assert_eq!(restored.get("volume").unwrap().value(), 0.37);
        assert_eq!(restored.get("portamento type").unwrap().value(), 2.0);
        assert_eq!(
            restored.get("portamento type").unwrap().display_string(),
            Some("on")
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut controls = sample_controls();
        let json = r#"{ "cutoff": 60.0, "flux capacitor": 88.0 }"#;
        patch_from_json(&mut controls, json).unwrap();
        assert_eq!(controls.get("cutoff").unwrap().value(), 60.0);
    }

    #[test]
    fn test_missing_fields_keep_current_value() {
        let mut controls = sample_controls();
        controls.get_mut("volume").unwrap().set(0.9);
        let json = r#"{ "cutoff": 60.0 }"#;
        patch_from_json(&mut controls, json).unwrap();
        assert_eq!(controls.get("volume").unwrap().value(), 0.9);
    }

    #[test]
    fn test_loaded_values_are_clamped() {
        let mut controls = sample_controls();
        let json = r#"{ "volume": 12.0 }"#;
        patch_from_json(&mut controls, json).unwrap();
        assert_eq!(controls.get("volume").unwrap().value(), 1.0);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let mut controls = sample_controls();
        assert!(patch_from_json(&mut controls, "not json").is_err());
    }

    #[test]
    fn test_midi_learn_roundtrip() {
        let mut assignments = StdMap::new();
        assignments.insert("cutoff".to_string(), 74u8);
        assignments.insert("resonance".to_string(), 71u8);

        let json = midi_learn_to_json(&assignments).unwrap();
        let restored = midi_learn_from_json(&json).unwrap();
        assert_eq!(restored, assignments);
    }
}
