//! MIDI helpers for scripts.
//!
//! `midi_outputs()` returns an array of `[prefix, suffix]` pairs. The
//! helpers below each return a one-element array so scripts can build the
//! table by concatenation:
//!
//! ```rhai
//! fn midi_outputs() {
//!     controller_event(7) + controller_event(10) + note_event(60, true)
//! }
//! ```
//!
//! Callbacks receive and fill [`ControlMap`]s keyed by controller, note or
//! program number (inputs) and by output slot (outputs).

use crate::codec::{encode, OutputTemplate, OutputTemplateTable};
use crate::error::{Error, Result};
use crate::midi::{MidiMessage, OUTPUT_CHANNEL};
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Integer-keyed map shared between the host and a script callback.
#[derive(Debug, Clone, Default)]
pub struct ControlMap {
    entries: Arc<Mutex<BTreeMap<i64, i64>>>,
}

impl ControlMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_mut(&self) -> MutexGuard<'_, BTreeMap<i64, i64>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: i64, value: i64) {
        self.entries_mut().insert(key, value);
    }

    pub fn get(&self, key: i64) -> Option<i64> {
        self.entries_mut().get(&key).copied()
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries_mut().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries_mut().is_empty()
    }

    /// Snapshot of all entries in ascending key order.
    pub fn entries(&self) -> Vec<(i64, i64)> {
        self.entries_mut().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl FromIterator<(i64, i64)> for ControlMap {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(Mutex::new(iter.into_iter().collect())),
        }
    }
}

impl fmt::Display for ControlMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.entries().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, value)?;
        }
        write!(f, "}}")
    }
}

fn data_byte(value: i64, what: &str) -> ScriptResult<u8> {
    if (0..=127).contains(&value) {
        Ok(value as u8)
    } else {
        Err(format!("{} must be in 0..=127, got {}", what, value).into())
    }
}

fn template_entry(message: MidiMessage) -> ScriptResult<Array> {
    let template = encode(&message).map_err(|e| e.to_string())?;
    let pair: Array = vec![
        Dynamic::from_blob(template.prefix),
        Dynamic::from_blob(template.suffix),
    ];
    Ok(vec![Dynamic::from_array(pair)])
}

/// Output whose value is the controller value of `cc`.
fn controller_event(cc: i64) -> ScriptResult<Array> {
    let cc = data_byte(cc, "controller number")?;
    template_entry(MidiMessage::controller(OUTPUT_CHANNEL, cc, 0))
}

/// Output whose value is the velocity of `note`.
fn note_event(note: i64, on: bool) -> ScriptResult<Array> {
    let note = data_byte(note, "note number")?;
    let message = if on {
        MidiMessage::note_on(OUTPUT_CHANNEL, note, 0)
    } else {
        MidiMessage::note_off(OUTPUT_CHANNEL, note, 0)
    };
    template_entry(message)
}

/// Output whose value is the program number.
fn program_change_event() -> ScriptResult<Array> {
    template_entry(MidiMessage::program_change(OUTPUT_CHANNEL, 0))
}

/// Output built from a complete example message; its last byte is variable.
fn midi_event(bytes: Array) -> ScriptResult<Array> {
    let bytes = bytes
        .into_iter()
        .map(|b| -> ScriptResult<u8> {
            let b = b
                .as_int()
                .map_err(|t| format!("MIDI bytes must be integers, got {}", t))?;
            u8::try_from(b).map_err(|_| format!("MIDI byte out of range: {}", b).into())
        })
        .collect::<ScriptResult<Vec<u8>>>()?;
    template_entry(MidiMessage::from_bytes(bytes))
}

fn midi_event_blob(bytes: Blob) -> ScriptResult<Array> {
    template_entry(MidiMessage::from_bytes(bytes))
}

fn bytes_from_dynamic(value: Dynamic) -> Result<Vec<u8>> {
    if value.is_blob() {
        return value.into_blob().map_err(|t| Error::InvalidTemplate(t.to_string()));
    }
    let items = value.into_array().map_err(|t| {
        Error::InvalidTemplate(format!("expected a blob or an array of bytes, got {}", t))
    })?;
    items
        .into_iter()
        .map(|item| {
            let byte = item.as_int().map_err(|t| {
                Error::InvalidTemplate(format!("template bytes must be integers, got {}", t))
            })?;
            u8::try_from(byte)
                .map_err(|_| Error::InvalidTemplate(format!("byte out of range: {}", byte)))
        })
        .collect()
}

fn template_from_dynamic(value: Dynamic) -> Result<OutputTemplate> {
    let pair = value.into_array().map_err(|t| {
        Error::InvalidTemplate(format!("expected a [prefix, suffix] pair, got {}", t))
    })?;
    let [prefix, suffix]: [Dynamic; 2] = pair.try_into().map_err(|pair: Array| {
        Error::InvalidTemplate(format!(
            "expected a [prefix, suffix] pair, got {} elements",
            pair.len()
        ))
    })?;
    let template = OutputTemplate::new(bytes_from_dynamic(prefix)?, bytes_from_dynamic(suffix)?);
    template.validate()?;
    Ok(template)
}

/// Convert the value returned by `midi_outputs()` into a template table.
pub(crate) fn templates_from_dynamic(value: Dynamic) -> Result<OutputTemplateTable> {
    let entries = value.into_array().map_err(|t| {
        Error::InvalidTemplate(format!("midi_outputs() must return an array, got {}", t))
    })?;
    let templates = entries
        .into_iter()
        .enumerate()
        .map(|(slot, entry)| {
            template_from_dynamic(entry).map_err(|e| match e {
                Error::InvalidTemplate(msg) => {
                    Error::InvalidTemplate(format!("output {}: {}", slot, msg))
                }
                other => other,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(OutputTemplateTable::new(templates))
}

/// Register [`ControlMap`] and the MIDI output helpers.
pub fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<ControlMap>("ControlMap")
        .register_indexer_get(|map: &mut ControlMap, key: i64| -> Dynamic {
            map.get(key).map(Dynamic::from_int).unwrap_or(Dynamic::UNIT)
        })
        .register_indexer_set(|map: &mut ControlMap, key: i64, value: i64| {
            map.insert(key, value)
        })
        .register_indexer_set(|map: &mut ControlMap, key: i64, value: f64| {
            map.insert(key, value as i64)
        })
        .register_fn("contains", |map: &mut ControlMap, key: i64| map.contains(key))
        .register_fn("keys", |map: &mut ControlMap| -> Array {
            map.entries()
                .into_iter()
                .map(|(k, _)| Dynamic::from_int(k))
                .collect()
        })
        .register_fn("len", |map: &mut ControlMap| map.len() as i64)
        .register_fn("is_empty", |map: &mut ControlMap| map.is_empty())
        .register_fn("to_string", |map: &mut ControlMap| map.to_string())
        .register_fn("to_debug", |map: &mut ControlMap| format!("ControlMap {}", map));

    engine
        .register_fn("controller_event", controller_event)
        .register_fn("note_event", note_event)
        .register_fn("program_change_event", program_change_event)
        .register_fn("midi_event", midi_event)
        .register_fn("midi_event", midi_event_blob);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_engine;
    use rhai::Scope;

    #[test]
    fn test_helpers_build_template_table() {
        let engine = create_engine();
        let value: Dynamic = engine
            .eval("controller_event(7) + note_event(60, false) + program_change_event()")
            .unwrap();
        let table = templates_from_dynamic(value).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0).unwrap().prefix, vec![0xB0, 7]);
        assert_eq!(table.get(1).unwrap().prefix, vec![0x80, 60]);
        assert_eq!(table.get(2).unwrap().prefix, vec![0xC0]);
    }

    #[test]
    fn test_integer_array_templates() {
        let engine = create_engine();
        let value: Dynamic = engine.eval("[[[0xB0, 74], []]]").unwrap();
        let table = templates_from_dynamic(value).unwrap();
        assert_eq!(table.get(0).unwrap().prefix, vec![0xB0, 74]);
        assert!(table.get(0).unwrap().suffix.is_empty());
    }

    #[test]
    fn test_malformed_templates_rejected() {
        let engine = create_engine();
        for script in ["42", "[[0xB0, 7]]", "[[[0xB0], [], []]]", "[[[0xB0, 7, 1], []]]", "[[[0x1B0], []]]"] {
            let value: Dynamic = engine.eval(script).unwrap();
            assert!(
                templates_from_dynamic(value).is_err(),
                "accepted {}",
                script
            );
        }
    }

    #[test]
    fn test_helper_range_errors() {
        let engine = create_engine();
        assert!(engine.eval::<Array>("controller_event(128)").is_err());
        assert!(engine.eval::<Array>("note_event(-1, true)").is_err());
        assert!(engine.eval::<Array>("midi_event([0xF0, 1, 0xF7])").is_err());
        let pitch: Array = engine.eval("midi_event([0xE0, 0, 64])").unwrap();
        assert_eq!(pitch.len(), 1);
    }

    #[test]
    fn test_control_map_shared_with_script() {
        let engine = create_engine();
        let inputs: ControlMap = [(7, 100)].into_iter().collect();
        let outputs = ControlMap::new();

        let mut scope = Scope::new();
        scope.push("inputs", inputs.clone());
        scope.push("outputs", outputs.clone());
        engine
            .run_with_scope(
                &mut scope,
                r#"
                    if inputs.contains(7) { outputs[0] = inputs[7]; }
                    outputs[1] = 12.9;
                    if type_of(inputs[3]) != "()" { outputs[2] = 1; }
                "#,
            )
            .unwrap();

        assert_eq!(outputs.entries(), vec![(0, 100), (1, 12)]);
        assert_eq!(outputs.to_string(), "{0: 100, 1: 12}");
    }
}
