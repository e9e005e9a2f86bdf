//! Block processing: host buffers in, script callbacks, host buffers out.
//!
//! For each block, under the runtime lock:
//!
//! 1. Incoming MIDI is split into controller, note-on, note-off and
//!    program-change maps, each only when the script declares the matching
//!    handler. Everything else passes through untouched.
//! 2. `process_audio`, `process_controls`, `process_notes` (on, then off)
//!    and `process_program_changes` are called. The MIDI handlers share one
//!    output map of `slot -> value`.
//! 3. Every output entry is rebuilt from its template. Controller outputs
//!    that repeat the last emitted value are dropped (CC pickup).
//!
//! A failing callback is recorded in the [`ProcessReport`]; later stages
//! still run.

use crate::api::{AudioChannel, ControlMap};
use crate::audio::AudioBuffer;
use crate::context::{Capabilities, ContextState, ExecutionContext};
use crate::error::{Error, Result};
use crate::midi::{MidiBuffer, MidiEventKind};
use rhai::{Array, Dynamic, Engine};
use std::collections::HashMap;
use std::sync::Arc;

/// Last emitted value per controller number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CcPickupCache {
    last: HashMap<u8, u8>,
}

impl CcPickupCache {
    /// Record `value` for `controller`, false if it repeats the last one.
    pub fn should_emit(&mut self, controller: u8, value: u8) -> bool {
        if self.last.get(&controller) == Some(&value) {
            return false;
        }
        self.last.insert(controller, value);
        true
    }

    /// Last value emitted for `controller`, if any.
    pub fn last_value(&self, controller: u8) -> Option<u8> {
        self.last.get(&controller).copied()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    /// Forget every emitted value.
    pub fn clear(&mut self) {
        self.last.clear();
    }
}

/// What happened to one block.
#[derive(Debug, Default)]
pub struct ProcessReport {
    /// Input events copied to the output unchanged.
    pub passed_through: usize,
    /// Reconstructed events added to the output.
    pub emitted: usize,
    /// Controller outputs dropped by CC pickup.
    pub suppressed: usize,
    /// Output entries with an unknown slot or an invalid value.
    pub skipped: usize,
    pub faults: Vec<Error>,
}

#[derive(Default)]
struct ClassifiedInput {
    controls: ControlMap,
    notes_on: ControlMap,
    notes_off: ControlMap,
    /// program -> channel
    programs: ControlMap,
    passthrough: MidiBuffer,
}

fn classify(capabilities: &Capabilities, midi: &MidiBuffer) -> ClassifiedInput {
    let mut input = ClassifiedInput::default();

    for event in midi {
        match event.message.kind() {
            MidiEventKind::ControlChange {
                controller, value, ..
            } if capabilities.process_controls => {
                input.controls.insert(controller as i64, value as i64);
            }
            MidiEventKind::NoteOn { note, velocity, .. } if capabilities.process_notes => {
                input.notes_on.insert(note as i64, velocity as i64);
            }
            MidiEventKind::NoteOff { note, velocity, .. } if capabilities.process_notes => {
                input.notes_off.insert(note as i64, velocity as i64);
            }
            MidiEventKind::ProgramChange { channel, program }
                if capabilities.process_program_changes =>
            {
                input.programs.insert(program as i64, channel as i64);
            }
            _ => input
                .passthrough
                .add_event(event.message.clone(), event.offset),
        }
    }
    input
}

fn channels_to_array(channels: &[AudioChannel]) -> Array {
    channels.iter().cloned().map(Dynamic::from).collect()
}

fn process_audio(
    engine: &Engine,
    state: &mut ContextState,
    audio: &mut AudioBuffer,
) -> Result<()> {
    let copy_channels = |buffer: &AudioBuffer, count: usize| -> Vec<AudioChannel> {
        (0..count)
            .filter_map(|i| buffer.channel(i))
            .map(|samples| AudioChannel::from_samples(samples.to_vec()))
            .collect()
    };
    let inputs = copy_channels(&*audio, audio.input_channels());
    let outputs = copy_channels(&*audio, audio.output_channels());

    let result = state.call(
        engine,
        "process_audio",
        (channels_to_array(&inputs), channels_to_array(&outputs)),
    );

    // Whatever the script wrote before a fault is kept
    for (i, channel) in outputs.iter().enumerate() {
        if let Some(dest) = audio.channel_mut(i) {
            channel.copy_into(dest);
        }
    }
    result.map(|_| ())
}

fn dispatch(
    engine: &Engine,
    state: &mut ContextState,
    audio: &mut AudioBuffer,
    input: &ClassifiedInput,
    outputs: &ControlMap,
    report: &mut ProcessReport,
) {
    let capabilities = state.script.capabilities;
    let mut record = |result: Result<Dynamic>| {
        if let Err(err) = result {
            log::warn!("{}", err);
            report.faults.push(err);
        }
    };

    if capabilities.process_audio {
        record(process_audio(engine, state, audio).map(|_| Dynamic::UNIT));
    }
    if capabilities.process_controls && !input.controls.is_empty() {
        record(state.call(
            engine,
            "process_controls",
            (input.controls.clone(), outputs.clone()),
        ));
    }
    if capabilities.process_notes && !input.notes_on.is_empty() {
        record(state.call(
            engine,
            "process_notes",
            (input.notes_on.clone(), true, outputs.clone()),
        ));
    }
    if capabilities.process_notes && !input.notes_off.is_empty() {
        record(state.call(
            engine,
            "process_notes",
            (input.notes_off.clone(), false, outputs.clone()),
        ));
    }
    if capabilities.process_program_changes && !input.programs.is_empty() {
        record(state.call(
            engine,
            "process_program_changes",
            (input.programs.clone(), outputs.clone()),
        ));
    }
}

fn reconstruct(
    state: &mut ContextState,
    outputs: &ControlMap,
    offset: u32,
    target: &mut MidiBuffer,
    report: &mut ProcessReport,
) {
    let pickup_enabled = state.script.capabilities.process_controls;

    for (slot, value) in outputs.entries() {
        let message = match usize::try_from(slot)
            .ok()
            .and_then(|slot| state.script.templates.reconstruct(slot, value))
        {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                log::debug!("Skipping output {}: {}", slot, err);
                report.skipped += 1;
                continue;
            }
            None => {
                log::debug!("Skipping unknown output slot {}", slot);
                report.skipped += 1;
                continue;
            }
        };

        if pickup_enabled {
            if let MidiEventKind::ControlChange {
                controller, value, ..
            } = message.kind()
            {
                if !state.script.pickup.should_emit(controller, value) {
                    report.suppressed += 1;
                    continue;
                }
            }
        }

        target.add_event(message, offset);
        report.emitted += 1;
    }
}

fn process_block(
    engine: &Engine,
    state: &mut ContextState,
    audio: &mut AudioBuffer,
    midi: &mut MidiBuffer,
) -> ProcessReport {
    let mut report = ProcessReport::default();

    let mut input = classify(&state.script.capabilities, midi);
    report.passed_through = input.passthrough.len();

    let outputs = ControlMap::new();
    dispatch(engine, state, audio, &input, &outputs, &mut report);

    let offset = midi.last_event_time();
    reconstruct(state, &outputs, offset, &mut input.passthrough, &mut report);

    midi.swap_with(&mut input.passthrough);
    report
}

/// Connects host blocks to one execution context.
pub struct ProcessingBridge {
    context: Arc<ExecutionContext>,
}

impl ProcessingBridge {
    /// Bridge blocks into `context`.
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Run one block through the script, in place.
    ///
    /// Only fails when the runtime lock cannot be taken; script faults are
    /// reported in the returned [`ProcessReport`].
    pub fn process(&self, audio: &mut AudioBuffer, midi: &mut MidiBuffer) -> Result<ProcessReport> {
        self.context
            .with_locked(|engine, state| process_block(engine, state, audio, midi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;

    fn bridge_for(source: &str) -> ProcessingBridge {
        let context = Arc::new(ExecutionContext::new());
        context.execute(None, source).unwrap();
        ProcessingBridge::new(context)
    }

    fn run(bridge: &ProcessingBridge, events: &[(u32, MidiMessage)]) -> (MidiBuffer, ProcessReport) {
        let mut audio = AudioBuffer::new(2, 2, 8);
        let mut midi: MidiBuffer = events.iter().cloned().collect();
        let report = bridge.process(&mut audio, &mut midi).unwrap();
        (midi, report)
    }

    const CC7_SCRIPT: &str = r#"
        fn midi_outputs() { controller_event(7) }
        fn process_controls(inputs, outputs) {
            if inputs.contains(7) { outputs[0] = inputs[7]; }
        }
    "#;

    #[test]
    fn test_pickup_cache() {
        let mut cache = CcPickupCache::default();
        assert!(cache.should_emit(7, 100));
        assert!(!cache.should_emit(7, 100));
        assert!(cache.should_emit(7, 101));
        assert!(cache.should_emit(10, 101));
        assert_eq!(cache.last_value(7), Some(101));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_handlers_passes_everything_through() {
        let bridge = bridge_for("let x = 1;");
        let events = vec![
            (0, MidiMessage::controller(3, 7, 100)),
            (4, MidiMessage::note_on(0, 60, 90)),
            (6, MidiMessage::from_bytes([0xF0, 0x7E, 0xF7])),
        ];

        let mut audio = AudioBuffer::from_channels(vec![vec![0.25; 4], vec![-0.5; 4]], 2, 2);
        let original_audio = audio.clone();
        let mut midi: MidiBuffer = events.iter().cloned().collect();
        let report = bridge.process(&mut audio, &mut midi).unwrap();

        assert_eq!(midi, events.into_iter().collect::<MidiBuffer>());
        assert_eq!(audio, original_audio);
        assert_eq!(report.passed_through, 3);
        assert_eq!(report.emitted, 0);
    }

    #[test]
    fn test_cc7_end_to_end_with_pickup() {
        let bridge = bridge_for(CC7_SCRIPT);

        let (out, report) = run(
            &bridge,
            &[
                (2, MidiMessage::note_on(0, 60, 90)),
                (5, MidiMessage::controller(3, 7, 100)),
            ],
        );
        let events: Vec<_> = out.iter().cloned().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].offset, 2);
        assert!(events[0].message.is_note_on());
        assert_eq!(events[1].message.bytes(), &[0xB0, 7, 100]);
        assert_eq!(events[1].offset, 5);
        assert_eq!(report.emitted, 1);

        // Same value again is picked up and dropped
        let (out, report) = run(&bridge, &[(0, MidiMessage::controller(0, 7, 100))]);
        assert!(out.is_empty());
        assert_eq!(report.suppressed, 1);

        let (out, _) = run(&bridge, &[(1, MidiMessage::controller(0, 7, 101))]);
        assert_eq!(out.messages().next().unwrap().bytes(), &[0xB0, 7, 101]);
    }

    #[test]
    fn test_pickup_resets_on_reexecution() {
        let bridge = bridge_for(CC7_SCRIPT);
        let (_, report) = run(&bridge, &[(0, MidiMessage::controller(0, 7, 64))]);
        assert_eq!(report.emitted, 1);

        bridge.context().execute(None, CC7_SCRIPT).unwrap();
        let (_, report) = run(&bridge, &[(0, MidiMessage::controller(0, 7, 64))]);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.suppressed, 0);
    }

    #[test]
    fn test_notes_classified_on_and_off() {
        let bridge = bridge_for(
            r#"
            fn midi_outputs() { note_event(60, true) + note_event(60, false) }
            fn process_notes(inputs, on, outputs) {
                if on { outputs[0] = inputs[60]; } else { outputs[1] = 0; }
            }
            "#,
        );

        let (out, report) = run(
            &bridge,
            &[
                (0, MidiMessage::note_on(2, 60, 90)),
                (3, MidiMessage::note_on(2, 60, 0)),
            ],
        );
        assert_eq!(report.passed_through, 0);
        let bytes: Vec<_> = out.messages().map(|m| m.bytes().to_vec()).collect();
        assert_eq!(bytes, vec![vec![0x90, 60, 90], vec![0x80, 60, 0]]);
        assert!(out.iter().all(|e| e.offset == 3));
    }

    #[test]
    fn test_non_controller_outputs_not_picked_up() {
        let bridge = bridge_for(
            r#"
            fn midi_outputs() { program_change_event() + controller_event(1) }
            fn process_controls(inputs, outputs) { outputs[0] = 5; }
            "#,
        );
        for _ in 0..2 {
            let (out, report) = run(&bridge, &[(0, MidiMessage::controller(0, 1, 1))]);
            assert_eq!(report.emitted, 1);
            assert!(out.messages().next().unwrap().is_program_change());
        }
    }

    #[test]
    fn test_program_changes_keyed_by_program() {
        let bridge = bridge_for(
            r#"
            fn midi_outputs() { program_change_event() }
            fn process_program_changes(inputs, outputs) {
                for program in inputs.keys() { outputs[0] = program + 1; }
            }
            "#,
        );
        let (out, _) = run(&bridge, &[(0, MidiMessage::program_change(4, 9))]);
        assert_eq!(out.messages().next().unwrap().bytes(), &[0xC0, 10]);
    }

    #[test]
    fn test_invalid_outputs_skipped() {
        let bridge = bridge_for(
            r#"
            fn midi_outputs() { controller_event(7) }
            fn process_controls(inputs, outputs) {
                outputs[3] = 1;
                outputs[-1] = 1;
                outputs[0] = 200;
            }
            "#,
        );
        let (out, report) = run(&bridge, &[(0, MidiMessage::controller(0, 7, 1))]);
        assert!(out.is_empty());
        assert_eq!(report.skipped, 3);
    }

    #[test]
    fn test_callback_fault_does_not_stop_later_stages() {
        let bridge = bridge_for(
            r#"
            fn midi_outputs() { note_event(60, true) }
            fn process_controls(inputs, outputs) { throw "broken"; }
            fn process_notes(inputs, on, outputs) { outputs[0] = 100; }
            "#,
        );
        let (out, report) = run(
            &bridge,
            &[
                (0, MidiMessage::controller(0, 7, 1)),
                (1, MidiMessage::note_on(0, 60, 1)),
            ],
        );
        assert_eq!(report.faults.len(), 1);
        assert!(matches!(
            report.faults[0],
            Error::Callback {
                callback: "process_controls",
                ..
            }
        ));
        assert_eq!(report.emitted, 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_process_audio_writes_outputs() {
        let bridge = bridge_for(
            r#"
            fn process_audio(inputs, outputs) {
                for c in 0..outputs.len() {
                    let out = outputs[c];
                    let inp = inputs[c];
                    for i in 0..out.len() { out[i] = inp[i] * 0.5; }
                }
            }
            "#,
        );
        let mut audio = AudioBuffer::from_channels(vec![vec![1.0; 4], vec![-1.0; 4]], 2, 2);
        let mut midi = MidiBuffer::new();
        let report = bridge.process(&mut audio, &mut midi).unwrap();
        assert!(report.faults.is_empty());
        assert_eq!(audio.channel(0).unwrap(), &[0.5; 4]);
        assert_eq!(audio.channel(1).unwrap(), &[-0.5; 4]);
    }

    #[test]
    fn test_faulty_script_behaves_as_pass_through() {
        let context = Arc::new(ExecutionContext::new());
        assert!(context
            .execute(None, "fn process_controls(i, o) { o[0] = 1; } let = ;")
            .is_err());
        let bridge = ProcessingBridge::new(context);
        let (out, report) = run(&bridge, &[(0, MidiMessage::controller(0, 7, 1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(report.passed_through, 1);
    }
}
