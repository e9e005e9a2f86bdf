//! MIDI message and buffer types exchanged with the host.
//!
//! Messages are stored as raw bytes so that anything the host delivers
//! (including SysEx) can be passed through untouched. [`MidiMessage::kind`]
//! parses the bytes on demand for classification.

/// Channel used for every templated/emitted message (MIDI channel 1).
pub const OUTPUT_CHANNEL: u8 = 0;

/// Parsed view of a raw MIDI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEventKind {
    /// Note on event (channel 0-15, note 0-127, velocity 1-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off event. Note on with velocity 0 is reported as note off.
    NoteOff { channel: u8, note: u8, velocity: u8 },
    /// Control change (channel, controller number, value)
    ControlChange {
        channel: u8,
        controller: u8,
        value: u8,
    },
    /// Polyphonic aftertouch (per-note pressure)
    PolyAftertouch { channel: u8, note: u8, pressure: u8 },
    /// Program change
    ProgramChange { channel: u8, program: u8 },
    /// Channel aftertouch (channel pressure)
    ChannelAftertouch { channel: u8, pressure: u8 },
    /// Pitch bend (channel, 14-bit value centered at 0)
    PitchBend { channel: u8, value: i16 },
    /// System exclusive message (F0 ... F7)
    SysEx,
    /// System common or real-time message
    System { status: u8 },
    /// Bytes that do not form a complete message
    Invalid,
}

/// Number of bytes in a channel-voice message with the given status byte.
///
/// Returns `None` for anything that is not a channel-voice status.
pub fn channel_message_len(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(3),
        0xC0 | 0xD0 => Some(2),
        _ => None,
    }
}

/// A raw MIDI message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiMessage {
    bytes: Vec<u8>,
}

impl MidiMessage {
    /// Wrap raw bytes without validation.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Control change; channel and data bytes are masked into range.
    pub fn controller(channel: u8, controller: u8, value: u8) -> Self {
        Self::from_bytes([0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F])
    }

    /// Note on. A velocity of 0 is classified as note off.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes([0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    /// Note off.
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes([0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    /// Program change (two bytes).
    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::from_bytes([0xC0 | (channel & 0x0F), program & 0x7F])
    }

    /// Raw bytes of the message.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True for complete channel-voice messages (note, CC, program, ...).
    pub fn is_channel_voice(&self) -> bool {
        match self.bytes.first() {
            Some(&status) => {
                channel_message_len(status) == Some(self.bytes.len())
                    && self.bytes[1..].iter().all(|b| b & 0x80 == 0)
            }
            None => false,
        }
    }

    /// The last data byte of a channel-voice message.
    pub fn data_byte(&self) -> Option<u8> {
        if self.is_channel_voice() {
            self.bytes.last().copied()
        } else {
            None
        }
    }

    /// Control change message.
    pub fn is_controller(&self) -> bool {
        matches!(self.kind(), MidiEventKind::ControlChange { .. })
    }

    /// Note on with a non-zero velocity.
    pub fn is_note_on(&self) -> bool {
        matches!(self.kind(), MidiEventKind::NoteOn { .. })
    }

    /// Note off, or note on with velocity 0.
    pub fn is_note_off(&self) -> bool {
        matches!(self.kind(), MidiEventKind::NoteOff { .. })
    }

    pub fn is_program_change(&self) -> bool {
        matches!(self.kind(), MidiEventKind::ProgramChange { .. })
    }

    /// Parse the raw bytes into a [`MidiEventKind`].
    pub fn kind(&self) -> MidiEventKind {
        let bytes = &self.bytes;
        let status = match bytes.first() {
            Some(&status) => status,
            None => return MidiEventKind::Invalid,
        };

        match status {
            0xF0 => return MidiEventKind::SysEx,
            0xF1..=0xFF => return MidiEventKind::System { status },
            0x00..=0x7F => return MidiEventKind::Invalid,
            _ => {}
        }

        if !self.is_channel_voice() {
            return MidiEventKind::Invalid;
        }

        let channel = status & 0x0F;
        match status & 0xF0 {
            0x90 => {
                let note = bytes[1];
                let velocity = bytes[2];
                if velocity == 0 {
                    // Note on with velocity 0 is treated as note off
                    MidiEventKind::NoteOff {
                        channel,
                        note,
                        velocity,
                    }
                } else {
                    MidiEventKind::NoteOn {
                        channel,
                        note,
                        velocity,
                    }
                }
            }
            0x80 => MidiEventKind::NoteOff {
                channel,
                note: bytes[1],
                velocity: bytes[2],
            },
            0xB0 => MidiEventKind::ControlChange {
                channel,
                controller: bytes[1],
                value: bytes[2],
            },
            0xA0 => MidiEventKind::PolyAftertouch {
                channel,
                note: bytes[1],
                pressure: bytes[2],
            },
            0xC0 => MidiEventKind::ProgramChange {
                channel,
                program: bytes[1],
            },
            0xD0 => MidiEventKind::ChannelAftertouch {
                channel,
                pressure: bytes[1],
            },
            0xE0 => {
                // Pitch bend is 14-bit: LSB + MSB
                let lsb = bytes[1] as i16;
                let msb = bytes[2] as i16;
                MidiEventKind::PitchBend {
                    channel,
                    value: ((msb << 7) | lsb) - 8192,
                }
            }
            _ => MidiEventKind::Invalid,
        }
    }
}

impl std::fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A MIDI message stamped with its sample offset inside the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedMidiEvent {
    pub offset: u32,
    pub message: MidiMessage,
}

/// Ordered MIDI events for one processing block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiBuffer {
    events: Vec<TimedMidiEvent>,
}

impl MidiBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` at sample `offset`. Events keep insertion order.
    pub fn add_event(&mut self, message: MidiMessage, offset: u32) {
        self.events.push(TimedMidiEvent { offset, message });
    }

    /// Events in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, TimedMidiEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Offset of the last event, 0 for an empty buffer.
    pub fn last_event_time(&self) -> u32 {
        self.events.last().map(|e| e.offset).unwrap_or(0)
    }

    /// Exchange contents with `other`.
    pub fn swap_with(&mut self, other: &mut MidiBuffer) {
        std::mem::swap(&mut self.events, &mut other.events);
    }

    /// Messages without their offsets.
    pub fn messages(&self) -> impl Iterator<Item = &MidiMessage> {
        self.events.iter().map(|e| &e.message)
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = &'a TimedMidiEvent;
    type IntoIter = std::slice::Iter<'a, TimedMidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl FromIterator<(u32, MidiMessage)> for MidiBuffer {
    fn from_iter<I: IntoIterator<Item = (u32, MidiMessage)>>(iter: I) -> Self {
        Self {
            events: iter
                .into_iter()
                .map(|(offset, message)| TimedMidiEvent { offset, message })
                .collect(),
        }
    }
}
