//! MIDI output templates.
//!
//! A script declares its MIDI outputs once (via `midi_outputs()`); each
//! output is a message with its final data byte cut out. At block time the
//! script only supplies `slot -> value` pairs and the full message is
//! rebuilt from the template.
//!
//! Only complete channel-voice messages can be templated. SysEx and system
//! messages carry no single variable byte and are rejected at encode time.

use crate::error::{Error, Result};
use crate::midi::{channel_message_len, MidiMessage};

/// Bytes surrounding the variable data byte of a MIDI message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OutputTemplate {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
}

impl OutputTemplate {
    /// Template from raw prefix and suffix bytes. Not validated.
    pub fn new(prefix: impl Into<Vec<u8>>, suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Length of the message this template reconstructs.
    pub fn message_len(&self) -> usize {
        self.prefix.len() + 1 + self.suffix.len()
    }

    /// Check that prefix + one data byte + suffix forms a channel-voice message.
    pub fn validate(&self) -> Result<()> {
        let status = *self
            .prefix
            .first()
            .ok_or_else(|| Error::InvalidTemplate("empty prefix".to_string()))?;
        let expected = channel_message_len(status).ok_or_else(|| {
            Error::InvalidTemplate(format!("status {:#04x} is not a channel message", status))
        })?;
        if expected != self.message_len() {
            return Err(Error::InvalidTemplate(format!(
                "status {:#04x} needs {} bytes, template yields {}",
                status,
                expected,
                self.message_len()
            )));
        }
        let mut data = self.prefix[1..].iter().chain(self.suffix.iter());
        if let Some(byte) = data.find(|b| **b & 0x80 != 0) {
            return Err(Error::InvalidTemplate(format!(
                "data byte {:#04x} has the status bit set",
                byte
            )));
        }
        Ok(())
    }
}

/// Split a message into its output template.
pub fn encode(message: &MidiMessage) -> Result<OutputTemplate> {
    if !message.is_channel_voice() {
        return Err(Error::UnsupportedMessage(format!(
            "[{}] is not a complete channel-voice message",
            message
        )));
    }
    let bytes = message.bytes();
    Ok(OutputTemplate::new(&bytes[..bytes.len() - 1], Vec::<u8>::new()))
}

/// Rebuild a message from a template and the variable data byte.
pub fn decode(template: &OutputTemplate, value: i64) -> Result<MidiMessage> {
    if !(0..=127).contains(&value) {
        return Err(Error::DataByteOutOfRange(value));
    }
    template.validate()?;

    let mut bytes = Vec::with_capacity(template.message_len());
    bytes.extend_from_slice(&template.prefix);
    bytes.push(value as u8);
    bytes.extend_from_slice(&template.suffix);
    Ok(MidiMessage::from_bytes(bytes))
}

/// Ordered output templates; index is the output slot a script writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputTemplateTable {
    templates: Vec<OutputTemplate>,
}

impl OutputTemplateTable {
    /// Table in slot order.
    pub fn new(templates: Vec<OutputTemplate>) -> Self {
        Self { templates }
    }

    /// Template for output `slot`.
    pub fn get(&self, slot: usize) -> Option<&OutputTemplate> {
        self.templates.get(slot)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutputTemplate> {
        self.templates.iter()
    }

    /// Reconstruct the message for `slot`, `None` if the slot is out of range.
    pub fn reconstruct(&self, slot: usize, value: i64) -> Option<Result<MidiMessage>> {
        self.get(slot).map(|template| decode(template, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::OUTPUT_CHANNEL;

    #[test]
    fn test_round_trip_channel_voice() {
        let messages = [
            MidiMessage::controller(OUTPUT_CHANNEL, 7, 100),
            MidiMessage::controller(5, 0, 0),
            MidiMessage::note_on(OUTPUT_CHANNEL, 60, 127),
            MidiMessage::note_off(9, 36, 64),
            MidiMessage::program_change(OUTPUT_CHANNEL, 12),
            MidiMessage::from_bytes([0xE3, 0x10, 0x40]),
            MidiMessage::from_bytes([0xD0, 0x33]),
            MidiMessage::from_bytes([0xA1, 60, 5]),
        ];
        for msg in messages {
            let template = encode(&msg).unwrap();
            let value = msg.data_byte().unwrap() as i64;
            assert_eq!(decode(&template, value).unwrap(), msg);
        }
    }

    #[test]
    fn test_encode_controller_shape() {
        let template = encode(&MidiMessage::controller(OUTPUT_CHANNEL, 7, 0)).unwrap();
        assert_eq!(template.prefix, vec![0xB0, 7]);
        assert!(template.suffix.is_empty());
    }

    #[test]
    fn test_encode_program_change_shape() {
        let template = encode(&MidiMessage::program_change(OUTPUT_CHANNEL, 0)).unwrap();
        assert_eq!(template.prefix, vec![0xC0]);
        let msg = decode(&template, 42).unwrap();
        assert!(msg.is_program_change());
    }

    #[test]
    fn test_encode_rejects_sysex_and_system() {
        assert!(matches!(
            encode(&MidiMessage::from_bytes([0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7])),
            Err(Error::UnsupportedMessage(_))
        ));
        assert!(encode(&MidiMessage::from_bytes([0xF8])).is_err());
        assert!(encode(&MidiMessage::from_bytes([0xB0, 7])).is_err());
        assert!(encode(&MidiMessage::from_bytes(Vec::<u8>::new())).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_templates() {
        // Too long for a controller message
        let template = OutputTemplate::new([0xB0, 7, 1], Vec::<u8>::new());
        assert!(matches!(decode(&template, 1), Err(Error::InvalidTemplate(_))));

        // Not a channel message
        let template = OutputTemplate::new([0xF0], Vec::<u8>::new());
        assert!(decode(&template, 1).is_err());

        // Empty prefix
        assert!(decode(&OutputTemplate::default(), 1).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_value() {
        let template = OutputTemplate::new([0xB0, 7], Vec::<u8>::new());
        assert!(matches!(
            decode(&template, 128),
            Err(Error::DataByteOutOfRange(128))
        ));
        assert!(decode(&template, -1).is_err());
    }

    #[test]
    fn test_table_reconstruct_out_of_bounds() {
        let table = OutputTemplateTable::new(vec![OutputTemplate::new([0xB0, 7], Vec::<u8>::new())]);
        assert!(table.reconstruct(1, 10).is_none());
        let msg = table.reconstruct(0, 10).unwrap().unwrap();
        assert_eq!(msg.bytes(), &[0xB0, 7, 10]);
    }
}
