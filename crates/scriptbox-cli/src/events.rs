//! Text event files for `scriptbox run`.
//!
//! One event per line: `<block> <offset> <hex bytes...>`. Blank lines and
//! lines starting with `#` are ignored.
//!
//! ```text
//! # CC7 = 100 in the first block, note on in the second
//! 0 0  b0 07 64
//! 1 12 90 3c 50
//! ```

use anyhow::{anyhow, bail, Context, Result};
use scriptbox_core::{MidiBuffer, MidiMessage};
use std::collections::BTreeMap;

/// Events grouped by block index.
#[derive(Debug, Default)]
pub struct EventSchedule {
    blocks: BTreeMap<usize, MidiBuffer>,
}

impl EventSchedule {
    pub fn parse(text: &str) -> Result<Self> {
        let mut schedule = Self::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (block, offset, message) =
                parse_line(line).with_context(|| format!("line {}: {:?}", number + 1, line))?;
            schedule
                .blocks
                .entry(block)
                .or_default()
                .add_event(message, offset);
        }
        Ok(schedule)
    }

    /// Number of blocks needed to play every event.
    pub fn block_count(&self) -> usize {
        self.blocks.keys().next_back().map(|b| b + 1).unwrap_or(0)
    }

    /// Events for `block`, empty if there are none.
    pub fn block(&self, block: usize) -> MidiBuffer {
        self.blocks.get(&block).cloned().unwrap_or_default()
    }
}

fn parse_line(line: &str) -> Result<(usize, u32, MidiMessage)> {
    let mut fields = line.split_whitespace();
    let block = fields
        .next()
        .ok_or_else(|| anyhow!("missing block index"))?
        .parse::<usize>()
        .context("invalid block index")?;
    let offset = fields
        .next()
        .ok_or_else(|| anyhow!("missing sample offset"))?
        .parse::<u32>()
        .context("invalid sample offset")?;

    let bytes = fields
        .map(|field| {
            let digits = field.trim_start_matches("0x");
            u8::from_str_radix(digits, 16).with_context(|| format!("invalid hex byte {:?}", field))
        })
        .collect::<Result<Vec<u8>>>()?;
    if bytes.is_empty() {
        bail!("missing MIDI bytes");
    }

    Ok((block, offset, MidiMessage::from_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups_by_block() {
        let schedule = EventSchedule::parse(
            "# comment\n\n0 0 b0 07 64\n2 12 0x90 0x3c 0x50\n0 5 c0 03\n",
        )
        .unwrap();
        assert_eq!(schedule.block_count(), 3);

        let first = schedule.block(0);
        assert_eq!(first.len(), 2);
        assert_eq!(first.last_event_time(), 5);
        assert!(schedule.block(1).is_empty());
        assert!(schedule.block(2).messages().next().unwrap().is_note_on());
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let err = EventSchedule::parse("0 0 b0 07 64\n0 x b0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
        assert!(EventSchedule::parse("0 0\n").is_err());
        assert!(EventSchedule::parse("0 0 zz\n").is_err());
        assert!(EventSchedule::parse("0 0 100\n").is_err());
    }

    #[test]
    fn test_empty_schedule() {
        let schedule = EventSchedule::parse("").unwrap();
        assert_eq!(schedule.block_count(), 0);
    }
}
