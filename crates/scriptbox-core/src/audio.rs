//! Host audio block.
//!
//! Processing is in place: the first `input_channels` channels hold the
//! input on entry, the first `output_channels` channels hold the output on
//! return.

/// Non-interleaved block of `f32` samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    input_channels: usize,
    output_channels: usize,
}

impl AudioBuffer {
    /// Silent buffer sized for the larger of the two channel counts.
    pub fn new(input_channels: usize, output_channels: usize, num_samples: usize) -> Self {
        let count = input_channels.max(output_channels);
        Self {
            channels: vec![vec![0.0; num_samples]; count],
            input_channels,
            output_channels,
        }
    }

    /// Wrap existing channel data. Channel counts are clamped to the data.
    pub fn from_channels(
        channels: Vec<Vec<f32>>,
        input_channels: usize,
        output_channels: usize,
    ) -> Self {
        let count = channels.len();
        Self {
            channels,
            input_channels: input_channels.min(count),
            output_channels: output_channels.min(count),
        }
    }

    /// Number of channels carrying host input.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Number of channels the host reads back.
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Total channel count (the larger of inputs and outputs).
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel in this block.
    pub fn num_samples(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Samples of channel `index`, if it exists.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        self.channels.get_mut(index).map(Vec::as_mut_slice)
    }

    /// Zero every channel.
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }
}
