//! Typed multi-channel block handed from the DSP stage to downstream consumers.

/// One processed audio frame: `channels` planes of PCM16, channel-major.
///
/// Channel `c` occupies `samples[c * samples_per_channel..(c + 1) * samples_per_channel]`.
/// Allocated once per pipeline run and reused every iteration.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    samples: Vec<i16>,
    channels: usize,
    samples_per_channel: usize,
}

impl AudioBlock {
    pub fn new(channels: usize, samples_per_channel: usize) -> Self {
        Self {
            samples: vec![0; channels * samples_per_channel],
            channels,
            samples_per_channel,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    /// Size of the block on the wire: `samples_per_channel * channels * 2`.
    pub fn len_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<i16>()
    }

    pub fn as_slice(&self) -> &[i16] {
        &self.samples
    }

    pub fn as_mut_slice(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    pub fn channel(&self, c: usize) -> &[i16] {
        let start = c * self.samples_per_channel;
        &self.samples[start..start + self.samples_per_channel]
    }

    pub fn channel_mut(&mut self, c: usize) -> &mut [i16] {
        let start = c * self.samples_per_channel;
        &mut self.samples[start..start + self.samples_per_channel]
    }

    /// Sum of squared samples of one channel.
    pub fn channel_energy(&self, c: usize) -> u64 {
        self.channel(c)
            .iter()
            .map(|s| {
                let v = *s as i64;
                (v * v) as u64
            })
            .sum()
    }

    /// Iterate samples frame by frame (`ch0, ch1, …, ch0, ch1, …`).
    pub fn interleaved(&self) -> impl Iterator<Item = i16> + '_ {
        (0..self.samples_per_channel)
            .flat_map(move |i| (0..self.channels).map(move |c| self.samples[c * self.samples_per_channel + i]))
    }

    pub fn clear(&mut self) {
        self.samples.fill(0);
    }
}
