//! Per-channel energy history over the last `window` frames.
//!
//! ## Layout
//!
//! One circular row of `window` slots per channel. Frame `f` of channel `c`
//! lives at `c * window + f % window`, so a frame number uniquely names a slot
//! until it is overwritten `window` frames later.
//!
//! ## Windowed energy
//!
//! Wake-word detectors report a detection some time after the word started.
//! [`EnergyHistory::windowed_energy`] sums the frames between `4/10` and
//! `1/10` of a window before the reference frame, each normalised by the
//! samples per channel.

use crate::buffering::chunk::AudioBlock;

#[derive(Debug, Clone)]
pub struct EnergyHistory {
    channels: usize,
    window: usize,
    samples_per_channel: usize,
    energies: Vec<u64>,
}

impl EnergyHistory {
    pub fn new(channels: usize, window: usize, samples_per_channel: usize) -> Self {
        Self {
            channels,
            window,
            samples_per_channel,
            energies: vec![0; channels * window],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn slot(&self, channel: usize, frame: u64) -> usize {
        channel * self.window + (frame % self.window as u64) as usize
    }

    /// Store the energy of one channel for `frame`.
    pub fn record(&mut self, frame: u64, channel: usize, energy: u64) {
        let idx = self.slot(channel, frame);
        self.energies[idx] = energy;
    }

    /// Store the energy of every channel of `block` for `frame`.
    pub fn record_block(&mut self, frame: u64, block: &AudioBlock) {
        for channel in 0..self.channels.min(block.channels()) {
            self.record(frame, channel, block.channel_energy(channel));
        }
    }

    /// Energy recorded for `channel` at `frame` (the slot may have been
    /// overwritten by `frame + window`).
    pub fn energy_at(&self, channel: usize, frame: u64) -> u64 {
        self.energies[self.slot(channel, frame)]
    }

    /// Sum of normalised energies of `channel` over the detection window
    /// that ends shortly before `reference_frame`.
    pub fn windowed_energy(&self, channel: usize, reference_frame: u64) -> u64 {
        let w = self.window;
        let lookback = w * 4 / 10;
        let span = lookback - w / 10;
        let start = (reference_frame % w as u64) as usize + w - lookback % w;
        let row = &self.energies[channel * w..(channel + 1) * w];
        let norm = self.samples_per_channel.max(1) as u64;

        (0..span).map(|i| row[(start + i) % w] / norm).sum()
    }

    /// Loudest detecting channel and its windowed energy.
    ///
    /// `detection_frames[c]` is the frame channel `c` detected at, or 0 when
    /// it did not. Ties go to the lowest channel index.
    pub fn loudest_channel(&self, detection_frames: &[u64]) -> Option<(usize, u64)> {
        detection_frames
            .iter()
            .take(self.channels)
            .enumerate()
            .filter(|&(_, &frame)| frame != 0)
            .map(|(c, &frame)| (c, self.windowed_energy(c, frame)))
            .fold(None, |best, (c, e)| match best {
                Some((_, b)) if b >= e => best,
                _ => Some((c, e)),
            })
    }

    pub fn reset(&mut self) {
        self.energies.fill(0);
    }
}
