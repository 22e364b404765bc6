//! Stand-in DSP backends for hosts without the vendor library and for tests.

use tracing::debug;

use super::{BeamProcessor, NoiseCanceller};
use crate::buffering::chunk::AudioBlock;
use crate::error::{ArrayError, Result};

/// Copies microphone `c % mic_channels` into beam `c`.
///
/// Lets the host exercise capture, selection and downstream delivery with
/// real audio before a vendor processor is wired in. Reports a fixed angle.
#[derive(Debug, Clone)]
pub struct PassthroughBeamProcessor {
    mic_channels: usize,
    angle: Option<f32>,
    open: bool,
}

impl PassthroughBeamProcessor {
    pub fn new(mic_channels: usize) -> Self {
        Self {
            mic_channels,
            angle: None,
            open: false,
        }
    }

    /// Report `angle` from every direction query.
    pub fn with_angle(mut self, angle: f32) -> Self {
        self.angle = Some(angle);
        self
    }
}

impl BeamProcessor for PassthroughBeamProcessor {
    fn open(&mut self) -> Result<()> {
        if self.mic_channels == 0 {
            return Err(ArrayError::Dsp("passthrough needs at least one mic channel".into()));
        }
        self.open = true;
        debug!(mic_channels = self.mic_channels, "passthrough processor opened");
        Ok(())
    }

    fn process(&mut self, raw: &[i16], out: &mut AudioBlock) -> Result<()> {
        if !self.open {
            return Err(ArrayError::Dsp("processor not open".into()));
        }
        let spc = out.samples_per_channel();
        if raw.len() < spc * self.mic_channels {
            return Err(ArrayError::Dsp(format!(
                "short capture slot: {} samples, need {}",
                raw.len(),
                spc * self.mic_channels
            )));
        }

        let mics = self.mic_channels;
        for c in 0..out.channels() {
            let mic = c % mics;
            for (i, s) in out.channel_mut(c).iter_mut().enumerate() {
                *s = raw[i * mics + mic];
            }
        }
        Ok(())
    }

    fn direction_of_arrival(&mut self, _offset: u64) -> Result<Option<f32>> {
        Ok(self.angle)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Emits all-zero beams and always reports 0°.
#[derive(Debug, Clone, Default)]
pub struct SilentBeamProcessor {
    frames: u64,
}

impl SilentBeamProcessor {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl BeamProcessor for SilentBeamProcessor {
    fn open(&mut self) -> Result<()> {
        self.frames = 0;
        Ok(())
    }

    fn process(&mut self, _raw: &[i16], out: &mut AudioBlock) -> Result<()> {
        out.clear();
        self.frames += 1;
        Ok(())
    }

    fn direction_of_arrival(&mut self, _offset: u64) -> Result<Option<f32>> {
        Ok(Some(0.0))
    }

    fn close(&mut self) {}
}

/// Leaves its targets untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCanceller;

impl NoiseCanceller for PassthroughCanceller {
    fn open(&mut self, _channels: usize, _samples_per_channel: usize) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self, _reference: &[i16], _targets: &mut AudioBlock) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_deinterleaves_and_repeats_mics() {
        let mut dsp = PassthroughBeamProcessor::new(2);
        dsp.open().unwrap();
        let raw = [1, 10, 2, 20, 3, 30];
        let mut out = AudioBlock::new(4, 3);
        dsp.process(&raw, &mut out).unwrap();
        assert_eq!(out.channel(0), &[1, 2, 3]);
        assert_eq!(out.channel(1), &[10, 20, 30]);
        assert_eq!(out.channel(2), &[1, 2, 3]);
        assert_eq!(out.channel(3), &[10, 20, 30]);
    }

    #[test]
    fn passthrough_rejects_short_slots_and_closed_state() {
        let mut dsp = PassthroughBeamProcessor::new(2);
        let mut out = AudioBlock::new(2, 3);
        assert!(dsp.process(&[0; 6], &mut out).is_err());
        dsp.open().unwrap();
        assert!(dsp.process(&[0; 5], &mut out).is_err());
    }

    #[test]
    fn passthrough_angle_is_configurable() {
        let mut dsp = PassthroughBeamProcessor::new(6);
        assert_eq!(dsp.direction_of_arrival(0).unwrap(), None);
        let mut dsp = dsp.with_angle(135.0);
        assert_eq!(dsp.direction_of_arrival(7).unwrap(), Some(135.0));
    }

    #[test]
    fn silent_processor_zeroes_output() {
        let mut dsp = SilentBeamProcessor::default();
        let mut out = AudioBlock::new(3, 4);
        out.as_mut_slice().fill(99);
        dsp.process(&[5; 12], &mut out).unwrap();
        assert!(out.as_slice().iter().all(|s| *s == 0));
        assert_eq!(dsp.frames(), 1);
    }
}
