//! Noise channel selection over the beamformed outputs.
//!
//! The `ChannelSelector` trait is the seam the pipeline drives once per audio
//! frame; `HysteresisSelector` is the production policy. Energy bookkeeping
//! lives in [`energy::EnergyHistory`], shared with the control path for
//! hotword direction queries.

pub mod energy;
pub mod hysteresis;

pub use energy::EnergyHistory;
pub use hysteresis::HysteresisSelector;

use serde::{Deserialize, Serialize};

use crate::error::{ArrayError, Result};

/// Geometry and calibration of the microphone array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArrayConfig {
    /// Raw microphone channels delivered by capture. Default: 6.
    pub mic_channels: usize,
    /// Beamformed output channels, evenly spaced around the circle. Default: 12.
    pub beam_channels: usize,
    /// Samples per channel in one audio frame (10 ms at 16 kHz). Default: 160.
    pub samples_per_channel: usize,
    /// Processing sample rate in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Energy history length in frames; also the hysteresis lock duration. Default: 200.
    pub energy_window: usize,
    /// Per-frame sum-of-squares energy a channel must exceed to count as a
    /// match. Calibration data; default: 6 000 000.
    pub energy_threshold: u64,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            mic_channels: 6,
            beam_channels: 12,
            samples_per_channel: 160,
            sample_rate: 16_000,
            energy_window: 200,
            energy_threshold: 6_000_000,
        }
    }
}

impl ArrayConfig {
    /// Check the invariants the selector and pipeline rely on.
    pub fn validate(&self) -> Result<()> {
        if self.beam_channels == 0 || 360 % self.beam_channels != 0 {
            return Err(ArrayError::InvalidConfig(format!(
                "beam channel count {} must evenly divide 360",
                self.beam_channels
            )));
        }
        if self.beam_channels > 16 {
            return Err(ArrayError::InvalidConfig(format!(
                "beam channel count {} exceeds the 16-bit indicator mask",
                self.beam_channels
            )));
        }
        if self.mic_channels == 0 || self.samples_per_channel == 0 {
            return Err(ArrayError::InvalidConfig(
                "mic channels and samples per channel must be non-zero".into(),
            ));
        }
        if self.energy_window < 10 {
            return Err(ArrayError::InvalidConfig(format!(
                "energy window {} is shorter than 10 frames",
                self.energy_window
            )));
        }
        Ok(())
    }

    /// Samples in one raw capture slot.
    pub fn capture_slot_len(&self) -> usize {
        self.mic_channels * self.samples_per_channel
    }

    /// Samples in one clean multi-channel block.
    pub fn clean_block_len(&self) -> usize {
        self.beam_channels * self.samples_per_channel
    }

    /// Nominal steering angle of `channel` in degrees.
    pub fn channel_angle(&self, channel: usize) -> u32 {
        (channel * (360 / self.beam_channels)) as u32
    }
}

/// Map a direction-of-arrival angle to the beam whose arc contains it.
///
/// Beam `k` points at `k * 360 / channels` degrees; arc boundaries sit at the
/// midpoints between neighbouring beams, rounding the midpoint itself up.
/// Angles outside `[0, 360)` are wrapped first.
pub fn angle_to_channel(angle: i32, channels: usize) -> usize {
    let arc = (360 / channels) as i32;
    let a = angle.rem_euclid(360);
    (((a * 2 + arc) / (2 * arc)) as usize) % channels
}

/// True when `a` and `b` are the same beam or circular neighbours.
pub fn is_adjacent(a: usize, b: usize, channels: usize) -> bool {
    a == b || a == (b + 1) % channels || b == (a + 1) % channels
}

/// Outcome of one selector step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "channel")]
pub enum ChannelDecision {
    /// This beam currently carries the dominant noise source.
    Selected(usize),
    Unselected,
}

impl ChannelDecision {
    pub fn channel(self) -> Option<usize> {
        match self {
            ChannelDecision::Selected(c) => Some(c),
            ChannelDecision::Unselected => None,
        }
    }
}

/// Snapshot of a selector's internal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionState {
    pub channel: Option<usize>,
    pub duration: usize,
    pub locked: bool,
}

/// Frame-by-frame channel selection policy.
pub trait ChannelSelector: Send + 'static {
    /// Feed the beam the current DOA maps to and that beam's energy this frame.
    fn update(&mut self, mapped: usize, energy: u64) -> ChannelDecision;

    /// Record a frame with no direction estimate. Counts as a non-matching
    /// frame, so a lock still drains.
    fn miss(&mut self) -> ChannelDecision;

    fn state(&self) -> SelectionState;

    fn reset(&mut self);
}
