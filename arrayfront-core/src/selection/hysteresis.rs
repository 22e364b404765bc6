//! Hysteresis policy for picking the dominant noise beam.
//!
//! ## Algorithm
//!
//! 1. The first frame adopts the mapped beam as the tentative channel.
//! 2. A frame *matches* when its beam is the tentative one or a circular
//!    neighbour, and that beam's energy exceeds the threshold. Matches grow
//!    a duration counter, capped at twice the window.
//! 3. Once the counter reaches the window the tentative channel locks and is
//!    reported as `Selected`.
//! 4. Non-matching frames shrink the counter. A locked channel stays
//!    selected until the counter drains to zero; then the mapped beam becomes
//!    the new tentative channel and the counter restarts.
//! 5. Frames without a direction drain the counter the same way. When it
//!    hits zero the tentative channel is forgotten and the next located
//!    frame starts over.

use tracing::debug;

use super::{is_adjacent, ArrayConfig, ChannelDecision, ChannelSelector, SelectionState};

#[derive(Debug, Clone)]
pub struct HysteresisSelector {
    channels: usize,
    window: usize,
    threshold: u64,
    tentative: Option<usize>,
    duration: usize,
    locked: bool,
}

impl HysteresisSelector {
    /// # Parameters
    /// - `channels`: beam count the mapped indices range over.
    /// - `window`: consecutive matching frames needed to lock.
    /// - `threshold`: per-frame energy a match must exceed.
    pub fn new(channels: usize, window: usize, threshold: u64) -> Self {
        Self {
            channels,
            window,
            threshold,
            tentative: None,
            duration: 0,
            locked: false,
        }
    }

    pub fn from_config(config: &ArrayConfig) -> Self {
        Self::new(
            config.beam_channels,
            config.energy_window,
            config.energy_threshold,
        )
    }
}

impl ChannelSelector for HysteresisSelector {
    fn update(&mut self, mapped: usize, energy: u64) -> ChannelDecision {
        let tentative = *self.tentative.get_or_insert(mapped);

        if energy > self.threshold && is_adjacent(mapped, tentative, self.channels) {
            if self.duration < self.window * 2 {
                self.duration += 1;
            }
            if !self.locked && self.duration >= self.window {
                self.locked = true;
                debug!(channel = tentative, "noise channel locked");
            }
            return if self.locked {
                ChannelDecision::Selected(tentative)
            } else {
                ChannelDecision::Unselected
            };
        }

        self.duration = self.duration.saturating_sub(1);
        if self.locked && self.duration > 0 {
            return ChannelDecision::Selected(tentative);
        }

        if self.locked {
            debug!(channel = tentative, next = mapped, "noise channel released");
        }
        self.locked = false;
        self.duration = 0;
        self.tentative = Some(mapped);
        ChannelDecision::Unselected
    }

    fn miss(&mut self) -> ChannelDecision {
        self.duration = self.duration.saturating_sub(1);
        if self.duration > 0 {
            return match (self.locked, self.tentative) {
                (true, Some(channel)) => ChannelDecision::Selected(channel),
                _ => ChannelDecision::Unselected,
            };
        }
        if self.locked {
            debug!(channel = ?self.tentative, "noise channel released; no direction");
        }
        self.locked = false;
        self.tentative = None;
        ChannelDecision::Unselected
    }

    fn state(&self) -> SelectionState {
        SelectionState {
            channel: self.tentative,
            duration: self.duration,
            locked: self.locked,
        }
    }

    fn reset(&mut self) {
        self.tentative = None;
        self.duration = 0;
        self.locked = false;
    }
}
