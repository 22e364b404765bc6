//! Platform audio binding.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not allocate or block. [`SlotStager`] satisfies that contract:
//! callback samples are staged into a pre-allocated slot-sized buffer and
//! handed to the capture ring with a non-blocking `obtain_write`. A full ring
//! drops the staged slot and counts it.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. [`ActiveCapture`] is therefore
//! not `Send`: the engine opens the capture backend inside the processing
//! thread and stops it on that same thread.

pub mod device;
pub mod dump;
pub mod playback;
pub mod replay;

pub use dump::AudioDump;
pub use playback::{PlaybackDrain, PlaybackQueue};
pub use replay::WavCapture;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::warn;

use crate::buffering::SlotRing;
use crate::error::Result;

#[cfg(feature = "audio-cpal")]
use crate::error::ArrayError;
#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use std::sync::atomic::AtomicBool;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

/// Something that can start feeding capture slots into a ring.
pub trait CaptureBackend: Send {
    /// Start capture. Slots are committed to `ring` until the returned handle
    /// is stopped or the ring is closed.
    fn open(&mut self, ring: Arc<SlotRing>) -> Result<Box<dyn ActiveCapture>>;
}

/// A running capture stream.
pub trait ActiveCapture {
    fn stop(&mut self);

    /// Slots discarded because the ring was full.
    fn dropped_slots(&self) -> u64 {
        0
    }
}

/// Re-blocks arbitrarily sized callback buffers into ring slots.
pub struct SlotStager {
    ring: Arc<SlotRing>,
    staging: Box<[i16]>,
    filled: usize,
    dropped: Arc<AtomicU64>,
}

impl SlotStager {
    pub fn new(ring: Arc<SlotRing>) -> Self {
        let staging = vec![0i16; ring.slot_len()].into_boxed_slice();
        Self {
            ring,
            staging,
            filled: 0,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of dropped slots.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn push(&mut self, samples: impl IntoIterator<Item = i16>) {
        for s in samples {
            self.staging[self.filled] = s;
            self.filled += 1;
            if self.filled == self.staging.len() {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        self.filled = 0;
        match self.ring.obtain_write(false) {
            Some(mut slot) => slot.copy_from_slice(&self.staging),
            None if self.ring.is_closed() => {}
            None => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    warn!(dropped = n, "capture ring full; slot dropped");
                }
            }
        }
    }
}

/// Live microphone-array capture through cpal.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Clone)]
pub struct CpalCapture {
    device_name: Option<String>,
    channels: u16,
    sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl CpalCapture {
    /// `channels` interleaved channels at `sample_rate`, from the named input
    /// device or the best array-capable one.
    pub fn new(device_name: Option<String>, channels: u16, sample_rate: u32) -> Self {
        Self {
            device_name,
            channels,
            sample_rate,
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl CaptureBackend for CpalCapture {
    fn open(&mut self, ring: Arc<SlotRing>) -> Result<Box<dyn ActiveCapture>> {
        let host = cpal::default_host();
        let device = device::find_input_device(&host, self.device_name.as_deref(), self.channels)?;
        let name = device.name().unwrap_or_default();

        let format = device
            .supported_input_configs()
            .map_err(|e| ArrayError::AudioDevice(e.to_string()))?
            .filter(|r| {
                r.channels() == self.channels
                    && r.min_sample_rate().0 <= self.sample_rate
                    && r.max_sample_rate().0 >= self.sample_rate
            })
            .map(|r| r.sample_format())
            .min_by_key(|f| match f {
                SampleFormat::I16 => 0,
                SampleFormat::F32 => 1,
                SampleFormat::U16 => 2,
                _ => 3,
            })
            .ok_or_else(|| {
                ArrayError::AudioDevice(format!(
                    "'{name}' cannot capture {} channels at {} Hz",
                    self.channels, self.sample_rate
                ))
            })?;

        info!(
            device = name.as_str(),
            channels = self.channels,
            sample_rate = self.sample_rate,
            ?format,
            "opening array input"
        );

        let config = StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut stager = SlotStager::new(ring);
        let dropped = stager.dropped_counter();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let stream = match format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if flag.load(Ordering::Relaxed) {
                        stager.push(data.iter().copied());
                    }
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if flag.load(Ordering::Relaxed) {
                        stager.push(data.iter().map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
                    }
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _info| {
                    if flag.load(Ordering::Relaxed) {
                        stager.push(data.iter().map(|s| (*s as i32 - 32768) as i16));
                    }
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(ArrayError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ArrayError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ArrayError::AudioStream(e.to_string()))?;

        Ok(Box::new(CpalActiveCapture {
            stream,
            running,
            dropped,
        }))
    }
}

#[cfg(feature = "audio-cpal")]
struct CpalActiveCapture {
    stream: Stream,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

#[cfg(feature = "audio-cpal")]
impl ActiveCapture for CpalActiveCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.stream.pause() {
            warn!("failed to pause input stream: {e}");
        }
    }

    fn dropped_slots(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stager_reblocks_uneven_callbacks() {
        let ring = Arc::new(SlotRing::new(4, 6).unwrap());
        let mut stager = SlotStager::new(Arc::clone(&ring));
        stager.push(0..4);
        assert_eq!(ring.ready_count(), 0);
        stager.push(4..13);
        assert_eq!(ring.ready_count(), 2);

        let first = ring.obtain_read(false).unwrap();
        assert_eq!(&*first, &[0, 1, 2, 3, 4, 5]);
        drop(first);
        let second = ring.obtain_read(false).unwrap();
        assert_eq!(&*second, &[6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn stager_counts_drops_when_ring_is_full() {
        let ring = Arc::new(SlotRing::new(2, 2).unwrap());
        let mut stager = SlotStager::new(Arc::clone(&ring));
        let dropped = stager.dropped_counter();
        stager.push(0..10);
        assert_eq!(ring.ready_count(), 2);
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn stager_is_quiet_after_close() {
        let ring = Arc::new(SlotRing::new(2, 2).unwrap());
        let mut stager = SlotStager::new(Arc::clone(&ring));
        ring.close();
        stager.push(0..8);
        assert_eq!(stager.dropped_counter().load(Ordering::Relaxed), 0);
    }
}
