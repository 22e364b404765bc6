//! Playback side of the slot ring: the pipeline writes, the hardware reads.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::buffering::SlotRing;
use crate::error::Result;

#[cfg(feature = "audio-cpal")]
use crate::error::ArrayError;
#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

/// PCM16 queue between a producer thread and an output callback.
#[derive(Debug)]
pub struct PlaybackQueue {
    ring: SlotRing,
    underruns: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(slot_count: usize, slot_len: usize) -> Result<Self> {
        Ok(Self {
            ring: SlotRing::new(slot_count, slot_len)?,
            underruns: AtomicU64::new(0),
        })
    }

    /// Queue `samples`, split across as many slots as needed. The last slot
    /// may be partially committed.
    ///
    /// Returns the number of samples accepted: less than `samples.len()` only
    /// when `blocking` is false and the queue filled up, or the queue is closed.
    pub fn write(&self, samples: &[i16], blocking: bool) -> usize {
        let mut written = 0;
        for chunk in samples.chunks(self.ring.slot_len()) {
            let Some(mut slot) = self.ring.obtain_write(blocking) else {
                break;
            };
            slot[..chunk.len()].copy_from_slice(chunk);
            slot.commit(chunk.len());
            written += chunk.len();
        }
        written
    }

    /// Output callbacks that found nothing queued.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Wake a blocked writer and refuse further writes.
    pub fn close(&self) {
        self.ring.close();
    }

    /// Hardware-side reader. Create one per output stream.
    pub fn drain(self: &Arc<Self>) -> PlaybackDrain {
        PlaybackDrain {
            queue: Arc::clone(self),
            pending: vec![0; self.ring.slot_len()].into_boxed_slice(),
            len: 0,
            pos: 0,
        }
    }
}

/// Copies queued slots into output buffers of any size.
pub struct PlaybackDrain {
    queue: Arc<PlaybackQueue>,
    pending: Box<[i16]>,
    len: usize,
    pos: usize,
}

impl PlaybackDrain {
    /// Fill `out` from the queue, zero-filling whatever the queue cannot
    /// supply. Never blocks. Returns the number of real samples written.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        let mut done = 0;
        while done < out.len() {
            if self.pos == self.len {
                let Some(slot) = self.queue.ring.obtain_read(false) else {
                    break;
                };
                self.len = slot.len();
                self.pending[..self.len].copy_from_slice(&slot);
                self.pos = 0;
                continue;
            }
            let n = (self.len - self.pos).min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            done += n;
        }
        if done < out.len() {
            out[done..].fill(0);
            self.queue.underruns.fetch_add(1, Ordering::Relaxed);
        }
        done
    }
}

/// Output stream pulling from a [`PlaybackQueue`]. Not `Send`.
#[cfg(feature = "audio-cpal")]
pub struct CpalPlayback {
    stream: Stream,
}

#[cfg(feature = "audio-cpal")]
impl CpalPlayback {
    /// Open the default output device for `channels` interleaved channels.
    pub fn open(queue: &Arc<PlaybackQueue>, channels: u16, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ArrayError::AudioDevice("no default output device".into()))?;
        let format = device
            .default_output_config()
            .map_err(|e| ArrayError::AudioDevice(e.to_string()))?
            .sample_format();

        info!(
            device = device.name().unwrap_or_default().as_str(),
            channels,
            sample_rate,
            "opening playback output"
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let mut drain = queue.drain();

        let stream = match format {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    drain.fill(data);
                },
                |err| error!("playback stream error: {err}"),
                None,
            ),
            SampleFormat::F32 => {
                let mut scratch = vec![0i16; 8192];
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info| {
                        for out in data.chunks_mut(scratch.len()) {
                            let tmp = &mut scratch[..out.len()];
                            drain.fill(tmp);
                            for (o, s) in out.iter_mut().zip(tmp.iter()) {
                                *o = *s as f32 / 32768.0;
                            }
                        }
                    },
                    |err| error!("playback stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(ArrayError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ArrayError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ArrayError::AudioStream(e.to_string()))?;
        Ok(Self { stream })
    }

    pub fn pause(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| ArrayError::AudioStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_stitches_slots_across_callback_sizes() {
        let queue = Arc::new(PlaybackQueue::new(4, 4).unwrap());
        assert_eq!(queue.write(&[1, 2, 3, 4, 5, 6], false), 6);
        let mut drain = queue.drain();

        let mut out = [0i16; 3];
        assert_eq!(drain.fill(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(drain.fill(&mut out), 3);
        assert_eq!(out, [4, 5, 6]);
        assert_eq!(queue.underruns(), 0);
    }

    #[test]
    fn underrun_zero_fills_and_counts() {
        let queue = Arc::new(PlaybackQueue::new(2, 4).unwrap());
        queue.write(&[7, 7], false);
        let mut drain = queue.drain();
        let mut out = [9i16; 5];
        assert_eq!(drain.fill(&mut out), 2);
        assert_eq!(out, [7, 7, 0, 0, 0]);
        assert_eq!(queue.underruns(), 1);
    }

    #[test]
    fn non_blocking_write_stops_when_full() {
        let queue = PlaybackQueue::new(2, 3).unwrap();
        assert_eq!(queue.write(&[1; 10], false), 6);
    }

    #[test]
    fn blocking_write_waits_for_the_reader() {
        let queue = Arc::new(PlaybackQueue::new(2, 2).unwrap());
        let writer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.write(&[1, 2, 3, 4, 5, 6, 7, 8], true))
        };
        let mut drain = queue.drain();
        let mut got = Vec::new();
        let mut out = [0i16; 2];
        while got.len() < 8 {
            if drain.fill(&mut out) == 2 {
                got.extend_from_slice(&out);
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        assert_eq!(writer.join().unwrap(), 8);
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
