//! Capture backend that replays a multi-channel WAV recording.
//!
//! Useful for regression runs against recordings made with
//! [`super::AudioDump`]: `mic.wav` replays into the same pipeline that
//! produced it.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader};
use tracing::{debug, error, info};

use super::{ActiveCapture, CaptureBackend};
use crate::buffering::SlotRing;
use crate::error::{ArrayError, Result};

#[derive(Debug, Clone)]
pub struct WavCapture {
    path: PathBuf,
    channels: u16,
    realtime: bool,
}

impl WavCapture {
    /// Replay `path`, which must hold `channels` channels of 16-bit PCM.
    pub fn new(path: impl Into<PathBuf>, channels: u16) -> Self {
        Self {
            path: path.into(),
            channels,
            realtime: true,
        }
    }

    /// Deliver slots as fast as the consumer takes them instead of at the
    /// recording's sample rate.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }
}

impl CaptureBackend for WavCapture {
    fn open(&mut self, ring: Arc<SlotRing>) -> Result<Box<dyn ActiveCapture>> {
        let reader = WavReader::open(&self.path)?;
        let spec = reader.spec();
        if spec.channels != self.channels
            || spec.bits_per_sample != 16
            || spec.sample_format != SampleFormat::Int
        {
            return Err(ArrayError::InvalidConfig(format!(
                "{} is {} ch / {}-bit, expected {} ch / 16-bit PCM",
                self.path.display(),
                spec.channels,
                spec.bits_per_sample,
                self.channels
            )));
        }

        let frames_per_slot = ring.slot_len() / self.channels.max(1) as usize;
        let pace = self
            .realtime
            .then(|| Duration::from_secs_f64(frames_per_slot as f64 / spec.sample_rate as f64));

        info!(path = %self.path.display(), sample_rate = spec.sample_rate, "replaying capture");

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("arrayfront-wav-replay".into())
            .spawn(move || replay(reader, &ring, &flag, pace))?;

        Ok(Box::new(ActiveReplay {
            running,
            handle: Some(handle),
        }))
    }
}

fn replay(mut reader: WavReader<BufReader<File>>, ring: &SlotRing, running: &AtomicBool, pace: Option<Duration>) {
    let mut samples = reader.samples::<i16>();
    let mut slots = 0u64;
    let started = Instant::now();

    while running.load(Ordering::Relaxed) {
        let Some(mut slot) = ring.obtain_write(true) else {
            break;
        };

        let mut filled = 0;
        let mut exhausted = false;
        for dst in slot.iter_mut() {
            match samples.next() {
                Some(Ok(s)) => {
                    *dst = s;
                    filled += 1;
                }
                Some(Err(e)) => {
                    error!(error = %e, "WAV read failed");
                    exhausted = true;
                    break;
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        slot[filled..].fill(0);
        drop(slot);
        slots += 1;

        if exhausted {
            break;
        }
        if let Some(pace) = pace {
            let due = pace * slots as u32;
            if let Some(wait) = due.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(slots, "WAV replay finished");
}

struct ActiveReplay {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActiveCapture for ActiveReplay {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("WAV replay thread panicked");
            }
        }
    }
}

impl Drop for ActiveReplay {
    fn drop(&mut self) {
        self.stop();
    }
}
