//! Vendor signal-processing abstraction.
//!
//! Beamforming, echo cancellation and direction-of-arrival estimation run in
//! an opaque DSP library. The pipeline only sees two traits:
//!
//! - [`BeamProcessor`] turns one raw capture slot into a clean multi-channel
//!   [`AudioBlock`] and answers direction queries.
//! - [`NoiseCanceller`] is the optional second stage that cleans a set of
//!   beams against a reference beam carrying the dominant noise.
//!
//! Both take `&mut self`: vendor contexts keep adaptive filter state between
//! frames. The beam processor is shared with the control path (hotword
//! direction queries), so it lives behind [`DspHandle`]'s mutex.

pub mod stub;

pub use stub::{PassthroughBeamProcessor, PassthroughCanceller, SilentBeamProcessor};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::chunk::AudioBlock;
use crate::error::Result;

/// Contract for the multi-channel beamforming front end.
pub trait BeamProcessor: Send + 'static {
    /// Allocate the vendor context. Called from `Engine::start`.
    ///
    /// # Errors
    /// Returns `ArrayError::Dsp` if the context cannot be created.
    fn open(&mut self) -> Result<()>;

    /// Process one capture slot.
    ///
    /// # Parameters
    /// - `raw`: interleaved microphone samples, one slot long.
    /// - `out`: channel-major block of beam outputs, overwritten in full.
    fn process(&mut self, raw: &[i16], out: &mut AudioBlock) -> Result<()>;

    /// Direction of arrival in degrees of the dominant source `offset` frames
    /// before the most recent one. `None` when the estimator has no result.
    fn direction_of_arrival(&mut self, offset: u64) -> Result<Option<f32>>;

    /// Release the vendor context. Must tolerate being called twice.
    fn close(&mut self);
}

/// Contract for the second-stage canceller.
pub trait NoiseCanceller: Send + 'static {
    fn open(&mut self, channels: usize, samples_per_channel: usize) -> Result<()>;

    /// Clean every channel of `targets` in place against `reference`.
    fn cancel(&mut self, reference: &[i16], targets: &mut AudioBlock) -> Result<()>;

    fn close(&mut self);
}

/// Thread-safe handle to any [`BeamProcessor`].
#[derive(Clone)]
pub struct DspHandle(pub Arc<Mutex<dyn BeamProcessor>>);

impl DspHandle {
    pub fn new<P: BeamProcessor>(processor: P) -> Self {
        Self(Arc::new(Mutex::new(processor)))
    }
}

impl std::fmt::Debug for DspHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspHandle").finish_non_exhaustive()
    }
}

/// Beams cleaned by the second stage when `reference` carries the noise:
/// `channels / 2 + 1` consecutive beams starting a quarter turn away.
pub fn cancellation_targets(reference: usize, channels: usize) -> impl Iterator<Item = usize> {
    let first = reference + channels / 4;
    (0..channels / 2 + 1).map(move |i| (first + i) % channels)
}
