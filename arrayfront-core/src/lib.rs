//! # arrayfront-core
//!
//! Audio front end for a circular microphone array with an external
//! beamforming DSP and a serial-attached signal-processing unit.
//!
//! ## Architecture
//!
//! ```text
//! Mic array → CaptureBackend → SlotRing → Pipeline thread
//!                                              │
//!                                  BeamProcessor::process (N beams)
//!                                              │
//!                              EnergyHistory + DOA → ChannelSelector
//!                                              │
//!                            NoiseCanceller (beams facing away from noise)
//!                                              │
//!                                    CleanAudioSink::on_clean_audio
//!
//! Serial device ⇄ SerialLink (FrameAssembler, HostCommand / DeviceEvent)
//! ```
//!
//! The capture callback never blocks and never allocates. All heap work
//! happens in the pipeline thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod link;
pub mod protocol;
pub mod selection;

// Convenience re-exports for downstream crates
pub use buffering::{chunk::AudioBlock, SlotRing};
pub use dsp::{BeamProcessor, DspHandle, NoiseCanceller};
pub use engine::{CleanAudioSink, Engine, EngineConfig};
pub use error::{ArrayError, Result};
pub use ipc::events::{
    EngineStatus, EngineStatusEvent, HotwordDirection, NoiseChannelEvent,
};
pub use link::{LinkParity, LinkStopBits, SerialConfig, SerialLink};
pub use protocol::{DeviceEvent, HostCommand};
pub use selection::{ArrayConfig, ChannelDecision, ChannelSelector};
