//! `Engine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Engine::new()
//!     └─► start()   → link opened (optional), DSP opened, pipeline thread spawned,
//!                     capture opened on that thread, status = Running | Degraded
//!         └─► stop() → running=false, ring closed, thread joined, DSP closed,
//!                      link closed, status = Stopped
//! ```
//!
//! `start()`/`stop()` return an error when called in the wrong state rather
//! than panicking. An engine can be restarted after `stop()`.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread affinity).
//! The capture backend is therefore opened *inside* the pipeline thread so the
//! stream never crosses a thread boundary. A sync oneshot channel propagates
//! open errors back to the `start()` caller. The thread hands the backend and
//! the canceller back through its `JoinHandle` when it exits.

pub mod pipeline;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    audio::{AudioDump, CaptureBackend},
    buffering::{chunk::AudioBlock, SlotRing},
    dsp::{DspHandle, NoiseCanceller},
    error::{ArrayError, Result},
    ipc::events::{EngineStatus, EngineStatusEvent, HotwordDirection, NoiseChannelEvent},
    link::{SerialConfig, SerialLink},
    protocol::{DeviceEvent, HostCommand},
    selection::{ArrayConfig, ChannelDecision, EnergyHistory, HysteresisSelector},
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Receives every processed block, on the pipeline thread.
///
/// Implementations must not block for long: the capture ring only holds
/// `ring_slots` frames.
pub trait CleanAudioSink: Send + Sync + 'static {
    fn on_clean_audio(&self, block: &AudioBlock);
}

impl<F> CleanAudioSink for F
where
    F: Fn(&AudioBlock) + Send + Sync + 'static,
{
    fn on_clean_audio(&self, block: &AudioBlock) {
        self(block)
    }
}

/// Configuration for `Engine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub array: ArrayConfig,
    /// Capture ring depth in frames. Default: 4.
    pub ring_slots: usize,
    /// Query the DSP direction of arrival every frame and run noise channel
    /// selection. Default: true.
    pub query_direction: bool,
    /// Run the noise canceller on the beams facing away from the selected
    /// noise channel. Default: true.
    pub post_cancellation: bool,
    /// Control link settings; `None` runs without one.
    pub serial: Option<SerialConfig>,
    /// Write `mic.wav` / `clean.wav` here while running.
    pub dump_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            array: ArrayConfig::default(),
            ring_slots: 4,
            query_direction: true,
            post_cancellation: true,
            serial: Some(SerialConfig::default()),
            dump_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.array.validate()?;
        if self.ring_slots < 2 {
            return Err(ArrayError::InvalidConfig(format!(
                "ring_slots must be at least 2, got {}",
                self.ring_slots
            )));
        }
        Ok(())
    }
}

/// Owned parts handed back by the pipeline thread.
struct Parts {
    capture: Box<dyn CaptureBackend>,
    canceller: Option<Box<dyn NoiseCanceller>>,
}

struct Worker {
    ring: Arc<SlotRing>,
    handle: JoinHandle<Parts>,
}

/// The top-level engine handle.
///
/// `Engine` is `Send + Sync`; all fields use interior mutability. Wrap in
/// `Arc<Engine>` to share between the host's control and event threads.
pub struct Engine {
    config: EngineConfig,
    dsp: DspHandle,
    sink: Arc<dyn CleanAudioSink>,
    /// `None` while the pipeline thread owns it.
    capture: Mutex<Option<Box<dyn CaptureBackend>>>,
    canceller: Mutex<Option<Box<dyn NoiseCanceller>>>,
    worker: Mutex<Option<Worker>>,
    link: Mutex<Option<Arc<SerialLink>>>,
    /// `true` while capture + pipeline are active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    noise_tx: broadcast::Sender<NoiseChannelEvent>,
    energy: Arc<Mutex<EnergyHistory>>,
    frame_counter: Arc<AtomicU64>,
    decision: Arc<Mutex<ChannelDecision>>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl Engine {
    /// Create a new engine. Does not start capturing; call `start()`.
    ///
    /// # Errors
    /// `ArrayError::InvalidConfig` if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        capture: Box<dyn CaptureBackend>,
        dsp: DspHandle,
        sink: Arc<dyn CleanAudioSink>,
    ) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (noise_tx, _) = broadcast::channel(BROADCAST_CAP);
        let energy = EnergyHistory::new(
            config.array.beam_channels,
            config.array.energy_window,
            config.array.samples_per_channel,
        );

        Ok(Self {
            config,
            dsp,
            sink,
            capture: Mutex::new(Some(capture)),
            canceller: Mutex::new(None),
            worker: Mutex::new(None),
            link: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            noise_tx,
            energy: Arc::new(Mutex::new(energy)),
            frame_counter: Arc::new(AtomicU64::new(0)),
            decision: Arc::new(Mutex::new(ChannelDecision::Unselected)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
        })
    }

    /// Install the second-stage canceller. Used only when
    /// `post_cancellation` is enabled.
    pub fn with_canceller(self, canceller: impl NoiseCanceller) -> Self {
        *self.canceller.lock() = Some(Box::new(canceller));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the control link, the DSP and the pipeline.
    ///
    /// Blocks until the capture backend is confirmed open (or fails), then
    /// returns. A control link that cannot be opened is not fatal: the engine
    /// runs with status `Degraded`.
    ///
    /// # Errors
    /// - `ArrayError::AlreadyRunning` if already started.
    /// - `ArrayError::CaptureLost` if a crashed pipeline took the capture
    ///   backend with it. Build a new engine.
    /// - DSP open errors, capture open errors.
    pub fn start(&self) -> Result<()> {
        let mut worker_slot = self.worker.lock();
        if worker_slot.is_some() {
            return Err(ArrayError::AlreadyRunning);
        }
        let Some(capture) = self.capture.lock().take() else {
            return Err(ArrayError::CaptureLost);
        };
        let array = self.config.array.clone();

        // ── Control link ────────────────────────────────────────────────────
        let link = self.config.serial.as_ref().and_then(|serial| {
            match SerialLink::open(serial) {
                Ok(link) => Some(Arc::new(link)),
                Err(e) => {
                    warn!(error = %e, "control link unavailable; running degraded");
                    None
                }
            }
        });

        // ── DSP ─────────────────────────────────────────────────────────────
        if let Err(e) = self.dsp.0.lock().open() {
            *self.capture.lock() = Some(capture);
            if let Some(link) = link {
                link.close();
            }
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }

        // ── Fresh per-run state ─────────────────────────────────────────────
        self.diagnostics.reset();
        self.frame_counter.store(0, Ordering::SeqCst);
        self.energy.lock().reset();
        *self.decision.lock() = ChannelDecision::Unselected;

        let ring = match SlotRing::new(self.config.ring_slots, array.capture_slot_len()) {
            Ok(ring) => Arc::new(ring),
            Err(e) => {
                self.abort_start(capture, link, &e);
                return Err(e);
            }
        };
        let dump = self.config.dump_dir.as_deref().and_then(|dir| {
            AudioDump::create(dir, &array)
                .map_err(|e| warn!(dir = %dir.display(), error = %e, "audio dump disabled"))
                .ok()
        });

        let mut capture = capture;
        let canceller = if self.config.post_cancellation {
            self.canceller.lock().take()
        } else {
            None
        };
        let ctx = pipeline::PipelineContext {
            selector: Box::new(HysteresisSelector::from_config(&array)),
            array,
            ring: Arc::clone(&ring),
            dsp: self.dsp.clone(),
            canceller,
            energy: Arc::clone(&self.energy),
            frame_counter: Arc::clone(&self.frame_counter),
            decision: Arc::clone(&self.decision),
            sink: Arc::clone(&self.sink),
            running: Arc::clone(&self.running),
            noise_tx: self.noise_tx.clone(),
            query_direction: self.config.query_direction,
            dump,
            diagnostics: Arc::clone(&self.diagnostics),
        };
        self.running.store(true, Ordering::SeqCst);

        // Sync oneshot: pipeline thread signals capture open success/failure.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_ring = Arc::clone(&ring);
        let running = Arc::clone(&self.running);

        let spawned = thread::Builder::new()
            .name("arrayfront-pipeline".into())
            .spawn(move || {
                // ── Open capture (must happen on THIS thread, cpal::Stream is !Send) ──
                let mut active = match capture.open(thread_ring) {
                    Ok(active) => {
                        let _ = open_tx.send(Ok(()));
                        active
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return Parts {
                            capture,
                            canceller: ctx.canceller,
                        };
                    }
                };

                let canceller = pipeline::run(ctx);

                active.stop();
                let dropped = active.dropped_slots();
                if dropped > 0 {
                    warn!(dropped, "capture dropped slots while the ring was full");
                }
                // Stream drops here, releasing the audio device on this thread.
                drop(active);
                Parts { capture, canceller }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The closure, and with it the capture backend, is gone.
                self.running.store(false, Ordering::SeqCst);
                self.dsp.0.lock().close();
                if let Some(link) = link {
                    link.close();
                }
                let e = ArrayError::Io(e);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        // Block start() until capture open is confirmed.
        let opened = open_rx.recv().unwrap_or_else(|_| {
            Err(ArrayError::Other(anyhow::anyhow!(
                "pipeline thread died unexpectedly"
            )))
        });
        if let Err(e) = opened {
            self.running.store(false, Ordering::SeqCst);
            ring.close();
            match handle.join() {
                Ok(parts) => self.restore_parts(parts),
                Err(_) => error!("pipeline thread panicked during start"),
            }
            self.dsp.0.lock().close();
            if let Some(link) = link {
                link.close();
            }
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }

        let status = if link.is_some() {
            EngineStatus::Running
        } else {
            EngineStatus::Degraded
        };
        *self.link.lock() = link;
        *worker_slot = Some(Worker { ring, handle });
        drop(worker_slot);

        self.set_status(status, None);
        info!(?status, "engine started");
        Ok(())
    }

    /// Stop capture and the pipeline, then release the DSP and the link.
    ///
    /// # Errors
    /// - `ArrayError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Err(ArrayError::NotRunning);
        };
        info!("engine stop requested");

        self.running.store(false, Ordering::SeqCst);
        worker.ring.close();
        let panicked = match worker.handle.join() {
            Ok(parts) => {
                self.restore_parts(parts);
                false
            }
            Err(_) => {
                error!("pipeline thread panicked; capture backend lost");
                true
            }
        };
        self.dsp.0.lock().close();
        if let Some(link) = self.link.lock().take() {
            link.close();
        }

        if panicked {
            self.set_status(EngineStatus::Error, Some(ArrayError::CaptureLost.to_string()));
        } else {
            self.set_status(EngineStatus::Stopped, None);
        }
        Ok(())
    }

    /// Pick the beam that carried a just-detected hotword and ask the DSP
    /// where it came from.
    ///
    /// `detection_frames[c]` is the frame at which channel `c`'s detector
    /// fired, or 0 when it did not. The indicator on the device is pointed at
    /// the winning beam when the control link is up.
    pub fn select_hotword_direction(
        &self,
        detection_frames: &[u64],
    ) -> Result<Option<HotwordDirection>> {
        let best = self.energy.lock().loudest_channel(detection_frames);
        let Some((channel, energy)) = best else {
            return Ok(None);
        };
        let frame = detection_frames[channel];

        if let Some(link) = self.link() {
            let indicator = u8::try_from(channel).unwrap_or(u8::MAX);
            if let Err(e) = link.send(HostCommand::IndicatorOn(indicator)) {
                warn!(channel, error = %e, "indicator update failed");
            }
        }

        let offset = self.frame_count().saturating_sub(frame);
        let angle = self.dsp.0.lock().direction_of_arrival(offset)?;
        info!(channel, energy, offset, angle = ?angle, "hotword direction selected");
        Ok(angle.map(|angle| HotwordDirection {
            channel,
            energy,
            angle,
        }))
    }

    /// Forward a command to the device.
    ///
    /// # Errors
    /// `ArrayError::LinkUnavailable` when no control link is open.
    pub fn send_command(&self, command: HostCommand) -> Result<()> {
        self.link()
            .ok_or(ArrayError::LinkUnavailable)?
            .send(command)
    }

    /// The open control link, if any.
    pub fn link(&self) -> Option<Arc<SerialLink>> {
        self.link.lock().clone()
    }

    /// Decoded device events, when a control link is open.
    pub fn device_events(&self) -> Option<Receiver<DeviceEvent>> {
        self.link.lock().as_ref().map(|link| link.events())
    }

    /// Frames processed since the last `start()`.
    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    /// Most recently reported noise channel selection.
    pub fn noise_channel(&self) -> ChannelDecision {
        *self.decision.lock()
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to noise channel changes.
    pub fn subscribe_noise_channel(&self) -> broadcast::Receiver<NoiseChannelEvent> {
        self.noise_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn abort_start(
        &self,
        capture: Box<dyn CaptureBackend>,
        link: Option<Arc<SerialLink>>,
        e: &ArrayError,
    ) {
        *self.capture.lock() = Some(capture);
        self.dsp.0.lock().close();
        if let Some(link) = link {
            link.close();
        }
        self.set_status(EngineStatus::Error, Some(e.to_string()));
    }

    fn restore_parts(&self, parts: Parts) {
        *self.capture.lock() = Some(parts.capture);
        if let Some(canceller) = parts.canceller {
            *self.canceller.lock() = Some(canceller);
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            let _ = self.stop();
        }
    }
}
