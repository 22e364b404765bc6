//! Serial control link to the signal-processing unit.
//!
//! ## Threads
//!
//! ```text
//! receive thread:  read → FrameAssembler::push → drain → DeviceEvent → crossbeam (try_send)
//! any thread:      send(HostCommand) → encode → writer (under mutex) → write_all
//! ```
//!
//! The receive thread checks the running flag once per read. [`SerialLink::open`]
//! configures the port with a read timeout, so a quiet device still wakes the
//! thread every `read_timeout_ms`. `Ok(0)`, `WouldBlock` and `TimedOut` all
//! count as idle ticks.

use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ArrayError, Result};
use crate::protocol::{codec, DeviceEvent, Frame, FrameAssembler, FrameConfig, HostCommand};

/// Settings for the control link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/ttyS1`.
    pub path: PathBuf,
    /// Default: 115 200.
    pub baud_rate: u32,
    /// 7 or 8. Default: 8.
    pub data_bits: u8,
    pub parity: LinkParity,
    pub stop_bits: LinkStopBits,
    /// Longest a read may block before the receive thread re-checks the
    /// running flag. Default: 100 ms.
    pub read_timeout_ms: u64,
    /// Sleep between reads that returned nothing. Default: 10 ms.
    pub idle_backoff_ms: u64,
    /// Largest accepted frame, header included. Default: 256.
    pub max_frame_len: usize,
    /// Decoded events buffered for the host before new ones are dropped. Default: 64.
    pub event_capacity: usize,
    /// Bytes requested per read. Default: 256.
    pub read_chunk: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/ttyS1"),
            baud_rate: 115_200,
            data_bits: 8,
            parity: LinkParity::None,
            stop_bits: LinkStopBits::One,
            read_timeout_ms: 100,
            idle_backoff_ms: 10,
            max_frame_len: codec::DEFAULT_MAX_FRAME_LEN,
            event_capacity: 64,
            read_chunk: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkParity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<LinkParity> for serialport::Parity {
    fn from(p: LinkParity) -> Self {
        match p {
            LinkParity::None => serialport::Parity::None,
            LinkParity::Odd => serialport::Parity::Odd,
            LinkParity::Even => serialport::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkStopBits {
    #[default]
    One,
    Two,
}

impl From<LinkStopBits> for serialport::StopBits {
    fn from(s: LinkStopBits) -> Self {
        match s {
            LinkStopBits::One => serialport::StopBits::One,
            LinkStopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl SerialConfig {
    fn data_bits(&self) -> Result<serialport::DataBits> {
        match self.data_bits {
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            n => Err(ArrayError::InvalidConfig(format!(
                "serial data bits must be 7 or 8, got {n}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct LinkStats {
    frames: AtomicU64,
    discarded_bytes: AtomicU64,
    dropped_events: AtomicU64,
    ignored_frames: AtomicU64,
    commands_sent: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time copy of the link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatsSnapshot {
    pub frames: u64,
    pub discarded_bytes: u64,
    /// Events decoded while the host channel was full.
    pub dropped_events: u64,
    /// Unknown codes and malformed payloads.
    pub ignored_frames: u64,
    pub commands_sent: u64,
    pub write_errors: u64,
}

/// Owns one duplex byte stream and its receive thread.
pub struct SerialLink {
    writer: Mutex<Box<dyn Write + Send>>,
    frame_config: FrameConfig,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    events: Receiver<DeviceEvent>,
    stats: Arc<LinkStats>,
}

impl SerialLink {
    /// Open and configure the serial port, then start receiving.
    ///
    /// # Errors
    /// - `ArrayError::InvalidConfig` for unsupported data bits.
    /// - `ArrayError::LinkOpen` if the port cannot be opened, configured or
    ///   duplicated.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let link_open = |e: serialport::Error| ArrayError::LinkOpen {
            path: config.path.clone(),
            source: io::Error::from(e),
        };
        let writer = serialport::new(config.path.to_string_lossy(), config.baud_rate)
            .data_bits(config.data_bits()?)
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(config.read_timeout_ms.max(1)))
            .open()
            .map_err(link_open)?;
        // Drop anything the device queued before we were listening.
        if let Err(e) = writer.clear(serialport::ClearBuffer::All) {
            warn!(error = %e, "serial buffer flush failed");
        }
        let reader = writer.try_clone().map_err(link_open)?;
        info!(
            path = %config.path.display(),
            baud = config.baud_rate,
            data_bits = config.data_bits,
            parity = ?config.parity,
            stop_bits = ?config.stop_bits,
            "serial link opened"
        );
        Self::spawn(reader, writer, config)
    }

    /// Run the link over an arbitrary reader/writer pair.
    pub fn spawn<R, W>(reader: R, writer: W, config: &SerialConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let frame_config = FrameConfig {
            max_frame_len: config.max_frame_len,
        };
        let (events_tx, events) = bounded(config.event_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(LinkStats::default());

        let ctx = ReceiveContext {
            assembler: FrameAssembler::new(frame_config),
            running: Arc::clone(&running),
            events_tx,
            stats: Arc::clone(&stats),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
            read_chunk: config.read_chunk.max(1),
        };
        let handle = thread::Builder::new()
            .name("arrayfront-serial-rx".into())
            .spawn(move || receive_loop(reader, ctx))?;

        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            frame_config,
            running,
            receiver: Mutex::new(Some(handle)),
            events,
            stats,
        })
    }

    /// Encode `command` and write it in one call.
    ///
    /// # Errors
    /// - `ArrayError::Frame` if the command cannot be encoded.
    /// - `ArrayError::LinkWrite` on a write failure. Nothing is retried.
    pub fn send(&self, command: HostCommand) -> Result<()> {
        let frame = command.to_frame()?;
        let bytes = codec::encode(&self.frame_config, frame.code, &frame.payload)?;

        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(?command, error = %e, "serial write failed");
            return Err(ArrayError::LinkWrite(e));
        }
        self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!(?command, bytes = bytes.len(), "command sent");
        Ok(())
    }

    /// Receiver for decoded device events. Clones share one queue.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events.clone()
    }

    /// `false` once the receive thread has exited (closed or hard read error).
    pub fn is_receiving(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        let s = &self.stats;
        LinkStatsSnapshot {
            frames: s.frames.load(Ordering::Relaxed),
            discarded_bytes: s.discarded_bytes.load(Ordering::Relaxed),
            dropped_events: s.dropped_events.load(Ordering::Relaxed),
            ignored_frames: s.ignored_frames.load(Ordering::Relaxed),
            commands_sent: s.commands_sent.load(Ordering::Relaxed),
            write_errors: s.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the receive thread and wait for it. Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                error!("serial receive thread panicked");
            }
            info!("serial link closed");
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("frame_config", &self.frame_config)
            .field("receiving", &self.is_receiving())
            .finish_non_exhaustive()
    }
}

struct ReceiveContext {
    assembler: FrameAssembler,
    running: Arc<AtomicBool>,
    events_tx: Sender<DeviceEvent>,
    stats: Arc<LinkStats>,
    idle_backoff: Duration,
    read_chunk: usize,
}

fn receive_loop<R: Read>(mut reader: R, mut ctx: ReceiveContext) {
    debug!("serial receive loop started");
    let mut buf = vec![0u8; ctx.read_chunk];

    while ctx.running.load(Ordering::Relaxed) {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                thread::sleep(ctx.idle_backoff);
                continue;
            }
            Ok(n) => n,
            // The read already waited out its timeout.
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ctx.idle_backoff);
                continue;
            }
            Err(e) => {
                error!(error = %e, "serial read failed; receive loop exiting");
                ctx.running.store(false, Ordering::SeqCst);
                break;
            }
        };

        ctx.assembler.push(&buf[..n]);
        let (events_tx, stats) = (&ctx.events_tx, &ctx.stats);
        ctx.assembler.drain(|frame| dispatch(frame, events_tx, stats));

        let asm = ctx.assembler.stats();
        ctx.stats.frames.store(asm.frames, Ordering::Relaxed);
        ctx.stats
            .discarded_bytes
            .store(asm.discarded_bytes, Ordering::Relaxed);
    }

    debug!(
        pending = ctx.assembler.pending_len(),
        "serial receive loop stopped"
    );
}

fn dispatch(frame: Frame, events_tx: &Sender<DeviceEvent>, stats: &LinkStats) {
    let event = match DeviceEvent::from_frame(&frame) {
        Ok(DeviceEvent::Unknown { code, payload }) => {
            stats.ignored_frames.fetch_add(1, Ordering::Relaxed);
            warn!(code = format_args!("0x{code:02X}"), len = payload.len(), "unknown device event ignored");
            return;
        }
        Ok(event) => event,
        Err(e) => {
            stats.ignored_frames.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "malformed device event ignored");
            return;
        }
    };

    debug!(?event, "device event");
    match events_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!(?event, "event queue full; device event dropped");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
