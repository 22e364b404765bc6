//! `arrayfront`: headless runner for the mic-array front end.
//!
//! Opens the array (or replays a recording), runs the engine with the
//! passthrough DSP, and logs noise channel changes, device events and
//! hotword directions until `q` is entered on stdin.
//!
//! ## Threads
//!
//! `CpalPlayback` is `!Send`, so the monitor output stream lives on the main
//! thread next to the stdin loop. Event forwarding runs on plain threads using
//! `blocking_recv` (broadcast) and `iter` (crossbeam); no async runtime is
//! needed.

mod settings;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use arrayfront_core::{
    audio::{
        device::list_input_devices, playback::CpalPlayback, replay::WavCapture, CaptureBackend,
        CpalCapture, PlaybackQueue,
    },
    dsp::{PassthroughBeamProcessor, PassthroughCanceller},
    AudioBlock, CleanAudioSink, DeviceEvent, DspHandle, Engine, HostCommand,
};
use settings::{default_settings_path, load_settings, save_settings, HostSettings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Monitor queue depth in frames.
const MONITOR_SLOTS: usize = 8;

struct Args {
    settings_path: PathBuf,
    replay: Option<PathBuf>,
    dump_dir: Option<PathBuf>,
    list_devices: bool,
    write_settings: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut settings_path: Option<PathBuf> = None;
    let mut replay: Option<PathBuf> = None;
    let mut dump_dir: Option<PathBuf> = None;
    let mut list_devices = false;
    let mut write_settings = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                settings_path = Some(PathBuf::from(v));
            }
            "--replay" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --replay".into());
                };
                replay = Some(PathBuf::from(v));
            }
            "--dump" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --dump".into());
                };
                dump_dir = Some(PathBuf::from(v));
            }
            "--list-devices" => list_devices = true,
            "--write-settings" => write_settings = true,
            "--help" | "-h" => {
                println!(
                    "Usage: arrayfront [--settings <file.json>] [--replay <mic.wav>] \\
  [--dump <dir>] [--list-devices] [--write-settings]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    Ok(Args {
        settings_path: settings_path.unwrap_or_else(default_settings_path),
        replay,
        dump_dir,
        list_devices,
        write_settings,
    })
}

fn capture_backend(settings: &HostSettings) -> anyhow::Result<Box<dyn CaptureBackend>> {
    let array = &settings.engine.array;
    let channels = u16::try_from(array.mic_channels).context("mic channel count out of range")?;
    Ok(match &settings.replay_wav {
        Some(path) => {
            let replay = WavCapture::new(path, channels);
            Box::new(if settings.realtime_replay {
                replay
            } else {
                replay.unpaced()
            })
        }
        None => Box::new(CpalCapture::new(
            settings.input_device.clone(),
            channels,
            array.sample_rate,
        )),
    })
}

fn spawn_event_loggers(engine: &Arc<Engine>) -> anyhow::Result<()> {
    let mut status_rx = engine.subscribe_status();
    thread::Builder::new()
        .name("arrayfront-status".into())
        .spawn(move || loop {
            match status_rx.blocking_recv() {
                Ok(ev) => info!(status = ?ev.status, detail = ?ev.detail, "engine status"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
                Err(RecvError::Closed) => break,
            }
        })?;

    let mut noise_rx = engine.subscribe_noise_channel();
    thread::Builder::new()
        .name("arrayfront-noise".into())
        .spawn(move || loop {
            match noise_rx.blocking_recv() {
                Ok(ev) => match serde_json::to_string(&ev) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "noise event not serializable"),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "noise channel events lagged"),
                Err(RecvError::Closed) => break,
            }
        })?;

    let Some(events) = engine.device_events() else {
        return Ok(());
    };
    let engine = Arc::clone(engine);
    thread::Builder::new()
        .name("arrayfront-device".into())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    DeviceEvent::WakeDetected => {
                        let frame = engine.frame_count();
                        let detections = vec![frame; engine.config().array.beam_channels];
                        match engine.select_hotword_direction(&detections) {
                            Ok(Some(dir)) => info!(
                                channel = dir.channel,
                                energy = dir.energy,
                                angle = dir.angle,
                                "hotword direction"
                            ),
                            Ok(None) => info!("hotword detected; direction unavailable"),
                            Err(e) => warn!(error = %e, "hotword direction query failed"),
                        }
                    }
                    DeviceEvent::WakeWords { words } => info!(?words, "device wake words"),
                    other => info!(event = ?other, "device event"),
                }
            }
        })?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("arrayfront=info")),
        )
        .init();

    let args = parse_args().map_err(anyhow::Error::msg)?;

    let mut settings = load_settings(&args.settings_path);
    if args.replay.is_some() {
        settings.replay_wav = args.replay;
    }
    if args.dump_dir.is_some() {
        settings.engine.dump_dir = args.dump_dir;
    }
    if args.write_settings {
        save_settings(&args.settings_path, &settings)
            .with_context(|| format!("writing {}", args.settings_path.display()))?;
        info!(path = %args.settings_path.display(), "settings written");
    }

    let array = settings.engine.array.clone();
    if args.list_devices {
        let required = u16::try_from(array.mic_channels).unwrap_or(u16::MAX);
        for device in list_input_devices(required) {
            println!(
                "{}{}  max_channels={}{}",
                device.name,
                if device.is_default { " (default)" } else { "" },
                device.max_channels,
                if device.is_array_capable { "  [array]" } else { "" },
            );
        }
        return Ok(());
    }

    info!(
        settings_path = %args.settings_path.display(),
        mic_channels = array.mic_channels,
        beam_channels = array.beam_channels,
        sample_rate = array.sample_rate,
        replay = ?settings.replay_wav,
        serial = ?settings.engine.serial.as_ref().map(|s| s.path.display().to_string()),
        "arrayfront starting"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    let monitor = match settings.monitor_channel {
        Some(channel) => Some((
            channel,
            Arc::new(PlaybackQueue::new(MONITOR_SLOTS, array.samples_per_channel)?),
        )),
        None => None,
    };
    let sink: Arc<dyn CleanAudioSink> = match &monitor {
        Some((channel, queue)) => {
            let (channel, queue) = (*channel, Arc::clone(queue));
            Arc::new(move |block: &AudioBlock| {
                queue.write(block.channel(channel), false);
            })
        }
        None => Arc::new(|_: &AudioBlock| {}),
    };

    let engine = Arc::new(
        Engine::new(
            settings.engine.clone(),
            capture_backend(&settings)?,
            DspHandle::new(PassthroughBeamProcessor::new(array.mic_channels)),
            sink,
        )?
        .with_canceller(PassthroughCanceller),
    );
    spawn_event_loggers(&engine)?;

    let playback = monitor.as_ref().and_then(|(channel, queue)| {
        match CpalPlayback::open(queue, 1, array.sample_rate) {
            Ok(playback) => {
                info!(channel, "monitoring clean beam");
                Some(playback)
            }
            Err(e) => {
                warn!(error = %e, "monitor output unavailable");
                None
            }
        }
    });

    engine.start()?;

    // Device events (if the link is up) are logged by the device thread.
    for command in [HostCommand::QueryWakeWords, HostCommand::QueryBeamDirectionList] {
        if let Err(e) = engine.send_command(command) {
            warn!(?command, error = %e, "startup query not sent");
        }
    }

    println!("arrayfront running. q: quit, d: diagnostics, l: link stats");
    for line in io::stdin().lock().lines() {
        match line?.trim() {
            "q" => break,
            "d" => println!("{}", serde_json::to_string(&engine.diagnostics_snapshot())?),
            "l" => match engine.link() {
                Some(link) => println!("{}", serde_json::to_string(&link.stats())?),
                None => println!("no control link"),
            },
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    engine.stop()?;
    if let Some((_, queue)) = &monitor {
        queue.close();
        if let Some(playback) = &playback {
            if let Err(e) = playback.pause() {
                warn!(error = %e, "monitor pause failed");
            }
        }
        info!(underruns = queue.underruns(), "monitor stopped");
    }
    info!("arrayfront stopped");
    Ok(())
}
