//! Blocking processing loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Blocking obtain of one capture slot (ring closed → exit)
//! 2. Optional raw dump
//! 3. BeamProcessor::process → clean AudioBlock       (error → log, skip frame)
//! 4. Record every beam's energy at the current frame
//! 5. DOA query (offset 0) → angle_to_channel → ChannelSelector::update
//!    (no direction → ChannelSelector::miss)
//! 6. Located + Selected + canceller → clean the beams facing away from the
//!    noise beam
//! 7. Broadcast NoiseChannelEvent when the selection changed
//! 8. CleanAudioSink::on_clean_audio, FrameCounter += 1, release the slot
//! ```
//!
//! The loop runs on its own OS thread, owned by `Engine`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::AudioDump,
    buffering::{chunk::AudioBlock, SlotRing},
    dsp::{cancellation_targets, DspHandle, NoiseCanceller},
    engine::CleanAudioSink,
    ipc::events::NoiseChannelEvent,
    selection::{angle_to_channel, ArrayConfig, ChannelDecision, ChannelSelector, EnergyHistory},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub dsp_errors: AtomicUsize,
    pub doa_unavailable: AtomicUsize,
    pub post_cancel_runs: AtomicUsize,
    pub selection_changes: AtomicUsize,
    pub dump_errors: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_processed.store(0, Ordering::Relaxed);
        self.dsp_errors.store(0, Ordering::Relaxed);
        self.doa_unavailable.store(0, Ordering::Relaxed);
        self.post_cancel_runs.store(0, Ordering::Relaxed);
        self.selection_changes.store(0, Ordering::Relaxed);
        self.dump_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            dsp_errors: self.dsp_errors.load(Ordering::Relaxed),
            doa_unavailable: self.doa_unavailable.load(Ordering::Relaxed),
            post_cancel_runs: self.post_cancel_runs.load(Ordering::Relaxed),
            selection_changes: self.selection_changes.load(Ordering::Relaxed),
            dump_errors: self.dump_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_processed: usize,
    pub dsp_errors: usize,
    pub doa_unavailable: usize,
    pub post_cancel_runs: usize,
    pub selection_changes: usize,
    pub dump_errors: usize,
}

/// All context the pipeline needs, passed as one struct so the thread closure stays tidy.
pub struct PipelineContext {
    pub array: ArrayConfig,
    pub ring: Arc<SlotRing>,
    pub dsp: DspHandle,
    pub canceller: Option<Box<dyn NoiseCanceller>>,
    pub selector: Box<dyn ChannelSelector>,
    pub energy: Arc<Mutex<EnergyHistory>>,
    pub frame_counter: Arc<AtomicU64>,
    pub decision: Arc<Mutex<ChannelDecision>>,
    pub sink: Arc<dyn CleanAudioSink>,
    pub running: Arc<AtomicBool>,
    pub noise_tx: broadcast::Sender<NoiseChannelEvent>,
    /// Query the DSP for a direction every frame and run selection.
    pub query_direction: bool,
    pub dump: Option<AudioDump>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run until `ctx.running` is cleared or the capture ring is closed.
///
/// Hands the canceller back so the engine can reuse it on the next start.
pub fn run(mut ctx: PipelineContext) -> Option<Box<dyn NoiseCanceller>> {
    let spc = ctx.array.samples_per_channel;
    let beams = ctx.array.beam_channels;
    info!(beams, samples_per_channel = spc, "pipeline started");

    let mut canceller = ctx.canceller.take();
    let mut parked = None;
    if let Some(c) = canceller.as_mut() {
        if let Err(e) = c.open(beams / 2 + 1, spc) {
            warn!(error = %e, "noise canceller unavailable; second stage disabled");
            parked = canceller.take();
        }
    }

    // Reused every iteration; nothing below allocates.
    let mut block = AudioBlock::new(beams, spc);
    let mut targets = AudioBlock::new(beams / 2 + 1, spc);
    let mut reference = vec![0i16; spc];
    let mut decision = ChannelDecision::Unselected;
    let mut reported: Option<usize> = None;
    let mut seq = 0u64;

    while ctx.running.load(Ordering::Relaxed) {
        // ── 1. Blocking obtain ──────────────────────────────────────────────
        let Some(slot) = ctx.ring.obtain_read(true) else {
            break;
        };
        ctx.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed);
        let frame = ctx.frame_counter.load(Ordering::Relaxed);

        // ── 2. Raw dump ─────────────────────────────────────────────────────
        if let Some(dump) = ctx.dump.as_mut() {
            if let Err(e) = dump.write_mic(&slot) {
                ctx.diagnostics.dump_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame, error = %e, "mic dump write failed");
            }
        }

        // ── 3. DSP ──────────────────────────────────────────────────────────
        let angle = {
            let mut dsp = ctx.dsp.0.lock();
            if let Err(e) = dsp.process(&slot, &mut block) {
                ctx.diagnostics.dsp_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame, error = %e, "DSP process failed; frame skipped");
                continue;
            }
            if ctx.query_direction {
                dsp.direction_of_arrival(0)
            } else {
                Ok(None)
            }
        };

        // ── 4. Energy history ───────────────────────────────────────────────
        ctx.energy.lock().record_block(frame, &block);

        // ── 5. Selection ────────────────────────────────────────────────────
        let located = match angle {
            Ok(Some(angle)) => {
                let mapped = angle_to_channel(angle as i32, beams);
                decision = ctx.selector.update(mapped, block.channel_energy(mapped));
                true
            }
            Ok(None) => {
                if ctx.query_direction {
                    ctx.diagnostics.doa_unavailable.fetch_add(1, Ordering::Relaxed);
                    decision = ctx.selector.miss();
                }
                false
            }
            Err(e) => {
                ctx.diagnostics.dsp_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame, error = %e, "direction query failed");
                decision = ctx.selector.miss();
                false
            }
        };

        // ── 6. Second-stage cancellation (located frames only) ──────────────
        if let (true, ChannelDecision::Selected(noise), Some(canceller)) =
            (located, decision, canceller.as_mut())
        {
            reference.copy_from_slice(block.channel(noise));
            for (i, c) in cancellation_targets(noise, beams).enumerate() {
                targets.channel_mut(i).copy_from_slice(block.channel(c));
            }
            match canceller.cancel(&reference, &mut targets) {
                Ok(()) => {
                    for (i, c) in cancellation_targets(noise, beams).enumerate() {
                        block.channel_mut(c).copy_from_slice(targets.channel(i));
                    }
                    ctx.diagnostics.post_cancel_runs.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    ctx.diagnostics.dsp_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(frame, noise, error = %e, "noise cancellation failed");
                }
            }
        }

        // ── 7. Selection change ─────────────────────────────────────────────
        let current = decision.channel();
        if current != reported {
            reported = current;
            *ctx.decision.lock() = decision;
            ctx.diagnostics.selection_changes.fetch_add(1, Ordering::Relaxed);
            let angle = current.map(|c| ctx.array.channel_angle(c));
            info!(frame, channel = ?current, angle = ?angle, "noise channel changed");
            let _ = ctx.noise_tx.send(NoiseChannelEvent {
                seq,
                frame,
                channel: current,
                angle,
            });
            seq += 1;
        }

        // ── 8. Deliver ──────────────────────────────────────────────────────
        if let Some(dump) = ctx.dump.as_mut() {
            if let Err(e) = dump.write_clean(&block) {
                ctx.diagnostics.dump_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame, error = %e, "clean dump write failed");
            }
        }
        ctx.sink.on_clean_audio(&block);
        ctx.frame_counter.fetch_add(1, Ordering::Release);
        ctx.diagnostics.frames_processed.fetch_add(1, Ordering::Relaxed);

        if frame % 500 == 0 {
            debug!(frame, ready = ctx.ring.ready_count(), "pipeline heartbeat");
        }
        drop(slot);
    }

    if let Some(c) = canceller.as_mut() {
        c.close();
    }
    if let Some(dump) = ctx.dump.take() {
        if let Err(e) = dump.finalize() {
            warn!(error = %e, "audio dump finalize failed");
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_in = snap.frames_in,
        frames_processed = snap.frames_processed,
        dsp_errors = snap.dsp_errors,
        doa_unavailable = snap.doa_unavailable,
        post_cancel_runs = snap.post_cancel_runs,
        selection_changes = snap.selection_changes,
        "pipeline stopped"
    );
    canceller.or(parked)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::dsp::{BeamProcessor, PassthroughBeamProcessor, SilentBeamProcessor};
    use crate::error::{ArrayError, Result};
    use crate::selection::{HysteresisSelector, SelectionState};

    struct CountingSink {
        blocks: Mutex<Vec<Vec<i16>>>,
    }

    impl CleanAudioSink for CountingSink {
        fn on_clean_audio(&self, block: &AudioBlock) {
            self.blocks.lock().push(block.as_slice().to_vec());
        }
    }

    struct ScriptedSelector {
        decisions: VecDeque<ChannelDecision>,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl ChannelSelector for ScriptedSelector {
        fn update(&mut self, mapped: usize, _energy: u64) -> ChannelDecision {
            self.seen.lock().push(mapped);
            self.decisions.pop_front().unwrap_or(ChannelDecision::Unselected)
        }

        fn miss(&mut self) -> ChannelDecision {
            self.decisions.pop_front().unwrap_or(ChannelDecision::Unselected)
        }

        fn state(&self) -> SelectionState {
            SelectionState::default()
        }

        fn reset(&mut self) {}
    }

    /// Fails every odd frame.
    struct FlakyProcessor {
        calls: u64,
    }

    impl BeamProcessor for FlakyProcessor {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, _raw: &[i16], out: &mut AudioBlock) -> Result<()> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(ArrayError::Dsp("bad frame".into()));
            }
            out.as_mut_slice().fill(1);
            Ok(())
        }

        fn direction_of_arrival(&mut self, _offset: u64) -> Result<Option<f32>> {
            Ok(Some(0.0))
        }

        fn close(&mut self) {}
    }

    /// Points at 90° for the first `located` frames, then alternates between
    /// a failed query and no estimate.
    struct LosingTrackProcessor {
        located: u64,
        calls: u64,
    }

    impl BeamProcessor for LosingTrackProcessor {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, _raw: &[i16], out: &mut AudioBlock) -> Result<()> {
            out.as_mut_slice().fill(100);
            Ok(())
        }

        fn direction_of_arrival(&mut self, _offset: u64) -> Result<Option<f32>> {
            self.calls += 1;
            match self.calls {
                n if n <= self.located => Ok(Some(90.0)),
                n if n % 2 == 1 => Err(ArrayError::Dsp("doa busy".into())),
                _ => Ok(None),
            }
        }

        fn close(&mut self) {}
    }

    /// Subtracts the reference from every target and records its calls.
    struct SubtractingCanceller {
        calls: Arc<Mutex<Vec<i16>>>,
    }

    impl NoiseCanceller for SubtractingCanceller {
        fn open(&mut self, _channels: usize, _spc: usize) -> Result<()> {
            Ok(())
        }

        fn cancel(&mut self, reference: &[i16], targets: &mut AudioBlock) -> Result<()> {
            self.calls.lock().push(reference[0]);
            for c in 0..targets.channels() {
                for (t, r) in targets.channel_mut(c).iter_mut().zip(reference) {
                    *t -= *r;
                }
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn small_array() -> ArrayConfig {
        ArrayConfig {
            mic_channels: 4,
            beam_channels: 4,
            samples_per_channel: 2,
            energy_window: 10,
            ..ArrayConfig::default()
        }
    }

    fn context(
        array: ArrayConfig,
        dsp: DspHandle,
        selector: Box<dyn ChannelSelector>,
        sink: Arc<dyn CleanAudioSink>,
    ) -> (PipelineContext, broadcast::Receiver<NoiseChannelEvent>) {
        let ring = Arc::new(SlotRing::new(32, array.capture_slot_len()).unwrap());
        let (noise_tx, noise_rx) = broadcast::channel(16);
        let energy = EnergyHistory::new(
            array.beam_channels,
            array.energy_window,
            array.samples_per_channel,
        );
        let ctx = PipelineContext {
            array,
            ring,
            dsp,
            canceller: None,
            selector,
            energy: Arc::new(Mutex::new(energy)),
            frame_counter: Arc::new(AtomicU64::new(0)),
            decision: Arc::new(Mutex::new(ChannelDecision::Unselected)),
            sink,
            running: Arc::new(AtomicBool::new(true)),
            noise_tx,
            query_direction: true,
            dump: None,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        };
        (ctx, noise_rx)
    }

    fn push_slots(ring: &SlotRing, slots: &[Vec<i16>]) {
        for samples in slots {
            let mut slot = ring.obtain_write(false).expect("ring has room");
            slot.copy_from_slice(samples);
        }
    }

    fn wait_for(counter: &AtomicU64, target: u64) {
        let start = Instant::now();
        while counter.load(Ordering::Acquire) < target {
            assert!(start.elapsed() < Duration::from_secs(2), "pipeline stalled");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn stop(ctx_running: &AtomicBool, ring: &SlotRing) {
        ctx_running.store(false, Ordering::SeqCst);
        ring.close();
    }

    #[test]
    fn dsp_failure_skips_the_frame_but_keeps_running() {
        let array = small_array();
        let sink = Arc::new(CountingSink { blocks: Mutex::new(Vec::new()) });
        let selector = Box::new(HysteresisSelector::from_config(&array));
        let (ctx, _rx) = context(
            array,
            DspHandle::new(FlakyProcessor { calls: 0 }),
            selector,
            sink.clone(),
        );
        let (ring, running, frames, diagnostics) = (
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.running),
            Arc::clone(&ctx.frame_counter),
            Arc::clone(&ctx.diagnostics),
        );
        push_slots(&ring, &vec![vec![0; 8]; 6]);

        let handle = thread::spawn(move || run(ctx));
        wait_for(&frames, 3);
        while diagnostics.frames_in.load(Ordering::Relaxed) < 6 {
            thread::sleep(Duration::from_millis(2));
        }
        stop(&running, &ring);
        handle.join().expect("pipeline thread panicked");

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_in, 6);
        assert_eq!(snap.frames_processed, 3);
        assert_eq!(snap.dsp_errors, 3);
        assert_eq!(sink.blocks.lock().len(), 3);
    }

    #[test]
    fn selected_channel_drives_second_stage_and_emits_one_event_per_change() {
        let array = small_array();
        let sink = Arc::new(CountingSink { blocks: Mutex::new(Vec::new()) });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let selector = Box::new(ScriptedSelector {
            decisions: VecDeque::from(vec![
                ChannelDecision::Unselected,
                ChannelDecision::Selected(1),
                ChannelDecision::Selected(1),
                ChannelDecision::Unselected,
            ]),
            seen: Arc::clone(&seen),
        });
        let dsp = DspHandle::new(PassthroughBeamProcessor::new(4).with_angle(95.0));
        dsp.0.lock().open().unwrap();
        let (mut ctx, mut noise_rx) = context(array, dsp, selector, sink.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));
        ctx.canceller = Some(Box::new(SubtractingCanceller { calls: Arc::clone(&calls) }));

        let (ring, running, frames) = (
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.running),
            Arc::clone(&ctx.frame_counter),
        );
        // Mic c carries value 10 * (c + 1) in every sample.
        let slot: Vec<i16> = (0..2).flat_map(|_| [10, 20, 30, 40]).collect();
        push_slots(&ring, &vec![slot; 4]);

        let handle = thread::spawn(move || run(ctx));
        wait_for(&frames, 4);
        stop(&running, &ring);
        let canceller = handle.join().expect("pipeline thread panicked");
        assert!(canceller.is_some());

        // 95° on a 4-beam array maps to beam 1.
        assert_eq!(*seen.lock(), vec![1, 1, 1, 1]);
        // Reference beam 1 (value 20) cleaned beams 2, 3, 0 on frames 2 and 3.
        assert_eq!(*calls.lock(), vec![20, 20]);
        let blocks = sink.blocks.lock();
        assert_eq!(blocks[0], vec![10, 10, 20, 20, 30, 30, 40, 40]);
        assert_eq!(blocks[1], vec![-10, -10, 20, 20, 10, 10, 20, 20]);
        assert_eq!(blocks[3], blocks[0]);

        let first = noise_rx.try_recv().unwrap();
        assert_eq!((first.frame, first.channel, first.angle), (1, Some(1), Some(90)));
        let second = noise_rx.try_recv().unwrap();
        assert_eq!((second.frame, second.channel), (3, None));
        assert!(noise_rx.try_recv().is_err());
    }

    #[test]
    fn lock_drains_and_canceller_idles_without_a_direction() {
        let array = ArrayConfig {
            energy_threshold: 0,
            ..small_array()
        };
        let window = array.energy_window as u64;
        let sink = Arc::new(CountingSink { blocks: Mutex::new(Vec::new()) });
        let selector = Box::new(HysteresisSelector::from_config(&array));
        let dsp = DspHandle::new(LosingTrackProcessor { located: window, calls: 0 });
        let (mut ctx, mut noise_rx) = context(array, dsp, selector, sink);
        let calls = Arc::new(Mutex::new(Vec::new()));
        ctx.canceller = Some(Box::new(SubtractingCanceller { calls: Arc::clone(&calls) }));

        let (ring, running, frames, decision, diagnostics) = (
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.running),
            Arc::clone(&ctx.frame_counter),
            Arc::clone(&ctx.decision),
            Arc::clone(&ctx.diagnostics),
        );
        let total = window + 15;
        push_slots(&ring, &vec![vec![0; 8]; total as usize]);

        let handle = thread::spawn(move || run(ctx));
        wait_for(&frames, total);
        stop(&running, &ring);
        handle.join().expect("pipeline thread panicked");

        // Locked on the last located frame; that is the only cancelled one.
        assert_eq!(calls.lock().len(), 1);
        let locked = noise_rx.try_recv().unwrap();
        assert_eq!((locked.frame, locked.channel), (window - 1, Some(1)));
        // A full window of frames without a direction releases the lock.
        let released = noise_rx.try_recv().unwrap();
        assert_eq!((released.frame, released.channel), (2 * window - 1, None));
        assert!(noise_rx.try_recv().is_err());
        assert_eq!(*decision.lock(), ChannelDecision::Unselected);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.post_cancel_runs, 1);
        assert_eq!(snap.doa_unavailable, 7);
        assert_eq!(snap.dsp_errors, 8);
    }

    #[test]
    fn closing_the_ring_unblocks_an_idle_pipeline() {
        let array = small_array();
        let sink = Arc::new(CountingSink { blocks: Mutex::new(Vec::new()) });
        let selector = Box::new(HysteresisSelector::from_config(&array));
        let (ctx, _rx) = context(array, DspHandle::new(SilentBeamProcessor::default()), selector, sink);
        let (ring, running) = (Arc::clone(&ctx.ring), Arc::clone(&ctx.running));

        let handle = thread::spawn(move || run(ctx));
        thread::sleep(Duration::from_millis(20));
        stop(&running, &ring);
        handle.join().expect("pipeline thread panicked");
    }

    #[test]
    fn energy_history_tracks_processed_frames() {
        let array = small_array();
        let sink = Arc::new(CountingSink { blocks: Mutex::new(Vec::new()) });
        let selector = Box::new(HysteresisSelector::from_config(&array));
        let dsp = DspHandle::new(PassthroughBeamProcessor::new(4));
        dsp.0.lock().open().unwrap();
        let (ctx, _rx) = context(array, dsp, selector, sink);
        let (ring, running, frames, energy) = (
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.running),
            Arc::clone(&ctx.frame_counter),
            Arc::clone(&ctx.energy),
        );
        push_slots(&ring, &[vec![1, 2, 3, 4, 1, 2, 3, 4], vec![2, 0, 0, 0, 2, 0, 0, 0]]);

        let handle = thread::spawn(move || run(ctx));
        wait_for(&frames, 2);
        stop(&running, &ring);
        handle.join().expect("pipeline thread panicked");

        let energy = energy.lock();
        assert_eq!(energy.energy_at(0, 0), 2);
        assert_eq!(energy.energy_at(3, 0), 32);
        assert_eq!(energy.energy_at(0, 1), 8);
        assert_eq!(energy.energy_at(1, 1), 0);
    }
}
