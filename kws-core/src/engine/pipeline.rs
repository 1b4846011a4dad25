//! Blocking recognition loop.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Park while suspended; exit on shutdown
//! 2. Honour a pending reset: previous time = 0, force a full resync,
//!    drop audio queued before the reset
//! 3. Read the audio clock
//! 4. FeatureProvider::populate(previous, now)
//!      error → log, count, next iteration
//!      0     → skip inference
//! 5. InferenceDriver::run → broadcast DetectionEvent
//! 6. Idle for the configured delay
//! ```
//!
//! The loop runs on a dedicated OS thread. Its only blocking points are the
//! bounded ring reads inside `populate` and the end-of-iteration delay.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::{
    audio::AudioClock,
    features::{AudioSource, FeatureProvider},
    inference::InferenceDriver,
    ipc::events::DetectionEvent,
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub iterations: AtomicUsize,
    pub slices_computed: AtomicUsize,
    pub inferences: AtomicUsize,
    pub skipped_iterations: AtomicUsize,
    pub feature_errors: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub resyncs: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.iterations.store(0, Ordering::Relaxed);
        self.slices_computed.store(0, Ordering::Relaxed);
        self.inferences.store(0, Ordering::Relaxed);
        self.skipped_iterations.store(0, Ordering::Relaxed);
        self.feature_errors.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.resyncs.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            slices_computed: self.slices_computed.load(Ordering::Relaxed),
            inferences: self.inferences.load(Ordering::Relaxed),
            skipped_iterations: self.skipped_iterations.load(Ordering::Relaxed),
            feature_errors: self.feature_errors.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub iterations: usize,
    pub slices_computed: usize,
    pub inferences: usize,
    pub skipped_iterations: usize,
    pub feature_errors: usize,
    pub inference_errors: usize,
    pub resyncs: usize,
}

#[derive(Default)]
struct LoopFlags {
    suspended: bool,
    shutdown: bool,
}

/// Cross-thread control of the loop: suspend/resume, reset and shutdown.
///
/// Cancellation is cooperative; the loop observes it at iteration boundaries.
#[derive(Default)]
pub struct LoopControl {
    flags: Mutex<LoopFlags>,
    cond: Condvar,
    reset_requested: AtomicBool,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.flags.lock().suspended = true;
    }

    /// Clear the halt and request a resync, so the window is rebuilt from
    /// fresh audio rather than stitched across the gap.
    pub fn resume(&self) {
        self.reset_requested.store(true, Ordering::Release);
        self.flags.lock().suspended = false;
        self.cond.notify_all();
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.flags.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.lock().suspended
    }

    fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    /// Park while suspended. Returns `false` once shutdown was requested.
    fn wait_while_suspended(&self) -> bool {
        let mut flags = self.flags.lock();
        while flags.suspended && !flags.shutdown {
            self.cond.wait(&mut flags);
        }
        !flags.shutdown
    }

    /// Sleep for `delay` unless shutdown arrives first. Returns `false` on
    /// shutdown.
    fn idle(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut flags = self.flags.lock();
        while !flags.shutdown {
            if self.cond.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        !flags.shutdown
    }
}

/// All context the loop needs, passed as one struct so the spawn closure
/// stays tidy.
pub struct PipelineContext {
    pub provider: FeatureProvider,
    pub source: Box<dyn AudioSource>,
    pub driver: InferenceDriver,
    pub clock: AudioClock,
    pub control: Arc<LoopControl>,
    /// Fixed idle at the end of each iteration; zero in tests.
    pub iteration_delay: Duration,
    pub detection_tx: broadcast::Sender<DetectionEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the loop until `ctx.control` requests shutdown.
pub fn run(mut ctx: PipelineContext) {
    let span = info_span!("recognition");
    let _enter = span.enter();
    info!("recognition loop started");

    let mut previous_time_ms: u64 = 0;

    loop {
        if !ctx.control.wait_while_suspended() {
            break;
        }

        if ctx.control.take_reset() {
            previous_time_ms = 0;
            ctx.provider.request_resync();
            let dropped = ctx.source.discard_buffered();
            ctx.diagnostics.resyncs.fetch_add(1, Ordering::Relaxed);
            debug!(dropped_samples = dropped, "feature window reset");
        }

        ctx.diagnostics.iterations.fetch_add(1, Ordering::Relaxed);
        let now_ms = ctx.clock.now_ms();

        match ctx
            .provider
            .populate(ctx.source.as_mut(), previous_time_ms, now_ms)
        {
            Err(e) => {
                ctx.diagnostics.feature_errors.fetch_add(1, Ordering::Relaxed);
                warn!(now_ms, previous_time_ms, "feature generation failed: {e}");
            }
            Ok(changed) => {
                previous_time_ms = now_ms;
                if changed == 0 {
                    ctx.diagnostics
                        .skipped_iterations
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    ctx.diagnostics
                        .slices_computed
                        .fetch_add(changed, Ordering::Relaxed);
                    infer_and_emit(&mut ctx, now_ms);
                }
            }
        }

        if !ctx.iteration_delay.is_zero() && !ctx.control.idle(ctx.iteration_delay) {
            break;
        }
    }

    info!(
        iterations = ctx.diagnostics.iterations.load(Ordering::Relaxed),
        inferences = ctx.diagnostics.inferences.load(Ordering::Relaxed),
        "recognition loop stopped"
    );
}

fn infer_and_emit(ctx: &mut PipelineContext, now_ms: u64) {
    match ctx.driver.run(ctx.provider.state()) {
        Ok(detection) => {
            ctx.diagnostics.inferences.fetch_add(1, Ordering::Relaxed);
            let seq = ctx.seq.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                seq,
                label = &*detection.label,
                score = detection.score,
                "detection"
            );
            // No subscribers is not an error.
            let _ = ctx.detection_tx.send(DetectionEvent {
                seq,
                label: detection.label.to_string(),
                index: detection.index,
                score: detection.score,
                audio_time_ms: now_ms,
            });
        }
        Err(e) => {
            ctx.diagnostics
                .inference_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(now_ms, "inference failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::features::{FeatureSlice, SpectrumTransform};
    use crate::inference::{stub::StubModel, OutputQuantization};
    use crate::settings::{CATEGORY_LABELS, SLICE_COUNT, STRIDE_MS, WINDOW_SAMPLES};
    use std::thread;

    /// Endless silence; counts discards.
    struct SilenceSource {
        discards: Arc<AtomicUsize>,
    }

    impl AudioSource for SilenceSource {
        fn pull(&mut self, _slice_start_ms: u64, out: &mut [i16]) -> usize {
            out.fill(0);
            out.len()
        }

        fn discard_buffered(&mut self) -> usize {
            self.discards.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    struct ZeroTransform;

    impl SpectrumTransform for ZeroTransform {
        fn transform(&mut self, _window: &[i16; WINDOW_SAMPLES], out: &mut FeatureSlice) -> Result<()> {
            out.fill(0);
            Ok(())
        }
    }

    struct Harness {
        clock: AudioClock,
        control: Arc<LoopControl>,
        diagnostics: Arc<PipelineDiagnostics>,
        discards: Arc<AtomicUsize>,
        detections: broadcast::Receiver<DetectionEvent>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_loop() -> Harness {
        let clock = AudioClock::new();
        let control = Arc::new(LoopControl::new());
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let discards = Arc::new(AtomicUsize::new(0));
        let (detection_tx, detections) = broadcast::channel(1024);

        let model = StubModel::new(vec![-128, 100, -128, -128], OutputQuantization::default());
        let ctx = PipelineContext {
            provider: FeatureProvider::new(Box::new(ZeroTransform)),
            source: Box::new(SilenceSource {
                discards: Arc::clone(&discards),
            }),
            driver: InferenceDriver::new(Box::new(model), &CATEGORY_LABELS[..]).unwrap(),
            clock: clock.clone(),
            control: Arc::clone(&control),
            iteration_delay: Duration::from_millis(1),
            detection_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };
        let handle = thread::spawn(move || run(ctx));

        Harness {
            clock,
            control,
            diagnostics,
            discards,
            detections,
            handle,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn first_iteration_infers_then_idle_clock_skips() {
        let mut h = spawn_loop();

        let first = h
            .detections
            .blocking_recv()
            .expect("first detection");
        assert_eq!(first.seq, 1);
        assert_eq!(first.label, "stop");
        assert_eq!(first.index, 1);

        // Clock never moves: every later iteration is a skip.
        wait_for(|| h.diagnostics.snapshot().skipped_iterations >= 3);
        let snap = h.diagnostics.snapshot();
        assert_eq!(snap.inferences, 1);
        assert_eq!(snap.slices_computed, SLICE_COUNT);

        h.control.shutdown();
        h.handle.join().unwrap();
    }

    #[test]
    fn advancing_clock_computes_only_new_slices() {
        let h = spawn_loop();
        wait_for(|| h.diagnostics.snapshot().inferences == 1);

        h.clock.advance(3 * STRIDE_MS as usize * 16, 16_000);
        wait_for(|| h.diagnostics.snapshot().inferences == 2);
        assert_eq!(h.diagnostics.snapshot().slices_computed, SLICE_COUNT + 3);

        h.control.shutdown();
        h.handle.join().unwrap();
    }

    #[test]
    fn resume_forces_full_resync_and_discards_audio() {
        let h = spawn_loop();
        wait_for(|| h.diagnostics.snapshot().inferences == 1);

        h.control.suspend();
        assert!(h.control.is_suspended());
        // Let the loop reach its park point.
        thread::sleep(Duration::from_millis(20));
        let parked = h.diagnostics.snapshot().iterations;
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.diagnostics.snapshot().iterations, parked);

        h.clock.advance(16, 16_000);
        h.control.resume();
        wait_for(|| h.diagnostics.snapshot().inferences == 2);

        let snap = h.diagnostics.snapshot();
        assert_eq!(snap.resyncs, 1);
        assert_eq!(snap.slices_computed, 2 * SLICE_COUNT);
        assert_eq!(h.discards.load(Ordering::Relaxed), 1);

        h.control.shutdown();
        h.handle.join().unwrap();
    }

    #[test]
    fn shutdown_wakes_a_suspended_loop() {
        let h = spawn_loop();
        h.control.suspend();
        h.control.shutdown();
        h.handle.join().unwrap();
    }

    #[test]
    fn diagnostics_reset_zeroes_counters() {
        let diagnostics = PipelineDiagnostics::default();
        diagnostics.iterations.store(4, Ordering::Relaxed);
        diagnostics.resyncs.store(2, Ordering::Relaxed);
        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), PipelineDiagnostics::default().snapshot());
    }
}
