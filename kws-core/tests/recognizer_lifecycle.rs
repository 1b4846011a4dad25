use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use kws_core::audio::CaptureState;
use kws_core::features::FeatureSlice;
use kws_core::settings::{SLICE_COUNT, WINDOW_SAMPLES};
use kws_core::{
    CaptureConfig, ChannelMask, DetectionEvent, KwsError, Microphone, Recognizer,
    RecognizerConfig, RecognizerStatus, SampleWidth, SpectrumTransform, StubModel,
};
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Serves full frames of a slow 32-bit ramp, a few times faster than real time.
struct RampMic {
    next: i32,
    pace: Duration,
    drains: Arc<AtomicUsize>,
}

impl Microphone for RampMic {
    fn configure(&mut self, _: u32, _: SampleWidth, _: ChannelMask) -> kws_core::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> kws_core::Result<usize> {
        if buf.len() <= 4 {
            self.drains.fetch_add(1, Ordering::Relaxed);
            return Ok(buf.len());
        }
        thread::sleep(self.pace);
        for word in buf.chunks_exact_mut(4) {
            word.copy_from_slice(&(self.next << 16).to_le_bytes());
            self.next = (self.next + 7) % 2_000;
        }
        Ok(buf.len())
    }

    fn zero_dma_buffers(&mut self) -> kws_core::Result<()> {
        Ok(())
    }
}

/// Counts transform calls; rows are constant.
struct CountingTransform(Arc<AtomicUsize>);

impl SpectrumTransform for CountingTransform {
    fn transform(
        &mut self,
        _window: &[i16; WINDOW_SAMPLES],
        out: &mut FeatureSlice,
    ) -> kws_core::Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        out.fill(3);
        Ok(())
    }
}

struct Fixture {
    recognizer: Recognizer,
    transforms: Arc<AtomicUsize>,
    drains: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let transforms = Arc::new(AtomicUsize::new(0));
    let drains = Arc::new(AtomicUsize::new(0));
    let mic_drains = Arc::clone(&drains);

    let config = RecognizerConfig {
        capture: CaptureConfig {
            read_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_millis(1),
            drain_timeout: Duration::from_millis(1),
            ..CaptureConfig::default()
        },
        audio_timeout: Duration::from_millis(500),
        iteration_delay: Duration::from_millis(1),
        ..RecognizerConfig::default()
    };

    let recognizer = Recognizer::new(
        config,
        move || {
            Ok(RampMic {
                next: 0,
                pace: Duration::from_millis(10),
                drains: Arc::clone(&mic_drains),
            })
        },
        Box::new(CountingTransform(Arc::clone(&transforms))),
        Box::new(StubModel::default()),
    )
    .expect("valid recognizer");

    Fixture {
        recognizer,
        transforms,
        drains,
    }
}

fn next_detection(rx: &mut broadcast::Receiver<DetectionEvent>) -> DetectionEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match rx.try_recv() {
            Ok(event) => return event,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "no detection before deadline");
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Closed) => panic!("detection channel closed"),
        }
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn running_recognizer_emits_detections() {
    let f = fixture();
    let mut detections = f.recognizer.subscribe_detections();

    f.recognizer.start().expect("start");
    f.recognizer.start().expect("second start is a no-op");
    assert_eq!(f.recognizer.status(), RecognizerStatus::Running);

    let first = next_detection(&mut detections);
    assert_eq!(first.label, "silence");
    assert_eq!(first.index, 2);
    assert!(first.score > 0.99);

    let second = next_detection(&mut detections);
    assert!(second.seq > first.seq);
    assert!(second.audio_time_ms >= first.audio_time_ms);

    let capture = f.recognizer.capture_diagnostics_snapshot().expect("capture running");
    assert!(capture.frames_read > 0);
    assert!(f.recognizer.audio_time_ms() > 0);
    assert!(f.transforms.load(Ordering::Relaxed) >= SLICE_COUNT);

    f.recognizer.shutdown();
    assert_eq!(f.recognizer.status(), RecognizerStatus::Stopped);
    assert!(matches!(f.recognizer.start(), Err(KwsError::ShutDown)));
}

#[test]
fn resume_after_suspend_rebuilds_the_whole_window() {
    let f = fixture();
    let mut detections = f.recognizer.subscribe_detections();
    f.recognizer.start().expect("start");
    next_detection(&mut detections);

    f.recognizer.suspend().expect("suspend");
    f.recognizer.suspend().expect("second suspend is a no-op");
    assert_eq!(f.recognizer.status(), RecognizerStatus::Suspended);
    wait_for(|| f.drains.load(Ordering::Relaxed) >= 1);

    // Let an in-flight iteration finish, then the loop must stay parked.
    thread::sleep(Duration::from_millis(1_000));
    let parked = f.recognizer.pipeline_diagnostics_snapshot();
    let transforms_parked = f.transforms.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(f.recognizer.pipeline_diagnostics_snapshot().iterations, parked.iterations);
    assert_eq!(parked.resyncs, 0);

    f.recognizer.resume().expect("resume");
    assert_eq!(f.recognizer.status(), RecognizerStatus::Running);

    wait_for(|| {
        let snap = f.recognizer.pipeline_diagnostics_snapshot();
        snap.resyncs == 1 && snap.inferences > parked.inferences
    });
    assert!(f.transforms.load(Ordering::Relaxed) - transforms_parked >= SLICE_COUNT);

    f.recognizer.shutdown();
}

#[test]
fn shutdown_from_suspended_joins_cleanly() {
    let f = fixture();
    let mut status = f.recognizer.subscribe_status();
    f.recognizer.start().expect("start");
    f.recognizer.suspend().expect("suspend");
    f.recognizer.shutdown();

    let seen: Vec<RecognizerStatus> = std::iter::from_fn(|| status.try_recv().ok())
        .map(|e| e.status)
        .collect();
    assert_eq!(
        seen,
        vec![
            RecognizerStatus::Running,
            RecognizerStatus::Suspended,
            RecognizerStatus::Stopped
        ]
    );
    assert!(f.recognizer.capture_diagnostics_snapshot().is_none());
}

#[test]
fn capture_state_is_observable_through_pause() {
    use kws_core::buffering::create_ring;
    use kws_core::{AudioCapture, AudioClock};

    let (tx, _rx) = create_ring(40_000).expect("ring");
    let drains = Arc::new(AtomicUsize::new(0));
    let mic_drains = Arc::clone(&drains);
    let mut capture = AudioCapture::start(
        CaptureConfig::default(),
        tx,
        AudioClock::new(),
        move || {
            Ok(RampMic {
                next: 0,
                pace: Duration::from_millis(2),
                drains: mic_drains,
            })
        },
    )
    .expect("capture");

    assert_eq!(capture.state(), CaptureState::Running);
    assert!(capture.pause());
    assert!(!capture.pause());
    assert_eq!(capture.state(), CaptureState::Paused);
    wait_for(|| drains.load(Ordering::Relaxed) == 1);
    let frames_paused = capture.diagnostics().frames_read;
    assert!(capture.resume());
    wait_for(|| capture.diagnostics().frames_read > frames_paused);
    capture.stop();
    assert_eq!(capture.state(), CaptureState::Stopped);
    assert_eq!(drains.load(Ordering::Relaxed), 2);
}

#[test]
fn external_reset_rebuilds_the_window_while_running() {
    let f = fixture();
    let mut detections = f.recognizer.subscribe_detections();
    f.recognizer.start().expect("start");
    next_detection(&mut detections);
    assert_eq!(f.recognizer.pipeline_diagnostics_snapshot().resyncs, 0);

    let before = f.transforms.load(Ordering::Relaxed);
    f.recognizer.reset().expect("reset");
    assert_eq!(f.recognizer.status(), RecognizerStatus::Running);

    wait_for(|| f.recognizer.pipeline_diagnostics_snapshot().resyncs == 1);
    wait_for(|| f.transforms.load(Ordering::Relaxed) - before >= SLICE_COUNT);

    f.recognizer.shutdown();
    assert!(matches!(f.recognizer.reset(), Err(KwsError::ShutDown)));
}
