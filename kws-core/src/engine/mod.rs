//! `Recognizer`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Recognizer::new()          → components validated, status = Idle
//!     └─► start()            → capture thread + recognition thread, status = Running
//!         ├─► suspend()      → loop parked, capture paused (bus drained), status = Suspended
//!         │     └─► resume() → capture resumed, full resync, status = Running
//!         └─► shutdown()     → both threads joined, status = Stopped
//! ```
//!
//! `start()`, `suspend()` and `resume()` are idempotent: repeating a call in
//! the state it leads to is a no-op. Calls that make no sense in the current
//! state return `KwsError::NotRunning` or `KwsError::ShutDown`.
//!
//! ## Threading
//!
//! The microphone is opened on the capture thread (see `AudioCapture`), so a
//! factory is stored rather than a device. The feature provider and model
//! move onto the recognition thread on the first successful `start()`.

pub mod pipeline;

use std::sync::{atomic::AtomicU64, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    audio::{AudioCapture, AudioClock, CaptureConfig, CaptureSnapshot, Microphone},
    buffering::create_ring,
    error::{KwsError, Result},
    features::{
        source::DEFAULT_AUDIO_TIMEOUT, FeatureProvider, RingAudioSource, SpectrumTransform,
    },
    inference::{InferenceDriver, Model},
    ipc::events::{DetectionEvent, RecognizerStatus, RecognizerStatusEvent},
    settings::{CATEGORY_COUNT, CATEGORY_LABELS, RING_CAPACITY_BYTES, SAMPLE_RATE},
};

use pipeline::{LoopControl, PipelineContext, PipelineDiagnostics};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Opens a microphone on the capture thread.
pub type MicrophoneFactory = Arc<dyn Fn() -> Result<Box<dyn Microphone>> + Send + Sync>;

/// Configuration for `Recognizer`.
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    pub capture: CaptureConfig,
    /// Ring buffer capacity in bytes of 16-bit audio. Default: 40 000.
    pub ring_capacity: usize,
    /// How long one slice may wait for fresh audio. Default: 200 ms.
    pub audio_timeout: Duration,
    /// Idle at the end of every loop iteration. Default: 10 ms.
    pub iteration_delay: Duration,
    /// Category labels in model output order.
    pub labels: Vec<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            ring_capacity: RING_CAPACITY_BYTES,
            audio_timeout: DEFAULT_AUDIO_TIMEOUT,
            iteration_delay: Duration::from_millis(10),
            labels: CATEGORY_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl RecognizerConfig {
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        if self.capture.sample_rate != SAMPLE_RATE {
            return Err(KwsError::InvalidConfig(format!(
                "capture rate {} Hz does not match the {} Hz feature geometry",
                self.capture.sample_rate, SAMPLE_RATE
            )));
        }
        if self.ring_capacity < self.capture.pcm_frame_bytes() {
            return Err(KwsError::InvalidConfig(format!(
                "ring capacity {} is smaller than one capture frame ({} bytes)",
                self.ring_capacity,
                self.capture.pcm_frame_bytes()
            )));
        }
        if self.ring_capacity % 2 != 0 {
            return Err(KwsError::InvalidConfig(format!(
                "ring capacity {} is not a whole number of 16-bit samples",
                self.ring_capacity
            )));
        }
        if self.labels.len() != CATEGORY_COUNT {
            return Err(KwsError::InvalidConfig(format!(
                "{} labels configured, model scores {}",
                self.labels.len(),
                CATEGORY_COUNT
            )));
        }
        Ok(())
    }
}

/// Threads and components owned by a recognizer, behind one lock.
struct Runtime {
    /// Present until the first successful `start()`.
    components: Option<(FeatureProvider, InferenceDriver)>,
    capture: Option<AudioCapture>,
    worker: Option<JoinHandle<()>>,
    clock: Option<AudioClock>,
}

/// The top-level recognizer handle.
///
/// `Recognizer` is `Send + Sync`; every method takes `&self`. Wrap in `Arc`
/// to drive it from several tasks.
pub struct Recognizer {
    config: RecognizerConfig,
    open_microphone: MicrophoneFactory,
    runtime: Mutex<Runtime>,
    control: Arc<LoopControl>,
    status: Arc<Mutex<RecognizerStatus>>,
    detection_tx: broadcast::Sender<DetectionEvent>,
    status_tx: broadcast::Sender<RecognizerStatusEvent>,
    /// Monotonically increasing detection sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl Recognizer {
    /// Validate configuration and components. Does not touch the audio
    /// device; call `start()` for that.
    ///
    /// # Errors
    /// - `KwsError::InvalidConfig` for inconsistent configuration.
    /// - `KwsError::ModelInputMismatch` when the model does not take a full
    ///   feature matrix.
    pub fn new<F, M>(
        config: RecognizerConfig,
        open_microphone: F,
        transform: Box<dyn SpectrumTransform>,
        model: Box<dyn Model>,
    ) -> Result<Self>
    where
        F: Fn() -> Result<M> + Send + Sync + 'static,
        M: Microphone + 'static,
    {
        config.validate()?;
        let driver = InferenceDriver::new(model, &config.labels[..])?;
        let provider = FeatureProvider::new(transform);

        let open_microphone: MicrophoneFactory =
            Arc::new(move || open_microphone().map(|m| Box::new(m) as Box<dyn Microphone>));

        let (detection_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            open_microphone,
            runtime: Mutex::new(Runtime {
                components: Some((provider, driver)),
                capture: None,
                worker: None,
                clock: None,
            }),
            control: Arc::new(LoopControl::new()),
            status: Arc::new(Mutex::new(RecognizerStatus::Idle)),
            detection_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        })
    }

    /// Open the microphone, start capture and the recognition loop.
    ///
    /// Blocks until the device is confirmed configured (or fails).
    ///
    /// # Errors
    /// - Device/driver failures from the microphone factory or
    ///   `Microphone::configure`; the recognizer stays startable.
    /// - `KwsError::ShutDown` after `shutdown()`.
    /// - `KwsError::ThreadSpawn` if the OS refuses a thread.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        match self.status() {
            RecognizerStatus::Running | RecognizerStatus::Suspended => return Ok(()),
            RecognizerStatus::Stopped => return Err(KwsError::ShutDown),
            RecognizerStatus::Idle | RecognizerStatus::Error => {}
        }

        let (producer, consumer) = create_ring(self.config.ring_capacity)?;
        let clock = AudioClock::new();
        let open = Arc::clone(&self.open_microphone);
        let capture = match AudioCapture::start(
            self.config.capture.clone(),
            producer,
            clock.clone(),
            move || open(),
        ) {
            Ok(c) => c,
            Err(e) => {
                error!("audio capture failed to start: {e}");
                self.set_status(RecognizerStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let Some((provider, driver)) = runtime.components.take() else {
            // Only reachable if a previous start lost its thread after the
            // components had moved.
            let e = KwsError::InvalidConfig("recognizer components already consumed".into());
            self.set_status(RecognizerStatus::Error, Some(e.to_string()));
            return Err(e);
        };

        self.diagnostics.reset();
        let ctx = PipelineContext {
            provider,
            source: Box::new(RingAudioSource::new(consumer, self.config.audio_timeout)),
            driver,
            clock: clock.clone(),
            control: Arc::clone(&self.control),
            iteration_delay: self.config.iteration_delay,
            detection_tx: self.detection_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let worker = std::thread::Builder::new()
            .name("kws-recognizer".into())
            .spawn(move || pipeline::run(ctx));
        let worker = match worker {
            Ok(w) => w,
            Err(source) => {
                let mut capture = capture;
                capture.stop();
                let e = KwsError::ThreadSpawn {
                    name: "recognizer",
                    source,
                };
                self.set_status(RecognizerStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        runtime.capture = Some(capture);
        runtime.worker = Some(worker);
        runtime.clock = Some(clock);
        self.set_status(RecognizerStatus::Running, None);
        info!("recognizer started");
        Ok(())
    }

    /// Halt the loop and pause capture (one bounded drain read).
    ///
    /// # Errors
    /// `KwsError::NotRunning` before a successful `start()`,
    /// `KwsError::ShutDown` after `shutdown()`.
    pub fn suspend(&self) -> Result<()> {
        let runtime = self.runtime.lock();
        match self.status() {
            RecognizerStatus::Suspended => return Ok(()),
            RecognizerStatus::Running => {}
            RecognizerStatus::Stopped => return Err(KwsError::ShutDown),
            RecognizerStatus::Idle | RecognizerStatus::Error => return Err(KwsError::NotRunning),
        }

        self.control.suspend();
        if let Some(capture) = runtime.capture.as_ref() {
            capture.pause();
        }
        self.set_status(RecognizerStatus::Suspended, None);
        info!("recognizer suspended");
        Ok(())
    }

    /// Resume capture and the loop; the next feature update is a full
    /// resync.
    ///
    /// # Errors
    /// Same as `suspend()`.
    pub fn resume(&self) -> Result<()> {
        let runtime = self.runtime.lock();
        match self.status() {
            RecognizerStatus::Running => return Ok(()),
            RecognizerStatus::Suspended => {}
            RecognizerStatus::Stopped => return Err(KwsError::ShutDown),
            RecognizerStatus::Idle | RecognizerStatus::Error => return Err(KwsError::NotRunning),
        }

        if let Some(capture) = runtime.capture.as_ref() {
            capture.resume();
        }
        self.control.resume();
        self.set_status(RecognizerStatus::Running, None);
        info!("recognizer resumed");
        Ok(())
    }

    /// Rebuild the whole feature window from fresh audio on the next
    /// iteration, dropping whatever is queued in the ring.
    ///
    /// # Errors
    /// Same as `suspend()`.
    pub fn reset(&self) -> Result<()> {
        let _runtime = self.runtime.lock();
        match self.status() {
            RecognizerStatus::Running | RecognizerStatus::Suspended => {}
            RecognizerStatus::Stopped => return Err(KwsError::ShutDown),
            RecognizerStatus::Idle | RecognizerStatus::Error => return Err(KwsError::NotRunning),
        }
        self.control.request_reset();
        debug!("feature window reset requested");
        Ok(())
    }

    /// Stop both threads and wait for them. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        let mut runtime = self.runtime.lock();
        if self.status() == RecognizerStatus::Stopped {
            return;
        }

        self.control.shutdown();
        if let Some(mut capture) = runtime.capture.take() {
            capture.stop();
        }
        if let Some(worker) = runtime.worker.take() {
            if worker.join().is_err() {
                error!("recognition thread panicked");
            }
        }
        self.set_status(RecognizerStatus::Stopped, None);
        info!("recognizer shut down");
    }

    /// Current status (snapshot).
    pub fn status(&self) -> RecognizerStatus {
        *self.status.lock()
    }

    /// Audio clock in milliseconds; zero before `start()`.
    pub fn audio_time_ms(&self) -> u64 {
        self.runtime
            .lock()
            .clock
            .as_ref()
            .map_or(0, AudioClock::now_ms)
    }

    /// Subscribe to per-inference detections.
    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionEvent> {
        self.detection_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<RecognizerStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of recognition loop counters.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Snapshot of capture counters; `None` before `start()` or after
    /// `shutdown()`.
    pub fn capture_diagnostics_snapshot(&self) -> Option<CaptureSnapshot> {
        self.runtime
            .lock()
            .capture
            .as_ref()
            .map(AudioCapture::diagnostics)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: RecognizerStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(RecognizerStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for Recognizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ChannelMask, SampleWidth};
    use crate::features::mel::MelSpectrumTransform;
    use crate::inference::stub::StubModel;

    struct DeadMic;

    impl Microphone for DeadMic {
        fn configure(&mut self, _: u32, _: SampleWidth, _: ChannelMask) -> Result<()> {
            Err(KwsError::AudioDevice("bus not present".into()))
        }

        fn read(&mut self, _: &mut [u8], _: Duration) -> Result<usize> {
            Ok(0)
        }

        fn zero_dma_buffers(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn recognizer(config: RecognizerConfig) -> Result<Recognizer> {
        Recognizer::new(
            config,
            || Ok(DeadMic),
            Box::new(MelSpectrumTransform::new()),
            Box::new(StubModel::default()),
        )
    }

    #[test]
    fn default_config_is_valid() {
        RecognizerConfig::default().validate().unwrap();
    }

    #[test]
    fn mismatched_rate_and_labels_are_rejected() {
        let mut config = RecognizerConfig::default();
        config.capture.sample_rate = 48_000;
        assert!(matches!(recognizer(config), Err(KwsError::InvalidConfig(_))));

        let config = RecognizerConfig {
            labels: vec!["yes".into(), "no".into()],
            ..RecognizerConfig::default()
        };
        assert!(matches!(recognizer(config), Err(KwsError::InvalidConfig(_))));

        let config = RecognizerConfig {
            ring_capacity: 100,
            ..RecognizerConfig::default()
        };
        assert!(matches!(recognizer(config), Err(KwsError::InvalidConfig(_))));
    }

    #[test]
    fn odd_ring_capacity_is_rejected() {
        let config = RecognizerConfig {
            ring_capacity: RING_CAPACITY_BYTES + 1,
            ..RecognizerConfig::default()
        };
        assert!(matches!(config.validate(), Err(KwsError::InvalidConfig(_))));
    }

    #[test]
    fn device_failure_surfaces_from_start_and_stays_retryable() {
        let rec = recognizer(RecognizerConfig::default()).unwrap();
        let mut status = rec.subscribe_status();

        assert!(matches!(rec.start(), Err(KwsError::AudioDevice(_))));
        assert_eq!(rec.status(), RecognizerStatus::Error);
        let event = status.try_recv().unwrap();
        assert_eq!(event.status, RecognizerStatus::Error);
        assert!(event.detail.unwrap().contains("bus not present"));

        // Components were not consumed; a retry hits the device again.
        assert!(matches!(rec.start(), Err(KwsError::AudioDevice(_))));
    }

    #[test]
    fn lifecycle_calls_before_start_and_after_shutdown() {
        let rec = recognizer(RecognizerConfig::default()).unwrap();
        assert_eq!(rec.status(), RecognizerStatus::Idle);
        assert!(matches!(rec.suspend(), Err(KwsError::NotRunning)));
        assert!(matches!(rec.resume(), Err(KwsError::NotRunning)));
        assert!(matches!(rec.reset(), Err(KwsError::NotRunning)));
        assert_eq!(rec.audio_time_ms(), 0);
        assert!(rec.capture_diagnostics_snapshot().is_none());

        rec.shutdown();
        rec.shutdown();
        assert_eq!(rec.status(), RecognizerStatus::Stopped);
        assert!(matches!(rec.start(), Err(KwsError::ShutDown)));
        assert!(matches!(rec.suspend(), Err(KwsError::ShutDown)));
        assert!(matches!(rec.reset(), Err(KwsError::ShutDown)));
    }
}
