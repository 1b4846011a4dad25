//! Audio capture producer.
//!
//! # Design constraints
//!
//! Capture runs on its own OS thread for the whole session. Each iteration
//! performs exactly one bounded hardware read, rescales the native-width
//! words down to 16-bit PCM in a scratch buffer allocated at thread start,
//! pushes the result into the SPSC ring and advances the audio clock by the
//! samples the ring actually accepted. Nothing else crosses the thread
//! boundary.
//!
//! # Threading note
//!
//! Hardware handles are frequently bound to the thread that opened them
//! (`cpal::Stream` is `!Send` on Windows/macOS). `AudioCapture::start`
//! therefore takes a factory and opens the microphone *inside* the capture
//! thread; a sync oneshot reports open success or failure back to the caller.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──start──► Running ⇄ Paused
//!                              │        │
//!                              └─stop──►└──► Stopped
//! ```
//!
//! Entering `Paused` or `Stopped` from `Running` issues one bounded dummy read
//! so the bus is left idle rather than mid-transaction.

#[cfg(feature = "audio-cpal")]
pub mod cpal_mic;

#[cfg(feature = "audio-cpal")]
pub use cpal_mic::CpalMicrophone;

use std::sync::{
    atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffering::RingProducer,
    error::{KwsError, Result},
    settings::{CAPTURE_CHUNK_BYTES, SAMPLE_RATE},
};

/// Native sample word width delivered by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    Bits16,
    Bits32,
}

impl SampleWidth {
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Bits16 => 2,
            SampleWidth::Bits32 => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// Which channel of the bus carries the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMask {
    Left,
    Right,
}

/// What the producer does with audio the ring cannot accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the part of the current frame that does not fit; queued audio
    /// is kept and the capture thread never blocks past the write timeout.
    #[default]
    DropNewest,
}

/// Hardware audio source.
///
/// Implementations are created and used on the capture thread only, so they
/// need not be `Send`.
pub trait Microphone {
    /// Configure rate, word width and channel. Called once before the first read.
    ///
    /// # Errors
    /// Driver install/configure failures, surfaced to `AudioCapture::start`.
    fn configure(
        &mut self,
        sample_rate: u32,
        width: SampleWidth,
        channel: ChannelMask,
    ) -> Result<()>;

    /// Blocking read of up to `buf.len()` raw bytes (little-endian native
    /// words), returning early when `timeout` elapses.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Clear any audio the driver has already buffered.
    fn zero_dma_buffers(&mut self) -> Result<()>;
}

impl<M: Microphone + ?Sized> Microphone for Box<M> {
    fn configure(
        &mut self,
        sample_rate: u32,
        width: SampleWidth,
        channel: ChannelMask,
    ) -> Result<()> {
        (**self).configure(sample_rate, width, channel)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn zero_dma_buffers(&mut self) -> Result<()> {
        (**self).zero_dma_buffers()
    }
}

/// Capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Bus sample rate (Hz). Must match the feature geometry.
    pub sample_rate: u32,
    /// Native word width of the raw frames.
    pub sample_width: SampleWidth,
    /// Channel the microphone is wired to.
    pub channel: ChannelMask,
    /// Raw bytes requested per hardware read.
    pub frame_bytes: usize,
    /// Arithmetic right shift applied to each native word before narrowing
    /// to 16 bits. Sensor- and gain-specific.
    pub right_shift: u32,
    /// Upper bound on each hardware read.
    pub read_timeout: Duration,
    /// Upper bound on each ring write.
    pub write_timeout: Duration,
    /// Upper bound on the dummy read issued when pausing or stopping.
    pub drain_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            sample_width: SampleWidth::Bits32,
            channel: ChannelMask::Left,
            frame_bytes: CAPTURE_CHUNK_BYTES,
            // Lossless for 16-bit audio left-justified in a 32-bit word.
            right_shift: 16,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(100),
            overflow_policy: OverflowPolicy::DropNewest,
        }
    }
}

impl CaptureConfig {
    /// Reject geometry the capture loop cannot process.
    pub fn validate(&self) -> Result<()> {
        let word = self.sample_width.bytes();
        if self.frame_bytes == 0 || self.frame_bytes % word != 0 {
            return Err(KwsError::InvalidConfig(format!(
                "frame_bytes {} must be a non-zero multiple of {} bytes",
                self.frame_bytes, word
            )));
        }
        if self.right_shift >= self.sample_width.bits() {
            return Err(KwsError::InvalidConfig(format!(
                "right_shift {} must be below the {}-bit word width",
                self.right_shift,
                self.sample_width.bits()
            )));
        }
        if self.sample_rate == 0 {
            return Err(KwsError::InvalidConfig("sample_rate must be non-zero".into()));
        }
        Ok(())
    }

    /// 16-bit bytes produced from one full raw frame.
    pub fn pcm_frame_bytes(&self) -> usize {
        self.frame_bytes / self.sample_width.bytes() * 2
    }
}

/// Milliseconds of audio deposited into the ring so far.
///
/// Written only by the capture thread; read lock-free by the recognizer.
/// A single atomic word, so readers see either the old or the new value.
#[derive(Debug, Clone, Default)]
pub struct AudioClock(Arc<AtomicU64>);

impl AudioClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance by `samples` worth of audio at `sample_rate`.
    pub fn advance(&self, samples: usize, sample_rate: u32) -> u64 {
        let delta = samples as u64 * 1000 / sample_rate as u64;
        self.0.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Explicit external reset back to zero.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Observable capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Uninitialized = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl CaptureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::Running,
            2 => CaptureState::Paused,
            3 => CaptureState::Stopped,
            _ => CaptureState::Uninitialized,
        }
    }
}

/// Shared control block between `AudioCapture` and its thread.
struct CaptureControl {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CaptureControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Uninitialized as u8),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: CaptureState) {
        let _guard = self.lock.lock();
        self.state.store(state as u8, Ordering::Release);
        self.cond.notify_all();
    }

    /// Move `from` → `to` only when currently in `from`.
    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        let _guard = self.lock.lock();
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.cond.notify_all();
        }
        ok
    }

    /// Park the calling thread until the state leaves `Paused`.
    fn wait_while_paused(&self) -> CaptureState {
        let mut guard = self.lock.lock();
        while self.state() == CaptureState::Paused {
            self.cond.wait(&mut guard);
        }
        self.state()
    }
}

/// Producer-side counters.
#[derive(Debug, Default)]
pub struct CaptureDiagnostics {
    pub frames_read: AtomicUsize,
    pub empty_reads: AtomicUsize,
    pub partial_reads: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub bytes_dropped: AtomicUsize,
    pub samples_produced: AtomicUsize,
    pub drain_reads: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub frames_read: usize,
    pub empty_reads: usize,
    pub partial_reads: usize,
    pub read_errors: usize,
    pub bytes_dropped: usize,
    pub samples_produced: usize,
    pub drain_reads: usize,
}

impl CaptureDiagnostics {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            partial_reads: self.partial_reads.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            samples_produced: self.samples_produced.load(Ordering::Relaxed),
            drain_reads: self.drain_reads.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running capture thread.
pub struct AudioCapture {
    control: Arc<CaptureControl>,
    clock: AudioClock,
    diagnostics: Arc<CaptureDiagnostics>,
    handle: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Spawn the capture thread, open the microphone on it via `open`, and
    /// block until the device is configured (or fails).
    ///
    /// # Errors
    /// - `KwsError::InvalidConfig` for unusable capture geometry.
    /// - Whatever `open`, `Microphone::configure` or
    ///   `Microphone::zero_dma_buffers` return.
    /// - `KwsError::ThreadSpawn` if the OS refuses a new thread.
    pub fn start<M, F>(
        config: CaptureConfig,
        producer: RingProducer,
        clock: AudioClock,
        open: F,
    ) -> Result<Self>
    where
        M: Microphone + 'static,
        F: FnOnce() -> Result<M> + Send + 'static,
    {
        config.validate()?;

        let control = Arc::new(CaptureControl::new());
        let diagnostics = Arc::new(CaptureDiagnostics::default());
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let thread_control = Arc::clone(&control);
        let thread_clock = clock.clone();
        let thread_diagnostics = Arc::clone(&diagnostics);

        let handle = std::thread::Builder::new()
            .name("kws-capture".into())
            .spawn(move || {
                let span = info_span!("capture", rate = config.sample_rate);
                let _enter = span.enter();

                // ── Open + configure the device (must happen on THIS thread) ──
                let mut mic = match open_microphone(open, &config) {
                    Ok(m) => m,
                    Err(e) => {
                        thread_control.set(CaptureState::Stopped);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                thread_control.set(CaptureState::Running);
                let _ = open_tx.send(Ok(()));

                run_capture(
                    &mut mic,
                    CaptureContext {
                        config,
                        producer,
                        clock: thread_clock,
                        control: thread_control,
                        diagnostics: thread_diagnostics,
                    },
                );
                // Microphone drops here, releasing the device on this thread.
            })
            .map_err(|source| KwsError::ThreadSpawn {
                name: "capture",
                source,
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!("audio capture running");
                Ok(Self {
                    control,
                    clock,
                    diagnostics,
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(KwsError::Other(anyhow::anyhow!(
                    "capture thread died before reporting device status"
                )))
            }
        }
    }

    pub fn state(&self) -> CaptureState {
        self.control.state()
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    pub fn diagnostics(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }

    /// Stop producing after the current read; the thread drains the bus and
    /// idles. No-op unless running.
    pub fn pause(&self) -> bool {
        let changed = self
            .control
            .transition(CaptureState::Running, CaptureState::Paused);
        if changed {
            info!("audio capture pause requested");
        }
        changed
    }

    /// Resume production. No-op unless paused.
    pub fn resume(&self) -> bool {
        let changed = self
            .control
            .transition(CaptureState::Paused, CaptureState::Running);
        if changed {
            info!("audio capture resume requested");
        }
        changed
    }

    /// Stop the thread and wait for it to drain and exit. Idempotent.
    pub fn stop(&mut self) {
        if self.control.state() != CaptureState::Stopped {
            self.control.set(CaptureState::Stopped);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
            info!("audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_microphone<M, F>(open: F, config: &CaptureConfig) -> Result<M>
where
    M: Microphone,
    F: FnOnce() -> Result<M>,
{
    let mut mic = open()?;
    mic.configure(config.sample_rate, config.sample_width, config.channel)?;
    mic.zero_dma_buffers()?;
    Ok(mic)
}

/// Everything the capture loop owns, passed as one struct.
struct CaptureContext {
    config: CaptureConfig,
    producer: RingProducer,
    clock: AudioClock,
    control: Arc<CaptureControl>,
    diagnostics: Arc<CaptureDiagnostics>,
}

fn run_capture<M: Microphone>(mic: &mut M, mut ctx: CaptureContext) {
    info!(
        frame_bytes = ctx.config.frame_bytes,
        shift = ctx.config.right_shift,
        "capture loop started"
    );

    // Scratch buffers: allocated once, reused every frame.
    let mut raw = vec![0u8; ctx.config.frame_bytes];
    let mut pcm = vec![0u8; ctx.config.pcm_frame_bytes()];
    let mut drained = false;

    loop {
        match ctx.control.state() {
            CaptureState::Stopped => break,
            CaptureState::Paused => {
                if !drained {
                    drain_bus(mic, &mut raw, &ctx);
                    drained = true;
                }
                if ctx.control.wait_while_paused() == CaptureState::Running {
                    if let Err(e) = mic.zero_dma_buffers() {
                        warn!("failed to clear driver buffers on resume: {e}");
                    }
                    drained = false;
                    info!("capture resumed");
                }
                continue;
            }
            CaptureState::Running | CaptureState::Uninitialized => {}
        }

        // ── 1. One bounded hardware read ──────────────────────────────────
        let bytes_read = match mic.read(&mut raw, ctx.config.read_timeout) {
            Ok(n) => n.min(raw.len()),
            Err(e) => {
                ctx.diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
                error!("microphone read failed: {e}");
                0
            }
        };

        if bytes_read == 0 {
            ctx.diagnostics.empty_reads.fetch_add(1, Ordering::Relaxed);
            warn!("no audio data read from microphone");
            continue;
        }
        ctx.diagnostics.frames_read.fetch_add(1, Ordering::Relaxed);
        if bytes_read < raw.len() {
            ctx.diagnostics.partial_reads.fetch_add(1, Ordering::Relaxed);
            warn!(bytes_read, wanted = raw.len(), "partial microphone read");
        }

        // ── 2. Rescale native words to i16 ────────────────────────────────
        let samples = rescale_frame(
            &raw[..bytes_read],
            ctx.config.sample_width,
            ctx.config.right_shift,
            &mut pcm,
        );
        let pcm_bytes = samples * 2;

        // ── 3. Push into the ring ─────────────────────────────────────────
        let written = ctx
            .producer
            .write(&pcm[..pcm_bytes], ctx.config.write_timeout);
        if written < pcm_bytes {
            apply_overflow_policy(&ctx, written, pcm_bytes);
        }

        // ── 4. Advance the audio clock by what the ring accepted ──────────
        let samples_written = written / 2;
        if samples_written > 0 {
            ctx.diagnostics
                .samples_produced
                .fetch_add(samples_written, Ordering::Relaxed);
            let now = ctx.clock.advance(samples_written, ctx.config.sample_rate);
            debug!(samples_written, clock_ms = now, "audio deposited");
        }
    }

    if !drained {
        drain_bus(mic, &mut raw, &ctx);
    }
    info!("capture loop exited");
}

fn apply_overflow_policy(ctx: &CaptureContext, written: usize, wanted: usize) {
    match ctx.config.overflow_policy {
        OverflowPolicy::DropNewest => {
            let dropped = wanted - written;
            ctx.diagnostics
                .bytes_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            if written == 0 {
                error!(dropped, "ring buffer full: could not write any audio");
            } else {
                warn!(written, wanted, dropped, "ring buffer full: dropped newest audio");
            }
        }
    }
}

/// One bounded dummy read so the bus is not left mid-transaction.
fn drain_bus<M: Microphone>(mic: &mut M, raw: &mut [u8], ctx: &CaptureContext) {
    let word = ctx.config.sample_width.bytes();
    ctx.diagnostics.drain_reads.fetch_add(1, Ordering::Relaxed);
    match mic.read(&mut raw[..word], ctx.config.drain_timeout) {
        Ok(n) => debug!(bytes = n, "drained microphone bus"),
        Err(e) => warn!("drain read failed: {e}"),
    }
}

/// Narrow little-endian native words in `raw` to little-endian `i16` bytes
/// in `out`, applying an arithmetic right shift and saturating.
///
/// Trailing bytes that do not form a whole word are ignored. Returns the
/// number of samples written to `out`.
pub fn rescale_frame(raw: &[u8], width: SampleWidth, shift: u32, out: &mut [u8]) -> usize {
    let word = width.bytes();
    let samples = (raw.len() / word).min(out.len() / 2);

    for (i, chunk) in raw.chunks_exact(word).take(samples).enumerate() {
        let wide = match width {
            SampleWidth::Bits32 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            SampleWidth::Bits16 => i16::from_le_bytes([chunk[0], chunk[1]]) as i32,
        };
        let narrow = (wide >> shift).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out[i * 2..i * 2 + 2].copy_from_slice(&narrow.to_le_bytes());
    }
    samples
}
