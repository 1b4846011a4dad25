//! `Microphone` backed by a cpal input stream.
//!
//! The cpal callback runs on an OS audio thread at elevated priority, so it
//! only converts samples and pushes them into a lock-free `ringbuf` queue of
//! left-justified 32-bit words. `read` drains that queue on the capture
//! thread with a timeout, which gives the same blocking-read contract a bus
//! driver offers.
//!
//! `cpal::Stream` is `!Send`; construct this type inside the capture thread
//! (the factory passed to `AudioCapture::start`).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{error, info, warn};

use super::{ChannelMask, Microphone, SampleWidth};
use crate::error::{KwsError, Result};

/// Queue between the cpal callback and `read`: one second of words.
const QUEUE_SECONDS: usize = 1;

/// Poll interval while `read` waits for the callback.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct CpalMicrophone {
    preferred_device: Option<String>,
    width: SampleWidth,
    /// Kept alive so the stream is not dropped prematurely.
    _stream: Option<Stream>,
    words: Option<HeapCons<i32>>,
    /// Set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
}

impl CpalMicrophone {
    /// Create an unopened microphone. The device is resolved in `configure`:
    /// `preferred_device` by exact name, then the host default input, then
    /// the first available input.
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device,
            width: SampleWidth::Bits32,
            _stream: None,
            words: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn select_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(preferred) = self.preferred_device.as_deref() {
            match host.input_devices() {
                Ok(mut devices) => {
                    let found = devices
                        .find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if let Some(device) = found {
                        return Ok(device);
                    }
                    warn!(preferred, "preferred input device not found, falling back");
                }
                Err(e) => warn!("failed to list input devices: {e}"),
            }
        }

        if let Some(device) = host.default_input_device() {
            return Ok(device);
        }

        let mut devices = host
            .input_devices()
            .map_err(|e| KwsError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(KwsError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to first available input");
        Ok(fallback)
    }
}

impl Microphone for CpalMicrophone {
    fn configure(
        &mut self,
        sample_rate: u32,
        width: SampleWidth,
        channel: ChannelMask,
    ) -> Result<()> {
        let device = self.select_device()?;
        let name = device.name().unwrap_or_default();

        let supported = device
            .supported_input_configs()
            .map_err(|e| KwsError::AudioDevice(e.to_string()))?
            .filter(|range| {
                range.min_sample_rate().0 <= sample_rate
                    && range.max_sample_rate().0 >= sample_rate
            })
            .min_by_key(|range| format_rank(range.sample_format()))
            .ok_or_else(|| {
                KwsError::UnsupportedCapture(format!("'{name}' cannot capture at {sample_rate} Hz"))
            })?
            .with_sample_rate(SampleRate(sample_rate));

        let channels = supported.channels() as usize;
        let channel_index = match channel {
            ChannelMask::Left => 0,
            ChannelMask::Right => 1,
        };
        if channel_index >= channels {
            return Err(KwsError::UnsupportedCapture(format!(
                "'{name}' has {channels} channel(s), {channel:?} requested"
            )));
        }

        info!(
            device = name.as_str(),
            sample_rate,
            channels,
            format = ?supported.sample_format(),
            "opening input device"
        );

        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) =
            HeapRb::<i32>::new(sample_rate as usize * QUEUE_SECONDS).split();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_stream::<f32, _>(&device, &config, channel_index, producer, running, |s| {
                    (s.clamp(-1.0, 1.0) * i32::MAX as f32) as i32
                })
            }
            SampleFormat::I32 => {
                build_stream::<i32, _>(&device, &config, channel_index, producer, running, |s| s)
            }
            SampleFormat::I16 => {
                build_stream::<i16, _>(&device, &config, channel_index, producer, running, |s| {
                    (s as i32) << 16
                })
            }
            SampleFormat::U8 => {
                build_stream::<u8, _>(&device, &config, channel_index, producer, running, |s| {
                    (s as i32 - 128) << 24
                })
            }
            fmt => {
                return Err(KwsError::UnsupportedCapture(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| KwsError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| KwsError::AudioStream(e.to_string()))?;

        self.width = width;
        self._stream = Some(stream);
        self.words = Some(consumer);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let words = self
            .words
            .as_mut()
            .ok_or_else(|| KwsError::AudioStream("microphone not configured".into()))?;

        let word_bytes = self.width.bytes();
        let wanted = buf.len() / word_bytes;
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < wanted {
            match words.try_pop() {
                Some(word) => {
                    let at = filled * word_bytes;
                    match self.width {
                        SampleWidth::Bits32 => {
                            buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
                        }
                        SampleWidth::Bits16 => {
                            let narrow = (word >> 16) as i16;
                            buf[at..at + 2].copy_from_slice(&narrow.to_le_bytes());
                        }
                    }
                    filled += 1;
                }
                None => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }

        Ok(filled * word_bytes)
    }

    fn zero_dma_buffers(&mut self) -> Result<()> {
        if let Some(words) = self.words.as_mut() {
            let queued = words.occupied_len();
            words.skip(queued);
        }
        Ok(())
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Lower is preferred when a device offers several formats at the rate.
fn format_rank(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::I32 => 0,
        SampleFormat::F32 => 1,
        SampleFormat::I16 => 2,
        SampleFormat::U8 => 3,
        _ => u8::MAX,
    }
}

fn build_stream<T, C>(
    device: &cpal::Device,
    config: &StreamConfig,
    channel_index: usize,
    mut producer: HeapProd<i32>,
    running: Arc<AtomicBool>,
    convert: C,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    C: Fn(T) -> i32 + Send + 'static,
{
    let channels = config.channels as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let frames = data.len() / channels;
            let pushed = producer.push_iter(
                data.chunks_exact(channels)
                    .map(|frame| convert(frame[channel_index])),
            );
            if pushed < frames {
                warn!("microphone queue full: dropped {} frames", frames - pushed);
            }
        },
        |err| error!("audio stream error: {err}"),
        None,
    )
}
