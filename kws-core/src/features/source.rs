//! `AudioSource` reading 16-bit little-endian samples out of the capture ring.

use std::time::Duration;

use tracing::{debug, warn};

use super::AudioSource;
use crate::buffering::RingConsumer;
use crate::settings::STRIDE_SAMPLES;

/// How long a pull may block waiting for capture to catch up.
pub const DEFAULT_AUDIO_TIMEOUT: Duration = Duration::from_millis(200);

pub struct RingAudioSource {
    ring: RingConsumer,
    timeout: Duration,
    bytes: Vec<u8>,
    /// Low byte of a sample whose high byte has not been read yet.
    pending: Option<u8>,
}

impl RingAudioSource {
    pub fn new(ring: RingConsumer, timeout: Duration) -> Self {
        Self {
            ring,
            timeout,
            bytes: vec![0; STRIDE_SAMPLES * 2],
            pending: None,
        }
    }

    /// Samples currently queued.
    pub fn buffered_samples(&self) -> usize {
        (self.ring.filled() + self.pending.is_some() as usize) / 2
    }
}

impl AudioSource for RingAudioSource {
    fn pull(&mut self, slice_start_ms: u64, out: &mut [i16]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let want = out.len() * 2;
        if self.bytes.len() < want {
            self.bytes.resize(want, 0);
        }

        let carried = match self.pending.take() {
            Some(low) => {
                self.bytes[0] = low;
                1
            }
            None => 0,
        };
        let got = carried + self.ring.read(&mut self.bytes[carried..want], self.timeout);

        // An odd count leaves half a sample; keep it for the next pull so
        // later samples stay aligned.
        let samples = got / 2;
        if got % 2 == 1 {
            self.pending = Some(self.bytes[got - 1]);
        }
        if got != want {
            warn!(
                slice_start_ms,
                got_bytes = got,
                want_bytes = want,
                "short audio read from ring"
            );
        }

        for (dst, pair) in out.iter_mut().zip(self.bytes[..samples * 2].chunks_exact(2)) {
            *dst = i16::from_le_bytes([pair[0], pair[1]]);
        }
        samples
    }

    fn discard_buffered(&mut self) -> usize {
        let queued = self.ring.filled();
        let carried = self.pending.is_some() as usize;
        let total = carried + queued;

        if total % 2 == 1 && queued > 0 {
            // The last queued byte opens a sample that is still being
            // written; keep it as the new carry.
            self.ring.skip(queued - 1);
            let mut low = [0u8; 1];
            self.pending = match self.ring.read(&mut low, Duration::ZERO) {
                1 => Some(low[0]),
                _ => None,
            };
        } else if queued > 0 {
            self.ring.skip(queued);
            self.pending = None;
        }

        let dropped = total / 2;
        if dropped > 0 {
            debug!(samples = dropped, "discarded stale audio");
        }
        dropped
    }
}
