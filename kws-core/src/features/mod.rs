//! Rolling spectrogram window.
//!
//! ## Slice bookkeeping
//!
//! Wall-clock time is quantized into stride-sized steps. Between two calls
//! only `current_step − last_step` slices are stale; the rest are shifted
//! towards index 0 and reused:
//!
//! ```text
//! last time = 80ms          current time = 120ms
//! +-----------+             +-----------+
//! | data@20ms |         --> | data@60ms |
//! +-----------+       --    +-----------+
//! | data@40ms |     --  --> | data@80ms |
//! +-----------+   --  --    +-----------+
//! | data@60ms | --  --      | data@100ms|  (recomputed)
//! +-----------+   --        +-----------+
//! | data@80ms | --          | data@120ms|  (recomputed)
//! +-----------+             +-----------+
//! ```
//!
//! Each recomputed slice needs a full window, but only one stride of it is
//! new audio; the overlap comes from the history carried in
//! `FeatureWindowState`.

pub mod mel;
pub mod source;

pub use mel::MelSpectrumTransform;
pub use source::RingAudioSource;

use tracing::{debug, warn};

use crate::error::{KwsError, Result};
use crate::settings::{
    COEFFS_PER_SLICE, FEATURE_ELEMENT_COUNT, HISTORY_SAMPLES, SLICE_COUNT, STRIDE_MS,
    STRIDE_SAMPLES, WINDOW_SAMPLES,
};

/// One quantized spectrum row.
pub type FeatureSlice = [i8; COEFFS_PER_SLICE];

/// `SLICE_COUNT` time-ordered rows, oldest first.
pub type FeatureMatrix = [FeatureSlice; SLICE_COUNT];

/// Converts one window of 16-bit audio into one feature row.
///
/// Must be a deterministic function of `window`. `&mut self` only exists so
/// implementations can reuse scratch buffers.
pub trait SpectrumTransform: Send + 'static {
    fn transform(&mut self, window: &[i16; WINDOW_SAMPLES], out: &mut FeatureSlice) -> Result<()>;
}

/// Supplier of fresh audio for the slice being computed.
pub trait AudioSource: Send {
    /// Fill `out` with the next samples of the slice starting at
    /// `slice_start_ms`. Returns how many samples were delivered; fewer than
    /// `out.len()` means the source ran dry before its deadline.
    fn pull(&mut self, slice_start_ms: u64, out: &mut [i16]) -> usize;

    /// Drop any audio queued but not yet pulled. Returns samples discarded.
    fn discard_buffered(&mut self) -> usize {
        0
    }
}

/// Feature matrix, window-overlap history and resync flags.
#[derive(Debug, Clone)]
pub struct FeatureWindowState {
    pub feature_matrix: FeatureMatrix,
    pub history: [i16; HISTORY_SAMPLES],
    pub is_first_run: bool,
    pub force_resync: bool,
}

impl Default for FeatureWindowState {
    fn default() -> Self {
        Self {
            feature_matrix: [[0; COEFFS_PER_SLICE]; SLICE_COUNT],
            history: [0; HISTORY_SAMPLES],
            is_first_run: true,
            force_resync: false,
        }
    }
}

impl FeatureWindowState {
    /// Copy the matrix row-major into `out`.
    ///
    /// # Errors
    /// `KwsError::FeatureSizeMismatch` unless `out` holds exactly
    /// `FEATURE_ELEMENT_COUNT` values. Nothing is written in that case.
    pub fn flatten_into(&self, out: &mut [i8]) -> Result<()> {
        if out.len() != FEATURE_ELEMENT_COUNT {
            return Err(KwsError::FeatureSizeMismatch {
                got: out.len(),
                want: FEATURE_ELEMENT_COUNT,
            });
        }
        for (dst, row) in out
            .chunks_exact_mut(COEFFS_PER_SLICE)
            .zip(self.feature_matrix.iter())
        {
            dst.copy_from_slice(row);
        }
        Ok(())
    }
}

/// How many slices a call covering `last_time_ms → now_ms` has to recompute,
/// before the first-run / resync override.
pub fn slices_needed(last_time_ms: u64, now_ms: u64) -> usize {
    let last_step = (last_time_ms / STRIDE_MS as u64) as i64;
    let current_step = (now_ms / STRIDE_MS as u64) as i64;
    (current_step - last_step).clamp(0, SLICE_COUNT as i64) as usize
}

/// Owns the window state and the transform; turns elapsed audio time into
/// recomputed rows.
pub struct FeatureProvider {
    state: FeatureWindowState,
    transform: Box<dyn SpectrumTransform>,
    /// Rows computed in the current call, committed only on success.
    staged: FeatureMatrix,
    /// History splice + fresh samples for the slice being computed.
    window: [i16; WINDOW_SAMPLES],
}

impl FeatureProvider {
    pub fn new(transform: Box<dyn SpectrumTransform>) -> Self {
        Self {
            state: FeatureWindowState::default(),
            transform,
            staged: [[0; COEFFS_PER_SLICE]; SLICE_COUNT],
            window: [0; WINDOW_SAMPLES],
        }
    }

    /// Read-only view of the window state.
    pub fn state(&self) -> &FeatureWindowState {
        &self.state
    }

    /// Current feature matrix.
    pub fn features(&self) -> &FeatureMatrix {
        &self.state.feature_matrix
    }

    /// Make the next `populate` recompute every slice.
    pub fn request_resync(&mut self) {
        self.state.force_resync = true;
    }

    /// Bring the matrix up to `now_ms` and report how many rows changed.
    ///
    /// `0` means nothing was recomputed and the matrix is untouched; callers
    /// should skip inference.
    ///
    /// # Errors
    /// - `KwsError::AudioSizeMismatch` when `source` cannot supply a full
    ///   window for some slice.
    /// - Whatever the transform returns.
    ///
    /// On error the matrix and history are left exactly as they were and a
    /// resync is scheduled, since the audio already pulled is gone.
    pub fn populate<S>(&mut self, source: &mut S, last_time_ms: u64, now_ms: u64) -> Result<usize>
    where
        S: AudioSource + ?Sized,
    {
        let stride = STRIDE_MS as i64;
        let current_step = (now_ms / STRIDE_MS as u64) as i64;

        let mut needed = slices_needed(last_time_ms, now_ms);
        let mut rebuild = false;
        if self.state.is_first_run {
            debug!("first run: computing every slice");
            self.state.is_first_run = false;
            rebuild = true;
        }
        if self.state.force_resync {
            debug!("resync requested: computing every slice");
            self.state.force_resync = false;
            rebuild = true;
        }
        if rebuild {
            needed = SLICE_COUNT;
        }

        if needed == 0 {
            return Ok(0);
        }

        let keep = SLICE_COUNT - needed;

        // A rebuild starts from silence: the old overlap predates the reset.
        let mut history = if rebuild {
            [0; HISTORY_SAMPLES]
        } else {
            self.state.history
        };
        for (staged_idx, row) in (keep..SLICE_COUNT).enumerate() {
            let step = current_step - SLICE_COUNT as i64 + 1 + row as i64;
            let slice_start_ms = (step * stride).max(0) as u64;

            self.window[..HISTORY_SAMPLES].copy_from_slice(&history);
            let fresh = source.pull(slice_start_ms, &mut self.window[HISTORY_SAMPLES..]);
            if fresh < STRIDE_SAMPLES {
                self.state.force_resync = true;
                warn!(
                    slice_start_ms,
                    fresh,
                    wanted = STRIDE_SAMPLES,
                    "audio source ran dry mid-update"
                );
                return Err(KwsError::AudioSizeMismatch {
                    got: HISTORY_SAMPLES + fresh,
                    want: WINDOW_SAMPLES,
                });
            }

            if let Err(e) = self
                .transform
                .transform(&self.window, &mut self.staged[staged_idx])
            {
                self.state.force_resync = true;
                return Err(e);
            }

            history.copy_from_slice(&self.window[WINDOW_SAMPLES - HISTORY_SAMPLES..]);
        }

        // Commit: shift the retained rows down, then append the new ones.
        let matrix = &mut self.state.feature_matrix;
        matrix.copy_within(needed.., 0);
        matrix[keep..].copy_from_slice(&self.staged[..needed]);
        self.state.history = history;

        Ok(needed)
    }
}
