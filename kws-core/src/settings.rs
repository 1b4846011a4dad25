//! Build-time geometry shared by the capture, feature and inference stages.
//!
//! These values are fixed by how the model was trained. Changing any of them
//! means retraining the model and re-exporting it.
//!
//! ```text
//!   window (30 ms = 480 samples)
//! |<------------------------------->|
//! | history (160) | fresh (320)     |
//!                 |<-- stride ----->|
//! ```

/// Capture and feature sample rate (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Time between the starts of consecutive slices.
pub const STRIDE_MS: u32 = 20;

/// Audio span each slice is computed from.
pub const WINDOW_DURATION_MS: u32 = 30;

/// Number of slices (rows) in the feature matrix.
pub const SLICE_COUNT: usize = 49;

/// Coefficients per slice (columns of the feature matrix).
pub const COEFFS_PER_SLICE: usize = 40;

/// Flattened feature matrix length, which is also the model input length.
pub const FEATURE_ELEMENT_COUNT: usize = SLICE_COUNT * COEFFS_PER_SLICE;

const SAMPLES_PER_MS: usize = (SAMPLE_RATE / 1000) as usize;

/// Samples in one analysis window.
pub const WINDOW_SAMPLES: usize = WINDOW_DURATION_MS as usize * SAMPLES_PER_MS;

/// Samples that are new in each window (one stride).
pub const STRIDE_SAMPLES: usize = STRIDE_MS as usize * SAMPLES_PER_MS;

/// Overlap carried from one window to the next.
pub const HISTORY_SAMPLES: usize =
    (WINDOW_DURATION_MS - STRIDE_MS) as usize * SAMPLES_PER_MS;

/// Number of output categories the model scores.
pub const CATEGORY_COUNT: usize = 4;

/// Category labels in model output order.
pub const CATEGORY_LABELS: [&str; CATEGORY_COUNT] = ["go", "stop", "silence", "unknown"];

/// Default ring buffer capacity in bytes (1.25 s of 16-bit audio).
pub const RING_CAPACITY_BYTES: usize = 40_000;

/// Default raw read size per hardware transaction, in bytes.
/// 3200 bytes of 32-bit samples = 800 samples = 50 ms at 16 kHz.
pub const CAPTURE_CHUNK_BYTES: usize = 3_200;

// Geometry sanity, checked at compile time.
const _: () = assert!(HISTORY_SAMPLES + STRIDE_SAMPLES == WINDOW_SAMPLES);
const _: () = assert!(WINDOW_DURATION_MS >= STRIDE_MS);
const _: () = assert!(SLICE_COUNT > 0 && COEFFS_PER_SLICE > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sample_counts_match_geometry() {
        assert_eq!(WINDOW_SAMPLES, 480);
        assert_eq!(STRIDE_SAMPLES, 320);
        assert_eq!(HISTORY_SAMPLES, 160);
        assert_eq!(FEATURE_ELEMENT_COUNT, 1960);
    }
}
