//! Log-mel spectrum of one analysis window, quantized to `i8`.
//!
//! Pipeline per window: scale to [-1, 1], periodic Hann taper, zero-pad to
//! `FFT_SIZE`, power spectrum, Slaney-normalized triangular mel filters,
//! `log10`, then an affine map of `[LOG_FLOOR, LOG_CEIL]` onto `-128..=127`.
//!
//! All buffers are sized in `new`; `transform` does not allocate.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::{FeatureSlice, SpectrumTransform};
use crate::error::{KwsError, Result};
use crate::settings::{COEFFS_PER_SLICE, SAMPLE_RATE, WINDOW_SAMPLES};

/// Next power of two above the window length.
pub const FFT_SIZE: usize = 512;

const MEL_FMIN_HZ: f32 = 0.0;
const MEL_FMAX_HZ: f32 = SAMPLE_RATE as f32 / 2.0;

/// log10 energy mapped to -128.
pub const LOG_FLOOR: f32 = -8.0;
/// log10 energy mapped to 127.
pub const LOG_CEIL: f32 = 4.0;

const ENERGY_EPSILON: f32 = 1e-10;

pub struct MelSpectrumTransform {
    fft: Arc<dyn Fft<f32>>,
    hann_window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    power: Vec<f32>,
}

impl MelSpectrumTransform {
    pub fn new() -> Self {
        let fft: Arc<dyn Fft<f32>> = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            hann_window: build_hann_window(WINDOW_SAMPLES),
            mel_filters: build_mel_filters(
                FFT_SIZE,
                SAMPLE_RATE,
                COEFFS_PER_SLICE,
                MEL_FMIN_HZ,
                MEL_FMAX_HZ,
            ),
            spectrum: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            power: vec![0.0; FFT_SIZE / 2 + 1],
            fft,
        }
    }
}

impl Default for MelSpectrumTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumTransform for MelSpectrumTransform {
    fn transform(&mut self, window: &[i16; WINDOW_SAMPLES], out: &mut FeatureSlice) -> Result<()> {
        for (i, slot) in self.spectrum.iter_mut().enumerate() {
            let re = if i < WINDOW_SAMPLES {
                window[i] as f32 / 32_768.0 * self.hann_window[i]
            } else {
                0.0
            };
            *slot = Complex::new(re, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        for (p, c) in self.power.iter_mut().zip(self.spectrum.iter()) {
            *p = c.norm_sqr();
        }

        for (coeff, filter) in out.iter_mut().zip(self.mel_filters.iter()) {
            let energy: f32 = filter
                .iter()
                .zip(self.power.iter())
                .map(|(w, p)| w * p)
                .sum();
            let log = (energy + ENERGY_EPSILON).log10();
            if !log.is_finite() {
                return Err(KwsError::Transform(format!(
                    "non-finite mel energy: {energy}"
                )));
            }
            *coeff = quantize(log);
        }
        Ok(())
    }
}

fn quantize(log_energy: f32) -> i8 {
    let unit = (log_energy - LOG_FLOOR) / (LOG_CEIL - LOG_FLOOR);
    (unit * 255.0 - 128.0).round().clamp(-128.0, 127.0) as i8
}

/// Periodic Hann taper.
fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Triangular filters evenly spaced on the Slaney mel scale, area-normalized.
fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let edges_hz: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    edges_hz
        .windows(3)
        .map(|edge| {
            let (lower, center, upper) = (edge[0], edge[1], edge[2]);
            let rise = (center - lower).max(1e-10);
            let fall = (upper - center).max(1e-10);
            let enorm = 2.0 / (upper - lower).max(1e-10);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / rise
                    } else if freq > center && freq <= upper {
                        (upper - freq) / fall
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1_000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;

fn log_step() -> f32 {
    6.4_f32.ln() / 27.0
}

fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}
