//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kws_core::settings::{CATEGORY_COUNT, CATEGORY_LABELS, RING_CAPACITY_BYTES};
use kws_core::{CaptureConfig, ChannelMask, RecognizerConfig, SampleWidth};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub model_path: Option<String>,
    pub model_input_name: String,
    pub model_output_name: String,
    pub output_scale: f32,
    pub output_zero_point: i32,
    pub sample_width_bits: u32,
    pub channel: String,
    pub right_shift: u32,
    pub frame_bytes: usize,
    pub ring_capacity_bytes: usize,
    pub audio_timeout_ms: u64,
    pub iteration_delay_ms: u64,
    pub detection_threshold: f32,
    pub labels: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            preferred_input_device: None,
            model_path: None,
            model_input_name: "input".into(),
            model_output_name: "output".into(),
            output_scale: 0.0039062,
            output_zero_point: -128,
            sample_width_bits: capture.sample_width.bits(),
            channel: "left".into(),
            right_shift: capture.right_shift,
            frame_bytes: capture.frame_bytes,
            ring_capacity_bytes: RING_CAPACITY_BYTES,
            audio_timeout_ms: 200,
            iteration_delay_ms: 10,
            detection_threshold: 0.8,
            labels: CATEGORY_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.model_path = trimmed(self.model_path.take());

        self.sample_width_bits = if self.sample_width_bits <= 16 { 16 } else { 32 };
        self.channel = match self.channel.trim().to_ascii_lowercase().as_str() {
            "right" => "right".into(),
            _ => "left".into(),
        };
        self.right_shift = self.right_shift.min(self.sample_width_bits - 1);

        let word = (self.sample_width_bits / 8) as usize;
        self.frame_bytes = self.frame_bytes.clamp(word * 16, 64 * 1024) / word * word;
        let pcm_frame = self.frame_bytes / word * 2;
        self.ring_capacity_bytes = self
            .ring_capacity_bytes
            .clamp(pcm_frame, 4 * 1024 * 1024)
            & !1;

        self.audio_timeout_ms = self.audio_timeout_ms.clamp(20, 5_000);
        self.iteration_delay_ms = self.iteration_delay_ms.min(1_000);
        self.detection_threshold = self.detection_threshold.clamp(0.0, 1.0);
        if !self.output_scale.is_finite() || self.output_scale <= 0.0 {
            self.output_scale = 0.0039062;
        }

        self.labels = self
            .labels
            .iter()
            .map(|l| l.trim().to_string())
            .collect();
        if self.labels.len() != CATEGORY_COUNT || self.labels.iter().any(String::is_empty) {
            self.labels = CATEGORY_LABELS.iter().map(|l| l.to_string()).collect();
        }
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        let capture = CaptureConfig {
            sample_width: if self.sample_width_bits == 16 {
                SampleWidth::Bits16
            } else {
                SampleWidth::Bits32
            },
            channel: if self.channel == "right" {
                ChannelMask::Right
            } else {
                ChannelMask::Left
            },
            frame_bytes: self.frame_bytes,
            right_shift: self.right_shift,
            ..CaptureConfig::default()
        };
        RecognizerConfig {
            capture,
            ring_capacity: self.ring_capacity_bytes,
            audio_timeout: Duration::from_millis(self.audio_timeout_ms),
            iteration_delay: Duration::from_millis(self.iteration_delay_ms),
            labels: self.labels.clone(),
        }
    }

    #[cfg(feature = "onnx")]
    pub fn onnx_model_config(&self) -> Option<kws_core::OnnxModelConfig> {
        let path = self.model_path.as_ref()?;
        Some(kws_core::OnnxModelConfig {
            model_path: PathBuf::from(path),
            input_name: self.model_input_name.clone(),
            output_name: self.model_output_name.clone(),
            quantization: kws_core::OutputQuantization {
                scale: self.output_scale,
                zero_point: self.output_zero_point,
            },
            ..kws_core::OnnxModelConfig::default()
        })
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kws")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("kws")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}
