//! # kws-core
//!
//! Streaming keyword-spotting front end: microphone to feature matrix to
//! quantized classifier, in real time, with no allocation in either
//! steady-state loop.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture (thread) → SPSC byte ring ──┐
//!                   │                                   │
//!                   └── AudioClock (atomic ms) ─────────┤
//!                                                       ▼
//!                               Recognizer loop (thread): FeatureProvider::populate
//!                                                       │  slices_changed > 0
//!                                                       ▼
//!                                           InferenceDriver → Model
//!                                                       │
//!                                    broadcast::Sender<DetectionEvent>
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod features;
pub mod inference;
pub mod ipc;
pub mod settings;

// Convenience re-exports for downstream crates
pub use audio::{AudioCapture, AudioClock, CaptureConfig, ChannelMask, Microphone, SampleWidth};
pub use engine::{Recognizer, RecognizerConfig};
pub use error::{KwsError, Result};
pub use features::{FeatureProvider, FeatureWindowState, MelSpectrumTransform, SpectrumTransform};
pub use inference::{stub::StubModel, InferenceDriver, Model, OutputQuantization};
pub use ipc::events::{DetectionEvent, RecognizerStatus, RecognizerStatusEvent};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalMicrophone;

#[cfg(feature = "onnx")]
pub use inference::{OnnxModel, OnnxModelConfig};
