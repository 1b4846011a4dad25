//! Detection and status events.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `DetectionEvent` | `Recognizer::subscribe_detections` |
//! | `RecognizerStatusEvent` | `Recognizer::subscribe_status` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Detection events
// ---------------------------------------------------------------------------

/// Emitted once per inference: the best category, unthresholded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub label: String,
    /// Category index in model output order.
    pub index: usize,
    /// De-quantized score of the winning category.
    pub score: f32,
    /// Audio clock at the start of the iteration that produced it.
    pub audio_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted when the recognizer changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizerStatusEvent {
    pub status: RecognizerStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of a `Recognizer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerStatus {
    /// Created, `start()` not yet called.
    Idle,
    /// Capturing audio and running inference.
    Running,
    /// Loop halted and capture paused; `resume()` continues.
    Suspended,
    /// Shut down; threads joined.
    Stopped,
    /// `start()` failed; the recognizer may be started again.
    Error,
}
