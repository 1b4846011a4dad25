use thiserror::Error;

/// All errors produced by kws-core.
#[derive(Debug, Error)]
pub enum KwsError {
    #[error("ring buffer capacity must be non-zero")]
    RingBufferCapacity,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("unsupported capture format: {0}")]
    UnsupportedCapture(String),

    #[error("feature buffer holds {got} values, expected {want}")]
    FeatureSizeMismatch { got: usize, want: usize },

    #[error("audio data size {got} too small, want {want}")]
    AudioSizeMismatch { got: usize, want: usize },

    /// `got` values were supplied to a model whose input holds `want`.
    #[error("model input holds {want} values, got {got}")]
    ModelInputMismatch { got: usize, want: usize },

    #[error("model produced {got} output values, expected {want}")]
    ModelOutputMismatch { got: usize, want: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("spectrum transform error: {0}")]
    Transform(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {}", path.display())]
    ModelNotFound { path: std::path::PathBuf },

    #[error("recognizer is not running")]
    NotRunning,

    #[error("recognizer has been shut down")]
    ShutDown,

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KwsError>;
