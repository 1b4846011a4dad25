//! `OnnxModel`: int8 keyword classifier run through ONNX Runtime.
//!
//! The graph takes the feature matrix as a `[1, SLICES, COEFFS, 1]` int8
//! tensor and produces `CATEGORY_COUNT` int8 scores. Quantization of the
//! output is not discoverable from the session, so it comes from
//! `OnnxModelConfig`.

use std::path::PathBuf;

use ndarray::ArrayView4;
use ort::session::{
    builder::{GraphOptimizationLevel, SessionBuilder},
    Session,
};
use ort::value::TensorRef;
use tracing::info;

use super::{Model, OutputQuantization};
use crate::error::{KwsError, Result};
use crate::settings::{CATEGORY_COUNT, COEFFS_PER_SLICE, FEATURE_ELEMENT_COUNT, SLICE_COUNT};

#[derive(Debug, Clone)]
pub struct OnnxModelConfig {
    pub model_path: PathBuf,
    pub input_name: String,
    pub output_name: String,
    pub quantization: OutputQuantization,
    pub intra_threads: usize,
}

impl Default for OnnxModelConfig {
    fn default() -> Self {
        let dir = std::env::var("KWS_MODEL_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("models"));
        Self {
            model_path: dir.join("keyword_model.onnx"),
            input_name: "input".into(),
            output_name: "output".into(),
            quantization: OutputQuantization::default(),
            intra_threads: 1,
        }
    }
}

pub struct OnnxModel {
    config: OnnxModelConfig,
    session: Session,
    input: Vec<i8>,
    output: Vec<i8>,
}

impl OnnxModel {
    /// Load and optimize the graph at `config.model_path`.
    ///
    /// # Errors
    /// `KwsError::ModelNotFound` for a missing file, `KwsError::OnnxSession`
    /// for anything ONNX Runtime rejects.
    pub fn load(config: OnnxModelConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(KwsError::ModelNotFound {
                path: config.model_path.clone(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?
            .with_intra_threads(config.intra_threads.max(1))
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::All)
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?
            .commit_from_file(&config.model_path)
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?;

        require_port(
            "input",
            &config.input_name,
            session.inputs().iter().map(|i| i.name()),
        )?;
        require_port(
            "output",
            &config.output_name,
            session.outputs().iter().map(|o| o.name()),
        )?;

        info!(
            path = %config.model_path.display(),
            input = config.input_name.as_str(),
            output = config.output_name.as_str(),
            "keyword model loaded"
        );

        Ok(Self {
            config,
            session,
            input: vec![0; FEATURE_ELEMENT_COUNT],
            output: vec![0; CATEGORY_COUNT],
        })
    }
}

/// Fail unless the graph exposes a port called `wanted`.
fn require_port<'a>(
    kind: &str,
    wanted: &str,
    available: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let names: Vec<&str> = available.into_iter().collect();
    if names.contains(&wanted) {
        return Ok(());
    }
    Err(KwsError::InvalidConfig(format!(
        "model has no {kind} named '{wanted}' (available: {})",
        names.join(", ")
    )))
}

impl Model for OnnxModel {
    fn input_len(&self) -> usize {
        FEATURE_ELEMENT_COUNT
    }

    fn set_input(&mut self, input: &[i8]) -> Result<()> {
        if input.len() != self.input.len() {
            return Err(KwsError::ModelInputMismatch {
                got: input.len(),
                want: self.input.len(),
            });
        }
        self.input.copy_from_slice(input);
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        let view = ArrayView4::from_shape((1, SLICE_COUNT, COEFFS_PER_SLICE, 1), &self.input)
            .map_err(|e| KwsError::Inference(e.to_string()))?;
        let tensor =
            TensorRef::from_array_view(view).map_err(|e| KwsError::OnnxSession(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.config.input_name.as_str() => tensor])
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?;
        let value = outputs
            .get(self.config.output_name.as_str())
            .ok_or_else(|| {
                KwsError::Inference(format!(
                    "model produced no output named '{}'",
                    self.config.output_name
                ))
            })?;
        let (_, scores) = value
            .try_extract_tensor::<i8>()
            .map_err(|e| KwsError::OnnxSession(e.to_string()))?;

        if scores.len() != self.output.len() {
            return Err(KwsError::ModelOutputMismatch {
                got: scores.len(),
                want: self.output.len(),
            });
        }
        self.output.copy_from_slice(scores);
        Ok(())
    }

    fn output(&self) -> &[i8] {
        &self.output
    }

    fn quantization(&self) -> OutputQuantization {
        self.config.quantization
    }
}
