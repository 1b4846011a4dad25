//! Model abstraction and the post-processing that turns quantized scores into
//! a detection.
//!
//! The `Model` trait decouples the recognizer from any specific backend
//! (fixed-output stub, ONNX Runtime, a vendor accelerator). Backends own
//! their input and output tensors; the driver only copies features in and
//! reads scores out.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxModel, OnnxModelConfig};

use std::sync::Arc;

use tracing::debug;

use crate::error::{KwsError, Result};
use crate::features::FeatureWindowState;
use crate::settings::FEATURE_ELEMENT_COUNT;

/// Affine parameters of the model's int8 output tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputQuantization {
    pub scale: f32,
    pub zero_point: i32,
}

impl OutputQuantization {
    /// `(raw − zero_point) × scale`
    pub fn dequantize(&self, raw: i8) -> f32 {
        (raw as i32 - self.zero_point) as f32 * self.scale
    }
}

impl Default for OutputQuantization {
    fn default() -> Self {
        Self {
            scale: 0.0039062,
            zero_point: -128,
        }
    }
}

/// Contract for keyword-classification backends.
///
/// `&mut self` on `set_input`/`invoke` reflects that backends own mutable
/// tensor arenas. The recognizer thread owns the model exclusively.
pub trait Model: Send + 'static {
    /// Number of int8 values `set_input` expects.
    fn input_len(&self) -> usize;

    /// Copy `input` into the model's input tensor.
    ///
    /// # Errors
    /// `KwsError::ModelInputMismatch` when `input.len() != input_len()`.
    fn set_input(&mut self, input: &[i8]) -> Result<()>;

    /// Run one forward pass over the current input.
    fn invoke(&mut self) -> Result<()>;

    /// Quantized category scores from the last `invoke`.
    fn output(&self) -> &[i8];

    fn quantization(&self) -> OutputQuantization;
}

/// Best category of one inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub index: usize,
    pub label: Arc<str>,
    pub score: f32,
}

/// Index and de-quantized score of the highest category.
///
/// Scans in order and only replaces the best on a strictly greater score, so
/// the lowest index wins a tie. `None` for an empty output.
pub fn best_category(output: &[i8], quantization: OutputQuantization) -> Option<(usize, f32)> {
    let (&first, rest) = output.split_first()?;
    let mut best_index = 0;
    let mut best_score = quantization.dequantize(first);
    for (i, &raw) in rest.iter().enumerate() {
        let score = quantization.dequantize(raw);
        if score > best_score {
            best_index = i + 1;
            best_score = score;
        }
    }
    Some((best_index, best_score))
}

/// Copies features into a model, runs it and reduces the output.
pub struct InferenceDriver {
    model: Box<dyn Model>,
    labels: Vec<Arc<str>>,
    /// Flattened feature matrix, reused every call.
    input: Vec<i8>,
}

impl InferenceDriver {
    /// # Errors
    /// `KwsError::ModelInputMismatch` when the model does not take a full
    /// feature matrix; `KwsError::InvalidConfig` when `labels` is empty.
    pub fn new<S: AsRef<str>>(model: Box<dyn Model>, labels: &[S]) -> Result<Self> {
        if model.input_len() != FEATURE_ELEMENT_COUNT {
            return Err(KwsError::ModelInputMismatch {
                got: FEATURE_ELEMENT_COUNT,
                want: model.input_len(),
            });
        }
        if labels.is_empty() {
            return Err(KwsError::InvalidConfig("no category labels".into()));
        }
        Ok(Self {
            model,
            labels: labels.iter().map(|l| Arc::from(l.as_ref())).collect(),
            input: vec![0; FEATURE_ELEMENT_COUNT],
        })
    }

    /// Flatten `state`'s matrix into the model, invoke it and report the
    /// highest-scoring category.
    ///
    /// Call only after `populate` reported changed slices.
    ///
    /// # Errors
    /// - Errors from the backend's `set_input` / `invoke`.
    /// - `KwsError::ModelOutputMismatch` when the output length differs from
    ///   the label count.
    pub fn run(&mut self, state: &FeatureWindowState) -> Result<Detection> {
        state.flatten_into(&mut self.input)?;
        self.model.set_input(&self.input)?;
        self.model.invoke()?;

        let output = self.model.output();
        if output.len() != self.labels.len() {
            return Err(KwsError::ModelOutputMismatch {
                got: output.len(),
                want: self.labels.len(),
            });
        }

        let (index, score) = best_category(output, self.model.quantization()).ok_or(
            KwsError::ModelOutputMismatch {
                got: 0,
                want: self.labels.len(),
            },
        )?;
        debug!(index, score, "inference complete");

        Ok(Detection {
            index,
            label: Arc::clone(&self.labels[index]),
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubModel;
    use super::*;
    use crate::settings::{CATEGORY_COUNT, CATEGORY_LABELS, COEFFS_PER_SLICE};
    use approx::assert_relative_eq;

    fn quantize(score: f32, q: OutputQuantization) -> i8 {
        ((score / q.scale).round() as i32 + q.zero_point) as i8
    }

    #[test]
    fn first_maximum_wins_a_tie() {
        let q = OutputQuantization::default();
        let raw: Vec<i8> = [0.10, 0.75, 0.75, 0.05]
            .iter()
            .map(|&s| quantize(s, q))
            .collect();

        let (index, score) = best_category(&raw, q).unwrap();
        assert_eq!(index, 1);
        assert_relative_eq!(score, 0.75, epsilon = 0.005);
    }

    #[test]
    fn strictly_greater_later_score_replaces_best() {
        let q = OutputQuantization {
            scale: 0.5,
            zero_point: 0,
        };
        assert_eq!(best_category(&[1, 3, 2, 4], q), Some((3, 2.0)));
        assert_eq!(best_category(&[5, 5, 5, 5], q), Some((0, 2.5)));
        assert_eq!(best_category(&[], q), None);
    }

    #[test]
    fn dequantize_is_affine() {
        let q = OutputQuantization::default();
        assert_relative_eq!(q.dequantize(-128), 0.0);
        assert_relative_eq!(q.dequantize(127), 255.0 * 0.0039062);
    }

    #[test]
    fn driver_flattens_matrix_row_major_into_model() {
        let model = StubModel::new(vec![-128, -128, 100, -128], OutputQuantization::default());
        let probe = model.probe();
        let mut driver = InferenceDriver::new(Box::new(model), &CATEGORY_LABELS[..]).unwrap();

        let mut state = FeatureWindowState::default();
        state.feature_matrix[0][3] = 9;
        state.feature_matrix[2][0] = -4;

        let detection = driver.run(&state).unwrap();
        assert_eq!(detection.index, 2);
        assert_eq!(&*detection.label, "silence");

        let input = probe.last_input();
        assert_eq!(input.len(), FEATURE_ELEMENT_COUNT);
        assert_eq!(input[3], 9);
        assert_eq!(input[2 * COEFFS_PER_SLICE], -4);
        assert_eq!(probe.invocations(), 1);
    }

    #[test]
    fn output_length_must_match_labels() {
        let model = StubModel::new(vec![0; CATEGORY_COUNT + 1], OutputQuantization::default());
        let mut driver = InferenceDriver::new(Box::new(model), &CATEGORY_LABELS[..]).unwrap();
        let err = driver.run(&FeatureWindowState::default()).unwrap_err();
        assert!(matches!(
            err,
            KwsError::ModelOutputMismatch { got: 5, want: 4 }
        ));
    }

    #[test]
    fn model_with_wrong_input_len_is_rejected() {
        let model = StubModel::with_input_len(
            100,
            vec![0; CATEGORY_COUNT],
            OutputQuantization::default(),
        );
        assert!(matches!(
            InferenceDriver::new(Box::new(model), &CATEGORY_LABELS[..]),
            Err(KwsError::ModelInputMismatch { got, want })
                if got == FEATURE_ELEMENT_COUNT && want == 100
        ));
    }
}
