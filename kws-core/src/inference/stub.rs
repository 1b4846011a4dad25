//! `StubModel`: placeholder backend that returns a fixed output.
//!
//! Lets the whole capture → features → inference path run without model
//! weights. A `StubProbe` exposes what the recognizer fed in.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{Model, OutputQuantization};
use crate::error::{KwsError, Result};
use crate::settings::{CATEGORY_COUNT, FEATURE_ELEMENT_COUNT};

/// Raw output favouring "silence" under the default quantization.
pub const DEFAULT_STUB_OUTPUT: [i8; CATEGORY_COUNT] = [-128, -128, 127, -128];

#[derive(Default)]
struct Observed {
    last_input: Mutex<Vec<i8>>,
    invocations: AtomicU64,
}

/// Read-only view of what a `StubModel` has seen, usable after the model
/// moved into the recognizer.
#[derive(Clone)]
pub struct StubProbe(Arc<Observed>);

impl StubProbe {
    pub fn invocations(&self) -> u64 {
        self.0.invocations.load(Ordering::Relaxed)
    }

    pub fn last_input(&self) -> Vec<i8> {
        self.0.last_input.lock().clone()
    }
}

pub struct StubModel {
    input_len: usize,
    input: Vec<i8>,
    output: Vec<i8>,
    quantization: OutputQuantization,
    observed: Arc<Observed>,
}

impl StubModel {
    pub fn new(output: Vec<i8>, quantization: OutputQuantization) -> Self {
        Self::with_input_len(FEATURE_ELEMENT_COUNT, output, quantization)
    }

    pub fn with_input_len(
        input_len: usize,
        output: Vec<i8>,
        quantization: OutputQuantization,
    ) -> Self {
        Self {
            input_len,
            input: vec![0; input_len],
            output,
            quantization,
            observed: Arc::default(),
        }
    }

    pub fn probe(&self) -> StubProbe {
        StubProbe(Arc::clone(&self.observed))
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new(DEFAULT_STUB_OUTPUT.to_vec(), OutputQuantization::default())
    }
}

impl Model for StubModel {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn set_input(&mut self, input: &[i8]) -> Result<()> {
        if input.len() != self.input_len {
            return Err(KwsError::ModelInputMismatch {
                got: input.len(),
                want: self.input_len,
            });
        }
        self.input.copy_from_slice(input);
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        let n = self.observed.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        self.observed.last_input.lock().clone_from(&self.input);
        debug!(invocation = n, "StubModel::invoke");
        Ok(())
    }

    fn output(&self) -> &[i8] {
        &self.output
    }

    fn quantization(&self) -> OutputQuantization {
        self.quantization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_input_length() {
        let mut model = StubModel::default();
        assert!(matches!(
            model.set_input(&[0; 3]),
            Err(KwsError::ModelInputMismatch { got: 3, .. })
        ));
    }

    #[test]
    fn probe_sees_input_after_invoke() {
        let mut model = StubModel::default();
        let probe = model.probe();
        let input = vec![7i8; FEATURE_ELEMENT_COUNT];
        model.set_input(&input).unwrap();
        assert_eq!(probe.invocations(), 0);
        model.invoke().unwrap();
        assert_eq!(probe.invocations(), 1);
        assert_eq!(probe.last_input(), input);
        assert_eq!(model.output(), &DEFAULT_STUB_OUTPUT);
    }
}
