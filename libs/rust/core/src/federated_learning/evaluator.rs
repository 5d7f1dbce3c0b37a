//! Centralized evaluation: scoring the global parameters on the coordinator's own test set.
//!
//! The evaluator is bound once at startup and shared read-only for the whole run,
//! so scores from different rounds are comparable.

use std::sync::Arc;
use thiserror::Error;
use crate::federated_learning::dataset::HeldOutSet;
use crate::federated_learning::types::{CentralizedEvalResult, Metrics, Parameters, RoundIndex};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("parameter shape {found:?} does not fit the evaluator, expected {expected:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    #[error("evaluation failed: {0}")]
    Other(String),
}

pub trait CentralizedEvaluator: Send + Sync {
    fn evaluate(&self, round: RoundIndex, parameters: &Parameters) -> Result<CentralizedEvalResult, EvaluationError>;
}

impl<F> CentralizedEvaluator for F
where F: Fn(RoundIndex, &Parameters) -> Result<CentralizedEvalResult, EvaluationError> + Send + Sync {
    fn evaluate(&self, round: RoundIndex, parameters: &Parameters) -> Result<CentralizedEvalResult, EvaluationError> { self(round, parameters) }
}

/// Softmax-linear scorer: tensor 0 holds `num_classes x features` weights (row-major),
/// tensor 1 holds `num_classes` biases. Reports mean cross-entropy and `accuracy`.
pub struct LinearEvaluator {
    dataset: Arc<HeldOutSet>,
}

impl LinearEvaluator {
    pub fn bind(dataset: Arc<HeldOutSet>) -> Self { Self { dataset } }

    pub fn expected_shape(&self) -> Vec<usize> {
        vec![self.dataset.num_classes * self.dataset.feature_dim(), self.dataset.num_classes]
    }
}

impl CentralizedEvaluator for LinearEvaluator {
    fn evaluate(&self, _round: RoundIndex, parameters: &Parameters) -> Result<CentralizedEvalResult, EvaluationError> {
        let expected = self.expected_shape();
        let found = parameters.shape();
        if found != expected { return Err(EvaluationError::ShapeMismatch { expected, found }); }
        let (weights, bias) = (&parameters.tensors[0], &parameters.tensors[1]);
        let dim = self.dataset.feature_dim();
        let mut total_loss = 0f64;
        let mut correct = 0usize;
        let mut logits = vec![0f64; self.dataset.num_classes];
        for sample in &self.dataset.samples {
            for (c, logit) in logits.iter_mut().enumerate() {
                let row = &weights[c * dim..(c + 1) * dim];
                *logit = bias[c] as f64 + row.iter().zip(&sample.features).map(|(w, x)| *w as f64 * *x as f64).sum::<f64>();
            }
            let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let log_norm = max + logits.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
            total_loss += log_norm - logits[sample.label];
            let predicted = logits.iter().enumerate().fold(0, |best, (i, l)| if *l > logits[best] { i } else { best });
            if predicted == sample.label { correct += 1; }
        }
        let n = self.dataset.len() as f64;
        Ok(CentralizedEvalResult {
            loss: total_loss / n,
            metrics: Metrics::from([("accuracy".to_string(), correct as f64 / n)]),
        })
    }
}
