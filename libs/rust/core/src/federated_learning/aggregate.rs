//! Sample-weighted aggregation of participant results.
//!
//! Metric maps, distributed losses and model parameters are all combined with
//! the same rule: each participant contributes `sample_count / total` of its value.
//! Weights are computed as fractions first so a lone participant's value passes
//! through unchanged.

use std::sync::Arc;
use thiserror::Error;
use crate::federated_learning::types::{Metrics, Parameters, ParticipantResult};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregationError {
    #[error("no participant results to aggregate")]
    Empty,
    #[error("total sample count is zero")]
    ZeroWeight,
    #[error("participant result {index} is missing metric `{key}`")]
    MissingMetric { index: usize, key: String },
    #[error("participant result {index} has parameter shape {found:?}, expected {expected:?}")]
    ShapeMismatch { index: usize, expected: Vec<usize>, found: Vec<usize> },
}

/// Callback shape the strategy accepts for either metric stream.
pub type MetricsAggregationFn = Arc<dyn Fn(&[ParticipantResult]) -> Result<Metrics, AggregationError> + Send + Sync>;

fn fractions<I: IntoIterator<Item = u64>>(counts: I) -> Result<Vec<f64>, AggregationError> {
    let counts: Vec<u64> = counts.into_iter().collect();
    if counts.is_empty() { return Err(AggregationError::Empty); }
    // u128 cannot overflow for any slice of u64 counts.
    let total: u128 = counts.iter().map(|&n| u128::from(n)).sum();
    if total == 0 { return Err(AggregationError::ZeroWeight); }
    let total = total as f64;
    Ok(counts.into_iter().map(|n| n as f64 / total).collect())
}

/// Weighted mean over an explicit, validated set of metric keys.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedAverage {
    keys: Vec<String>,
}

impl WeightedAverage {
    pub fn new<I, S>(keys: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> {
        Self { keys: keys.into_iter().map(Into::into).collect() }
    }

    pub fn accuracy() -> Self { Self::new(["accuracy"]) }

    pub fn keys(&self) -> &[String] { &self.keys }

    /// `Σ(n_i · v_i) / Σ n_i` for every expected key. Keys a participant reports
    /// beyond the expected set are ignored; a missing expected key is an error.
    pub fn aggregate(&self, results: &[ParticipantResult]) -> Result<Metrics, AggregationError> {
        let weights = fractions(results.iter().map(|r| r.sample_count))?;
        let mut out = Metrics::new();
        for key in &self.keys {
            let mut acc = 0.0f64;
            for (index, (result, w)) in results.iter().zip(&weights).enumerate() {
                let value = result.metrics.get(key).ok_or_else(|| AggregationError::MissingMetric { index, key: key.clone() })?;
                acc += w * value;
            }
            out.insert(key.clone(), acc);
        }
        Ok(out)
    }

    pub fn into_fn(self) -> MetricsAggregationFn {
        Arc::new(move |results: &[ParticipantResult]| self.aggregate(results))
    }
}

/// Sample-weighted mean of per-participant losses.
pub fn weighted_loss(results: &[(u64, f64)]) -> Result<f64, AggregationError> {
    let weights = fractions(results.iter().map(|(n, _)| *n))?;
    Ok(results.iter().zip(weights).map(|((_, loss), w)| w * loss).sum())
}

/// FedAvg over model parameters. Every update must match the first one's shape.
pub fn fedavg(updates: &[(u64, &Parameters)]) -> Result<Parameters, AggregationError> {
    let weights = fractions(updates.iter().map(|(n, _)| *n))?;
    let expected = updates[0].1.shape();
    for (index, (_, p)) in updates.iter().enumerate().skip(1) {
        let found = p.shape();
        if found != expected { return Err(AggregationError::ShapeMismatch { index, expected, found }); }
    }
    let mut acc: Vec<Vec<f64>> = expected.iter().map(|len| vec![0f64; *len]).collect();
    for ((_, p), w) in updates.iter().zip(&weights) {
        for (layer, values) in acc.iter_mut().zip(&p.tensors) {
            for (slot, v) in layer.iter_mut().zip(values) { *slot += *v as f64 * w; }
        }
    }
    Ok(Parameters::new(acc.into_iter().map(|layer| layer.into_iter().map(|v| v as f32).collect()).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(n: u64, acc: f64) -> ParticipantResult {
        ParticipantResult::new(n, Metrics::from([("accuracy".to_string(), acc)]))
    }

    #[test]
    fn three_participant_weighted_mean() {
        let out = WeightedAverage::accuracy().aggregate(&[res(10, 0.8), res(20, 0.6), res(30, 0.9)]).unwrap();
        let expected = (10.0 * 0.8 + 20.0 * 0.6 + 30.0 * 0.9) / 60.0;
        assert!((out["accuracy"] - expected).abs() < 1e-12);
        assert!((out["accuracy"] - 0.783_333_333).abs() < 1e-6);
    }

    #[test]
    fn equal_counts_give_plain_mean() {
        let out = WeightedAverage::accuracy().aggregate(&[res(7, 0.2), res(7, 0.4), res(7, 0.9)]).unwrap();
        assert!((out["accuracy"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn single_result_passes_through_exactly() {
        for n in [1, 3, 1_000_003] {
            let out = WeightedAverage::accuracy().aggregate(&[res(n, 0.1)]).unwrap();
            assert_eq!(out["accuracy"], 0.1);
        }
    }

    #[test]
    fn permutation_does_not_change_result() {
        let a = [res(10, 0.8), res(20, 0.6), res(30, 0.9), res(5, 0.1)];
        let b = [res(5, 0.1), res(30, 0.9), res(10, 0.8), res(20, 0.6)];
        let agg = WeightedAverage::accuracy();
        let (x, y) = (agg.aggregate(&a).unwrap()["accuracy"], agg.aggregate(&b).unwrap()["accuracy"]);
        assert!((x - y).abs() < 1e-12);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(WeightedAverage::accuracy().aggregate(&[]), Err(AggregationError::Empty));
        assert_eq!(weighted_loss(&[]), Err(AggregationError::Empty));
        assert_eq!(fedavg(&[]), Err(AggregationError::Empty));
    }

    #[test]
    fn zero_total_weight_is_an_error() {
        assert_eq!(WeightedAverage::accuracy().aggregate(&[res(0, 0.5), res(0, 0.7)]), Err(AggregationError::ZeroWeight));
    }

    #[test]
    fn huge_sample_counts_do_not_overflow() {
        let out = WeightedAverage::accuracy().aggregate(&[res(u64::MAX, 0.5), res(2, 0.5)]).unwrap();
        assert!((out["accuracy"] - 0.5).abs() < 1e-12);
        let loss = weighted_loss(&[(u64::MAX, 1.0), (u64::MAX, 3.0)]).unwrap();
        assert!((loss - 2.0).abs() < 1e-12);
    }

    #[test]
    fn missing_key_fails_fast() {
        let bad = ParticipantResult::new(3, Metrics::from([("loss".to_string(), 1.0)]));
        let err = WeightedAverage::accuracy().aggregate(&[res(1, 0.5), bad]).unwrap_err();
        assert_eq!(err, AggregationError::MissingMetric { index: 1, key: "accuracy".into() });
    }

    #[test]
    fn every_expected_key_is_aggregated_and_extras_dropped() {
        let r1 = ParticipantResult::new(1, Metrics::from([("accuracy".into(), 1.0), ("f1".into(), 0.0), ("noise".into(), 9.0)]));
        let r2 = ParticipantResult::new(3, Metrics::from([("accuracy".into(), 0.0), ("f1".into(), 1.0)]));
        let out = WeightedAverage::new(["accuracy", "f1"]).aggregate(&[r1, r2]).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out["accuracy"] - 0.25).abs() < 1e-12);
        assert!((out["f1"] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn loss_is_sample_weighted() {
        let loss = weighted_loss(&[(1, 2.0), (3, 6.0)]).unwrap();
        assert!((loss - 5.0).abs() < 1e-12);
    }

    #[test]
    fn fedavg_weights_each_element() {
        let a = Parameters::new(vec![vec![1.0, 2.0], vec![0.0]]);
        let b = Parameters::new(vec![vec![3.0, 4.0], vec![4.0]]);
        let avg = fedavg(&[(10, &a), (30, &b)]).unwrap();
        assert_eq!(avg.tensors, vec![vec![2.5, 3.5], vec![3.0]]);
    }

    #[test]
    fn fedavg_rejects_shape_mismatch() {
        let a = Parameters::new(vec![vec![1.0, 2.0]]);
        let b = Parameters::new(vec![vec![1.0]]);
        assert!(matches!(fedavg(&[(1, &a), (1, &b)]), Err(AggregationError::ShapeMismatch { index: 1, .. })));
    }
}
