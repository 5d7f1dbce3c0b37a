//! Round strategy: which participants to ask, what to send them, how to combine replies.
//!
//! `FedAvg` is assembled from injected callbacks (round config, fit/evaluate metric
//! aggregation, centralized evaluator) so the orchestrator never hard-codes them.

use std::sync::Arc;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use crate::federated_learning::aggregate::{fedavg, weighted_loss, AggregationError, MetricsAggregationFn};
use crate::federated_learning::evaluator::CentralizedEvaluator;
use crate::federated_learning::round_config::OnRoundConfigFn;
use crate::federated_learning::types::{
    CentralizedEvalResult, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters, ParticipantId,
    ParticipantResult, RoundConfig, RoundIndex,
};

pub trait Strategy: Send + Sync {
    fn initialize_parameters(&self) -> Option<Parameters>;
    fn min_available_participants(&self) -> usize;
    fn configure_fit(&self, round: RoundIndex, parameters: &Parameters, available: &[ParticipantId]) -> Vec<(ParticipantId, FitIns)>;
    fn aggregate_fit(&self, round: RoundIndex, results: &[(ParticipantId, FitRes)]) -> Result<(Parameters, Option<Metrics>), AggregationError>;
    /// `false` skips the distributed evaluation stage, availability wait included.
    fn distributed_evaluation_enabled(&self) -> bool { true }
    fn configure_evaluate(&self, round: RoundIndex, parameters: &Parameters, available: &[ParticipantId]) -> Vec<(ParticipantId, EvaluateIns)>;
    fn aggregate_evaluate(&self, round: RoundIndex, results: &[(ParticipantId, EvaluateRes)]) -> Result<(f64, Option<Metrics>), AggregationError>;
    /// Centralized score for `round` (0 = initial parameters), `None` when skipped or failed.
    fn evaluate(&self, round: RoundIndex, parameters: &Parameters, is_final: bool) -> Option<CentralizedEvalResult>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct FedAvgOptions {
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_participants: usize,
    pub min_evaluate_participants: usize,
    pub min_available_participants: usize,
    /// Centralized evaluation on rounds divisible by this (and the final round); 0 disables it.
    pub centralized_eval_every: u64,
}

impl Default for FedAvgOptions {
    fn default() -> Self {
        Self { fraction_fit: 1.0, fraction_evaluate: 1.0, min_fit_participants: 2, min_evaluate_participants: 2, min_available_participants: 2, centralized_eval_every: 1 }
    }
}

pub struct FedAvg {
    options: FedAvgOptions,
    initial_parameters: Option<Parameters>,
    on_fit_config: Option<OnRoundConfigFn>,
    on_evaluate_config: Option<OnRoundConfigFn>,
    fit_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluate_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluator: Option<Arc<dyn CentralizedEvaluator>>,
}

#[derive(Default)]
pub struct FedAvgBuilder {
    options: FedAvgOptions,
    initial_parameters: Option<Parameters>,
    on_fit_config: Option<OnRoundConfigFn>,
    on_evaluate_config: Option<OnRoundConfigFn>,
    fit_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluate_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluator: Option<Arc<dyn CentralizedEvaluator>>,
}

impl FedAvgBuilder {
    pub fn options(mut self, options: FedAvgOptions) -> Self { self.options = options; self }
    pub fn initial_parameters(mut self, p: Parameters) -> Self { self.initial_parameters = Some(p); self }
    pub fn on_fit_config(mut self, f: OnRoundConfigFn) -> Self { self.on_fit_config = Some(f); self }
    pub fn on_evaluate_config(mut self, f: OnRoundConfigFn) -> Self { self.on_evaluate_config = Some(f); self }
    pub fn fit_metrics_aggregation(mut self, f: MetricsAggregationFn) -> Self { self.fit_metrics_aggregation = Some(f); self }
    pub fn evaluate_metrics_aggregation(mut self, f: MetricsAggregationFn) -> Self { self.evaluate_metrics_aggregation = Some(f); self }
    pub fn evaluator(mut self, e: Arc<dyn CentralizedEvaluator>) -> Self { self.evaluator = Some(e); self }

    pub fn build(self) -> FedAvg {
        if self.fit_metrics_aggregation.is_none() { warn!("no fit metrics aggregation provided"); }
        if self.evaluate_metrics_aggregation.is_none() { warn!("no evaluate metrics aggregation provided"); }
        FedAvg {
            options: self.options,
            initial_parameters: self.initial_parameters,
            on_fit_config: self.on_fit_config,
            on_evaluate_config: self.on_evaluate_config,
            fit_metrics_aggregation: self.fit_metrics_aggregation,
            evaluate_metrics_aggregation: self.evaluate_metrics_aggregation,
            evaluator: self.evaluator,
        }
    }
}

/// `max(ceil(fraction * available), min)`, never more than `available`.
pub fn sample_size(available: usize, fraction: f64, min: usize) -> usize {
    let wanted = (fraction * available as f64).ceil() as usize;
    wanted.max(min).min(available)
}

fn sample(available: &[ParticipantId], n: usize) -> Vec<ParticipantId> {
    available.choose_multiple(&mut rand::thread_rng(), n).cloned().collect()
}

impl FedAvg {
    pub fn builder() -> FedAvgBuilder { FedAvgBuilder::default() }

    pub fn options(&self) -> &FedAvgOptions { &self.options }

    fn config_for(cb: &Option<OnRoundConfigFn>, round: RoundIndex) -> RoundConfig {
        cb.as_ref().map(|f| f(round)).unwrap_or_default()
    }

    fn wants_centralized(&self, round: RoundIndex, is_final: bool) -> bool {
        if round == 0 { return true; }
        let every = self.options.centralized_eval_every;
        every > 0 && (round % every == 0 || is_final)
    }
}

impl Strategy for FedAvg {
    fn initialize_parameters(&self) -> Option<Parameters> { self.initial_parameters.clone() }

    fn min_available_participants(&self) -> usize { self.options.min_available_participants }

    fn configure_fit(&self, round: RoundIndex, parameters: &Parameters, available: &[ParticipantId]) -> Vec<(ParticipantId, FitIns)> {
        let config = Self::config_for(&self.on_fit_config, round);
        let n = sample_size(available.len(), self.options.fraction_fit, self.options.min_fit_participants);
        sample(available, n).into_iter()
            .map(|id| (id, FitIns { round, parameters: parameters.clone(), config: config.clone() }))
            .collect()
    }

    fn aggregate_fit(&self, round: RoundIndex, results: &[(ParticipantId, FitRes)]) -> Result<(Parameters, Option<Metrics>), AggregationError> {
        let updates: Vec<(u64, &Parameters)> = results.iter().map(|(_, r)| (r.sample_count, &r.parameters)).collect();
        let parameters = fedavg(&updates)?;
        let metrics = match &self.fit_metrics_aggregation {
            Some(agg) => {
                let reported: Vec<ParticipantResult> = results.iter().map(|(_, r)| ParticipantResult::from(r)).collect();
                Some(agg(&reported)?)
            }
            None => None,
        };
        debug!(round, ?metrics, "fit_aggregated");
        Ok((parameters, metrics))
    }

    fn distributed_evaluation_enabled(&self) -> bool { self.options.fraction_evaluate > 0.0 }

    fn configure_evaluate(&self, round: RoundIndex, parameters: &Parameters, available: &[ParticipantId]) -> Vec<(ParticipantId, EvaluateIns)> {
        if !self.distributed_evaluation_enabled() { return Vec::new(); }
        let config = Self::config_for(&self.on_evaluate_config, round);
        let n = sample_size(available.len(), self.options.fraction_evaluate, self.options.min_evaluate_participants);
        sample(available, n).into_iter()
            .map(|id| (id, EvaluateIns { round, parameters: parameters.clone(), config: config.clone() }))
            .collect()
    }

    fn aggregate_evaluate(&self, round: RoundIndex, results: &[(ParticipantId, EvaluateRes)]) -> Result<(f64, Option<Metrics>), AggregationError> {
        let losses: Vec<(u64, f64)> = results.iter().map(|(_, r)| (r.sample_count, r.loss)).collect();
        let loss = weighted_loss(&losses)?;
        let metrics = match &self.evaluate_metrics_aggregation {
            Some(agg) => {
                let reported: Vec<ParticipantResult> = results.iter().map(|(_, r)| ParticipantResult::from(r)).collect();
                Some(agg(&reported)?)
            }
            None => None,
        };
        debug!(round, loss, ?metrics, "evaluate_aggregated");
        Ok((loss, metrics))
    }

    fn evaluate(&self, round: RoundIndex, parameters: &Parameters, is_final: bool) -> Option<CentralizedEvalResult> {
        let evaluator = self.evaluator.as_ref()?;
        if !self.wants_centralized(round, is_final) { return None; }
        match evaluator.evaluate(round, parameters) {
            Ok(res) => Some(res),
            Err(e) => { warn!(round, error = %e, "centralized_evaluation_failed"); None }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::aggregate::WeightedAverage;
    use crate::federated_learning::evaluator::EvaluationError;
    use crate::federated_learning::round_config::RoundConfigBuilder;
    use crate::federated_learning::types::Scalar;

    fn ids(n: usize) -> Vec<ParticipantId> { (0..n).map(|i| format!("p{i}")).collect() }

    fn fit_res(n: u64, w: f32, acc: f64) -> FitRes {
        FitRes { parameters: Parameters::new(vec![vec![w]]), sample_count: n, metrics: Metrics::from([("accuracy".into(), acc)]) }
    }

    #[test]
    fn sample_size_respects_fraction_and_minimum() {
        assert_eq!(sample_size(10, 0.5, 2), 5);
        assert_eq!(sample_size(10, 0.05, 2), 2);
        assert_eq!(sample_size(3, 1.0, 5), 3);
        assert_eq!(sample_size(7, 0.3, 0), 3);
    }

    #[test]
    fn configure_fit_sends_same_config_to_distinct_participants() {
        let strategy = FedAvg::builder()
            .options(FedAvgOptions { fraction_fit: 0.5, min_fit_participants: 1, ..Default::default() })
            .on_fit_config(RoundConfigBuilder::new(3, 0.1).into_fn())
            .build();
        let plan = strategy.configure_fit(2, &Parameters::default(), &ids(6));
        assert_eq!(plan.len(), 3);
        let mut chosen: Vec<_> = plan.iter().map(|(id, _)| id.clone()).collect();
        chosen.sort();
        chosen.dedup();
        assert_eq!(chosen.len(), 3);
        assert!(plan.iter().all(|(_, ins)| ins.round == 2 && ins.config["epochs"] == Scalar::Int(3)));
    }

    #[test]
    fn aggregate_fit_combines_parameters_and_metrics() {
        let strategy = FedAvg::builder().fit_metrics_aggregation(WeightedAverage::accuracy().into_fn()).build();
        let results = vec![("a".to_string(), fit_res(10, 1.0, 0.8)), ("b".to_string(), fit_res(30, 5.0, 0.4))];
        let (params, metrics) = strategy.aggregate_fit(1, &results).unwrap();
        assert_eq!(params.tensors, vec![vec![4.0]]);
        assert!((metrics.unwrap()["accuracy"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn aggregate_fit_without_results_fails() {
        let strategy = FedAvg::builder().fit_metrics_aggregation(WeightedAverage::accuracy().into_fn()).build();
        assert_eq!(strategy.aggregate_fit(1, &[]).unwrap_err(), AggregationError::Empty);
    }

    #[test]
    fn evaluation_disabled_by_zero_fraction() {
        let strategy = FedAvg::builder().options(FedAvgOptions { fraction_evaluate: 0.0, ..Default::default() }).build();
        assert!(!strategy.distributed_evaluation_enabled());
        assert!(strategy.configure_evaluate(1, &Parameters::default(), &ids(4)).is_empty());
    }

    #[test]
    fn aggregate_evaluate_weights_loss() {
        let strategy = FedAvg::builder().evaluate_metrics_aggregation(WeightedAverage::accuracy().into_fn()).build();
        let res = |n, loss, acc| EvaluateRes { loss, sample_count: n, metrics: Metrics::from([("accuracy".into(), acc)]) };
        let (loss, metrics) = strategy.aggregate_evaluate(1, &[("a".to_string(), res(1, 1.0, 1.0)), ("b".to_string(), res(1, 3.0, 0.0))]).unwrap();
        assert_eq!(loss, 2.0);
        assert_eq!(metrics.unwrap()["accuracy"], 0.5);
    }

    #[test]
    fn centralized_cadence_and_failures() {
        let evaluator = |round: RoundIndex, p: &Parameters| -> Result<CentralizedEvalResult, EvaluationError> {
            if p.is_empty() { return Err(EvaluationError::Other("no tensors".into())); }
            Ok(CentralizedEvalResult { loss: round as f64, metrics: Metrics::new() })
        };
        let strategy = FedAvg::builder()
            .options(FedAvgOptions { centralized_eval_every: 2, ..Default::default() })
            .evaluator(Arc::new(evaluator))
            .build();
        let p = Parameters::new(vec![vec![0.0]]);
        assert!(strategy.evaluate(0, &p, false).is_some());
        assert!(strategy.evaluate(1, &p, false).is_none());
        assert!(strategy.evaluate(2, &p, false).is_some());
        assert!(strategy.evaluate(3, &p, true).is_some());
        assert!(strategy.evaluate(2, &Parameters::default(), false).is_none());
    }

    #[test]
    fn no_evaluator_means_no_centralized_result() {
        let strategy = FedAvg::builder().build();
        assert!(strategy.evaluate(0, &Parameters::default(), true).is_none());
    }
}
