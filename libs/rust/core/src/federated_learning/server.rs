//! Round orchestrator: drives exactly `num_rounds` sequential rounds over a
//! distribution channel and returns the accumulated history.
//!
//! Within a round participants are reached concurrently; rounds never overlap.
//! Participants that fail or time out are dropped from that round's aggregation
//! input. A round left with no results aborts the run.

use std::future::Future;
use std::time::{Duration, Instant};
use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, instrument, warn};
use crate::federated_learning::aggregate::AggregationError;
use crate::federated_learning::channel::{ChannelError, DistributionChannel};
use crate::federated_learning::history::{History, HistoryError, RoundRecord};
use crate::federated_learning::strategy::Strategy;
use crate::federated_learning::types::{Metrics, Parameters, ParticipantId, RoundIndex};
use crate::metrics_ext::FL_METRICS;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("round {round}: aggregation failed: {source}")]
    Aggregation { round: RoundIndex, #[source] source: AggregationError },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub num_rounds: u64,
    /// Per-participant reply deadline; `None` waits indefinitely.
    pub round_timeout: Option<Duration>,
    pub availability_timeout: Duration,
}

impl ServerConfig {
    pub fn new(num_rounds: u64) -> Self {
        Self { num_rounds, round_timeout: None, availability_timeout: Duration::from_secs(300) }
    }
}

struct StageOutcome<T> {
    value: T,
    succeeded: usize,
    failed: usize,
}

pub struct RoundOrchestrator<C, S> {
    channel: C,
    strategy: S,
    config: ServerConfig,
}

fn split_replies<T>(round: RoundIndex, stage: &'static str, replies: Vec<(ParticipantId, Result<T, ChannelError>)>) -> (Vec<(ParticipantId, T)>, usize) {
    let mut ok = Vec::with_capacity(replies.len());
    let mut failed = 0usize;
    for (id, reply) in replies {
        match reply {
            Ok(v) => ok.push((id, v)),
            Err(e) => { failed += 1; warn!(round, stage, participant = %id, error = %e, "participant_failed"); }
        }
    }
    FL_METRICS.participant_results_total.inc_by(ok.len() as u64);
    FL_METRICS.participant_failures_total.inc_by(failed as u64);
    (ok, failed)
}

impl<C: DistributionChannel, S: Strategy> RoundOrchestrator<C, S> {
    pub fn new(channel: C, strategy: S, config: ServerConfig) -> Self { Self { channel, strategy, config } }

    pub fn channel(&self) -> &C { &self.channel }
    pub fn strategy(&self) -> &S { &self.strategy }

    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<History, RunError> {
        let mut history = History::new();
        info!(run_id = %history.run_id, num_rounds = self.config.num_rounds, "run_started");
        let mut parameters = self.initial_parameters().await?;
        history.initial_evaluation = self.strategy.evaluate(0, &parameters, false);
        if let Some(initial) = &history.initial_evaluation {
            FL_METRICS.centralized_evaluations_total.inc();
            info!(loss = initial.loss, metrics = ?initial.metrics, "initial_evaluation");
        }

        for round in 1..=self.config.num_rounds {
            let started = Instant::now();
            FL_METRICS.current_round.set(round as i64);
            let mut record = RoundRecord::new(round);

            let fit = self.fit_round(round, &parameters).await?;
            (parameters, record.fit_metrics) = fit.value;
            record.fit_participants = fit.succeeded;
            record.fit_failures = fit.failed;

            record.centralized = self.strategy.evaluate(round, &parameters, round == self.config.num_rounds);
            if let Some(c) = &record.centralized {
                FL_METRICS.centralized_evaluations_total.inc();
                info!(round, loss = c.loss, metrics = ?c.metrics, "centralized_evaluation");
            }

            if let Some(eval) = self.evaluate_round(round, &parameters).await? {
                (record.distributed_loss, record.evaluate_metrics) = (Some(eval.value.0), eval.value.1);
                record.evaluate_participants = eval.succeeded;
                record.evaluate_failures = eval.failed;
            }

            record.completed_at = Utc::now();
            info!(round, fit_metrics = ?record.fit_metrics, evaluate_metrics = ?record.evaluate_metrics,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, "round_completed");
            history.push(record)?;
            FL_METRICS.rounds_total.inc();
        }
        info!(run_id = %history.run_id, rounds = history.len(), "run_completed");
        Ok(history)
    }

    async fn initial_parameters(&self) -> Result<Parameters, RunError> {
        if let Some(p) = self.strategy.initialize_parameters() {
            info!("initial_parameters_from_strategy");
            return Ok(p);
        }
        let available = self.channel.wait_for_participants(1, self.config.availability_timeout).await?;
        let source = available.first().ok_or(ChannelError::InsufficientParticipants { required: 1, available: 0 })?;
        let params = self.bounded(source, self.channel.get_parameters(source)).await?;
        info!(participant = %source, shape = ?params.shape(), "initial_parameters_from_participant");
        Ok(params)
    }

    async fn available(&self) -> Result<Vec<ParticipantId>, RunError> {
        let min = self.strategy.min_available_participants();
        Ok(self.channel.wait_for_participants(min, self.config.availability_timeout).await?)
    }

    async fn bounded<T, F>(&self, id: &ParticipantId, call: F) -> Result<T, ChannelError>
    where F: Future<Output = Result<T, ChannelError>> {
        match self.config.round_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| Err(ChannelError::Timeout { id: id.clone() })),
            None => call.await,
        }
    }

    async fn fit_round(&self, round: RoundIndex, parameters: &Parameters) -> Result<StageOutcome<(Parameters, Option<Metrics>)>, RunError> {
        let available = self.available().await?;
        let plan = self.strategy.configure_fit(round, parameters, &available);
        info!(round, selected = plan.len(), available = available.len(), "fit_round_started");
        let replies = join_all(plan.into_iter().map(|(id, ins)| async move {
            let reply = self.bounded(&id, self.channel.fit(&id, ins)).await;
            (id, reply)
        })).await;
        let (results, failed) = split_replies(round, "fit", replies);
        let aggregation_started = Instant::now();
        let value = self.strategy.aggregate_fit(round, &results).map_err(|source| RunError::Aggregation { round, source })?;
        FL_METRICS.aggregation_latency_ms.observe(aggregation_started.elapsed().as_secs_f64() * 1000.0);
        Ok(StageOutcome { value, succeeded: results.len(), failed })
    }

    async fn evaluate_round(&self, round: RoundIndex, parameters: &Parameters) -> Result<Option<StageOutcome<(f64, Option<Metrics>)>>, RunError> {
        if !self.strategy.distributed_evaluation_enabled() { return Ok(None); }
        let available = self.available().await?;
        let plan = self.strategy.configure_evaluate(round, parameters, &available);
        if plan.is_empty() { return Ok(None); }
        info!(round, selected = plan.len(), "evaluate_round_started");
        let replies = join_all(plan.into_iter().map(|(id, ins)| async move {
            let reply = self.bounded(&id, self.channel.evaluate(&id, ins)).await;
            (id, reply)
        })).await;
        let (results, failed) = split_replies(round, "evaluate", replies);
        let value = self.strategy.aggregate_evaluate(round, &results).map_err(|source| RunError::Aggregation { round, source })?;
        Ok(Some(StageOutcome { value, succeeded: results.len(), failed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use async_trait::async_trait;
    use crate::federated_learning::aggregate::WeightedAverage;
    use crate::federated_learning::channel::{LocalChannel, Participant};
    use crate::federated_learning::evaluator::EvaluationError;
    use crate::federated_learning::round_config::RoundConfigBuilder;
    use crate::federated_learning::strategy::{FedAvg, FedAvgOptions};
    use crate::federated_learning::types::{CentralizedEvalResult, EvaluateIns, EvaluateRes, FitIns, FitRes};

    /// Reports a fixed accuracy and nudges every weight by +1 per fit.
    struct Scripted { samples: u64, accuracy: f64, fail_fit: bool, fits: AtomicUsize }

    impl Scripted {
        fn new(samples: u64, accuracy: f64) -> Arc<Self> { Arc::new(Self { samples, accuracy, fail_fit: false, fits: AtomicUsize::new(0) }) }
        fn failing() -> Arc<Self> { Arc::new(Self { samples: 1, accuracy: 0.0, fail_fit: true, fits: AtomicUsize::new(0) }) }
    }

    #[async_trait]
    impl Participant for Scripted {
        async fn get_parameters(&self) -> anyhow::Result<Parameters> { Ok(Parameters::new(vec![vec![0.0, 0.0]])) }
        async fn fit(&self, ins: FitIns) -> anyhow::Result<FitRes> {
            self.fits.fetch_add(1, Ordering::SeqCst);
            if self.fail_fit { anyhow::bail!("device lost"); }
            anyhow::ensure!(ins.config.contains_key("epochs") && ins.config.contains_key("lr"), "missing round config");
            let tensors: Vec<Vec<f32>> = ins.parameters.tensors.iter().map(|t| t.iter().map(|v| v + 1.0).collect()).collect();
            Ok(FitRes { parameters: Parameters::new(tensors), sample_count: self.samples, metrics: Metrics::from([("accuracy".into(), self.accuracy)]) })
        }
        async fn evaluate(&self, _ins: EvaluateIns) -> anyhow::Result<EvaluateRes> {
            if self.fail_fit { anyhow::bail!("device lost"); }
            Ok(EvaluateRes { loss: 1.0 - self.accuracy, sample_count: self.samples, metrics: Metrics::from([("accuracy".into(), self.accuracy)]) })
        }
    }

    fn strategy(min: usize) -> FedAvg {
        FedAvg::builder()
            .options(FedAvgOptions { min_fit_participants: min, min_evaluate_participants: min, min_available_participants: min, ..Default::default() })
            .on_fit_config(RoundConfigBuilder::new(1, 0.01).into_fn())
            .fit_metrics_aggregation(WeightedAverage::accuracy().into_fn())
            .evaluate_metrics_aggregation(WeightedAverage::accuracy().into_fn())
            .build()
    }

    #[tokio::test]
    async fn two_rounds_produce_two_records() {
        let channel = LocalChannel::new()
            .with_participant("a", Scripted::new(10, 0.8))
            .with_participant("b", Scripted::new(20, 0.6))
            .with_participant("c", Scripted::new(30, 0.9));
        let orchestrator = RoundOrchestrator::new(channel, strategy(3), ServerConfig::new(2));
        let history = orchestrator.run().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.rounds().iter().map(|r| r.round).collect::<Vec<_>>(), vec![1, 2]);
        for record in history.rounds() {
            assert!((record.fit_metrics.as_ref().unwrap()["accuracy"] - 47.0 / 60.0).abs() < 1e-9);
            assert_eq!(record.fit_participants, 3);
            assert_eq!(record.evaluate_participants, 3);
            assert!(record.distributed_loss.is_some());
        }
    }

    #[tokio::test]
    async fn failed_participant_is_excluded_not_zero_weighted() {
        let bad = Scripted::failing();
        let channel = LocalChannel::new()
            .with_participant("good", Scripted::new(5, 0.75))
            .with_participant("bad", bad.clone());
        let orchestrator = RoundOrchestrator::new(channel, strategy(2), ServerConfig::new(3));
        let history = orchestrator.run().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(bad.fits.load(Ordering::SeqCst), 3);
        for record in history.rounds() {
            assert_eq!(record.fit_metrics.as_ref().unwrap()["accuracy"], 0.75);
            assert_eq!((record.fit_participants, record.fit_failures), (1, 1));
            assert_eq!((record.evaluate_participants, record.evaluate_failures), (1, 1));
        }
    }

    #[tokio::test]
    async fn round_without_results_aborts_run() {
        let channel = LocalChannel::new().with_participant("x", Scripted::failing()).with_participant("y", Scripted::failing());
        let orchestrator = RoundOrchestrator::new(channel, strategy(2), ServerConfig::new(2));
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, RunError::Aggregation { round: 1, source: AggregationError::Empty }));
    }

    #[tokio::test]
    async fn parameters_are_carried_between_rounds_and_scored_centrally() {
        let evaluator = |_: RoundIndex, p: &Parameters| -> Result<CentralizedEvalResult, EvaluationError> {
            Ok(CentralizedEvalResult { loss: p.tensors[0][0] as f64, metrics: Metrics::new() })
        };
        let strategy = FedAvg::builder()
            .options(FedAvgOptions { min_fit_participants: 1, min_evaluate_participants: 1, min_available_participants: 1, fraction_evaluate: 0.0, ..Default::default() })
            .fit_metrics_aggregation(WeightedAverage::accuracy().into_fn())
            .evaluator(Arc::new(evaluator))
            .initial_parameters(Parameters::new(vec![vec![10.0]]))
            .build();
        let channel = LocalChannel::new().with_participant("solo", Scripted::new(4, 0.5));
        let history = RoundOrchestrator::new(channel, strategy, ServerConfig::new(3)).run().await.unwrap();
        assert_eq!(history.initial_evaluation.as_ref().unwrap().loss, 10.0);
        let losses: Vec<f64> = history.rounds().iter().map(|r| r.centralized.as_ref().unwrap().loss).collect();
        assert_eq!(losses, vec![11.0, 12.0, 13.0]);
        assert!(history.rounds().iter().all(|r| r.evaluate_metrics.is_none() && r.distributed_loss.is_none()));
    }

    /// Local channel that loses every participant after the first availability check.
    struct Shrinking { inner: LocalChannel, checks: AtomicUsize }

    #[async_trait]
    impl DistributionChannel for Shrinking {
        async fn wait_for_participants(&self, min: usize, timeout: Duration) -> Result<Vec<ParticipantId>, ChannelError> {
            if self.checks.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ChannelError::InsufficientParticipants { required: min, available: 0 });
            }
            self.inner.wait_for_participants(min, timeout).await
        }
        async fn get_parameters(&self, participant: &ParticipantId) -> Result<Parameters, ChannelError> { self.inner.get_parameters(participant).await }
        async fn fit(&self, participant: &ParticipantId, ins: FitIns) -> Result<FitRes, ChannelError> { self.inner.fit(participant, ins).await }
        async fn evaluate(&self, participant: &ParticipantId, ins: EvaluateIns) -> Result<EvaluateRes, ChannelError> { self.inner.evaluate(participant, ins).await }
    }

    #[tokio::test]
    async fn disabled_evaluation_does_not_wait_for_participants() {
        let channel = Shrinking { inner: LocalChannel::new().with_participant("a", Scripted::new(3, 0.6)), checks: AtomicUsize::new(0) };
        let strategy = FedAvg::builder()
            .options(FedAvgOptions { min_fit_participants: 1, min_evaluate_participants: 1, min_available_participants: 1, fraction_evaluate: 0.0, ..Default::default() })
            .initial_parameters(Parameters::new(vec![vec![0.0]]))
            .fit_metrics_aggregation(WeightedAverage::accuracy().into_fn())
            .build();
        let orchestrator = RoundOrchestrator::new(channel, strategy, ServerConfig::new(1));
        let history = orchestrator.run().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(orchestrator.channel().checks.load(Ordering::SeqCst), 1);
        assert!(history.rounds()[0].distributed_loss.is_none());
    }

    struct Stalled;

    #[async_trait]
    impl Participant for Stalled {
        async fn get_parameters(&self) -> anyhow::Result<Parameters> { Ok(Parameters::default()) }
        async fn fit(&self, _ins: FitIns) -> anyhow::Result<FitRes> { futures::future::pending().await }
        async fn evaluate(&self, _ins: EvaluateIns) -> anyhow::Result<EvaluateRes> { futures::future::pending().await }
    }

    #[tokio::test]
    async fn stalled_participant_times_out() {
        let channel = LocalChannel::new().with_participant("live", Scripted::new(2, 0.4)).with_participant("stalled", Arc::new(Stalled));
        let config = ServerConfig { round_timeout: Some(Duration::from_millis(50)), ..ServerConfig::new(1) };
        let history = RoundOrchestrator::new(channel, strategy(2), config).run().await.unwrap();
        assert_eq!(history.rounds()[0].fit_failures, 1);
        assert_eq!(history.rounds()[0].fit_metrics.as_ref().unwrap()["accuracy"], 0.4);
    }
}
