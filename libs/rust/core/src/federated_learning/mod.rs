//! Federated learning round coordination (round config, aggregation, history, orchestrator)

pub mod types;
pub mod round_config;
pub mod aggregate;
pub mod dataset;
pub mod evaluator;
pub mod history;
pub mod channel;
pub mod strategy;
pub mod server;
pub mod wire;

pub use types::{
    CentralizedEvalResult, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters, ParticipantId,
    ParticipantResult, RoundConfig, RoundIndex, Scalar,
};
pub use round_config::{LrSchedule, OnRoundConfigFn, RoundConfigBuilder};
pub use aggregate::{fedavg, weighted_loss, AggregationError, MetricsAggregationFn, WeightedAverage};
pub use dataset::{DatasetError, HeldOutSet, Sample};
pub use evaluator::{CentralizedEvaluator, EvaluationError, LinearEvaluator};
pub use history::{load_history, save_history, History, HistoryError, RoundRecord};
pub use channel::{ChannelError, DistributionChannel, LocalChannel, Participant};
pub use strategy::{FedAvg, FedAvgOptions, Strategy};
pub use server::{RoundOrchestrator, RunError, ServerConfig};
