use std::sync::Arc;
use anyhow::{Context, Result};
use tracing::{info, warn};
use fedround_core::federated_learning::{HeldOutSet, LinearEvaluator};
use fedround_core::{save_history, FedAvg, FlConfig, History, RoundOrchestrator, WeightedAverage};
use crate::nats_channel::NatsChannel;

pub struct FederationModule {
    config: FlConfig,
    orchestrator: RoundOrchestrator<NatsChannel, FedAvg>,
}

/// Binds the coordinator's evaluator to the held-out set, loaded once for the run.
pub fn bind_evaluator(config: &FlConfig) -> Result<Option<LinearEvaluator>> {
    let Some(path) = &config.testset_path else {
        warn!("testset_path_unset_centralized_evaluation_disabled");
        return Ok(None);
    };
    let testset = HeldOutSet::load_json(path).with_context(|| format!("loading held-out set {}", path.display()))?;
    info!(path = %path.display(), samples = testset.len(), num_classes = testset.num_classes, "testset_loaded");
    Ok(Some(LinearEvaluator::bind(Arc::new(testset))))
}

pub fn build_strategy(config: &FlConfig, evaluator: Option<LinearEvaluator>) -> FedAvg {
    let metrics = WeightedAverage::new(config.metric_keys.iter().cloned());
    let mut builder = FedAvg::builder()
        .options(config.strategy_options())
        .on_fit_config(config.round_config().into_fn())
        .evaluate_metrics_aggregation(metrics.clone().into_fn())
        .fit_metrics_aggregation(metrics.into_fn());
    if let Some(evaluator) = evaluator { builder = builder.evaluator(Arc::new(evaluator)); }
    builder.build()
}

impl FederationModule {
    pub async fn new(config: FlConfig) -> Result<Self> {
        let strategy = build_strategy(&config, bind_evaluator(&config)?);
        let channel = NatsChannel::connect(&config.server_address, &config.subject_prefix, None).await
            .with_context(|| format!("connecting to {}", config.server_address))?;
        let orchestrator = RoundOrchestrator::new(channel, strategy, config.server_config());
        info!(num_rounds = config.num_rounds, metric_keys = ?config.metric_keys, "federation_module_initialized");
        Ok(Self { config, orchestrator })
    }

    pub async fn run(&self) -> Result<History> {
        Ok(self.orchestrator.run().await?)
    }

    pub fn persist(&self, history: &History) -> Result<()> {
        save_history(history, &self.config.history_path_json, &self.config.history_path_txt)?;
        info!(json = %self.config.history_path_json.display(), text = %self.config.history_path_txt.display(), "history_saved");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(registered = self.orchestrator.channel().registered().len(), "federation_module_shutdown");
        Ok(())
    }
}
