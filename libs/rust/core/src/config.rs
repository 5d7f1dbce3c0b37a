//! Static run configuration.
//!
//! Layered with the `config` crate: defaults, then `FEDROUND_CONFIG_FILE`, then a
//! YAML document fetched from `FEDROUND_CONFIG_HTTP`, then `FEDROUND__*` env vars.

use std::path::PathBuf;
use std::time::Duration;
use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::{info, warn};
use crate::federated_learning::round_config::{LrSchedule, RoundConfigBuilder};
use crate::federated_learning::server::ServerConfig;
use crate::federated_learning::strategy::FedAvgOptions;

pub use ::config::FileFormat;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FlConfig {
    pub service_name: String,
    pub config_version: Option<String>,
    /// NATS URL participants connect through.
    pub server_address: String,
    pub subject_prefix: String,
    pub num_rounds: u64,
    pub epochs: u32,
    pub learning_rate: f64,
    pub lr_decay_gamma: Option<f64>,
    pub lr_decay_every: Option<u64>,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_participants: usize,
    pub min_evaluate_participants: usize,
    pub min_available_participants: usize,
    pub centralized_eval_every: u64,
    pub round_timeout_secs: Option<u64>,
    pub availability_timeout_secs: u64,
    pub testset_path: Option<PathBuf>,
    pub history_path_json: PathBuf,
    pub history_path_txt: PathBuf,
    pub health_port: u16,
    pub metric_keys: Vec<String>,
}

impl FlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_rounds == 0 { bail!("num_rounds must be at least 1"); }
        if self.epochs == 0 { bail!("epochs must be at least 1"); }
        if !(self.learning_rate > 0.0) { bail!("learning_rate must be positive, got {}", self.learning_rate); }
        for (name, v) in [("fraction_fit", self.fraction_fit), ("fraction_evaluate", self.fraction_evaluate)] {
            if !(0.0..=1.0).contains(&v) { bail!("{name} must be within [0, 1], got {v}"); }
        }
        if self.metric_keys.is_empty() { bail!("metric_keys must name at least one metric"); }
        if self.history_path_json == self.history_path_txt { bail!("history_path_json and history_path_txt must differ"); }
        match (self.lr_decay_gamma, self.lr_decay_every) {
            (Some(_), None) | (None, Some(_)) => bail!("lr_decay_gamma and lr_decay_every must be set together"),
            (Some(_), Some(0)) => bail!("lr_decay_every must be at least 1"),
            _ => {}
        }
        Ok(())
    }

    pub fn lr_schedule(&self) -> LrSchedule {
        match (self.lr_decay_gamma, self.lr_decay_every) {
            (Some(gamma), Some(every)) => LrSchedule::StepDecay { gamma, every },
            _ => LrSchedule::Constant,
        }
    }

    pub fn round_config(&self) -> RoundConfigBuilder {
        RoundConfigBuilder::new(self.epochs, self.learning_rate).with_schedule(self.lr_schedule())
    }

    pub fn strategy_options(&self) -> FedAvgOptions {
        FedAvgOptions {
            fraction_fit: self.fraction_fit,
            fraction_evaluate: self.fraction_evaluate,
            min_fit_participants: self.min_fit_participants,
            min_evaluate_participants: self.min_evaluate_participants,
            min_available_participants: self.min_available_participants,
            centralized_eval_every: self.centralized_eval_every,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            num_rounds: self.num_rounds,
            round_timeout: self.round_timeout_secs.map(Duration::from_secs),
            availability_timeout: Duration::from_secs(self.availability_timeout_secs),
        }
    }
}

fn defaults(service: &str) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    Ok(config::Config::builder()
        .set_default("service_name", service)?
        .set_default("config_version", "0")?
        .set_default("server_address", "127.0.0.1:4222")?
        .set_default("subject_prefix", "fl")?
        .set_default("num_rounds", 3)?
        .set_default("epochs", 1)?
        .set_default("learning_rate", 0.01)?
        .set_default("fraction_fit", 1.0)?
        .set_default("fraction_evaluate", 1.0)?
        .set_default("min_fit_participants", 2)?
        .set_default("min_evaluate_participants", 2)?
        .set_default("min_available_participants", 2)?
        .set_default("centralized_eval_every", 1)?
        .set_default("availability_timeout_secs", 300)?
        .set_default("history_path_json", "history.json")?
        .set_default("history_path_txt", "history.txt")?
        .set_default("health_port", 9095)?
        .set_default("metric_keys", vec!["accuracy"])?)
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("FEDROUND")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("metric_keys")
}

/// Defaults overlaid with an optional YAML/TOML/JSON document (no env, no network).
pub fn from_str(service: &str, text: &str, format: FileFormat) -> Result<FlConfig> {
    let cfg = defaults(service)?.add_source(config::File::from_str(text, format)).build()?;
    Ok(cfg.try_deserialize()?)
}

pub async fn load_config(service: &str) -> Result<FlConfig> {
    let mut builder = defaults(service)?;
    if let Ok(file) = std::env::var("FEDROUND_CONFIG_FILE") {
        info!(%file, "config_file_source");
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("FEDROUND_CONFIG_HTTP") {
        match reqwest::get(http_url.clone()).await {
            Ok(resp) => {
                let text = resp.error_for_status()?.text().await?;
                builder = builder.add_source(config::File::from_str(&text, FileFormat::Yaml));
                info!(url = %http_url, "config_http_source");
            }
            Err(e) => warn!(url = %http_url, error = %e, "config_http_unreachable"),
        }
    }
    let cfg = builder.add_source(env_source()).build()?;
    Ok(cfg.try_deserialize()?)
}
