//! Per-round instructions dispatched to every selected participant.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::federated_learning::types::{RoundConfig, RoundIndex, Scalar};

pub const EPOCHS_KEY: &str = "epochs";
pub const LR_KEY: &str = "lr";

pub type OnRoundConfigFn = Arc<dyn Fn(RoundIndex) -> RoundConfig + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr * gamma^((round - 1) / every)`
    StepDecay { gamma: f64, every: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoundConfigBuilder {
    epochs: u32,
    learning_rate: f64,
    schedule: LrSchedule,
}

impl RoundConfigBuilder {
    pub fn new(epochs: u32, learning_rate: f64) -> Self {
        Self { epochs, learning_rate, schedule: LrSchedule::Constant }
    }

    pub fn with_schedule(mut self, schedule: LrSchedule) -> Self { self.schedule = schedule; self }

    pub fn learning_rate_for(&self, round: RoundIndex) -> f64 {
        match self.schedule {
            LrSchedule::Constant => self.learning_rate,
            LrSchedule::StepDecay { gamma, every } => {
                let steps = round.saturating_sub(1) / every.max(1);
                self.learning_rate * gamma.powi(steps.min(i32::MAX as u64) as i32)
            }
        }
    }

    /// Exactly `epochs` and `lr`; the same payload goes to every participant of the round.
    pub fn build(&self, round: RoundIndex) -> RoundConfig {
        RoundConfig::from([
            (EPOCHS_KEY.to_string(), Scalar::from(self.epochs)),
            (LR_KEY.to_string(), Scalar::from(self.learning_rate_for(round))),
        ])
    }

    pub fn into_fn(self) -> OnRoundConfigFn { Arc::new(move |round| self.build(round)) }
}
