//! Distribution channel seam: how the orchestrator reaches participants.
//!
//! `DistributionChannel` is what the round loop talks to. `LocalChannel` keeps
//! participants in-process (simulation, tests); network-backed channels live in services.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use crate::federated_learning::types::{EvaluateIns, EvaluateRes, FitIns, FitRes, Parameters, ParticipantId};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("participant {0} is not connected")]
    UnknownParticipant(ParticipantId),
    #[error("participant {id} did not reply in time")]
    Timeout { id: ParticipantId },
    #[error("participant {id} failed: {reason}")]
    Participant { id: ParticipantId, reason: String },
    #[error("only {available} of {required} required participants available")]
    InsufficientParticipants { required: usize, available: usize },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait DistributionChannel: Send + Sync {
    /// Currently reachable participants, waiting up to `timeout` for at least `min`.
    async fn wait_for_participants(&self, min: usize, timeout: Duration) -> Result<Vec<ParticipantId>, ChannelError>;
    async fn get_parameters(&self, participant: &ParticipantId) -> Result<Parameters, ChannelError>;
    async fn fit(&self, participant: &ParticipantId, ins: FitIns) -> Result<FitRes, ChannelError>;
    async fn evaluate(&self, participant: &ParticipantId, ins: EvaluateIns) -> Result<EvaluateRes, ChannelError>;
}

/// Opaque local training/evaluation capability a participant exposes.
#[async_trait]
pub trait Participant: Send + Sync {
    async fn get_parameters(&self) -> anyhow::Result<Parameters>;
    async fn fit(&self, ins: FitIns) -> anyhow::Result<FitRes>;
    async fn evaluate(&self, ins: EvaluateIns) -> anyhow::Result<EvaluateRes>;
}

#[derive(Default, Clone)]
pub struct LocalChannel {
    participants: BTreeMap<ParticipantId, Arc<dyn Participant>>,
}

impl LocalChannel {
    pub fn new() -> Self { Self::default() }

    pub fn with_participant(mut self, id: impl Into<ParticipantId>, participant: Arc<dyn Participant>) -> Self {
        self.participants.insert(id.into(), participant);
        self
    }

    pub fn len(&self) -> usize { self.participants.len() }
    pub fn is_empty(&self) -> bool { self.participants.is_empty() }

    fn lookup(&self, id: &ParticipantId) -> Result<&Arc<dyn Participant>, ChannelError> {
        self.participants.get(id).ok_or_else(|| ChannelError::UnknownParticipant(id.clone()))
    }
}

fn participant_error(id: &ParticipantId, e: anyhow::Error) -> ChannelError {
    ChannelError::Participant { id: id.clone(), reason: format!("{e:#}") }
}

#[async_trait]
impl DistributionChannel for LocalChannel {
    async fn wait_for_participants(&self, min: usize, _timeout: Duration) -> Result<Vec<ParticipantId>, ChannelError> {
        if self.participants.len() < min {
            return Err(ChannelError::InsufficientParticipants { required: min, available: self.participants.len() });
        }
        Ok(self.participants.keys().cloned().collect())
    }

    async fn get_parameters(&self, participant: &ParticipantId) -> Result<Parameters, ChannelError> {
        self.lookup(participant)?.get_parameters().await.map_err(|e| participant_error(participant, e))
    }

    async fn fit(&self, participant: &ParticipantId, ins: FitIns) -> Result<FitRes, ChannelError> {
        self.lookup(participant)?.fit(ins).await.map_err(|e| participant_error(participant, e))
    }

    async fn evaluate(&self, participant: &ParticipantId, ins: EvaluateIns) -> Result<EvaluateRes, ChannelError> {
        self.lookup(participant)?.evaluate(ins).await.map_err(|e| participant_error(participant, e))
    }
}
