//! NATS-backed distribution channel.
//!
//! Participants announce themselves on `<prefix>.register`; work is dispatched with
//! request/reply on `<prefix>.participant.<id>.<verb>`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;
use async_nats::client::RequestErrorKind;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use fedround_core::federated_learning::wire::{participant_subject, register_subject, validate_participant_id, Hello, Reply, Verb};
use fedround_core::federated_learning::{
    ChannelError, DistributionChannel, EvaluateIns, EvaluateRes, FitIns, FitRes, Parameters, ParticipantId,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

type Registry = Arc<RwLock<BTreeSet<ParticipantId>>>;

pub struct NatsChannel {
    client: async_nats::Client,
    prefix: String,
    registry: Registry,
    listener: JoinHandle<()>,
}

impl NatsChannel {
    /// `request_timeout` bounds every NATS request; `None` leaves it to the orchestrator.
    pub async fn connect(address: &str, prefix: &str, request_timeout: Option<Duration>) -> Result<Self> {
        let client = async_nats::ConnectOptions::new().request_timeout(request_timeout).connect(address).await?;
        info!(%address, %prefix, "nats_connected");
        Self::with_client(client, prefix).await
    }

    pub async fn with_client(client: async_nats::Client, prefix: &str) -> Result<Self> {
        let registry: Registry = Arc::default();
        let sub = client.subscribe(register_subject(prefix)).await?;
        client.flush().await?;
        let listener = tokio::spawn(run_registration_loop(client.clone(), sub, registry.clone()));
        Ok(Self { client, prefix: prefix.to_string(), registry, listener })
    }

    pub fn registered(&self) -> Vec<ParticipantId> { self.registry.read().iter().cloned().collect() }

    async fn call<Req, Res>(&self, id: &ParticipantId, verb: Verb, body: &Req) -> Result<Res, ChannelError>
    where Req: Serialize + Sync, Res: DeserializeOwned {
        let subject = participant_subject(&self.prefix, id, verb);
        let payload = serde_json::to_vec(body)?;
        let msg = match self.client.request(subject, payload.into()).await {
            Ok(msg) => msg,
            Err(e) => {
                if matches!(e.kind(), RequestErrorKind::NoResponders) {
                    self.registry.write().remove(id);
                    warn!(participant = %id, verb = verb.as_str(), "participant_deregistered");
                }
                return Err(request_failure(e.kind(), id, e.to_string()));
            }
        };
        let reply: Reply<Res> = serde_json::from_slice(&msg.payload)?;
        reply.into_result().map_err(|reason| ChannelError::Participant { id: id.clone(), reason })
    }
}

impl Drop for NatsChannel {
    fn drop(&mut self) { self.listener.abort(); }
}

fn request_failure(kind: RequestErrorKind, id: &ParticipantId, detail: String) -> ChannelError {
    match kind {
        RequestErrorKind::TimedOut => ChannelError::Timeout { id: id.clone() },
        RequestErrorKind::NoResponders => ChannelError::Transport(format!("no responders for {id}")),
        _ => ChannelError::Transport(detail),
    }
}

/// Registers the sender of a `Hello` payload and returns the acknowledgement to send back.
fn handle_hello(registry: &RwLock<BTreeSet<ParticipantId>>, payload: &[u8]) -> Reply<()> {
    let hello: Hello = match serde_json::from_slice(payload) {
        Ok(h) => h,
        Err(e) => {
            debug!(error = %e, "malformed_hello_rejected");
            return Reply::Error(format!("malformed hello: {e}"));
        }
    };
    if let Err(reason) = validate_participant_id(&hello.participant_id) {
        warn!(%reason, "participant_id_rejected");
        return Reply::Error(reason);
    }
    if registry.write().insert(hello.participant_id.clone()) {
        info!(participant = %hello.participant_id, "participant_registered");
    }
    Reply::Ok(())
}

async fn run_registration_loop(client: async_nats::Client, mut sub: async_nats::Subscriber, registry: Registry) {
    while let Some(msg) = sub.next().await {
        let ack = handle_hello(&registry, &msg.payload);
        if let Some(reply) = msg.reply {
            let body = serde_json::to_vec(&ack).unwrap_or_default();
            if let Err(e) = client.publish(reply, body.into()).await { warn!(error = %e, "register_ack_failed"); }
        }
    }
    info!("registration_loop_ended");
}

#[async_trait]
impl DistributionChannel for NatsChannel {
    async fn wait_for_participants(&self, min: usize, timeout: Duration) -> Result<Vec<ParticipantId>, ChannelError> {
        let started = Instant::now();
        loop {
            let ids = self.registered();
            if ids.len() >= min { return Ok(ids); }
            if started.elapsed() >= timeout {
                return Err(ChannelError::InsufficientParticipants { required: min, available: ids.len() });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn get_parameters(&self, participant: &ParticipantId) -> Result<Parameters, ChannelError> {
        self.call(participant, Verb::GetParameters, &()).await
    }

    async fn fit(&self, participant: &ParticipantId, ins: FitIns) -> Result<FitRes, ChannelError> {
        self.call(participant, Verb::Fit, &ins).await
    }

    async fn evaluate(&self, participant: &ParticipantId, ins: EvaluateIns) -> Result<EvaluateRes, ChannelError> {
        self.call(participant, Verb::Evaluate, &ins).await
    }
}
