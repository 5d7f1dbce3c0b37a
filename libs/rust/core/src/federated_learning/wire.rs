//! JSON envelopes exchanged with remote participants.
//!
//! Subjects (relative to a configurable prefix):
//! - `<prefix>.register`: participant announces itself with [`Hello`]
//! - `<prefix>.participant.<id>.<verb>`: request/reply, verb in [`Verb`]

use serde::{Deserialize, Serialize};
use crate::federated_learning::types::ParticipantId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello { pub participant_id: ParticipantId }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb { GetParameters, Fit, Evaluate }

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self { Verb::GetParameters => "get_parameters", Verb::Fit => "fit", Verb::Evaluate => "evaluate" }
    }
}

pub fn register_subject(prefix: &str) -> String { format!("{prefix}.register") }

/// A participant id must be exactly one subject token: non-empty, no `.`, `*`, `>`
/// or whitespace, so `participant_subject` can never widen into a wildcard.
pub fn validate_participant_id(id: &str) -> Result<(), String> {
    if id.is_empty() { return Err("participant id is empty".into()); }
    match id.chars().find(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace() || c.is_control()) {
        Some(c) => Err(format!("participant id {id:?} contains {c:?}")),
        None => Ok(()),
    }
}

pub fn participant_subject(prefix: &str, id: &str, verb: Verb) -> String {
    format!("{prefix}.participant.{id}.{}", verb.as_str())
}

/// Participant reply: `{"status":"ok","body":...}` or `{"status":"error","body":"reason"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Error(String),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, String> {
        match self { Reply::Ok(v) => Ok(v), Reply::Error(reason) => Err(reason) }
    }
}
