//! Round-by-round record of a run and its two on-disk renderings.
//!
//! The structured artifact is versioned JSON (`{"version": 1, "history": {...}}`);
//! the text artifact is the `Display` form. Both are written once, after the last round.

use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use crate::federated_learning::types::{float_repr, CentralizedEvalResult, Metrics, RoundIndex};

pub const HISTORY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported history format version {0}")]
    UnsupportedVersion(u32),
    #[error("round {found} appended out of order, expected {expected}")]
    OutOfOrder { expected: RoundIndex, found: RoundIndex },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: RoundIndex,
    #[serde(with = "float_repr::metrics::option")]
    pub fit_metrics: Option<Metrics>,
    pub fit_participants: usize,
    pub fit_failures: usize,
    #[serde(with = "float_repr::metrics::option")]
    pub evaluate_metrics: Option<Metrics>,
    #[serde(with = "float_repr::option")]
    pub distributed_loss: Option<f64>,
    pub evaluate_participants: usize,
    pub evaluate_failures: usize,
    pub centralized: Option<CentralizedEvalResult>,
    pub completed_at: DateTime<Utc>,
}

impl RoundRecord {
    pub fn new(round: RoundIndex) -> Self {
        Self {
            round,
            fit_metrics: None,
            fit_participants: 0,
            fit_failures: 0,
            evaluate_metrics: None,
            distributed_loss: None,
            evaluate_participants: 0,
            evaluate_failures: 0,
            centralized: None,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub run_id: Uuid,
    pub initial_evaluation: Option<CentralizedEvalResult>,
    rounds: Vec<RoundRecord>,
}

impl Default for History {
    fn default() -> Self { Self::new() }
}

impl History {
    pub fn new() -> Self { Self { run_id: Uuid::new_v4(), initial_evaluation: None, rounds: Vec::new() } }

    /// Appends the next round; rounds must arrive as 1, 2, 3, ...
    pub fn push(&mut self, record: RoundRecord) -> Result<(), HistoryError> {
        let expected = self.rounds.last().map(|r| r.round + 1).unwrap_or(1);
        if record.round != expected { return Err(HistoryError::OutOfOrder { expected, found: record.round }); }
        self.rounds.push(record);
        Ok(())
    }

    pub fn rounds(&self) -> &[RoundRecord] { &self.rounds }
    pub fn len(&self) -> usize { self.rounds.len() }
    pub fn is_empty(&self) -> bool { self.rounds.is_empty() }

    pub fn fit_series(&self, key: &str) -> Vec<(RoundIndex, f64)> {
        self.rounds.iter().filter_map(|r| r.fit_metrics.as_ref()?.get(key).map(|v| (r.round, *v))).collect()
    }

    pub fn evaluate_series(&self, key: &str) -> Vec<(RoundIndex, f64)> {
        self.rounds.iter().filter_map(|r| r.evaluate_metrics.as_ref()?.get(key).map(|v| (r.round, *v))).collect()
    }

    /// Centralized results including the initial evaluation as round 0.
    pub fn centralized_series(&self) -> Vec<(RoundIndex, &CentralizedEvalResult)> {
        self.initial_evaluation.iter().map(|e| (0, e))
            .chain(self.rounds.iter().filter_map(|r| r.centralized.as_ref().map(|c| (r.round, c))))
            .collect()
    }
}

fn write_series(f: &mut fmt::Formatter<'_>, title: &str, series: &[(RoundIndex, f64)]) -> fmt::Result {
    writeln!(f, "History ({title}):")?;
    for (round, value) in series { writeln!(f, "\tround {round}: {value}")?; }
    Ok(())
}

fn metric_keys<'a>(maps: impl Iterator<Item = &'a Metrics>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = maps.flat_map(|m| m.keys().map(String::as_str)).collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "History (run {}, {} rounds)", self.run_id, self.rounds.len())?;
        let distributed: Vec<_> = self.rounds.iter().filter_map(|r| r.distributed_loss.map(|l| (r.round, l))).collect();
        if !distributed.is_empty() { write_series(f, "loss, distributed", &distributed)?; }
        let centralized = self.centralized_series();
        if !centralized.is_empty() {
            let losses: Vec<_> = centralized.iter().map(|(r, c)| (*r, c.loss)).collect();
            write_series(f, "loss, centralized", &losses)?;
        }
        for key in metric_keys(self.rounds.iter().filter_map(|r| r.fit_metrics.as_ref())) {
            write_series(f, &format!("metrics, distributed, fit, {key}"), &self.fit_series(key))?;
        }
        for key in metric_keys(self.rounds.iter().filter_map(|r| r.evaluate_metrics.as_ref())) {
            write_series(f, &format!("metrics, distributed, evaluate, {key}"), &self.evaluate_series(key))?;
        }
        for key in metric_keys(centralized.iter().map(|(_, c)| &c.metrics)) {
            let series: Vec<_> = centralized.iter().filter_map(|(r, c)| c.metrics.get(key).map(|v| (*r, *v))).collect();
            write_series(f, &format!("metrics, centralized, {key}"), &series)?;
        }
        writeln!(f, "Participation:")?;
        for r in &self.rounds {
            writeln!(f, "\tround {}: fit {} ok / {} failed, evaluate {} ok / {} failed, completed {}",
                r.round, r.fit_participants, r.fit_failures, r.evaluate_participants, r.evaluate_failures, r.completed_at.to_rfc3339())?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct HistoryFileRef<'a> { version: u32, history: &'a History }

#[derive(Deserialize)]
struct HistoryFile { version: u32, history: History }

fn write_file(path: &Path, contents: &[u8]) -> Result<(), HistoryError> {
    std::fs::write(path, contents).map_err(|source| HistoryError::Io { path: path.to_path_buf(), source })
}

/// Writes the structured artifact, then the text artifact. A text-write failure
/// surfaces after the structured file already exists; that file is left in place.
pub fn save_history(history: &History, path_structured: &Path, path_text: &Path) -> Result<(), HistoryError> {
    let json = serde_json::to_vec_pretty(&HistoryFileRef { version: HISTORY_FORMAT_VERSION, history })?;
    write_file(path_structured, &json)?;
    info!(path = %path_structured.display(), rounds = history.len(), "history_saved_structured");
    write_file(path_text, history.to_string().as_bytes())?;
    info!(path = %path_text.display(), "history_saved_text");
    Ok(())
}

pub fn load_history(path: &Path) -> Result<History, HistoryError> {
    let bytes = std::fs::read(path).map_err(|source| HistoryError::Io { path: path.to_path_buf(), source })?;
    let file: HistoryFile = serde_json::from_slice(&bytes)?;
    if file.version != HISTORY_FORMAT_VERSION { return Err(HistoryError::UnsupportedVersion(file.version)); }
    Ok(file.history)
}
