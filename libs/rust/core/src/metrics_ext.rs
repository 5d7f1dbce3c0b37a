//! Prometheus instruments for the federated round loop, registered in the default registry.

use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};

pub struct FederatedLearningMetrics {
    pub rounds_total: IntCounter,
    pub participant_results_total: IntCounter,
    pub participant_failures_total: IntCounter,
    pub centralized_evaluations_total: IntCounter,
    pub aggregation_latency_ms: Histogram,
    pub current_round: IntGauge,
}

pub static FL_METRICS: Lazy<FederatedLearningMetrics> = Lazy::new(|| {
    FederatedLearningMetrics {
        rounds_total: register_int_counter!("fedround_rounds_total", "Federated rounds completed").expect("static metric descriptor"),
        participant_results_total: register_int_counter!("fedround_participant_results_total", "Participant results accepted (fit + evaluate)").expect("static metric descriptor"),
        participant_failures_total: register_int_counter!("fedround_participant_failures_total", "Participant calls that failed or timed out").expect("static metric descriptor"),
        centralized_evaluations_total: register_int_counter!("fedround_centralized_evaluations_total", "Centralized evaluations that produced a score").expect("static metric descriptor"),
        aggregation_latency_ms: register_histogram!("fedround_aggregation_latency_ms", "Fit aggregation latency ms", vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 250.0, 1000.0]).expect("static metric descriptor"),
        current_round: register_int_gauge!("fedround_current_round", "Round currently in progress (0 before the first round)").expect("static metric descriptor"),
    }
});
