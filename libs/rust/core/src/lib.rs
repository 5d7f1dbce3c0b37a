//! Core shared utilities for the federated round coordinator.

use anyhow::Result;
use tracing::info;
use once_cell::sync::OnceCell;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static OTEL_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();
static PROM_INIT: OnceCell<()> = OnceCell::new();
static CONFIG_VERSION: OnceCell<String> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Records the loaded config version for `/status`; first call wins.
pub fn set_config_version(version: impl Into<String>) { let _ = CONFIG_VERSION.set(version.into()); }

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDROUND_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json_layer = json.then(|| fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false));
        let text_layer = (!json).then(|| fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true));
        let otel_layer = match otlp_endpoint(std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()) {
            Some(endpoint) => {
                let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint).build()?;
                let provider = SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .with_resource(Resource::builder().with_service_name(service.to_string()).build())
                    .build();
                let tracer = provider.tracer(service.to_string());
                opentelemetry::global::set_tracer_provider(provider.clone());
                let _ = OTEL_PROVIDER.set(provider);
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            None => None,
        };
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).with(otel_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "fedround", service, otlp = OTEL_PROVIDER.get().is_some(), "tracing_initialized");
    Ok(())
}

/// OTLP span export is on only for a non-blank endpoint.
fn otlp_endpoint(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Flushes buffered spans; a no-op when OTLP export is off.
pub fn shutdown_tracing() {
    if let Some(provider) = OTEL_PROVIDER.get() {
        if let Err(e) = provider.shutdown() { tracing::warn!(error = %e, "otlp_shutdown_failed"); }
    }
}

pub fn init_metrics() -> Result<()> {
    PROM_INIT.get_or_try_init(|| -> Result<()> {
        once_cell::sync::Lazy::force(&FL_METRICS);
        Ok(())
    })?;
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "live": NODE_LIVENESS.load(Ordering::SeqCst),
                "ready": NODE_READINESS.load(Ordering::SeqCst),
                "current_round": FL_METRICS.current_round.get(),
                "config_version": CONFIG_VERSION.get(),
            }))
        }))
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health_server_listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health_server_failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    if PROM_INIT.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

pub mod config;
pub mod federated_learning;
mod metrics_ext;

pub use config::{load_config, FlConfig};
pub use federated_learning::{
    save_history, load_history, FedAvg, FedAvgOptions, History, RoundOrchestrator, RoundConfigBuilder,
    WeightedAverage, Strategy, DistributionChannel, ServerConfig,
};
pub use metrics_ext::{FederatedLearningMetrics, FL_METRICS};
