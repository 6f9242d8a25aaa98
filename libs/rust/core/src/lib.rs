//! Core shared utilities for the round aggregation coordinator.

use anyhow::{bail, Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use config::builder::DefaultState;
use config::ConfigBuilder;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod federated_learning;

pub use federated_learning::{
    aggregate, drain_completions, AggregationError, ChannelSink, CompletionTrigger, CompletionWorker, MemoryModelStore, Model, ModelStore,
    RoundCoordinator, RoundDefaults, RoundError, RoundOutcome, RoundRegistry, RoundSink, RoundStart, Subjects,
    TimeoutMonitor, TimeoutMonitorConfig, UpdateRecord,
};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `ROUNDS_JSON_LOG=1|true` switches to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("ROUNDS_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
        tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init()?;
        Ok(())
    })?;
    info!(target: "round-core", service, "tracing initialized");
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    pub service_name: String,
    pub nats_url: String,
    pub log_level: String,
    pub subject_prefix: String,
    pub default_k_of_n: usize,
    pub default_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub completed_retention_secs: u64,
    pub health_port: u16,
    pub store_path: String,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_k_of_n == 0 { bail!("default_k_of_n must be positive"); }
        if self.default_timeout_secs == 0 { bail!("default_timeout_secs must be positive"); }
        if self.monitor_interval_secs == 0 { bail!("monitor_interval_secs must be positive"); }
        if self.subject_prefix.is_empty() { bail!("subject_prefix must not be empty"); }
        Ok(())
    }

    pub fn round_defaults(&self) -> RoundDefaults {
        RoundDefaults { k_of_n: self.default_k_of_n, timeout: Duration::from_secs(self.default_timeout_secs) }
    }

    pub fn monitor_config(&self) -> TimeoutMonitorConfig {
        TimeoutMonitorConfig { interval: Duration::from_secs(self.monitor_interval_secs), completed_retention: Duration::from_secs(self.completed_retention_secs) }
    }

    pub fn subjects(&self) -> Subjects { Subjects::new(self.subject_prefix.clone()) }
}

fn base_builder(service: &str) -> Result<ConfigBuilder<DefaultState>> {
    Ok(config::Config::builder()
        .set_default("service_name", service)?
        .set_default("nats_url", "127.0.0.1:4222")?
        .set_default("log_level", "info")?
        .set_default("subject_prefix", "fl")?
        .set_default("default_k_of_n", 3)?
        .set_default("default_timeout_secs", 60)?
        .set_default("monitor_interval_secs", 5)?
        .set_default("completed_retention_secs", 3600)?
        .set_default("health_port", 8090)?
        .set_default("store_path", "./data/models")?)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<CoordinatorConfig> {
    let cfg: CoordinatorConfig = builder.build()?.try_deserialize().context("invalid coordinator config")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Defaults, then the file named by `ROUNDS_CONFIG_FILE`, then `ROUNDS__*` environment overrides.
pub fn load_config(service: &str) -> Result<CoordinatorConfig> {
    let mut builder = base_builder(service)?;
    if let Ok(file) = std::env::var("ROUNDS_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("ROUNDS").separator("__"));
    finish(builder)
}

pub fn config_from_yaml(service: &str, text: &str) -> Result<CoordinatorConfig> {
    finish(base_builder(service)?.add_source(config::File::from_str(text, config::FileFormat::Yaml)))
}

/// Binds the health endpoints and serves them on a spawned task. The returned handle owns
/// the server's `RoundCoordinator` reference until it is aborted.
pub async fn start_health_server(port: u16, coordinator: Arc<RoundCoordinator>) -> Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(status_handler))
        .with_state(coordinator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind health server on {addr}"))?;
    tracing::info!(?addr, "Health server listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "Health server failed");
        }
    }))
}

async fn status_handler(State(coordinator): State<Arc<RoundCoordinator>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "live": NODE_LIVENESS.load(Ordering::SeqCst),
        "ready": NODE_READINESS.load(Ordering::SeqCst),
        "rounds": coordinator.status(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_sources() {
        let cfg = finish(base_builder("coordinator").unwrap()).unwrap();
        assert_eq!(cfg.service_name, "coordinator");
        assert_eq!(cfg.round_defaults(), RoundDefaults::default());
        assert_eq!(cfg.monitor_config().interval, Duration::from_secs(5));
        assert_eq!(cfg.subjects().round_start(), "fl.round.start");
    }

    #[test]
    fn yaml_overrides_defaults() {
        let cfg = config_from_yaml("coordinator", "default_timeout_secs: 30\nsubject_prefix: lab\n").unwrap();
        assert_eq!(cfg.default_timeout_secs, 30);
        assert_eq!(cfg.subjects().model_global(), "lab.model.global");
        assert_eq!(cfg.default_k_of_n, 3);
    }

    #[test]
    fn zero_quorum_is_rejected() {
        assert!(config_from_yaml("coordinator", "default_k_of_n: 0\n").is_err());
    }
}
