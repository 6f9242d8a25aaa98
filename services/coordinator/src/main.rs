use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tracing::{info, warn};
use round_core::{clear_ready, drain_completions, init_tracing, load_config, mark_ready, start_health_server, ModelStore, RoundCoordinator, RoundRegistry, TimeoutMonitor};
use tokio::signal;

mod bus;
mod store;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("coordinator-service")?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(?cfg, "config loaded");

    let subjects = cfg.subjects();
    let store = Arc::new(store::SledModelStore::open(&cfg.store_path)?);
    let nc = async_nats::connect(cfg.nats_url.clone()).await.with_context(|| format!("connect to NATS at {}", cfg.nats_url))?;
    info!(nats_url = %cfg.nats_url, "Connected to NATS");

    let sink = Arc::new(bus::NatsSink::new(nc.clone(), subjects.clone()));
    let registry = Arc::new(RoundRegistry::new(cfg.round_defaults()));
    let (coordinator, worker) = RoundCoordinator::new(registry, store.clone(), sink, subjects.model_global())?;
    let coordinator = Arc::new(coordinator);

    let worker = worker.spawn();
    let monitor = TimeoutMonitor::new(coordinator.clone(), cfg.monitor_config()).spawn();
    let health = start_health_server(cfg.health_port, coordinator.clone()).await?;

    let store_dyn: Arc<dyn ModelStore> = store.clone();
    let listeners = vec![
        tokio::spawn(bus::run_round_start_listener(nc.clone(), coordinator.clone(), subjects.clone())),
        tokio::spawn(bus::run_update_listener(nc.clone(), coordinator.clone(), subjects.clone())),
        tokio::spawn(bus::run_latest_model_responder(nc.clone(), store_dyn, subjects.clone())),
    ];
    mark_ready();
    info!("service ready");

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    clear_ready();
    // every task holding a coordinator handle must be gone before the job queue closes
    let tasks: Vec<_> = listeners.into_iter().chain([monitor, health]).collect();
    for t in &tasks { t.abort(); }
    for t in tasks { let _ = t.await; }
    drop(coordinator);
    if drain_completions(worker, SHUTDOWN_GRACE).await { info!("completion_jobs_drained"); }
    if let Err(e) = nc.flush().await { warn!(error=%e, "nats_flush_failed"); }
    store.flush()?;
    info!("shutdown");
    Ok(())
}
