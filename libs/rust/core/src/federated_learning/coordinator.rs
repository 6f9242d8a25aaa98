//! Round coordinator façade.
//!
//! Event handlers (round start, update) and the timeout monitor all funnel into
//! [`RoundCoordinator::attempt_completion`]. Whoever wins the registry's CAS queues a
//! [`CompletionJob`]; a single [`CompletionWorker`] drains the queue, aggregates,
//! persists and publishes, so slow collaborators never stall ingestion and model
//! versions are handed out in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::aggregation::{aggregate, total_samples};
use super::error::{CollaboratorError, RegistryError, RoundError};
use super::metrics::{record_outcome, FED_METRICS};
use super::registry::{AppendOutcome, RoundRegistry, RoundSnapshot};
use super::sink::{ModelStore, RoundSink};
use super::types::{CompletionTrigger, ModelVersion, RoundId, RoundOutcome, RoundStart, UpdateRecord};
use super::validate;

/// Work item queued once a round has been atomically marked complete.
#[derive(Debug, Clone)]
pub struct CompletionJob {
    pub round_id: RoundId,
    pub trigger: CompletionTrigger,
    pub updates: Vec<UpdateRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active_rounds: usize,
    pub completed_rounds: usize,
    pub latest_model_version: ModelVersion,
}

pub struct RoundCoordinator {
    registry: Arc<RoundRegistry>,
    jobs: mpsc::UnboundedSender<CompletionJob>,
    published_version: Arc<AtomicU64>,
}

impl RoundCoordinator {
    /// Builds the coordinator and its completion worker. The worker resumes from the
    /// latest model in `store`, or version 0 when the store is empty.
    pub fn new(registry: Arc<RoundRegistry>, store: Arc<dyn ModelStore>, sink: Arc<dyn RoundSink>, model_topic: impl Into<String>) -> Result<(Self, CompletionWorker), CollaboratorError> {
        let version = store.latest()?.map(|m| m.version).unwrap_or(0);
        let published_version = Arc::new(AtomicU64::new(version));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = CompletionWorker { jobs: rx, store, sink, model_topic: model_topic.into(), version, published_version: published_version.clone() };
        info!(model_version = version, "coordinator_initialized");
        Ok((Self { registry, jobs: tx, published_version }, worker))
    }

    pub fn registry(&self) -> &Arc<RoundRegistry> { &self.registry }

    pub fn latest_model_version(&self) -> ModelVersion { self.published_version.load(Ordering::SeqCst) }

    pub fn status(&self) -> CoordinatorStatus {
        let (active_rounds, completed_rounds) = self.registry.counts();
        CoordinatorStatus { active_rounds, completed_rounds, latest_model_version: self.latest_model_version() }
    }

    pub fn on_round_start(&self, start: RoundStart) -> Result<RoundSnapshot, RoundError> {
        if let Some(k) = start.k_of_n {
            if !start.participants.is_empty() && k > start.participants.len() {
                warn!(round_id = %start.round_id, k_of_n = k, participants = start.participants.len(), "quorum_exceeds_participants");
            }
        }
        let timeout = start.timeout_s.map(Duration::from_secs);
        match self.registry.create(&start.round_id, &start.model_uri, start.k_of_n, timeout) {
            Ok(snap) => {
                info!(round_id = %snap.round_id, k_of_n = snap.k_of_n, timeout_s = snap.timeout.as_secs(), model_uri = %snap.model_uri, "round_started");
                Ok(snap)
            }
            Err(RegistryError::AlreadyExists(id)) => {
                warn!(round_id = %id, "duplicate_round_start_ignored");
                Err(RoundError::DuplicateRound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn on_update_received(&self, update: UpdateRecord) -> Result<AppendOutcome, RoundError> {
        let round_id = update.round_id.clone();
        let participant_id = update.participant_id.clone();
        self.registry.get_or_lazy_create(&round_id, &update.base_model_uri);
        match self.registry.append_update(update) {
            Ok(out) => {
                FED_METRICS.updates_total.add(1, &[]);
                debug!(%round_id, %participant_id, count = out.count, "update_appended");
                if out.threshold_reached { self.attempt_completion(&round_id, CompletionTrigger::Quorum); }
                Ok(out)
            }
            Err(RegistryError::RoundAlreadyCompleted(_)) => {
                FED_METRICS.late_updates_total.add(1, &[]);
                warn!(%round_id, %participant_id, "late_update_discarded");
                Err(RoundError::LateUpdate { round_id, participant_id })
            }
            Err(e) => {
                warn!(%round_id, %participant_id, error = %e, "update_not_appended");
                Err(e.into())
            }
        }
    }

    /// Runs the completion CAS and, on success, queues aggregation. Returns whether this
    /// caller won; losers take no further action.
    pub fn attempt_completion(&self, round_id: &str, trigger: CompletionTrigger) -> bool {
        let Some(updates) = self.registry.try_mark_complete(round_id) else {
            debug!(round_id, trigger = trigger.as_str(), "completion_already_claimed");
            return false;
        };
        info!(round_id, trigger = trigger.as_str(), updates = updates.len(), "round_completion_claimed");
        if self.jobs.send(CompletionJob { round_id: round_id.to_string(), trigger, updates }).is_err() {
            error!(round_id, "completion_worker_gone");
        }
        true
    }

    /// Parses and dispatches a round-start payload. Malformed input is logged and dropped.
    pub fn handle_round_start_payload(&self, bytes: &[u8]) -> Result<RoundSnapshot, RoundError> {
        let start = validate::parse_round_start(bytes).inspect_err(log_malformed)?;
        self.on_round_start(start)
    }

    /// Parses and dispatches an update payload. `origin` is the (round, participant)
    /// pair encoded in the subject the payload arrived on, when known.
    pub fn handle_update_payload(&self, bytes: &[u8], origin: Option<(&str, &str)>) -> Result<AppendOutcome, RoundError> {
        let update = validate::parse_update(bytes).inspect_err(log_malformed)?;
        if let Some((round_id, participant_id)) = origin {
            validate::check_update_origin(&update, round_id, participant_id).inspect_err(log_malformed)?;
        }
        self.on_update_received(update)
    }
}

fn log_malformed(e: &RoundError) {
    FED_METRICS.malformed_total.add(1, &[]);
    warn!(error = %e, "malformed_record_discarded");
}

/// Drains completion jobs: aggregate, persist, publish, notify.
pub struct CompletionWorker {
    jobs: mpsc::UnboundedReceiver<CompletionJob>,
    store: Arc<dyn ModelStore>,
    sink: Arc<dyn RoundSink>,
    model_topic: String,
    version: ModelVersion,
    published_version: Arc<AtomicU64>,
}

impl CompletionWorker {
    pub fn spawn(self) -> JoinHandle<()> { tokio::spawn(self.run()) }

    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await { self.process(job).await; }
        info!("completion_worker_stopped");
    }

    /// Processes the next queued job; `None` once every coordinator handle is dropped.
    pub async fn run_once(&mut self) -> Option<RoundOutcome> {
        let job = self.jobs.recv().await?;
        Some(self.process(job).await)
    }

    pub async fn process(&mut self, job: CompletionJob) -> RoundOutcome {
        let CompletionJob { round_id, trigger, updates } = job;
        let num_updates = updates.len();
        let outcome = if updates.is_empty() {
            warn!(%round_id, trigger = trigger.as_str(), "round_aborted_empty");
            RoundOutcome::AbortedEmpty { round_id, completed_at: Utc::now() }
        } else {
            let started = Instant::now();
            match aggregate(&updates, self.version) {
                Ok(model) => {
                    FED_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                    self.version = model.version;
                    self.published_version.store(model.version, Ordering::SeqCst);
                    if let Err(e) = self.store.persist(&model) {
                        error!(%round_id, key = %model.storage_key(), error = %e, "model_persist_failed");
                    }
                    if let Err(e) = self.sink.publish_model(&model).await {
                        error!(%round_id, version = model.version, error = %e, "model_publish_failed");
                    }
                    let total = total_samples(&updates);
                    info!(%round_id, version = model.version, num_updates, total_samples = total, trigger = trigger.as_str(), "round_aggregated");
                    RoundOutcome::Completed { round_id, model_version: model.version, model_topic: self.model_topic.clone(), num_updates, total_samples: total, completed_at: Utc::now() }
                }
                Err(e) => {
                    warn!(%round_id, error = %e, num_updates, "aggregation_failed");
                    RoundOutcome::Failed { round_id, reason: e.to_string(), num_updates, completed_at: Utc::now() }
                }
            }
        };
        record_outcome(outcome.label(), trigger.as_str());
        if let Err(e) = self.sink.publish_outcome(&outcome).await {
            error!(round_id = outcome.round_id(), error = %e, "outcome_publish_failed");
        }
        outcome
    }
}

/// Waits up to `grace` for a spawned worker to finish the jobs already claimed. The
/// worker only stops once every [`RoundCoordinator`] handle is dropped. On timeout the
/// worker is aborted and `false` is returned.
pub async fn drain_completions(worker: JoinHandle<()>, grace: Duration) -> bool {
    let abort = worker.abort_handle();
    match tokio::time::timeout(grace, worker).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "completion_worker_failed");
            false
        }
        Err(_) => {
            abort.abort();
            error!(grace_ms = grace.as_millis() as u64, "completion_jobs_abandoned");
            false
        }
    }
}
