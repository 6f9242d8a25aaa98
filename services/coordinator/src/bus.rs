//! NATS glue: inbound round-start/update subscriptions and the outbound sink.

use std::sync::Arc;
use async_trait::async_trait;
use futures::StreamExt;
use round_core::federated_learning::CollaboratorError;
use round_core::{Model, ModelStore, RoundCoordinator, RoundOutcome, RoundSink, Subjects};
use tracing::{debug, info, warn};

pub struct NatsSink {
    client: async_nats::Client,
    subjects: Subjects,
}

impl NatsSink {
    pub fn new(client: async_nats::Client, subjects: Subjects) -> Self { Self { client, subjects } }

    async fn publish_json<T: serde::Serialize>(&self, subject: String, value: &T) -> Result<(), CollaboratorError> {
        let bytes = serde_json::to_vec(value)?;
        self.client.publish(subject, bytes.into()).await.map_err(|e| CollaboratorError::Publish(e.to_string()))
    }
}

#[async_trait]
impl RoundSink for NatsSink {
    async fn publish_model(&self, model: &Model) -> Result<(), CollaboratorError> {
        self.publish_json(self.subjects.model_global(), model).await
    }

    async fn publish_outcome(&self, outcome: &RoundOutcome) -> Result<(), CollaboratorError> {
        self.publish_json(self.subjects.round_complete(outcome.round_id()), outcome).await
    }
}

pub async fn run_round_start_listener(nc: async_nats::Client, coordinator: Arc<RoundCoordinator>, subjects: Subjects) {
    let subject = subjects.round_start();
    let mut sub = match nc.subscribe(subject.clone()).await { Ok(s) => s, Err(e) => { warn!(error=?e, %subject, "subscribe_failed"); return; } };
    info!(%subject, "round_start_listener_started");
    while let Some(msg) = sub.next().await {
        // failures are logged by the coordinator; nothing to do here
        let _ = coordinator.handle_round_start_payload(&msg.payload);
    }
    info!(%subject, "round_start_listener_ended");
}

pub async fn run_update_listener(nc: async_nats::Client, coordinator: Arc<RoundCoordinator>, subjects: Subjects) {
    let subject = subjects.updates();
    let mut sub = match nc.subscribe(subject.clone()).await { Ok(s) => s, Err(e) => { warn!(error=?e, %subject, "subscribe_failed"); return; } };
    info!(%subject, "update_listener_started");
    while let Some(msg) = sub.next().await {
        let Some(origin) = subjects.parse_update(msg.subject.as_str()) else {
            debug!(subject = %msg.subject, "unexpected_update_subject");
            continue;
        };
        let _ = coordinator.handle_update_payload(&msg.payload, Some(origin));
    }
    info!(%subject, "update_listener_ended");
}

/// Answers `model.latest` requests with the newest persisted model, or an empty body when none exists.
pub async fn run_latest_model_responder(nc: async_nats::Client, store: Arc<dyn ModelStore>, subjects: Subjects) {
    let subject = subjects.model_latest();
    let mut sub = match nc.subscribe(subject.clone()).await { Ok(s) => s, Err(e) => { warn!(error=?e, %subject, "subscribe_failed"); return; } };
    while let Some(msg) = sub.next().await {
        let Some(reply) = msg.reply else { continue; };
        let body = match store.latest() {
            Ok(Some(model)) => match serde_json::to_vec(&model) { Ok(b) => b, Err(e) => { warn!(error=%e, "serialize_error"); continue; } },
            Ok(None) => Vec::new(),
            Err(e) => { warn!(error=%e, "latest_model_lookup_failed"); continue; }
        };
        if let Err(e) = nc.publish(reply, body.into()).await { warn!(error=%e, "latest_model_reply_failed"); }
    }
}
