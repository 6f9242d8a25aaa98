//! Collaborator seams: model storage and the outbound side of the bus.

use std::collections::BTreeMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::error::CollaboratorError;
use super::types::{Model, ModelVersion, RoundOutcome};

/// Blind versioned artifact store. Models are keyed by `global_model_v{N}`.
pub trait ModelStore: Send + Sync {
    fn persist(&self, model: &Model) -> Result<(), CollaboratorError>;
    fn latest(&self) -> Result<Option<Model>, CollaboratorError>;
}

/// Outbound publication of models and round outcomes.
#[async_trait]
pub trait RoundSink: Send + Sync {
    async fn publish_model(&self, model: &Model) -> Result<(), CollaboratorError>;
    async fn publish_outcome(&self, outcome: &RoundOutcome) -> Result<(), CollaboratorError>;
}

#[derive(Default)]
pub struct MemoryModelStore { models: RwLock<BTreeMap<ModelVersion, Model>> }

impl MemoryModelStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_bootstrap(model: Model) -> Self {
        let store = Self::default();
        store.models.write().insert(model.version, model);
        store
    }

    pub fn get(&self, version: ModelVersion) -> Option<Model> { self.models.read().get(&version).cloned() }

    pub fn len(&self) -> usize { self.models.read().len() }

    pub fn is_empty(&self) -> bool { self.models.read().is_empty() }
}

impl ModelStore for MemoryModelStore {
    fn persist(&self, model: &Model) -> Result<(), CollaboratorError> {
        self.models.write().insert(model.version, model.clone());
        Ok(())
    }

    fn latest(&self) -> Result<Option<Model>, CollaboratorError> {
        Ok(self.models.read().values().next_back().cloned())
    }
}

/// Everything a `ChannelSink` forwards.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    Model(Model),
    Outcome(RoundOutcome),
}

/// Forwards publications into an mpsc channel, for in-process consumers.
pub struct ChannelSink { tx: mpsc::UnboundedSender<SinkEvent> }

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, ev: SinkEvent) -> Result<(), CollaboratorError> {
        self.tx.send(ev).map_err(|_| CollaboratorError::Publish("receiver dropped".into()))
    }
}

#[async_trait]
impl RoundSink for ChannelSink {
    async fn publish_model(&self, model: &Model) -> Result<(), CollaboratorError> { self.send(SinkEvent::Model(model.clone())) }
    async fn publish_outcome(&self, outcome: &RoundOutcome) -> Result<(), CollaboratorError> { self.send(SinkEvent::Outcome(outcome.clone())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_latest_is_highest_version() {
        let store = MemoryModelStore::with_bootstrap(Model { w: vec![0.0], b: 0.0, version: 0 });
        store.persist(&Model { w: vec![2.0], b: 0.0, version: 2 }).unwrap();
        store.persist(&Model { w: vec![1.0], b: 0.0, version: 1 }).unwrap();
        assert_eq!(store.latest().unwrap().map(|m| m.version), Some(2));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let err = sink.publish_model(&Model { w: vec![], b: 0.0, version: 1 }).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Publish(_)));
    }
}
