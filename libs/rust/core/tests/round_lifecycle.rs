use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use round_core::federated_learning::{CollaboratorError, RoundError, SinkEvent, UpdatePayload};
use round_core::{ChannelSink, MemoryModelStore, Model, ModelStore, RoundCoordinator, RoundOutcome, RoundRegistry, RoundSink, RoundStart, TimeoutMonitor, TimeoutMonitorConfig, UpdateRecord};
use tokio::sync::mpsc::UnboundedReceiver;

fn upd(round: &str, p: &str, n: u64, w: Vec<f64>, b: f64) -> UpdateRecord {
    UpdateRecord { round_id: round.into(), participant_id: p.into(), base_model_uri: "models/v0".into(), num_samples: n, metrics: Default::default(), payload: UpdatePayload { w, b } }
}

fn start(round: &str, k: Option<usize>, timeout_s: Option<u64>) -> RoundStart {
    RoundStart { round_id: round.into(), model_uri: "models/v0".into(), participants: vec![], hyperparams: Default::default(), k_of_n: k, timeout_s }
}

async fn next_outcome(rx: &mut UnboundedReceiver<SinkEvent>) -> RoundOutcome {
    loop {
        match tokio::time::timeout(Duration::from_secs(120), rx.recv()).await.expect("no sink event").expect("sink closed") {
            SinkEvent::Outcome(o) => return o,
            SinkEvent::Model(_) => continue,
        }
    }
}

#[tokio::test]
async fn two_participant_weighted_round() {
    let store = Arc::new(MemoryModelStore::with_bootstrap(Model { w: vec![0.0, 0.0], b: 0.0, version: 3 }));
    let (sink, mut rx) = ChannelSink::new();
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), store.clone(), Arc::new(sink), "fl.model.global").unwrap();
    let _worker = worker.spawn();

    coord.on_round_start(start("r1", Some(2), None)).unwrap();
    coord.on_update_received(upd("r1", "p1", 10, vec![1.0, 0.0], 0.0)).unwrap();
    coord.on_update_received(upd("r1", "p2", 30, vec![0.0, 1.0], 0.0)).unwrap();

    let Some(SinkEvent::Model(model)) = rx.recv().await else { panic!("expected model first") };
    assert_eq!(model.version, 4);
    assert!((model.w[0] - 0.25).abs() < 1e-9);
    assert!((model.w[1] - 0.75).abs() < 1e-9);
    assert_eq!(model.b, 0.0);
    match next_outcome(&mut rx).await {
        RoundOutcome::Completed { round_id, model_version, model_topic, num_updates, total_samples, .. } => {
            assert_eq!(round_id, "r1");
            assert_eq!(model_version, 4);
            assert_eq!(model_topic, "fl.model.global");
            assert_eq!((num_updates, total_samples), (2, 40));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.latest().unwrap().map(|m| m.version), Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_aggregate_once() {
    let (sink, mut rx) = ChannelSink::new();
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), Arc::new(MemoryModelStore::new()), Arc::new(sink), "fl.model.global").unwrap();
    let coord = Arc::new(coord);
    let _worker = worker.spawn();
    coord.on_round_start(start("r1", Some(4), None)).unwrap();

    let tasks: Vec<_> = (0..32).map(|i| {
        let coord = coord.clone();
        tokio::spawn(async move { coord.on_update_received(upd("r1", &format!("p{i}"), 1, vec![1.0], 0.0)) })
    }).collect();
    let mut accepted = 0;
    for t in tasks { if t.await.unwrap().is_ok() { accepted += 1; } }
    assert!(accepted >= 4);

    match next_outcome(&mut rx).await {
        RoundOutcome::Completed { model_version, num_updates, .. } => {
            assert_eq!(model_version, 1);
            assert_eq!(num_updates, accepted);
        }
        other => panic!("unexpected {other:?}"),
    }
    // Appends and the completion flip share the round lock, so the snapshot holds every accepted update.
    assert_eq!(coord.registry().snapshot("r1").unwrap().num_updates, accepted);
    drop(coord);
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn quorum_and_timeout_race_produces_one_version() {
    let (sink, mut rx) = ChannelSink::new();
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), Arc::new(MemoryModelStore::new()), Arc::new(sink), "fl.model.global").unwrap();
    let coord = Arc::new(coord);
    let _worker = worker.spawn();
    let monitor = TimeoutMonitor::new(coord.clone(), TimeoutMonitorConfig { interval: Duration::from_secs(1), completed_retention: Duration::from_secs(600) });

    coord.on_round_start(start("r1", Some(2), Some(10))).unwrap();
    coord.on_update_received(upd("r1", "p1", 2, vec![4.0], 1.0)).unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(monitor.scan_once(), 1);
    // Quorum reached after the timeout claimed the round: rejected as late.
    assert!(coord.on_update_received(upd("r1", "p2", 2, vec![0.0], 0.0)).is_err());

    match next_outcome(&mut rx).await {
        RoundOutcome::Completed { model_version, num_updates, .. } => assert_eq!((model_version, num_updates), (1, 1)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(monitor.scan_once(), 0);
    assert_eq!(coord.latest_model_version(), 1);
}

#[tokio::test(start_paused = true)]
async fn spawned_monitor_aborts_empty_round() {
    let (sink, mut rx) = ChannelSink::new();
    let store = Arc::new(MemoryModelStore::new());
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), store.clone(), Arc::new(sink), "fl.model.global").unwrap();
    let coord = Arc::new(coord);
    let _worker = worker.spawn();
    let _monitor = TimeoutMonitor::new(coord.clone(), TimeoutMonitorConfig { interval: Duration::from_secs(5), completed_retention: Duration::from_secs(600) }).spawn();

    coord.on_round_start(start("empty", None, None)).unwrap();
    match next_outcome(&mut rx).await {
        RoundOutcome::AbortedEmpty { round_id, .. } => assert_eq!(round_id, "empty"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(store.is_empty());
    assert!(coord.registry().snapshot("empty").unwrap().completed);
}

#[tokio::test]
async fn versions_increase_across_rounds() {
    let (sink, mut rx) = ChannelSink::new();
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), Arc::new(MemoryModelStore::new()), Arc::new(sink), "fl.model.global").unwrap();
    let _worker = worker.spawn();
    let mut versions = Vec::new();
    for r in ["a", "b", "c"] {
        coord.on_round_start(start(r, Some(1), None)).unwrap();
        coord.on_update_received(upd(r, "p1", 1, vec![1.0], 0.0)).unwrap();
        if let RoundOutcome::Completed { model_version, .. } = next_outcome(&mut rx).await { versions.push(model_version); }
    }
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn schema_mismatch_fails_round_permanently() {
    let (sink, mut rx) = ChannelSink::new();
    let (coord, worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), Arc::new(MemoryModelStore::new()), Arc::new(sink), "fl.model.global").unwrap();
    let _worker = worker.spawn();
    coord.on_round_start(start("r1", Some(2), None)).unwrap();
    coord.on_update_received(upd("r1", "p1", 1, vec![1.0, 2.0], 0.0)).unwrap();
    coord.on_update_received(upd("r1", "p2", 1, vec![1.0], 0.0)).unwrap();
    match next_outcome(&mut rx).await {
        RoundOutcome::Failed { reason, num_updates, .. } => {
            assert!(reason.contains("p2"));
            assert_eq!(num_updates, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(coord.on_update_received(upd("r1", "p3", 1, vec![1.0, 2.0], 0.0)).is_err());
    assert_eq!(coord.latest_model_version(), 0);
}

struct FailingStore;

impl ModelStore for FailingStore {
    fn persist(&self, _: &Model) -> Result<(), CollaboratorError> { Err(CollaboratorError::Persist("disk full".into())) }
    fn latest(&self) -> Result<Option<Model>, CollaboratorError> { Ok(None) }
}

struct FailingSink;

#[async_trait]
impl RoundSink for FailingSink {
    async fn publish_model(&self, _: &Model) -> Result<(), CollaboratorError> { Err(CollaboratorError::Publish("no responders".into())) }
    async fn publish_outcome(&self, _: &RoundOutcome) -> Result<(), CollaboratorError> { Err(CollaboratorError::Publish("no responders".into())) }
}

#[tokio::test]
async fn collaborator_failures_keep_rounds_completed() {
    let (coord, mut worker) = RoundCoordinator::new(Arc::new(RoundRegistry::default()), Arc::new(FailingStore), Arc::new(FailingSink), "fl.model.global").unwrap();
    for (round, expected) in [("r1", 1), ("r2", 2)] {
        coord.on_round_start(start(round, Some(1), None)).unwrap();
        coord.on_update_received(upd(round, "p1", 4, vec![1.0], 0.5)).unwrap();
        match worker.run_once().await.unwrap() {
            RoundOutcome::Completed { model_version, .. } => assert_eq!(model_version, expected),
            other => panic!("unexpected {other:?}"),
        }
        assert!(coord.registry().snapshot(round).unwrap().completed);
    }
    assert_eq!(
        coord.on_update_received(upd("r1", "p2", 4, vec![1.0], 0.5)),
        Err(RoundError::LateUpdate { round_id: "r1".into(), participant_id: "p2".into() })
    );
    assert_eq!(coord.latest_model_version(), 2);
}
