//! Round registry: round_id -> per-round handle.
//!
//! The map lock only guards insert/lookup/removal. Scans copy the round handles out
//! and release it before any round's own lock is taken, so the two are never nested.
//! `try_mark_complete` is the single gate that authorizes aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::error::RegistryError;
use super::types::{RoundId, UpdateRecord};

pub const DEFAULT_K_OF_N: usize = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Quorum and timeout applied when a round does not specify them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundDefaults {
    pub k_of_n: usize,
    pub timeout: Duration,
}

impl Default for RoundDefaults {
    fn default() -> Self { Self { k_of_n: DEFAULT_K_OF_N, timeout: DEFAULT_TIMEOUT } }
}

#[derive(Debug)]
struct RoundEntry {
    round_id: RoundId,
    model_uri: String,
    k_of_n: usize,
    timeout: Duration,
    started: Instant,
    started_at: DateTime<Utc>,
    state: Mutex<RoundProgress>,
}

#[derive(Debug, Default)]
struct RoundProgress {
    updates: Vec<UpdateRecord>,
    completed: bool,
    completed_at: Option<Instant>,
}

/// Read-only view of a round at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub model_uri: String,
    pub k_of_n: usize,
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
    pub num_updates: usize,
    pub completed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub count: usize,
    pub threshold_reached: bool,
}

impl RoundEntry {
    fn new(round_id: RoundId, model_uri: String, k_of_n: usize, timeout: Duration) -> Self {
        Self { round_id, model_uri, k_of_n, timeout, started: Instant::now(), started_at: Utc::now(), state: Mutex::new(RoundProgress::default()) }
    }

    fn snapshot(&self) -> RoundSnapshot {
        let st = self.state.lock();
        RoundSnapshot {
            round_id: self.round_id.clone(),
            model_uri: self.model_uri.clone(),
            k_of_n: self.k_of_n,
            timeout: self.timeout,
            started_at: self.started_at,
            num_updates: st.updates.len(),
            completed: st.completed,
        }
    }
}

pub struct RoundRegistry {
    defaults: RoundDefaults,
    rounds: RwLock<HashMap<RoundId, Arc<RoundEntry>>>,
}

impl RoundRegistry {
    pub fn new(defaults: RoundDefaults) -> Self { Self { defaults, rounds: RwLock::new(HashMap::new()) } }

    pub fn defaults(&self) -> RoundDefaults { self.defaults }

    fn entry(&self, round_id: &str) -> Option<Arc<RoundEntry>> { self.rounds.read().get(round_id).cloned() }

    pub fn create(&self, round_id: &str, model_uri: &str, k_of_n: Option<usize>, timeout: Option<Duration>) -> Result<RoundSnapshot, RegistryError> {
        let mut map = self.rounds.write();
        if map.contains_key(round_id) { return Err(RegistryError::AlreadyExists(round_id.to_string())); }
        let entry = Arc::new(RoundEntry::new(
            round_id.to_string(),
            model_uri.to_string(),
            k_of_n.unwrap_or(self.defaults.k_of_n).max(1),
            timeout.unwrap_or(self.defaults.timeout),
        ));
        map.insert(round_id.to_string(), entry.clone());
        drop(map);
        Ok(entry.snapshot())
    }

    /// Returns the round, creating it with defaults when an update arrives before its round start.
    /// The flag is true when this call created it.
    pub fn get_or_lazy_create(&self, round_id: &str, inferred_model_uri: &str) -> (RoundSnapshot, bool) {
        if let Some(entry) = self.entry(round_id) { return (entry.snapshot(), false); }
        let mut map = self.rounds.write();
        let mut created = false;
        let entry = map.entry(round_id.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(RoundEntry::new(round_id.to_string(), inferred_model_uri.to_string(), self.defaults.k_of_n, self.defaults.timeout))
        }).clone();
        drop(map);
        if created { debug!(round_id, model_uri = inferred_model_uri, "round_lazily_created"); }
        (entry.snapshot(), created)
    }

    pub fn append_update(&self, update: UpdateRecord) -> Result<AppendOutcome, RegistryError> {
        let entry = self.entry(&update.round_id).ok_or_else(|| RegistryError::UnknownRound(update.round_id.clone()))?;
        let mut st = entry.state.lock();
        if st.completed { return Err(RegistryError::RoundAlreadyCompleted(entry.round_id.clone())); }
        st.updates.push(update);
        let count = st.updates.len();
        Ok(AppendOutcome { count, threshold_reached: count >= entry.k_of_n })
    }

    /// Flips `completed` false -> true and hands back a copy of the accumulated updates.
    /// `None` when the round is unknown or another caller already completed it.
    pub fn try_mark_complete(&self, round_id: &str) -> Option<Vec<UpdateRecord>> {
        let entry = self.entry(round_id)?;
        let mut st = entry.state.lock();
        if st.completed { return None; }
        st.completed = true;
        st.completed_at = Some(Instant::now());
        Some(st.updates.clone())
    }

    pub fn elapsed(&self, round_id: &str) -> Option<Duration> { self.entry(round_id).map(|e| e.started.elapsed()) }

    pub fn timeout(&self, round_id: &str) -> Option<Duration> { self.entry(round_id).map(|e| e.timeout) }

    pub fn snapshot(&self, round_id: &str) -> Option<RoundSnapshot> { self.entry(round_id).map(|e| e.snapshot()) }

    /// Open rounds whose deadline has passed.
    pub fn expired(&self) -> Vec<RoundId> {
        self.entries().into_iter()
            .filter(|e| !e.state.lock().completed && e.started.elapsed() >= e.timeout)
            .map(|e| e.round_id.clone())
            .collect()
    }

    fn entries(&self) -> Vec<Arc<RoundEntry>> { self.rounds.read().values().cloned().collect() }

    /// Drops completed rounds older than `retention`. Returns how many were removed.
    pub fn prune_completed(&self, retention: Duration) -> usize {
        let stale: Vec<Arc<RoundEntry>> = self.entries().into_iter()
            .filter(|e| e.state.lock().completed_at.is_some_and(|at| at.elapsed() >= retention))
            .collect();
        if stale.is_empty() { return 0; }
        // completion is never undone, so a stale handle stays removable once the map lock is retaken
        let mut map = self.rounds.write();
        let mut removed = 0;
        for e in &stale {
            if map.get(&e.round_id).is_some_and(|cur| Arc::ptr_eq(cur, e)) {
                map.remove(&e.round_id);
                removed += 1;
            }
        }
        removed
    }

    /// (open, completed) round counts.
    pub fn counts(&self) -> (usize, usize) {
        let entries = self.entries();
        let completed = entries.iter().filter(|e| e.state.lock().completed).count();
        (entries.len() - completed, completed)
    }
}

impl Default for RoundRegistry {
    fn default() -> Self { Self::new(RoundDefaults::default()) }
}
