use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RoundId = String;
pub type ModelVersion = u64;

/// Model delta carried by an update: one weight vector plus a scalar bias.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub w: Vec<f64>,
    pub b: f64,
}

/// One participant contribution to a round, as received from the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub round_id: RoundId,
    pub participant_id: String,
    pub base_model_uri: String,
    pub num_samples: u64,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(rename = "update")]
    pub payload: UpdatePayload,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    #[serde(default)]
    pub epochs: Option<u32>,
    #[serde(default)]
    pub lr: Option<f64>,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Round-start announcement. Quorum and timeout fall back to coordinator defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundStart {
    pub round_id: RoundId,
    pub model_uri: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub hyperparams: Hyperparams,
    #[serde(default)]
    pub k_of_n: Option<usize>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

/// Global model produced by aggregation; version 0 is the externally created bootstrap model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub w: Vec<f64>,
    pub b: f64,
    pub version: ModelVersion,
}

impl Model {
    /// Storage key the model is persisted under.
    pub fn storage_key(&self) -> String { storage_key(self.version) }
}

pub fn storage_key(version: ModelVersion) -> String { format!("global_model_v{version}") }

/// Which producer asked for a round to complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger { Quorum, Timeout }

impl CompletionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self { CompletionTrigger::Quorum => "quorum", CompletionTrigger::Timeout => "timeout" }
    }
}

/// Terminal result of a round, published on the round's completion subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    Completed {
        round_id: RoundId,
        model_version: ModelVersion,
        model_topic: String,
        num_updates: usize,
        total_samples: u64,
        completed_at: DateTime<Utc>,
    },
    Failed {
        round_id: RoundId,
        reason: String,
        num_updates: usize,
        completed_at: DateTime<Utc>,
    },
    AbortedEmpty {
        round_id: RoundId,
        completed_at: DateTime<Utc>,
    },
}

impl RoundOutcome {
    pub fn round_id(&self) -> &str {
        match self {
            RoundOutcome::Completed { round_id, .. }
            | RoundOutcome::Failed { round_id, .. }
            | RoundOutcome::AbortedEmpty { round_id, .. } => round_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RoundOutcome::Completed { .. } => "completed",
            RoundOutcome::Failed { .. } => "failed",
            RoundOutcome::AbortedEmpty { .. } => "aborted_empty",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_record_uses_wire_field_names() {
        let raw = r#"{"round_id":"r1","participant_id":"p1","base_model_uri":"m0","num_samples":5,"metrics":{"loss":0.4},"update":{"w":[1.0,2.0],"b":0.5}}"#;
        let rec: UpdateRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.payload.w, vec![1.0, 2.0]);
        assert_eq!(rec.metrics.get("loss"), Some(&0.4));
        let back = serde_json::to_value(&rec).unwrap();
        assert!(back.get("update").is_some());
    }

    #[test]
    fn outcome_is_tagged_by_status() {
        let out = RoundOutcome::AbortedEmpty { round_id: "r9".into(), completed_at: Utc::now() };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["status"], "aborted_empty");
        assert_eq!(v["round_id"], "r9");
    }

    #[test]
    fn storage_key_format() {
        assert_eq!(storage_key(7), "global_model_v7");
    }
}
