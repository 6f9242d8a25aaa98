use thiserror::Error;
use super::types::RoundId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("round {0} already exists")]
    AlreadyExists(RoundId),
    #[error("round {0} already completed")]
    RoundAlreadyCompleted(RoundId),
    #[error("round {0} is not registered")]
    UnknownRound(RoundId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("no updates to aggregate")]
    EmptyInput,
    #[error("update from {participant_id} has {found} weights, expected {expected}")]
    SchemaMismatch { participant_id: String, expected: usize, found: usize },
    #[error("all updates carry zero samples")]
    DegenerateWeights,
}

/// Errors surfaced by the coordinator façade to event handlers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoundError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("duplicate round start for {0}")]
    DuplicateRound(RoundId),
    #[error("late update for completed round {round_id} from {participant_id}")]
    LateUpdate { round_id: RoundId, participant_id: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure reported by a storage or transport collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("persist failed: {0}")]
    Persist(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}
