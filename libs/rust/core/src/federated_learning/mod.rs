//! Federated learning round aggregation: validation, FedAvg, round registry,
//! timeout monitor and the coordinator that ties them together.

pub mod aggregation;
pub mod coordinator;
pub mod error;
mod metrics;
pub mod registry;
pub mod sink;
pub mod subjects;
pub mod timeout;
pub mod types;
pub mod validate;

pub use aggregation::aggregate;
pub use coordinator::{drain_completions, CompletionJob, CompletionWorker, CoordinatorStatus, RoundCoordinator};
pub use error::{AggregationError, CollaboratorError, RegistryError, RoundError};
pub use registry::{AppendOutcome, RoundDefaults, RoundRegistry, RoundSnapshot};
pub use sink::{ChannelSink, MemoryModelStore, ModelStore, RoundSink, SinkEvent};
pub use subjects::Subjects;
pub use timeout::{TimeoutMonitor, TimeoutMonitorConfig};
pub use types::{CompletionTrigger, Hyperparams, Model, ModelVersion, RoundId, RoundOutcome, RoundStart, UpdatePayload, UpdateRecord};
