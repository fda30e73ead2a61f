//! Orchestration layer.
//!
//! The [`Orchestrator`] owns a fixed pool of worker slots and drives the
//! priority queues through pre-flight validation, remote execution,
//! completion and failure handling.

pub mod audit;
pub mod completion;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod validation;

pub use audit::{AuditLog, FailureRecord, ViolationKind, ViolationRecord};
pub use completion::{CompletionOutcome, CompletionProtocol, CompletionReport};
pub use executor::{HttpJobExecutor, JobExecutor, JobPoll, JobRequest, JobStatus};
pub use health::{HealthPolicy, HealthReport, InvalidEntry, InvalidReason};
pub use orchestrator::{
    AssignOutcome, Collaborators, Orchestrator, OrchestratorSettings, OrchestratorStatus,
    TickReport,
};
pub use pool::{SlotState, WorkerEvent, WorkerPool, WorkerSlot};
pub use retry::{DeadLetter, FailureVerdict, RetryRecord, RetryTracker};
pub use validation::{is_valid_branch_name, preflight, validate_branch, PreflightOutcome};
