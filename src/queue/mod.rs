//! Dual-queue priority scheduling.
//!
//! Tasks waiting for context gathering sit in the context queue; tasks
//! with a confirmed manifest sit in the implementation queue. The
//! [`PriorityQueueManager`] owns both queues and the dependency graph.

pub mod entry;
pub mod manager;
pub mod scoring;

pub use entry::{QueueEntry, QueueName, ValidationIssue};
pub use manager::{IngestError, IngestSummary, PriorityQueueManager, RouteOutcome};
pub use scoring::{context_ratio, score, ScoreInput};
