//! Core domain models for relay scheduling.
//!
//! This module contains the task model and the dependency graph that the
//! queue manager owns.

pub mod dag;
pub mod task;

pub use dag::{
    CycleReport, DependencyGraph, DependencyCheck, GraphSnapshot, GraphStats, NodeMeta,
    TopoResult,
};
pub use task::{Leverage, Priority, Task, TaskId, TaskMeta, TaskStatus};
