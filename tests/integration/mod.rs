//! Integration test suite for relay.
//!
//! These tests run the orchestrator against a real task directory in a
//! temporary repository, with scripted stand-ins for the remote executor
//! and source control. Time is paused, so poll intervals and backoffs
//! elapse instantly.
//!
//! # Test Categories
//!
//! - `scheduling`: Queue selection, pre-flight validation and assignment
//! - `failures`: Retry backoff, dead-lettering and soft failure paths
//! - `lifecycle`: End-to-end runs, restarts and the startup self-check
//!
//! # CI Compatibility
//!
//! No network or git access is needed, making them safe to run in CI
//! environments.

mod fixtures;

mod failures;
mod lifecycle;
mod scheduling;
